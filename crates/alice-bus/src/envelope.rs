//! Envelope: the unit exchanged on the bus.
//!
//! Wire form is a JSON object `{"type": string, "data": object, "context": object}`.
//! `context.session_id` is set by the first producer of a conversational turn and
//! must be carried unchanged by every envelope derived from it; the [`Envelope::reply`],
//! [`Envelope::forward`] and [`Envelope::response`] helpers do that.

use crate::error::{BusError, BusResult};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub msg_type: String,
    #[serde(default)]
    pub data: Map<String, Value>,
    #[serde(default)]
    pub context: MessageContext,
}

/// Routing and correlation metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Client id(s) the envelope is addressed to. Empty means broadcast.
    #[serde(
        default,
        skip_serializing_if = "Vec::is_empty",
        serialize_with = "serialize_destination",
        deserialize_with = "deserialize_destination"
    )]
    pub destination: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Free-form correlation metadata.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn deserialize_destination<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(OneOrMany::One(id)) => vec![id],
        Some(OneOrMany::Many(ids)) => ids,
    })
}

#[allow(clippy::ptr_arg)]
fn serialize_destination<S>(destination: &Vec<String>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match destination.as_slice() {
        [single] => serializer.serialize_str(single),
        many => many.serialize(serializer),
    }
}

impl Envelope {
    pub fn new(msg_type: impl Into<String>) -> Self {
        Self {
            msg_type: msg_type.into(),
            data: Map::new(),
            context: MessageContext::default(),
        }
    }

    /// Replace the payload. Non-object values are wrapped as `{"value": ...}`.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = match data {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.context.session_id = Some(session_id.into());
        self
    }

    pub fn with_destination(mut self, client_id: impl Into<String>) -> Self {
        self.context.destination = vec![client_id.into()];
        self
    }

    pub fn with_source(mut self, client_id: impl Into<String>) -> Self {
        self.context.source = Some(client_id.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context.extra.insert(key.into(), value);
        self
    }

    /// Mark as critical: never chosen for overflow dropping.
    pub fn critical(self) -> Self {
        self.with_context("critical", Value::Bool(true))
    }

    pub fn is_critical(&self) -> bool {
        self.context
            .extra
            .get("critical")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn session_id(&self) -> Option<&str> {
        self.context.session_id.as_deref()
    }

    pub fn source(&self) -> Option<&str> {
        self.context.source.as_deref()
    }

    /// True when the envelope is a broadcast or names `client_id` as a destination.
    pub fn is_addressed_to(&self, client_id: &str) -> bool {
        self.context.destination.is_empty()
            || self.context.destination.iter().any(|d| d == client_id)
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }

    pub fn bool_field(&self, key: &str) -> Option<bool> {
        self.data.get(key).and_then(Value::as_bool)
    }

    pub fn u64_field(&self, key: &str) -> Option<u64> {
        self.data.get(key).and_then(Value::as_u64)
    }

    pub fn validate(&self) -> BusResult<()> {
        if self.msg_type.trim().is_empty() {
            return Err(BusError::MissingType);
        }
        Ok(())
    }

    /// Parse and validate a wire envelope. `data`/`context` may be omitted or null.
    pub fn from_json(raw: &str) -> BusResult<Self> {
        let value: Value =
            serde_json::from_str(raw).map_err(|e| BusError::Malformed(e.to_string()))?;
        let Value::Object(mut object) = value else {
            return Err(BusError::Malformed("envelope must be a JSON object".into()));
        };
        match object.get("type") {
            Some(Value::String(t)) if !t.trim().is_empty() => {}
            _ => return Err(BusError::MissingType),
        }
        for key in ["data", "context"] {
            if matches!(object.get(key), Some(Value::Null)) {
                object.remove(key);
            }
        }
        let envelope: Envelope = serde_json::from_value(Value::Object(object))
            .map_err(|e| BusError::Malformed(e.to_string()))?;
        envelope.validate()?;
        Ok(envelope)
    }

    pub fn to_json(&self) -> BusResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// New envelope addressed back to whoever sent this one. Source and destination
    /// swap; session and correlation metadata are kept.
    pub fn reply(&self, msg_type: impl Into<String>, data: Value) -> Self {
        let mut context = self.context.clone();
        context.destination = self.context.source.iter().cloned().collect();
        context.source = match self.context.destination.as_slice() {
            [single] => Some(single.clone()),
            _ => None,
        };
        context.extra.remove("critical");
        Envelope {
            msg_type: msg_type.into(),
            data: Map::new(),
            context,
        }
        .with_data(data)
    }

    /// New envelope that keeps this one's context unchanged.
    pub fn forward(&self, msg_type: impl Into<String>, data: Value) -> Self {
        Envelope {
            msg_type: msg_type.into(),
            data: Map::new(),
            context: self.context.clone(),
        }
        .with_data(data)
    }

    /// Reply whose type is `<type>.response`.
    pub fn response(&self, data: Value) -> Self {
        self.reply(format!("{}.response", self.msg_type), data)
    }
}
