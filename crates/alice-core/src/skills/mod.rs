//! Skill Activation State Machine.
//!
//! The [`SkillManager`] is the only writer of skill state. It consumes announcement,
//! registration and lifecycle envelopes, keeps the [`IntentIndex`] in step, and
//! broadcasts `mycroft.skills.state` on every transition.

mod lifecycle;
mod registry;

pub use lifecycle::SkillState;
pub use registry::{FallbackHandler, SkillRecord, SkillRegistry};

use crate::config::SkillsConfig;
use crate::error::{LifecycleError, RegistrationError};
use crate::intent::{IntentDefinition, IntentIndex};
use crate::messages;
use alice_bus::{BusClient, ConnectionId, Envelope};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct SkillManager {
    config: SkillsConfig,
    intents: Arc<IntentIndex>,
    skills: Arc<SkillRegistry>,
}

impl SkillManager {
    pub fn new(config: SkillsConfig, intents: Arc<IntentIndex>, skills: Arc<SkillRegistry>) -> Self {
        Self {
            config,
            intents,
            skills,
        }
    }

    pub fn registry(&self) -> &Arc<SkillRegistry> {
        &self.skills
    }

    /// Process one envelope, returning what should be published in response.
    pub fn handle(&mut self, envelope: &Envelope, now: DateTime<Utc>) -> Vec<Envelope> {
        let mut out = Vec::new();
        match envelope.msg_type.as_str() {
            messages::SKILL_LOADING => self.on_loading(envelope, now, &mut out),
            messages::REGISTER_INTENTS => self.on_register(envelope, now, &mut out),
            messages::DETACH_INTENT => self.on_detach_intent(envelope),
            messages::DETACH_SKILL => {
                if let Some(skill_id) = skill_field(envelope) {
                    self.stop(skill_id, "detached", now, &mut out);
                }
            }
            messages::FALLBACK_REGISTER => self.on_fallback_register(envelope, now, &mut out),
            messages::FALLBACK_DETACH => {
                if let Some(skill_id) = skill_field(envelope) {
                    self.skills.update(skill_id, |r| r.fallback_priority = None);
                    debug!(skill_id, "fallback detached");
                }
            }
            messages::SKILL_PAUSE => self.on_toggle(envelope, SkillState::Paused, now, &mut out),
            messages::SKILL_RESUME => self.on_toggle(envelope, SkillState::Active, now, &mut out),
            messages::SKILL_FAILED => {
                if let Some(skill_id) = skill_field(envelope) {
                    let reason = envelope.str_field("reason").unwrap_or("skill_failed");
                    self.fail(skill_id, reason, now, &mut out);
                }
            }
            messages::SKILLS_GET => out.push(self.skills_response(envelope)),
            alice_bus::messages::CLIENT_DISCONNECTED => {
                if let Some(client_id) = envelope.str_field("client_id") {
                    let connection = ConnectionId::new(client_id);
                    for skill_id in self.skills.skills_on(&connection) {
                        let routable = matches!(
                            self.skills.state(&skill_id),
                            Some(SkillState::Loading | SkillState::Active | SkillState::Paused)
                        );
                        if routable {
                            self.fail(&skill_id, "disconnected", now, &mut out);
                        }
                    }
                }
            }
            other => debug!(msg_type = other, "skill manager ignoring envelope"),
        }
        out
    }

    /// Drive reload attempts for failed skills.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Vec<Envelope> {
        let mut out = Vec::new();
        for skill_id in self.skills.due_for_reload(now) {
            let Some(record) = self.skills.get(&skill_id) else {
                continue;
            };
            if record.reload_attempts >= self.config.max_reload_attempts {
                warn!(skill_id = %skill_id, attempts = record.reload_attempts, "reload attempts exhausted");
                self.stop(&skill_id, "reload_exhausted", now, &mut out);
            } else {
                self.request_reload(&skill_id, now, &mut out);
            }
        }
        out
    }

    fn on_loading(&mut self, envelope: &Envelope, now: DateTime<Utc>, out: &mut Vec<Envelope>) {
        let Some(skill_id) = skill_field(envelope) else {
            return;
        };
        let connection = envelope.source().map(ConnectionId::new);
        match self.skills.state(skill_id) {
            None => {
                self.skills.insert_loading(skill_id, connection, now);
                info!(skill_id, "skill loading");
                out.push(state_event(skill_id, None, SkillState::Loading));
            }
            Some(SkillState::Failed) => {
                self.skills.update(skill_id, |r| {
                    if connection.is_some() {
                        r.connection = connection;
                    }
                });
                let _ = self.transition(skill_id, SkillState::Loading, now, out);
            }
            Some(state) => {
                self.skills.update(skill_id, |r| {
                    if connection.is_some() {
                        r.connection = connection;
                    }
                    r.updated_at = now;
                });
                debug!(skill_id, %state, "repeated loading announcement");
            }
        }
    }

    fn on_register(&mut self, envelope: &Envelope, now: DateTime<Utc>, out: &mut Vec<Envelope>) {
        let skill_id = skill_field(envelope).unwrap_or_default();
        let definitions = match parse_definitions(envelope) {
            Ok(definitions) => definitions,
            Err(e) => {
                out.push(registration_failed(envelope, skill_id, &e));
                return;
            }
        };
        let registered = match self.intents.register_intents(skill_id, definitions) {
            Ok(registered) => registered,
            Err(e) => {
                out.push(registration_failed(envelope, skill_id, &e));
                return;
            }
        };

        let connection = envelope.source().map(ConnectionId::new);
        let previous_connection = self.skills.connection(skill_id);
        if let Some(replaced) = &registered.replaced {
            info!(skill_id, previous = replaced.len(), count = registered.intents.len(), "intent registration replaced");
            out.push(
                Envelope::new(messages::REGISTRATION_REPLACED).with_data(json!({
                    "skill_id": skill_id,
                    "previous": replaced,
                    "intents": registered.intents,
                    "previous_connection": previous_connection,
                })),
            );
        }
        self.activate(skill_id, connection, now, out);
    }

    /// Mark registration complete: create if unknown and move to active where allowed.
    fn activate(
        &mut self,
        skill_id: &str,
        connection: Option<ConnectionId>,
        now: DateTime<Utc>,
        out: &mut Vec<Envelope>,
    ) {
        if self.skills.state(skill_id).is_none() {
            self.skills.insert_loading(skill_id, connection.clone(), now);
            out.push(state_event(skill_id, None, SkillState::Loading));
        }
        self.skills.update(skill_id, |r| {
            if connection.is_some() {
                r.connection = connection;
            }
        });
        match self.skills.state(skill_id) {
            Some(SkillState::Loading | SkillState::Failed) => {
                let _ = self.transition(skill_id, SkillState::Active, now, out);
            }
            Some(state) => debug!(skill_id, %state, "registration updated without transition"),
            None => {}
        }
    }

    fn on_detach_intent(&mut self, envelope: &Envelope) {
        let (Some(skill_id), Some(intent)) = (skill_field(envelope), envelope.str_field("intent")) else {
            return;
        };
        if !self.intents.remove_intent(skill_id, intent) {
            debug!(skill_id, intent, "detach for unknown intent");
        }
    }

    fn on_fallback_register(&mut self, envelope: &Envelope, now: DateTime<Utc>, out: &mut Vec<Envelope>) {
        let Some(skill_id) = skill_field(envelope) else {
            return;
        };
        let priority = envelope
            .data
            .get("priority")
            .and_then(Value::as_i64)
            .unwrap_or(50);
        let connection = envelope.source().map(ConnectionId::new);
        self.activate(skill_id, connection, now, out);
        self.skills.update(skill_id, |r| r.fallback_priority = Some(priority));
        info!(skill_id, priority, "fallback registered");
    }

    fn on_toggle(&mut self, envelope: &Envelope, to: SkillState, now: DateTime<Utc>, out: &mut Vec<Envelope>) {
        let Some(skill_id) = skill_field(envelope) else {
            return;
        };
        if let Err(e) = self.transition(skill_id, to, now, out) {
            warn!(skill_id, error = %e, "lifecycle request refused");
        }
    }

    /// Uncaught failure: move to failed and start the bounded reload sequence.
    fn fail(&mut self, skill_id: &str, reason: &str, now: DateTime<Utc>, out: &mut Vec<Envelope>) {
        if self.transition(skill_id, SkillState::Failed, now, out).is_err() {
            return;
        }
        warn!(skill_id, reason, "skill failed");
        self.skills
            .update(skill_id, |r| r.failure_reason = Some(reason.to_string()));
        if self.config.max_reload_attempts == 0 {
            self.stop(skill_id, "reload_disabled", now, out);
            return;
        }
        let attempts = self.skills.get(skill_id).map(|r| r.reload_attempts).unwrap_or(0);
        if attempts >= self.config.max_reload_attempts {
            self.stop(skill_id, "reload_exhausted", now, out);
        } else {
            self.request_reload(skill_id, now, out);
        }
    }

    fn request_reload(&mut self, skill_id: &str, now: DateTime<Utc>, out: &mut Vec<Envelope>) {
        let backoff = self.config.reload_backoff();
        let Some(attempt) = self.skills.update(skill_id, |r| {
            r.reload_attempts += 1;
            r.next_reload_check = Some(now + backoff);
            r.reload_attempts
        }) else {
            return;
        };
        info!(skill_id, attempt, max_attempts = self.config.max_reload_attempts, "requesting skill reload");
        out.push(
            Envelope::new(messages::SKILL_RELOAD).critical().with_data(json!({
                "skill_id": skill_id,
                "attempt": attempt,
                "max_attempts": self.config.max_reload_attempts,
            })),
        );
    }

    /// Terminal: intents are dropped and the record destroyed.
    fn stop(&mut self, skill_id: &str, reason: &str, now: DateTime<Utc>, out: &mut Vec<Envelope>) {
        if self.transition(skill_id, SkillState::Stopped, now, out).is_err() {
            return;
        }
        self.intents.remove_skill(skill_id);
        self.skills.remove(skill_id);
        info!(skill_id, reason, "skill stopped");
    }

    fn transition(
        &mut self,
        skill_id: &str,
        to: SkillState,
        now: DateTime<Utc>,
        out: &mut Vec<Envelope>,
    ) -> Result<SkillState, LifecycleError> {
        let from = self
            .skills
            .update(skill_id, |r| {
                let from = r.state;
                from.check_transition(skill_id, to)?;
                r.state = to;
                r.updated_at = now;
                if to == SkillState::Active {
                    r.reload_attempts = 0;
                    r.next_reload_check = None;
                    r.failure_reason = None;
                }
                Ok(from)
            })
            .ok_or_else(|| LifecycleError::UnknownSkill(skill_id.to_string()))??;
        debug!(skill_id, %from, %to, "skill transition");
        out.push(state_event(skill_id, Some(from), to));
        Ok(from)
    }

    fn skills_response(&self, request: &Envelope) -> Envelope {
        let snapshot = self.intents.snapshot();
        let skills: Vec<Value> = self
            .skills
            .snapshot()
            .into_iter()
            .map(|r| {
                json!({
                    "skill_id": r.skill_id,
                    "state": r.state,
                    "intents": snapshot.intent_names(&r.skill_id),
                    "fallback_priority": r.fallback_priority,
                    "connection": r.connection,
                    "reload_attempts": r.reload_attempts,
                })
            })
            .collect();
        request.response(json!({ "skills": skills }))
    }

    /// Serve the bus until the client's connection closes.
    pub async fn run(mut self, client: BusClient) {
        let mut ticker =
            tokio::time::interval(Duration::from_millis(self.config.check_interval_ms));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(client_id = %client.id(), "skill manager started");
        loop {
            let outgoing = tokio::select! {
                received = client.recv() => match received {
                    Some(envelope) => self.handle(&envelope, Utc::now()),
                    None => break,
                },
                _ = ticker.tick() => self.tick(Utc::now()),
            };
            if !crate::publish_all(&client, outgoing) {
                break;
            }
        }
        info!("skill manager stopped");
    }

    pub fn spawn(self, client: BusClient) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run(client))
    }
}

fn skill_field(envelope: &Envelope) -> Option<&str> {
    envelope
        .str_field("skill_id")
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn parse_definitions(envelope: &Envelope) -> Result<Vec<IntentDefinition>, RegistrationError> {
    if skill_field(envelope).is_none() {
        return Err(RegistrationError::EmptySkillId);
    }
    match envelope.data.get("intents") {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(value) => serde_json::from_value(value.clone())
            .map_err(|e| RegistrationError::Malformed(e.to_string())),
    }
}

fn registration_failed(request: &Envelope, skill_id: &str, error: &RegistrationError) -> Envelope {
    warn!(skill_id, error = %error, "intent registration refused");
    request.reply(
        messages::REGISTRATION_FAILED,
        json!({ "skill_id": skill_id, "error": error.to_string() }),
    )
}

fn state_event(skill_id: &str, from: Option<SkillState>, to: SkillState) -> Envelope {
    Envelope::new(messages::SKILL_STATE).with_data(json!({
        "skill_id": skill_id,
        "from": from,
        "to": to,
    }))
}
