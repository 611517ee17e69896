//! Subscription filters: `*` (everything), `prefix*`, or an exact type.

use crate::error::{BusError, BusResult};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SubscriptionPattern {
    All,
    Prefix(String),
    Exact(String),
}

impl SubscriptionPattern {
    pub fn parse(raw: &str) -> BusResult<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(BusError::InvalidPattern(raw.to_string()));
        }
        if raw == "*" {
            return Ok(SubscriptionPattern::All);
        }
        match raw.find('*') {
            None => Ok(SubscriptionPattern::Exact(raw.to_string())),
            Some(pos) if pos == raw.len() - 1 => {
                Ok(SubscriptionPattern::Prefix(raw[..pos].to_string()))
            }
            Some(_) => Err(BusError::InvalidPattern(raw.to_string())),
        }
    }

    pub fn matches(&self, msg_type: &str) -> bool {
        match self {
            SubscriptionPattern::All => true,
            SubscriptionPattern::Prefix(prefix) => msg_type.starts_with(prefix.as_str()),
            SubscriptionPattern::Exact(exact) => exact == msg_type,
        }
    }

    /// Exact patterns count as an explicit subscription (used for self-delivery).
    pub fn is_exact_for(&self, msg_type: &str) -> bool {
        matches!(self, SubscriptionPattern::Exact(exact) if exact == msg_type)
    }
}

impl FromStr for SubscriptionPattern {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for SubscriptionPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubscriptionPattern::All => write!(f, "*"),
            SubscriptionPattern::Prefix(prefix) => write!(f, "{}*", prefix),
            SubscriptionPattern::Exact(exact) => write!(f, "{}", exact),
        }
    }
}

/// Parse a list of patterns, failing on the first invalid one.
pub fn parse_patterns<I, S>(raw: I) -> BusResult<Vec<SubscriptionPattern>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    raw.into_iter()
        .map(|p| SubscriptionPattern::parse(p.as_ref()))
        .collect()
}
