//! Skill registrations, shared read-only with the dispatcher.
//!
//! Only the [`SkillManager`](crate::skills::SkillManager) mutates records; the
//! dispatcher reads state, connection and fallback priority when routing.

use crate::skills::SkillState;
use alice_bus::ConnectionId;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Serialize)]
pub struct SkillRecord {
    pub skill_id: String,
    pub state: SkillState,
    /// Bus connection that announced the skill; invocations are addressed to it.
    pub connection: Option<ConnectionId>,
    /// Set when the skill registered as a fallback handler. Lower is tried first.
    pub fallback_priority: Option<i64>,
    pub registration_seq: u64,
    pub reload_attempts: u32,
    #[serde(skip)]
    pub next_reload_check: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// One entry of the fallback chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackHandler {
    pub skill_id: String,
    pub priority: i64,
    pub connection: Option<ConnectionId>,
    pub registration_seq: u64,
}

#[derive(Debug, Default)]
pub struct SkillRegistry {
    skills: DashMap<String, SkillRecord>,
    next_seq: AtomicU64,
}

impl SkillRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, skill_id: &str) -> Option<SkillRecord> {
        self.skills.get(skill_id).map(|r| r.value().clone())
    }

    pub fn state(&self, skill_id: &str) -> Option<SkillState> {
        self.skills.get(skill_id).map(|r| r.state)
    }

    pub fn is_active(&self, skill_id: &str) -> bool {
        self.state(skill_id).is_some_and(|s| s.is_routable())
    }

    pub fn connection(&self, skill_id: &str) -> Option<ConnectionId> {
        self.skills.get(skill_id).and_then(|r| r.connection.clone())
    }

    /// Skills announced by `connection`.
    pub fn skills_on(&self, connection: &ConnectionId) -> Vec<String> {
        let mut ids: Vec<(u64, String)> = self
            .skills
            .iter()
            .filter(|r| r.connection.as_ref() == Some(connection))
            .map(|r| (r.registration_seq, r.skill_id.clone()))
            .collect();
        ids.sort();
        ids.into_iter().map(|(_, id)| id).collect()
    }

    /// Active fallback handlers, lowest priority number first, then registration order.
    pub fn fallback_chain(&self) -> Vec<FallbackHandler> {
        let mut chain: Vec<FallbackHandler> = self
            .skills
            .iter()
            .filter(|r| r.state.is_routable())
            .filter_map(|r| {
                r.fallback_priority.map(|priority| FallbackHandler {
                    skill_id: r.skill_id.clone(),
                    priority,
                    connection: r.connection.clone(),
                    registration_seq: r.registration_seq,
                })
            })
            .collect();
        chain.sort_by_key(|h| (h.priority, h.registration_seq));
        chain
    }

    /// All records in registration order.
    pub fn snapshot(&self) -> Vec<SkillRecord> {
        let mut all: Vec<SkillRecord> = self.skills.iter().map(|r| r.value().clone()).collect();
        all.sort_by_key(|r| r.registration_seq);
        all
    }

    pub fn len(&self) -> usize {
        self.skills.len()
    }

    pub fn is_empty(&self) -> bool {
        self.skills.is_empty()
    }

    pub(crate) fn insert_loading(
        &self,
        skill_id: &str,
        connection: Option<ConnectionId>,
        now: DateTime<Utc>,
    ) -> SkillRecord {
        let record = SkillRecord {
            skill_id: skill_id.to_string(),
            state: SkillState::Loading,
            connection,
            fallback_priority: None,
            registration_seq: self.next_seq.fetch_add(1, Ordering::Relaxed) + 1,
            reload_attempts: 0,
            next_reload_check: None,
            failure_reason: None,
            updated_at: now,
        };
        self.skills.insert(skill_id.to_string(), record.clone());
        record
    }

    /// Apply `f` to the record, returning its result, or `None` if the skill is unknown.
    pub(crate) fn update<R>(&self, skill_id: &str, f: impl FnOnce(&mut SkillRecord) -> R) -> Option<R> {
        self.skills.get_mut(skill_id).map(|mut r| f(r.value_mut()))
    }

    pub(crate) fn remove(&self, skill_id: &str) -> Option<SkillRecord> {
        self.skills.remove(skill_id).map(|(_, r)| r)
    }

    /// Failed skills whose next reload check is due.
    pub(crate) fn due_for_reload(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut due: Vec<(u64, String)> = self
            .skills
            .iter()
            .filter(|r| r.state == SkillState::Failed)
            .filter(|r| r.next_reload_check.is_some_and(|t| t <= now))
            .map(|r| (r.registration_seq, r.skill_id.clone()))
            .collect();
        due.sort();
        due.into_iter().map(|(_, id)| id).collect()
    }
}
