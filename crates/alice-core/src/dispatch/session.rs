//! Per-session conversational state, owned exclusively by the dispatcher.
//!
//! Deadlines are checked against the `now` passed in, lazily whenever a session is
//! touched and eagerly by [`SessionManager::sweep`].

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    AwaitingContinuation,
    Expired,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::AwaitingContinuation => "awaiting_continuation",
            SessionState::Expired => "expired",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    ContinuationTimeout,
    IdleTimeout,
    ConversationEnded,
}

impl EndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndReason::ContinuationTimeout => "continuation_timeout",
            EndReason::IdleTimeout => "idle_timeout",
            EndReason::ConversationEnded => "conversation_ended",
        }
    }
}

/// A pending dialog step pushed by a skill that asked for the next utterance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DialogFrame {
    pub skill_id: String,
    pub invocation_id: String,
    pub data: Value,
    pub pushed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub id: String,
    pub state: SessionState,
    pub active_skill: Option<String>,
    /// Most recent first.
    pub conversation_stack: VecDeque<DialogFrame>,
    pub expires_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    /// Stamped per utterance from a manager-wide counter, so a recreated session never
    /// reuses a number. Results for an older turn no longer touch state.
    pub turn: u64,
}

impl Session {
    fn new(id: String, now: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            id,
            state: SessionState::Idle,
            active_skill: None,
            conversation_stack: VecDeque::new(),
            expires_at: now + ttl,
            last_activity: now,
            turn: 0,
        }
    }

    fn release(&mut self, ttl: Duration) {
        self.state = SessionState::Idle;
        self.active_skill = None;
        self.conversation_stack.clear();
        self.expires_at = self.last_activity + ttl;
    }
}

/// Emitted when a session's continuation window closes or the session goes away.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionEnded {
    pub session_id: String,
    pub reason: EndReason,
    pub active_skill: Option<String>,
}

/// Read-only view for queries.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionView {
    pub session_id: String,
    pub state: SessionState,
    pub active_skill: Option<String>,
    pub stack_depth: usize,
    pub expires_at: Option<DateTime<Utc>>,
    pub exists: bool,
}

#[derive(Debug)]
pub struct SessionManager {
    sessions: HashMap<String, Session>,
    ttl: Duration,
    last_turn: u64,
}

impl SessionManager {
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: HashMap::new(),
            ttl,
            last_turn: 0,
        }
    }

    pub fn get(&self, session_id: &str) -> Option<&Session> {
        self.sessions.get(session_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Find or create the session for an incoming turn. An absent id gets a fresh one.
    /// Deadlines that have passed are applied first.
    pub fn resolve(&mut self, session_id: Option<&str>, now: DateTime<Utc>) -> (String, Vec<SessionEnded>) {
        let id = match session_id.map(str::trim).filter(|s| !s.is_empty()) {
            Some(id) => id.to_string(),
            None => uuid::Uuid::new_v4().to_string(),
        };
        let mut ended = Vec::new();
        if let Some(event) = self.expire_one(&id, now) {
            ended.push(event);
        }
        if !self.sessions.contains_key(&id) {
            debug!(session_id = %id, "session created");
            self.sessions
                .insert(id.clone(), Session::new(id.clone(), now, self.ttl));
        }
        (id, ended)
    }

    /// Start a new turn and return its number, unique across all sessions.
    pub fn begin_turn(&mut self, session_id: &str, now: DateTime<Utc>) -> u64 {
        let ttl = self.ttl;
        let Some(session) = self.sessions.get_mut(session_id) else {
            return 0;
        };
        self.last_turn += 1;
        session.turn = self.last_turn;
        session.last_activity = now;
        if session.state == SessionState::Idle {
            session.expires_at = now + ttl;
        }
        session.turn
    }

    pub fn current_turn(&self, session_id: &str) -> Option<u64> {
        self.sessions.get(session_id).map(|s| s.turn)
    }

    /// Skill a follow-up utterance should go to, if the session awaits one.
    pub fn continuation_target(&self, session_id: &str, now: DateTime<Utc>) -> Option<&str> {
        self.sessions
            .get(session_id)
            .filter(|s| s.state == SessionState::AwaitingContinuation && now < s.expires_at)
            .and_then(|s| s.active_skill.as_deref())
    }

    /// A follow-up arrived inside the window: the window is used up and the frame it
    /// answers is popped. The session stays with the pinned skill, idle, until the skill
    /// asks for another response or the turn resolves.
    pub fn take_continuation(&mut self, session_id: &str, now: DateTime<Utc>) -> Option<DialogFrame> {
        let ttl = self.ttl;
        let session = self.sessions.get_mut(session_id)?;
        if session.state != SessionState::AwaitingContinuation {
            return None;
        }
        session.state = SessionState::Idle;
        session.last_activity = now;
        session.expires_at = now + ttl;
        session.conversation_stack.pop_front()
    }

    /// Most recent dialog frame, if any.
    pub fn top_frame(&self, session_id: &str) -> Option<&DialogFrame> {
        self.sessions
            .get(session_id)
            .and_then(|s| s.conversation_stack.front())
    }

    /// Pin the session to `frame.skill_id` until `deadline`.
    pub fn await_continuation(&mut self, session_id: &str, frame: DialogFrame, deadline: DateTime<Utc>) {
        if let Some(session) = self.sessions.get_mut(session_id) {
            debug!(session_id, skill_id = %frame.skill_id, %deadline, "awaiting continuation");
            session.state = SessionState::AwaitingContinuation;
            session.active_skill = Some(frame.skill_id.clone());
            session.last_activity = frame.pushed_at;
            session.conversation_stack.push_front(frame);
            session.expires_at = deadline;
        }
    }

    /// Back to idle with no pin.
    pub fn release(&mut self, session_id: &str) {
        let ttl = self.ttl;
        if let Some(session) = self.sessions.get_mut(session_id) {
            session.release(ttl);
        }
    }

    /// The skill ended the conversation: the session is destroyed.
    pub fn end(&mut self, session_id: &str) -> Option<SessionEnded> {
        let session = self.sessions.remove(session_id)?;
        info!(session_id, "conversation ended");
        Some(SessionEnded {
            session_id: session.id,
            reason: EndReason::ConversationEnded,
            active_skill: session.active_skill,
        })
    }

    /// Apply every passed deadline.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> Vec<SessionEnded> {
        let mut due: Vec<String> = self
            .sessions
            .values()
            .filter(|s| now >= s.expires_at)
            .map(|s| s.id.clone())
            .collect();
        due.sort();
        due.iter().filter_map(|id| self.expire_one(id, now)).collect()
    }

    fn expire_one(&mut self, session_id: &str, now: DateTime<Utc>) -> Option<SessionEnded> {
        let ttl = self.ttl;
        let session = self.sessions.get_mut(session_id)?;
        if now < session.expires_at {
            return None;
        }
        let state = session.state;
        match state {
            SessionState::AwaitingContinuation => {
                let active_skill = session.active_skill.clone();
                session.release(ttl);
                info!(session_id, skill_id = ?active_skill, "continuation window expired");
                Some(SessionEnded {
                    session_id: session_id.to_string(),
                    reason: EndReason::ContinuationTimeout,
                    active_skill,
                })
            }
            SessionState::Idle | SessionState::Expired => {
                session.state = SessionState::Expired;
                let session = self.sessions.remove(session_id)?;
                debug!(session_id, "idle session expired");
                Some(SessionEnded {
                    session_id: session.id,
                    reason: EndReason::IdleTimeout,
                    active_skill: None,
                })
            }
        }
    }

    /// Effective state at `now`, without applying any transition.
    pub fn view(&self, session_id: &str, now: DateTime<Utc>) -> SessionView {
        match self.sessions.get(session_id) {
            Some(s) if now < s.expires_at => SessionView {
                session_id: s.id.clone(),
                state: s.state,
                active_skill: s.active_skill.clone(),
                stack_depth: s.conversation_stack.len(),
                expires_at: Some(s.expires_at),
                exists: true,
            },
            Some(s) if s.state == SessionState::AwaitingContinuation => SessionView {
                session_id: s.id.clone(),
                state: SessionState::Idle,
                active_skill: None,
                stack_depth: 0,
                expires_at: Some(s.last_activity + self.ttl),
                exists: true,
            },
            Some(s) => SessionView {
                session_id: s.id.clone(),
                state: SessionState::Expired,
                active_skill: None,
                stack_depth: 0,
                expires_at: None,
                exists: false,
            },
            None => SessionView {
                session_id: session_id.to_string(),
                state: SessionState::Idle,
                active_skill: None,
                stack_depth: 0,
                expires_at: None,
                exists: false,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn frame(skill: &str, at: DateTime<Utc>) -> DialogFrame {
        DialogFrame {
            skill_id: skill.to_string(),
            invocation_id: "inv-1".to_string(),
            data: json!({}),
            pushed_at: at,
        }
    }

    #[test]
    fn test_absent_id_creates_fresh_session() {
        let mut sessions = SessionManager::new(Duration::seconds(300));
        let now = Utc::now();
        let (a, _) = sessions.resolve(None, now);
        let (b, _) = sessions.resolve(None, now);
        assert_ne!(a, b);
        let (c, _) = sessions.resolve(Some("kitchen"), now);
        assert_eq!(c, "kitchen");
        assert_eq!(sessions.len(), 3);
    }

    #[test]
    fn test_continuation_until_deadline() {
        let mut sessions = SessionManager::new(Duration::seconds(300));
        let t0 = Utc::now();
        let (id, _) = sessions.resolve(Some("s1"), t0);
        sessions.begin_turn(&id, t0);
        sessions.await_continuation(&id, frame("timer", t0), t0 + Duration::seconds(20));

        assert_eq!(sessions.continuation_target(&id, t0 + Duration::seconds(19)), Some("timer"));
        assert_eq!(sessions.continuation_target(&id, t0 + Duration::seconds(20)), None);
        assert_eq!(
            sessions.view(&id, t0 + Duration::seconds(25)).state,
            SessionState::Idle
        );

        let (_, ended) = sessions.resolve(Some("s1"), t0 + Duration::seconds(25));
        assert_eq!(ended.len(), 1);
        assert_eq!(ended[0].reason, EndReason::ContinuationTimeout);
        assert_eq!(ended[0].active_skill.as_deref(), Some("timer"));
        let session = sessions.get("s1").unwrap();
        assert_eq!(session.state, SessionState::Idle);
        assert!(session.conversation_stack.is_empty());
    }

    #[test]
    fn test_idle_ttl_removes_session() {
        let mut sessions = SessionManager::new(Duration::seconds(60));
        let t0 = Utc::now();
        sessions.resolve(Some("s1"), t0);
        sessions.resolve(Some("s2"), t0 + Duration::seconds(30));
        let ended = sessions.sweep(t0 + Duration::seconds(61));
        assert_eq!(ended.len(), 1);
        assert_eq!(ended[0].session_id, "s1");
        assert_eq!(ended[0].reason, EndReason::IdleTimeout);
        assert!(sessions.get("s1").is_none());
        assert!(sessions.get("s2").is_some());
    }

    #[test]
    fn test_end_destroys_session() {
        let mut sessions = SessionManager::new(Duration::seconds(60));
        let now = Utc::now();
        sessions.resolve(Some("s1"), now);
        sessions.await_continuation("s1", frame("quiz", now), now + Duration::seconds(10));
        let ended = sessions.end("s1").unwrap();
        assert_eq!(ended.reason, EndReason::ConversationEnded);
        assert_eq!(ended.active_skill.as_deref(), Some("quiz"));
        assert!(sessions.end("s1").is_none());
    }

    #[test]
    fn test_recreated_session_gets_fresh_turn_numbers() {
        let mut sessions = SessionManager::new(Duration::seconds(60));
        let now = Utc::now();
        sessions.resolve(Some("s1"), now);
        let first = sessions.begin_turn("s1", now);
        sessions.end("s1");
        sessions.resolve(Some("s1"), now);
        assert!(sessions.begin_turn("s1", now) > first);
    }

    #[test]
    fn test_taking_a_continuation_consumes_the_window_and_frame() {
        let mut sessions = SessionManager::new(Duration::seconds(300));
        let t0 = Utc::now();
        sessions.resolve(Some("s1"), t0);
        sessions.await_continuation("s1", frame("timer", t0), t0 + Duration::seconds(10));

        let t9 = t0 + Duration::seconds(9);
        let taken = sessions.take_continuation("s1", t9).unwrap();
        assert_eq!(taken.skill_id, "timer");
        let view = sessions.view("s1", t9);
        assert_eq!(view.state, SessionState::Idle);
        assert_eq!(view.active_skill.as_deref(), Some("timer"));
        assert_eq!(view.stack_depth, 0);
        assert!(sessions.sweep(t0 + Duration::seconds(11)).is_empty());
        assert!(sessions.take_continuation("s1", t9).is_none());
    }

    #[test]
    fn test_turns_increment_and_stack_is_most_recent_first() {
        let mut sessions = SessionManager::new(Duration::seconds(60));
        let now = Utc::now();
        sessions.resolve(Some("s1"), now);
        assert_eq!(sessions.begin_turn("s1", now), 1);
        assert_eq!(sessions.begin_turn("s1", now), 2);
        sessions.await_continuation("s1", frame("a", now), now + Duration::seconds(10));
        sessions.await_continuation("s1", frame("b", now), now + Duration::seconds(10));
        assert_eq!(sessions.top_frame("s1").unwrap().skill_id, "b");
        assert_eq!(sessions.view("s1", now).stack_depth, 2);
    }
}
