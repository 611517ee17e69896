//! Dispatcher: turns utterances into routed skill invocations and owns session state.
//!
//! Per utterance: resolve the session, route to the pinned skill if the session is
//! awaiting a continuation, otherwise match against the [`IntentIndex`] and route the
//! top candidate if it clears the acceptance threshold, otherwise walk the fallback
//! chain. Every invocation is tracked until the skill reports a result, fails, or its
//! deadline passes; it never hangs.

mod session;

pub use session::{
    DialogFrame, EndReason, Session, SessionEnded, SessionManager, SessionState, SessionView,
};

use crate::config::DispatchConfig;
use crate::intent::{IntentIndex, MatchCandidate};
use crate::messages;
use crate::skills::{FallbackHandler, SkillRegistry};
use alice_bus::{BusClient, ConnectionId, Envelope, MessageContext};
use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Map, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Outcome of one resolution attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchResult {
    /// Routed to the skill the session was pinned to.
    Continuation { skill_id: String, invocation_id: String },
    Matched { candidate: MatchCandidate, invocation_id: String },
    /// No candidate cleared the threshold; the first fallback handler was asked.
    Fallback { skill_id: String, invocation_id: String },
    /// Nothing matched and no fallback handler is available.
    NoMatch,
    /// The event carried no usable utterance.
    Ignored,
}

#[derive(Debug, Clone)]
enum InvocationKind {
    Intent { intent: String },
    Converse,
    Fallback { remaining: VecDeque<FallbackHandler> },
}

#[derive(Debug, Clone)]
struct PendingInvocation {
    invocation_id: String,
    session_id: String,
    turn: u64,
    skill_id: String,
    connection: Option<ConnectionId>,
    deadline: DateTime<Utc>,
    utterance: String,
    lang: Option<String>,
    origin: MessageContext,
    kind: InvocationKind,
}

/// What a single turn needs to route and to derive its outgoing envelopes.
struct Turn {
    session_id: String,
    turn: u64,
    utterance: String,
    lang: Option<String>,
    origin: MessageContext,
}

pub struct Dispatcher {
    config: DispatchConfig,
    intents: Arc<IntentIndex>,
    skills: Arc<SkillRegistry>,
    sessions: SessionManager,
    pending: HashMap<String, PendingInvocation>,
}

impl Dispatcher {
    pub fn new(config: DispatchConfig, intents: Arc<IntentIndex>, skills: Arc<SkillRegistry>) -> Self {
        let sessions = SessionManager::new(config.session_ttl());
        Self {
            config,
            intents,
            skills,
            sessions,
            pending: HashMap::new(),
        }
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn pending_invocations(&self) -> usize {
        self.pending.len()
    }

    /// Process one envelope, returning what should be published in response.
    pub fn handle(&mut self, envelope: &Envelope, now: DateTime<Utc>) -> Vec<Envelope> {
        let mut out = Vec::new();
        match envelope.msg_type.as_str() {
            messages::UTTERANCE => {
                let (_, produced) = self.dispatch(envelope, now);
                out = produced;
            }
            messages::HANDLER_START => self.on_start(envelope, now),
            messages::HANDLER_COMPLETE => self.on_complete(envelope, now, &mut out),
            messages::FALLBACK_RESPONSE => self.on_fallback_response(envelope, now, &mut out),
            messages::SESSION_GET => out.push(self.session_response(envelope, now)),
            messages::INTENT_GET => out.push(self.intent_response(envelope)),
            messages::SKILL_STATE => {
                let to = envelope.str_field("to");
                if matches!(to, Some("failed") | Some("stopped")) {
                    if let Some(skill_id) = envelope.str_field("skill_id") {
                        self.fail_pending(|p| p.skill_id == skill_id, "skill_failed", now, &mut out);
                    }
                }
            }
            alice_bus::messages::CLIENT_DISCONNECTED => {
                if let Some(client_id) = envelope.str_field("client_id") {
                    self.fail_pending(
                        |p| p.connection.as_ref().map(ConnectionId::as_str) == Some(client_id),
                        "disconnected",
                        now,
                        &mut out,
                    );
                }
            }
            other => debug!(msg_type = other, "dispatcher ignoring envelope"),
        }
        out
    }

    /// Apply deadlines: session expiry and invocation timeouts.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Vec<Envelope> {
        let mut out: Vec<Envelope> = self
            .sessions
            .sweep(now)
            .iter()
            .map(session_ended)
            .collect();

        let mut expired: Vec<(DateTime<Utc>, String)> = self
            .pending
            .values()
            .filter(|p| p.deadline <= now)
            .map(|p| (p.deadline, p.invocation_id.clone()))
            .collect();
        expired.sort();
        for (_, invocation_id) in expired {
            let Some(pending) = self.pending.remove(&invocation_id) else {
                continue;
            };
            match pending.kind {
                InvocationKind::Fallback { .. } => {
                    warn!(invocation_id = %invocation_id, skill_id = %pending.skill_id, "fallback handler timed out");
                    self.continue_fallback(pending, now, &mut out);
                }
                _ => {
                    warn!(invocation_id = %invocation_id, skill_id = %pending.skill_id, "skill handler timed out");
                    out.push(
                        Envelope::new(messages::SKILL_FAILED).with_data(json!({
                            "skill_id": pending.skill_id,
                            "reason": "handler_timeout",
                        })),
                    );
                    self.resolve_failed(&pending, "timeout", &mut out);
                }
            }
        }
        out
    }

    /// Route one utterance event.
    #[instrument(skip(self, envelope, now), fields(session_id = envelope.session_id()))]
    pub fn dispatch(&mut self, envelope: &Envelope, now: DateTime<Utc>) -> (DispatchResult, Vec<Envelope>) {
        let mut out = Vec::new();
        let Some(utterance) = first_utterance(&envelope.data) else {
            debug!("utterance event without text");
            return (DispatchResult::Ignored, out);
        };
        let entities = entities(&envelope.data);

        let (session_id, ended) = self.sessions.resolve(envelope.session_id(), now);
        out.extend(ended.iter().map(session_ended));
        let turn = Turn {
            turn: self.sessions.begin_turn(&session_id, now),
            session_id,
            utterance,
            lang: envelope.str_field("lang").map(str::to_string),
            origin: envelope.context.clone(),
        };

        if let Some(skill_id) = self
            .sessions
            .continuation_target(&turn.session_id, now)
            .map(str::to_string)
        {
            if self.skills.is_active(&skill_id) {
                let frame = self.sessions.take_continuation(&turn.session_id, now);
                let invocation_id = self.converse(&turn, &skill_id, frame, now, &mut out);
                return (
                    DispatchResult::Continuation {
                        skill_id,
                        invocation_id,
                    },
                    out,
                );
            }
            debug!(skill_id = %skill_id, "pinned skill no longer active; matching fresh");
            self.sessions.release(&turn.session_id);
        }

        let skills = Arc::clone(&self.skills);
        let top = self
            .intents
            .best_match(&turn.utterance, &entities, |skill_id| skills.is_active(skill_id));
        match top {
            Some(candidate) if candidate.score >= self.config.acceptance_threshold => {
                self.sessions.release(&turn.session_id);
                let invocation_id = self.invoke(&turn, &candidate, now, &mut out);
                (
                    DispatchResult::Matched {
                        candidate,
                        invocation_id,
                    },
                    out,
                )
            }
            other => {
                if let Some(best) = &other {
                    debug!(skill_id = %best.skill_id, intent = %best.intent, score = best.score, "best candidate below threshold");
                }
                let chain: VecDeque<FallbackHandler> = self.skills.fallback_chain().into();
                match self.start_fallback(&turn, chain, now, &mut out) {
                    Some((skill_id, invocation_id)) => (
                        DispatchResult::Fallback {
                            skill_id,
                            invocation_id,
                        },
                        out,
                    ),
                    None => (DispatchResult::NoMatch, out),
                }
            }
        }
    }

    fn invoke(&mut self, turn: &Turn, candidate: &MatchCandidate, now: DateTime<Utc>, out: &mut Vec<Envelope>) -> String {
        let invocation_id = new_invocation_id();
        let connection = self.skills.connection(&candidate.skill_id);
        info!(
            session_id = %turn.session_id,
            skill_id = %candidate.skill_id,
            intent = %candidate.intent,
            confidence = candidate.score,
            invocation_id = %invocation_id,
            "intent matched"
        );
        out.push(address(
            derive(
                &turn.origin,
                &turn.session_id,
                messages::intent_message_type(&candidate.skill_id, &candidate.intent),
                json!({
                    "invocation_id": invocation_id,
                    "skill_id": candidate.skill_id,
                    "intent": candidate.intent,
                    "utterance": turn.utterance,
                    "slots": candidate.slots,
                    "confidence": candidate.score,
                    "lang": turn.lang,
                }),
            ),
            connection.as_ref(),
        ));
        self.track(
            turn,
            &invocation_id,
            &candidate.skill_id,
            connection,
            now + self.config.handler_timeout(),
            InvocationKind::Intent {
                intent: candidate.intent.clone(),
            },
        );
        invocation_id
    }

    fn converse(
        &mut self,
        turn: &Turn,
        skill_id: &str,
        frame: Option<DialogFrame>,
        now: DateTime<Utc>,
        out: &mut Vec<Envelope>,
    ) -> String {
        let invocation_id = new_invocation_id();
        let connection = self.skills.connection(skill_id);
        let frame = frame.map(|f| f.data).unwrap_or_else(|| json!({}));
        info!(session_id = %turn.session_id, skill_id, invocation_id = %invocation_id, "continuing conversation");
        out.push(address(
            derive(
                &turn.origin,
                &turn.session_id,
                messages::CONVERSE_REQUEST.to_string(),
                json!({
                    "invocation_id": invocation_id,
                    "skill_id": skill_id,
                    "utterance": turn.utterance,
                    "frame": frame,
                    "lang": turn.lang,
                }),
            ),
            connection.as_ref(),
        ));
        self.track(
            turn,
            &invocation_id,
            skill_id,
            connection,
            now + self.config.handler_timeout(),
            InvocationKind::Converse,
        );
        invocation_id
    }

    /// Ask the first still-active handler in `chain`; emit the no-intent result if none is left.
    fn start_fallback(
        &mut self,
        turn: &Turn,
        mut chain: VecDeque<FallbackHandler>,
        now: DateTime<Utc>,
        out: &mut Vec<Envelope>,
    ) -> Option<(String, String)> {
        while let Some(handler) = chain.pop_front() {
            if !self.skills.is_active(&handler.skill_id) {
                continue;
            }
            let invocation_id = new_invocation_id();
            debug!(session_id = %turn.session_id, skill_id = %handler.skill_id, priority = handler.priority, "trying fallback");
            out.push(address(
                derive(
                    &turn.origin,
                    &turn.session_id,
                    messages::FALLBACK_REQUEST.to_string(),
                    json!({
                        "invocation_id": invocation_id,
                        "skill_id": handler.skill_id,
                        "utterance": turn.utterance,
                        "priority": handler.priority,
                        "lang": turn.lang,
                    }),
                ),
                handler.connection.as_ref(),
            ));
            self.track(
                turn,
                &invocation_id,
                &handler.skill_id,
                handler.connection.clone(),
                now + self.config.fallback_timeout(),
                InvocationKind::Fallback { remaining: chain },
            );
            return Some((handler.skill_id, invocation_id));
        }

        info!(session_id = %turn.session_id, utterance = %turn.utterance, "no intent found");
        out.push(derive(
            &turn.origin,
            &turn.session_id,
            messages::INTENT_FAILURE.to_string(),
            json!({ "utterance": turn.utterance, "lang": turn.lang }),
        ));
        None
    }

    fn continue_fallback(&mut self, pending: PendingInvocation, now: DateTime<Utc>, out: &mut Vec<Envelope>) {
        if self.is_stale(&pending) {
            debug!(invocation_id = %pending.invocation_id, "fallback chain superseded by a newer turn");
            return;
        }
        let InvocationKind::Fallback { remaining } = pending.kind else {
            return;
        };
        let turn = Turn {
            session_id: pending.session_id,
            turn: pending.turn,
            utterance: pending.utterance,
            lang: pending.lang,
            origin: pending.origin,
        };
        self.start_fallback(&turn, remaining, now, out);
    }

    fn track(
        &mut self,
        turn: &Turn,
        invocation_id: &str,
        skill_id: &str,
        connection: Option<ConnectionId>,
        deadline: DateTime<Utc>,
        kind: InvocationKind,
    ) {
        self.pending.insert(
            invocation_id.to_string(),
            PendingInvocation {
                invocation_id: invocation_id.to_string(),
                session_id: turn.session_id.clone(),
                turn: turn.turn,
                skill_id: skill_id.to_string(),
                connection,
                deadline,
                utterance: turn.utterance.clone(),
                lang: turn.lang.clone(),
                origin: turn.origin.clone(),
                kind,
            },
        );
    }

    fn is_stale(&self, pending: &PendingInvocation) -> bool {
        self.sessions.current_turn(&pending.session_id) != Some(pending.turn)
    }

    fn on_start(&mut self, envelope: &Envelope, now: DateTime<Utc>) {
        let timeout = self.config.handler_timeout();
        if let Some(pending) = envelope
            .str_field("invocation_id")
            .and_then(|id| self.pending.get_mut(id))
        {
            if !matches!(pending.kind, InvocationKind::Fallback { .. }) {
                pending.deadline = now + timeout;
            }
            debug!(invocation_id = %pending.invocation_id, skill_id = %pending.skill_id, "handler started");
        }
    }

    fn on_complete(&mut self, envelope: &Envelope, now: DateTime<Utc>, out: &mut Vec<Envelope>) {
        let Some(invocation_id) = envelope.str_field("invocation_id") else {
            return;
        };
        let Some(pending) = self.pending.remove(invocation_id) else {
            debug!(invocation_id, "completion for unknown or resolved invocation");
            return;
        };
        if let InvocationKind::Intent { intent } = &pending.kind {
            debug!(invocation_id, skill_id = %pending.skill_id, intent = %intent, "handler complete");
        }
        if self.is_stale(&pending) {
            debug!(invocation_id, session_id = %pending.session_id, "result for a superseded turn");
            return;
        }

        if envelope.bool_field("end_conversation").unwrap_or(false) {
            if let Some(ended) = self.sessions.end(&pending.session_id) {
                out.push(session_ended(&ended));
            }
        } else if envelope.bool_field("expect_response").unwrap_or(false) {
            let timeout = envelope
                .u64_field("continuation_timeout")
                .filter(|secs| *secs > 0)
                .map(|secs| Duration::seconds(secs as i64))
                .unwrap_or_else(|| self.config.continuation_timeout());
            let frame = DialogFrame {
                skill_id: pending.skill_id.clone(),
                invocation_id: pending.invocation_id.clone(),
                data: envelope.data.get("frame").cloned().unwrap_or_else(|| json!({})),
                pushed_at: now,
            };
            self.sessions
                .await_continuation(&pending.session_id, frame, now + timeout);
        } else {
            self.sessions.release(&pending.session_id);
        }
    }

    fn on_fallback_response(&mut self, envelope: &Envelope, now: DateTime<Utc>, out: &mut Vec<Envelope>) {
        let Some(invocation_id) = envelope.str_field("invocation_id") else {
            return;
        };
        let is_fallback = matches!(
            self.pending.get(invocation_id).map(|p| &p.kind),
            Some(InvocationKind::Fallback { .. })
        );
        if !is_fallback {
            return;
        }
        let Some(pending) = self.pending.remove(invocation_id) else {
            return;
        };
        if envelope.bool_field("handled").unwrap_or(false) {
            info!(invocation_id, skill_id = %pending.skill_id, session_id = %pending.session_id, "fallback handled utterance");
            return;
        }
        debug!(invocation_id, skill_id = %pending.skill_id, "fallback declined");
        self.continue_fallback(pending, now, out);
    }

    /// Resolve every matching in-flight invocation as failed.
    fn fail_pending<F>(&mut self, predicate: F, reason: &str, now: DateTime<Utc>, out: &mut Vec<Envelope>)
    where
        F: Fn(&PendingInvocation) -> bool,
    {
        let mut ids: Vec<(DateTime<Utc>, String)> = self
            .pending
            .values()
            .filter(|p| predicate(p))
            .map(|p| (p.deadline, p.invocation_id.clone()))
            .collect();
        ids.sort();
        for (_, id) in ids {
            let Some(pending) = self.pending.remove(&id) else {
                continue;
            };
            match pending.kind {
                InvocationKind::Fallback { .. } => self.continue_fallback(pending, now, out),
                _ => self.resolve_failed(&pending, reason, out),
            }
        }
    }

    /// Deliver a failure result to the originating session and drop a pin it held.
    fn resolve_failed(&mut self, pending: &PendingInvocation, reason: &str, out: &mut Vec<Envelope>) {
        warn!(
            invocation_id = %pending.invocation_id,
            skill_id = %pending.skill_id,
            session_id = %pending.session_id,
            reason,
            "invocation failed"
        );
        out.push(
            derive(
                &pending.origin,
                &pending.session_id,
                messages::HANDLER_FAILED.to_string(),
                json!({
                    "invocation_id": pending.invocation_id,
                    "skill_id": pending.skill_id,
                    "reason": reason,
                }),
            )
            .critical(),
        );
        let pinned_here = self
            .sessions
            .get(&pending.session_id)
            .and_then(|s| s.active_skill.as_deref())
            == Some(pending.skill_id.as_str());
        if !self.is_stale(pending) && pinned_here {
            self.sessions.release(&pending.session_id);
        }
    }

    fn session_response(&self, request: &Envelope, now: DateTime<Utc>) -> Envelope {
        let session_id = request
            .str_field("session_id")
            .or_else(|| request.session_id())
            .unwrap_or_default();
        let view = self.sessions.view(session_id, now);
        request.response(json!({
            "session_id": view.session_id,
            "state": view.state,
            "active_skill": view.active_skill,
            "stack_depth": view.stack_depth,
            "expires_at": view.expires_at,
            "exists": view.exists,
        }))
    }

    fn intent_response(&self, request: &Envelope) -> Envelope {
        let utterance = request
            .str_field("utterance")
            .map(str::to_string)
            .or_else(|| first_utterance(&request.data))
            .unwrap_or_default();
        let skills = Arc::clone(&self.skills);
        let best = self
            .intents
            .best_match(&utterance, &entities(&request.data), |s| skills.is_active(s));
        let accepted = best
            .as_ref()
            .is_some_and(|c| c.score >= self.config.acceptance_threshold);
        request.response(json!({ "intent": best, "accepted": accepted }))
    }

    /// Serve the bus until the client's connection closes.
    pub async fn run(mut self, client: BusClient) {
        let mut sweep =
            tokio::time::interval(std::time::Duration::from_millis(self.config.sweep_interval_ms));
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(client_id = %client.id(), "dispatcher started");
        loop {
            let outgoing = tokio::select! {
                received = client.recv() => match received {
                    Some(envelope) => self.handle(&envelope, Utc::now()),
                    None => break,
                },
                _ = sweep.tick() => self.tick(Utc::now()),
            };
            if !crate::publish_all(&client, outgoing) {
                break;
            }
        }
        info!("dispatcher stopped");
    }

    pub fn spawn(self, client: BusClient) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run(client))
    }
}

fn new_invocation_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// First non-empty transcription of an utterance event.
fn first_utterance(data: &Map<String, Value>) -> Option<String> {
    let listed = data
        .get("utterances")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(Value::as_str);
    let single = data.get("utterance").and_then(Value::as_str);
    listed
        .chain(single)
        .map(str::trim)
        .find(|u| !u.is_empty())
        .map(str::to_string)
}

fn entities(data: &Map<String, Value>) -> HashMap<String, String> {
    data.get("entities")
        .and_then(Value::as_object)
        .map(|object| {
            object
                .iter()
                .filter_map(|(k, v)| {
                    let value = match v {
                        Value::String(s) => s.clone(),
                        Value::Null => return None,
                        other => other.to_string(),
                    };
                    Some((k.clone(), value))
                })
                .collect()
        })
        .unwrap_or_default()
}

/// New envelope in the same turn: session and correlation metadata carried over,
/// routing fields left for the broker and [`address`].
fn derive(origin: &MessageContext, session_id: &str, msg_type: String, data: Value) -> Envelope {
    let mut envelope = Envelope::new(msg_type).with_data(data).with_session(session_id);
    envelope.context.extra = origin.extra.clone();
    envelope.context.extra.remove("critical");
    envelope
}

fn address(envelope: Envelope, connection: Option<&ConnectionId>) -> Envelope {
    match connection {
        Some(connection) => envelope.with_destination(connection.as_str()),
        None => envelope,
    }
}

fn session_ended(ended: &SessionEnded) -> Envelope {
    Envelope::new(messages::SESSION_ENDED)
        .with_session(ended.session_id.as_str())
        .with_data(json!({
            "session_id": ended.session_id,
            "reason": ended.reason.as_str(),
            "active_skill": ended.active_skill,
        }))
}
