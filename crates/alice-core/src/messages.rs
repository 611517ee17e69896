//! Dispatch and skill lifecycle message types.

// Utterances and dispatch results
pub const UTTERANCE: &str = "recognizer_loop:utterance";
pub const SPEAK: &str = "speak";
pub const CONVERSE_REQUEST: &str = "skill.converse.request";
pub const FALLBACK_REQUEST: &str = "mycroft.skills.fallback";
pub const FALLBACK_RESPONSE: &str = "mycroft.skills.fallback.response";
pub const HANDLER_START: &str = "mycroft.skill.handler.start";
pub const HANDLER_COMPLETE: &str = "mycroft.skill.handler.complete";
pub const HANDLER_FAILED: &str = "mycroft.skill.handler.failed";
/// No intent and no fallback handled the utterance.
pub const INTENT_FAILURE: &str = "complete_intent_failure";

// Sessions
pub const SESSION_ENDED: &str = "mycroft.session.ended";
pub const SESSION_GET: &str = "mycroft.session.get";

// Skill registration and lifecycle
pub const SKILL_LOADING: &str = "mycroft.skills.loading";
pub const REGISTER_INTENTS: &str = "intent.service.intent.reply";
pub const DETACH_INTENT: &str = "detach_intent";
pub const DETACH_SKILL: &str = "detach_skill";
pub const FALLBACK_REGISTER: &str = "mycroft.skills.fallback.register";
pub const FALLBACK_DETACH: &str = "mycroft.skills.fallback.detach";
pub const SKILL_PAUSE: &str = "mycroft.skills.pause";
pub const SKILL_RESUME: &str = "mycroft.skills.resume";
pub const SKILL_FAILED: &str = "mycroft.skills.failed";
pub const SKILL_STATE: &str = "mycroft.skills.state";
pub const SKILL_RELOAD: &str = "mycroft.skills.reload";
pub const REGISTRATION_REPLACED: &str = "intent.service.registration.replaced";
pub const REGISTRATION_FAILED: &str = "intent.service.registration.failed";

// Read-only queries; answered with `<type>.response`
pub const INTENT_GET: &str = "intent.service.intent.get";
pub const SKILLS_GET: &str = "intent.service.skills.get";

/// Types the dispatcher subscribes to.
pub const DISPATCHER_SUBSCRIPTIONS: &[&str] = &[
    UTTERANCE,
    HANDLER_START,
    HANDLER_COMPLETE,
    FALLBACK_RESPONSE,
    SESSION_GET,
    INTENT_GET,
    SKILL_STATE,
    alice_bus::messages::CLIENT_DISCONNECTED,
];

/// Types the skill manager subscribes to.
pub const SKILL_MANAGER_SUBSCRIPTIONS: &[&str] = &[
    SKILL_LOADING,
    REGISTER_INTENTS,
    DETACH_INTENT,
    DETACH_SKILL,
    FALLBACK_REGISTER,
    FALLBACK_DETACH,
    SKILL_PAUSE,
    SKILL_RESUME,
    SKILL_FAILED,
    SKILLS_GET,
    alice_bus::messages::CLIENT_DISCONNECTED,
];

/// Invocation type for a matched intent: `<skill_id>:<intent_name>`.
pub fn intent_message_type(skill_id: &str, intent: &str) -> String {
    format!("{}:{}", skill_id, intent)
}
