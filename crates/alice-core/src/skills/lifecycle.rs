//! Skill lifecycle states and the legal transitions between them.
//!
//! ```text
//! loading -> active <-> paused
//! loading | active | paused -> failed -> loading (reload) | active (re-registered)
//! any -> stopped
//! ```

use crate::error::LifecycleError;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkillState {
    Loading,
    Active,
    Paused,
    Failed,
    Stopped,
}

impl SkillState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkillState::Loading => "loading",
            SkillState::Active => "active",
            SkillState::Paused => "paused",
            SkillState::Failed => "failed",
            SkillState::Stopped => "stopped",
        }
    }

    /// Only active skills take part in matching and the fallback chain.
    pub fn is_routable(&self) -> bool {
        matches!(self, SkillState::Active)
    }

    pub fn can_transition(&self, to: SkillState) -> bool {
        use SkillState::*;
        matches!(
            (*self, to),
            (Loading, Active)
                | (Active, Paused)
                | (Paused, Active)
                | (Loading | Active | Paused, Failed)
                | (Failed, Loading)
                | (Failed, Active)
                | (Loading | Active | Paused | Failed, Stopped)
        )
    }

    pub fn check_transition(&self, skill_id: &str, to: SkillState) -> Result<(), LifecycleError> {
        if self.can_transition(to) {
            Ok(())
        } else {
            Err(LifecycleError::InvalidTransition {
                skill_id: skill_id.to_string(),
                from: *self,
                to,
            })
        }
    }
}

impl fmt::Display for SkillState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::SkillState::*;

    #[test]
    fn test_legal_transitions() {
        assert!(Loading.can_transition(Active));
        assert!(Active.can_transition(Paused));
        assert!(Paused.can_transition(Active));
        assert!(Paused.can_transition(Failed));
        assert!(Failed.can_transition(Loading));
        assert!(Failed.can_transition(Stopped));
    }

    #[test]
    fn test_illegal_transitions() {
        assert!(!Loading.can_transition(Paused));
        assert!(!Stopped.can_transition(Loading));
        assert!(!Stopped.can_transition(Stopped));
        assert!(!Failed.can_transition(Paused));
        assert!(!Active.can_transition(Loading));
        assert!(Loading.check_transition("s", Paused).is_err());
    }

    #[test]
    fn test_only_active_is_routable() {
        for state in [Loading, Paused, Failed, Stopped] {
            assert!(!state.is_routable());
        }
        assert!(Active.is_routable());
    }
}
