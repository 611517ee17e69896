//! Intent Index: the registered intents of every skill and the matcher over them.
//!
//! Readers take an `Arc` snapshot and match without holding any lock, so concurrent
//! `match_utterance` calls never contend. Writers build a new snapshot under a
//! writer lock and swap it in, which makes each registration atomic.

mod definition;
mod matcher;

pub use definition::{compile, CompiledIntent, IntentDefinition};
pub use matcher::{normalize, rank, score_intent, tokenize, MatchCandidate, ScoringWeights, Utterance};

use crate::error::RegistrationError;
use std::collections::{BTreeMap, HashMap};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone)]
struct SkillIntents {
    registration_seq: u64,
    intents: Vec<CompiledIntent>,
}

#[derive(Debug, Clone, Default)]
pub struct IndexSnapshot {
    skills: BTreeMap<String, SkillIntents>,
    next_seq: u64,
}

impl IndexSnapshot {
    pub fn skill_ids(&self) -> Vec<&str> {
        self.skills.keys().map(String::as_str).collect()
    }

    pub fn intent_names(&self, skill_id: &str) -> Vec<String> {
        self.skills
            .get(skill_id)
            .map(|s| s.intents.iter().map(|i| i.name().to_string()).collect())
            .unwrap_or_default()
    }

    pub fn registration_seq(&self, skill_id: &str) -> Option<u64> {
        self.skills.get(skill_id).map(|s| s.registration_seq)
    }

    pub fn len(&self) -> usize {
        self.skills.values().map(|s| s.intents.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Result of a successful registration.
#[derive(Debug, Clone, PartialEq)]
pub struct Registered {
    pub skill_id: String,
    pub intents: Vec<String>,
    /// Intent names from the registration this one replaced.
    pub replaced: Option<Vec<String>>,
}

#[derive(Debug)]
pub struct IntentIndex {
    snapshot: RwLock<Arc<IndexSnapshot>>,
    writer: Mutex<()>,
    weights: ScoringWeights,
}

impl Default for IntentIndex {
    fn default() -> Self {
        Self::new(ScoringWeights::default())
    }
}

impl IntentIndex {
    pub fn new(weights: ScoringWeights) -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(IndexSnapshot::default())),
            writer: Mutex::new(()),
            weights,
        }
    }

    pub fn snapshot(&self) -> Arc<IndexSnapshot> {
        Arc::clone(&self.snapshot.read())
    }

    fn update<R>(&self, f: impl FnOnce(&mut IndexSnapshot) -> R) -> R {
        let _guard = self.writer.lock();
        let mut next = (*self.snapshot()).clone();
        let result = f(&mut next);
        *self.snapshot.write() = Arc::new(next);
        result
    }

    /// Atomically replace everything `skill_id` had registered. On error nothing changes.
    pub fn register_intents(
        &self,
        skill_id: &str,
        definitions: Vec<IntentDefinition>,
    ) -> Result<Registered, RegistrationError> {
        let compiled = compile(skill_id, definitions)?;
        let names: Vec<String> = compiled.iter().map(|i| i.name().to_string()).collect();

        let replaced = self.update(|snapshot| {
            let seq = match snapshot.skills.get(skill_id) {
                Some(existing) => existing.registration_seq,
                None => {
                    snapshot.next_seq += 1;
                    snapshot.next_seq
                }
            };
            snapshot
                .skills
                .insert(
                    skill_id.to_string(),
                    SkillIntents {
                        registration_seq: seq,
                        intents: compiled,
                    },
                )
                .map(|old| old.intents.iter().map(|i| i.name().to_string()).collect())
        });

        info!(skill_id, intents = names.len(), replaced = replaced.is_some(), "intents registered");
        Ok(Registered {
            skill_id: skill_id.to_string(),
            intents: names,
            replaced,
        })
    }

    /// Remove one intent. The skill keeps its registration order.
    pub fn remove_intent(&self, skill_id: &str, intent: &str) -> bool {
        let removed = self.update(|snapshot| {
            let Some(skill) = snapshot.skills.get_mut(skill_id) else {
                return false;
            };
            let before = skill.intents.len();
            skill.intents.retain(|i| i.name() != intent);
            skill.intents.len() != before
        });
        debug!(skill_id, intent, removed, "detach intent");
        removed
    }

    /// Forget the skill entirely, including its registration order.
    pub fn remove_skill(&self, skill_id: &str) -> bool {
        let removed = self.update(|snapshot| snapshot.skills.remove(skill_id).is_some());
        debug!(skill_id, removed, "detach skill");
        removed
    }

    /// Ranked candidates that pass the hard gate, restricted to skills `eligible` accepts.
    pub fn match_utterance<F>(
        &self,
        text: &str,
        entities: &HashMap<String, String>,
        eligible: F,
    ) -> Vec<MatchCandidate>
    where
        F: Fn(&str) -> bool,
    {
        let snapshot = self.snapshot();
        let utterance = Utterance::new(text);
        let mut candidates: Vec<MatchCandidate> = snapshot
            .skills
            .iter()
            .filter(|(skill_id, _)| eligible(skill_id))
            .flat_map(|(_, skill)| {
                let utterance = &utterance;
                let weights = &self.weights;
                skill.intents.iter().filter_map(move |intent| {
                    score_intent(intent, utterance, entities, skill.registration_seq, weights)
                })
            })
            .collect();
        rank(&mut candidates);
        candidates
    }

    pub fn best_match<F>(
        &self,
        text: &str,
        entities: &HashMap<String, String>,
        eligible: F,
    ) -> Option<MatchCandidate>
    where
        F: Fn(&str) -> bool,
    {
        self.match_utterance(text, entities, eligible).into_iter().next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn weather() -> IntentDefinition {
        IntentDefinition::new("current")
            .with_vocabulary(["weather", "what's the weather"])
            .with_priority(10)
    }

    fn no_entities() -> HashMap<String, String> {
        HashMap::new()
    }

    #[test]
    fn test_reregistration_replaces_atomically() {
        let index = IntentIndex::default();
        index
            .register_intents("weather", vec![weather(), IntentDefinition::new("old").with_vocabulary(["umbrella"])])
            .unwrap();
        let second = index
            .register_intents("weather", vec![weather()])
            .unwrap();
        assert_eq!(second.replaced, Some(vec!["current".to_string(), "old".to_string()]));
        assert!(index
            .match_utterance("umbrella", &no_entities(), |_| true)
            .is_empty());
        assert_eq!(index.snapshot().intent_names("weather"), vec!["current"]);
    }

    #[test]
    fn test_failed_registration_keeps_previous() {
        let index = IntentIndex::default();
        index.register_intents("weather", vec![weather()]).unwrap();
        let err = index
            .register_intents("weather", vec![IntentDefinition::new("x").with_pattern("(")])
            .unwrap_err();
        assert!(matches!(err, RegistrationError::InvalidPattern { .. }));
        assert_eq!(index.snapshot().intent_names("weather"), vec!["current"]);
    }

    #[test]
    fn test_registration_order_breaks_ties_and_survives_reregistration() {
        let index = IntentIndex::default();
        index.register_intents("first", vec![weather()]).unwrap();
        index.register_intents("second", vec![weather()]).unwrap();
        index.register_intents("first", vec![weather()]).unwrap();

        let ranked = index.match_utterance("what's the weather", &no_entities(), |_| true);
        let skills: Vec<&str> = ranked.iter().map(|c| c.skill_id.as_str()).collect();
        assert_eq!(skills, vec!["first", "second"]);

        index.remove_skill("first");
        index.register_intents("first", vec![weather()]).unwrap();
        let ranked = index.match_utterance("what's the weather", &no_entities(), |_| true);
        assert_eq!(ranked[0].skill_id, "second");
    }

    #[test]
    fn test_match_is_deterministic() {
        let index = IntentIndex::default();
        for skill in ["a", "b", "c"] {
            index.register_intents(skill, vec![weather()]).unwrap();
        }
        let first = index.match_utterance("weather", &no_entities(), |_| true);
        for _ in 0..10 {
            assert_eq!(index.match_utterance("weather", &no_entities(), |_| true), first);
        }
    }

    #[test]
    fn test_eligibility_filters_without_unregistering() {
        let index = IntentIndex::default();
        index.register_intents("weather", vec![weather()]).unwrap();
        assert!(index
            .best_match("weather", &no_entities(), |s| s != "weather")
            .is_none());
        assert!(index.best_match("weather", &no_entities(), |_| true).is_some());
    }

    #[test]
    fn test_remove_intent() {
        let index = IntentIndex::default();
        index
            .register_intents("weather", vec![weather(), IntentDefinition::new("alerts").with_vocabulary(["alerts"])])
            .unwrap();
        assert!(index.remove_intent("weather", "alerts"));
        assert!(!index.remove_intent("weather", "alerts"));
        assert!(index.best_match("alerts", &no_entities(), |_| true).is_none());
        assert_eq!(index.snapshot().len(), 1);
    }
}
