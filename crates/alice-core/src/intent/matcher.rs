//! Utterance normalisation and per-intent scoring.
//!
//! A candidate must pass the hard gate (every required slot filled and at least one
//! phrase or pattern matched). Its score is then
//! `overlap * w_overlap + slot_fill * w_slots + min(priority, 100) / 100 * w_priority`,
//! clamped to `[0, 1]`.

use crate::intent::definition::CompiledIntent;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringWeights {
    pub overlap: f64,
    pub slots: f64,
    pub priority: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            overlap: 0.6,
            slots: 0.2,
            priority: 0.2,
        }
    }
}

impl ScoringWeights {
    pub fn validate(&self) -> Result<(), String> {
        let all = [self.overlap, self.slots, self.priority];
        if all.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(format!("scoring weights must be finite and >= 0: {:?}", self));
        }
        if all.iter().sum::<f64>() <= 0.0 {
            return Err("scoring weights must not all be zero".into());
        }
        Ok(())
    }
}

/// One ranked match for an utterance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchCandidate {
    pub skill_id: String,
    pub intent: String,
    pub score: f64,
    pub priority: u8,
    pub slots: BTreeMap<String, String>,
    pub overlap: f64,
    pub slot_fill: f64,
    pub registration_seq: u64,
    pub declaration_index: usize,
}

/// Lowercase, map anything but alphanumerics, whitespace and apostrophes to a space,
/// then collapse whitespace.
pub fn normalize(text: &str) -> String {
    let mapped: String = text
        .chars()
        .flat_map(char::to_lowercase)
        .map(|c| {
            if c.is_alphanumeric() || c.is_whitespace() || c == '\'' {
                c
            } else {
                ' '
            }
        })
        .collect();
    mapped.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn tokenize(text: &str) -> Vec<String> {
    normalize(text)
        .split(' ')
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// A normalised utterance with byte spans for each token.
#[derive(Debug, Clone)]
pub struct Utterance {
    pub normalized: String,
    pub tokens: Vec<String>,
    spans: Vec<(usize, usize)>,
}

impl Utterance {
    pub fn new(text: &str) -> Self {
        let normalized = normalize(text);
        let mut tokens = Vec::new();
        let mut spans = Vec::new();
        let mut offset = 0;
        for token in normalized.split(' ') {
            if !token.is_empty() {
                tokens.push(token.to_string());
                spans.push((offset, offset + token.len()));
            }
            offset += token.len() + 1;
        }
        Self {
            normalized,
            tokens,
            spans,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

/// Score one intent, or `None` if it fails the hard gate.
pub fn score_intent(
    intent: &CompiledIntent,
    utterance: &Utterance,
    entities: &HashMap<String, String>,
    registration_seq: u64,
    weights: &ScoringWeights,
) -> Option<MatchCandidate> {
    if utterance.is_empty() {
        return None;
    }
    let definition = &intent.definition;
    let declared = definition.declared_slots();
    let mut covered = vec![false; utterance.tokens.len()];
    let mut matched = false;

    for phrase in &intent.phrases {
        let width = phrase.len();
        if width > utterance.tokens.len() {
            continue;
        }
        for start in 0..=(utterance.tokens.len() - width) {
            if utterance.tokens[start..start + width] == phrase[..] {
                matched = true;
                covered[start..start + width].iter_mut().for_each(|c| *c = true);
            }
        }
    }

    let mut slots: BTreeMap<String, String> = declared
        .iter()
        .filter_map(|slot| entities.get(*slot).map(|v| (slot.to_string(), v.clone())))
        .collect();

    for pattern in &intent.patterns {
        for captures in pattern.captures_iter(&utterance.normalized) {
            let Some(whole) = captures.get(0) else {
                continue;
            };
            if whole.as_str().trim().is_empty() {
                continue;
            }
            matched = true;
            for (i, (start, end)) in utterance.spans.iter().enumerate() {
                if *start < whole.end() && whole.start() < *end {
                    covered[i] = true;
                }
            }
            for name in pattern.capture_names().flatten() {
                if let Some(value) = captures.name(name) {
                    let value = value.as_str().trim();
                    if !value.is_empty() {
                        slots
                            .entry(name.to_string())
                            .or_insert_with(|| value.to_string());
                    }
                }
            }
        }
    }

    if !matched
        || definition
            .required_slots
            .iter()
            .any(|slot| !slots.contains_key(slot))
    {
        return None;
    }

    let overlap = covered.iter().filter(|c| **c).count() as f64 / covered.len() as f64;
    let slot_fill = if declared.is_empty() {
        1.0
    } else {
        declared.iter().filter(|s| slots.contains_key(**s)).count() as f64 / declared.len() as f64
    };
    let priority = f64::from(definition.priority.min(100)) / 100.0;
    let score = (weights.overlap * overlap + weights.slots * slot_fill + weights.priority * priority)
        .clamp(0.0, 1.0);

    Some(MatchCandidate {
        skill_id: intent.skill_id.clone(),
        intent: definition.name.clone(),
        score,
        priority: definition.priority,
        slots,
        overlap,
        slot_fill,
        registration_seq,
        declaration_index: intent.declaration_index,
    })
}

/// Ranking: score desc, priority desc, registration order asc, declaration order asc.
pub fn rank(candidates: &mut [MatchCandidate]) {
    candidates.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| b.priority.cmp(&a.priority))
            .then_with(|| a.registration_seq.cmp(&b.registration_seq))
            .then_with(|| a.declaration_index.cmp(&b.declaration_index))
    });
}
