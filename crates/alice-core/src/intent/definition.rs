use crate::error::RegistrationError;
use crate::intent::matcher::tokenize;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

/// An intent as a skill declares it in `intent.service.intent.reply`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentDefinition {
    pub name: String,
    /// Keyword or phrase triggers, matched as contiguous tokens.
    #[serde(default)]
    pub vocabulary: Vec<String>,
    /// Regular expressions over the normalised utterance. Named groups fill slots.
    #[serde(default)]
    pub patterns: Vec<String>,
    #[serde(default)]
    pub required_slots: Vec<String>,
    #[serde(default)]
    pub optional_slots: Vec<String>,
    #[serde(default)]
    pub priority: u8,
}

impl IntentDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            vocabulary: Vec::new(),
            patterns: Vec::new(),
            required_slots: Vec::new(),
            optional_slots: Vec::new(),
            priority: 0,
        }
    }

    pub fn with_vocabulary<I, S>(mut self, phrases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.vocabulary.extend(phrases.into_iter().map(Into::into));
        self
    }

    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.patterns.push(pattern.into());
        self
    }

    pub fn require(mut self, slot: impl Into<String>) -> Self {
        self.required_slots.push(slot.into());
        self
    }

    pub fn optional(mut self, slot: impl Into<String>) -> Self {
        self.optional_slots.push(slot.into());
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// Required and optional slots, without duplicates, in declaration order.
    pub fn declared_slots(&self) -> Vec<&str> {
        let mut slots: Vec<&str> = Vec::new();
        for slot in self.required_slots.iter().chain(&self.optional_slots) {
            if !slots.contains(&slot.as_str()) {
                slots.push(slot);
            }
        }
        slots
    }
}

/// An intent ready for matching.
#[derive(Debug, Clone)]
pub struct CompiledIntent {
    pub skill_id: String,
    pub definition: IntentDefinition,
    pub declaration_index: usize,
    pub(crate) phrases: Vec<Vec<String>>,
    pub(crate) patterns: Vec<Regex>,
}

impl CompiledIntent {
    pub fn name(&self) -> &str {
        &self.definition.name
    }
}

/// Validate and compile one skill's declarations. A later declaration with the same
/// name replaces the earlier one in place.
pub fn compile(
    skill_id: &str,
    definitions: Vec<IntentDefinition>,
) -> Result<Vec<CompiledIntent>, RegistrationError> {
    if skill_id.trim().is_empty() {
        return Err(RegistrationError::EmptySkillId);
    }

    let mut deduped: Vec<IntentDefinition> = Vec::with_capacity(definitions.len());
    for definition in definitions {
        if definition.name.trim().is_empty() {
            return Err(RegistrationError::EmptyIntentName {
                skill_id: skill_id.to_string(),
            });
        }
        match deduped.iter_mut().find(|d| d.name == definition.name) {
            Some(existing) => *existing = definition,
            None => deduped.push(definition),
        }
    }

    deduped
        .into_iter()
        .enumerate()
        .map(|(index, definition)| {
            let phrases = definition
                .vocabulary
                .iter()
                .map(|p| tokenize(p))
                .filter(|tokens| !tokens.is_empty())
                .collect();
            let patterns = definition
                .patterns
                .iter()
                .map(|p| {
                    RegexBuilder::new(p)
                        .case_insensitive(true)
                        .build()
                        .map_err(|e| RegistrationError::InvalidPattern {
                            intent: definition.name.clone(),
                            pattern: p.clone(),
                            reason: e.to_string(),
                        })
                })
                .collect::<Result<Vec<_>, _>>()?;
            Ok(CompiledIntent {
                skill_id: skill_id.to_string(),
                definition,
                declaration_index: index,
                phrases,
                patterns,
            })
        })
        .collect()
}
