//! Intent and entity definitions supplied by tenants, and the training input preconditions

use crate::error::{NluError, NluResult};
use crate::language::LanguageCode;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Entities provided by the engine itself; slots may reference them without declaring them
pub const SYSTEM_ENTITIES: &[&str] = &[
    "any",
    "amountOfMoney",
    "distance",
    "duration",
    "email",
    "number",
    "ordinal",
    "phoneNumber",
    "quantity",
    "temperature",
    "time",
    "url",
    "volume",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentDefinition {
    pub name: String,
    pub contexts: Vec<String>,
    pub utterances: Vec<String>,
    #[serde(default)]
    pub slots: Vec<SlotDefinition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotDefinition {
    pub name: String,
    pub entities: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListEntityValue {
    pub name: String,
    #[serde(default)]
    pub synonyms: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum EntityDefinition {
    List {
        name: String,
        values: Vec<ListEntityValue>,
        fuzzy: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sensitive: Option<bool>,
    },
    Pattern {
        name: String,
        regex: String,
        case_sensitive: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sensitive: Option<bool>,
    },
}

impl EntityDefinition {
    pub fn name(&self) -> &str {
        match self {
            EntityDefinition::List { name, .. } | EntityDefinition::Pattern { name, .. } => name,
        }
    }
}

/// Definitions a tenant maintains for a single language
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingDefinitions {
    #[serde(default)]
    pub contexts: Vec<String>,
    #[serde(default)]
    pub intents: Vec<IntentDefinition>,
    #[serde(default)]
    pub entities: Vec<EntityDefinition>,
}

/// Body of a training request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainInput {
    #[serde(default)]
    pub contexts: Vec<String>,
    pub intents: Vec<IntentDefinition>,
    #[serde(default)]
    pub entities: Vec<EntityDefinition>,
    pub language: String,
    #[serde(default)]
    pub password: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
}

/// What the engine actually trains on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainSet {
    pub intents: Vec<IntentDefinition>,
    pub entities: Vec<EntityDefinition>,
    pub language: LanguageCode,
    pub seed: i64,
}

impl TrainInput {
    pub fn from_definitions(
        definitions: &TrainingDefinitions,
        language: &LanguageCode,
        password: &str,
        seed: i64,
    ) -> Self {
        Self {
            contexts: definitions.contexts.clone(),
            intents: definitions.intents.clone(),
            entities: definitions.entities.clone(),
            language: language.to_string(),
            password: password.to_string(),
            seed: Some(seed),
        }
    }
}

/// Checks a training input for consistency before any job is created.
///
/// Every intent context must be declared, every slot must reference a declared
/// entity or a system entity, names must be unique and pattern regexes must compile.
pub fn assert_train_input(input: &TrainInput) -> NluResult<LanguageCode> {
    let language: LanguageCode = input.language.parse()?;

    let contexts: HashSet<&str> = input.contexts.iter().map(String::as_str).collect();

    let mut entity_names = HashSet::new();
    for entity in &input.entities {
        let name = entity.name();
        if name.trim().is_empty() {
            return Err(precondition("entity name cannot be empty"));
        }
        if !entity_names.insert(name) {
            return Err(precondition(format!("entity \"{}\" is defined twice", name)));
        }
        match entity {
            EntityDefinition::Pattern { regex, .. } => {
                if regex.is_empty() {
                    return Err(precondition(format!(
                        "pattern entity \"{}\" has an empty regex",
                        name
                    )));
                }
                regex::Regex::new(regex).map_err(|e| {
                    precondition(format!(
                        "pattern entity \"{}\" has an invalid regex: {}",
                        name, e
                    ))
                })?;
            }
            EntityDefinition::List { fuzzy, .. } => {
                if !(0.0..=1.0).contains(fuzzy) {
                    return Err(precondition(format!(
                        "list entity \"{}\" fuzzy ratio must be within [0, 1]",
                        name
                    )));
                }
            }
        }
    }

    let mut intent_names = HashSet::new();
    for intent in &input.intents {
        if intent.name.trim().is_empty() {
            return Err(precondition("intent name cannot be empty"));
        }
        if !intent_names.insert(intent.name.as_str()) {
            return Err(precondition(format!(
                "intent \"{}\" is defined twice",
                intent.name
            )));
        }

        for ctx in &intent.contexts {
            if !contexts.contains(ctx.as_str()) {
                return Err(precondition(format!(
                    "Context \"{}\" of intent \"{}\" does not exist.",
                    ctx, intent.name
                )));
            }
        }

        for slot in &intent.slots {
            for entity in &slot.entities {
                let known =
                    entity_names.contains(entity.as_str()) || SYSTEM_ENTITIES.contains(&entity.as_str());
                if !known {
                    return Err(precondition(format!(
                        "Slot \"{}\" of intent \"{}\" references entity \"{}\" which does not exist.",
                        slot.name, intent.name, entity
                    )));
                }
            }
        }
    }

    Ok(language)
}

fn precondition(msg: impl Into<String>) -> NluError {
    NluError::Precondition(msg.into())
}
