//! Deterministic model identity
//!
//! A [`ModelId`] is derived from the training content, the engine specification,
//! the seed and the language. Two equal ids designate interchangeable artifacts,
//! which makes the id both the cache key and the idempotency token for training.

use crate::definitions::{EntityDefinition, IntentDefinition, TrainSet};
use crate::engine::Specifications;
use crate::error::NluError;
use crate::language::LanguageCode;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Length of a hash segment in hex characters
pub const HASH_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelId {
    pub content_hash: String,
    pub specification_hash: String,
    pub seed: i64,
    pub language_code: LanguageCode,
}

/// Partial model id used to query "latest model matching these fields"
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BriefId {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub specification_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language_code: Option<LanguageCode>,
}

/// Whatever is known about a model when probing for it
#[derive(Debug, Clone, Copy, Default)]
pub struct BriefFactors<'a> {
    pub intents: Option<&'a [IntentDefinition]>,
    pub entities: Option<&'a [EntityDefinition]>,
    pub language: Option<&'a LanguageCode>,
    pub seed: Option<i64>,
    pub specifications: Option<&'a Specifications>,
}

impl ModelId {
    pub fn make(train_set: &TrainSet, specifications: &Specifications) -> Self {
        Self {
            content_hash: content_hash(&train_set.intents, &train_set.entities),
            specification_hash: specification_hash(specifications),
            seed: train_set.seed,
            language_code: train_set.language.clone(),
        }
    }

    /// Validates the `<content>.<spec>.<seed>.<lang>` format
    pub fn is_id(s: &str) -> bool {
        let parts: Vec<&str> = s.split('.').collect();
        if parts.len() != 4 {
            return false;
        }

        is_half_hash(parts[0])
            && is_half_hash(parts[1])
            && parts[2].parse::<i64>().is_ok()
            && LanguageCode::is_valid(parts[3])
    }

    pub fn matches(&self, brief: &BriefId) -> bool {
        brief.matches(self)
    }
}

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.content_hash, self.specification_hash, self.seed, self.language_code
        )
    }
}

impl FromStr for ModelId {
    type Err = NluError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if !Self::is_id(s) {
            return Err(NluError::Precondition(format!(
                "model id \"{}\" has invalid format",
                s
            )));
        }

        let mut parts = s.split('.');
        let (Some(content), Some(spec), Some(seed), Some(lang)) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(NluError::Precondition(format!(
                "model id \"{}\" has invalid format",
                s
            )));
        };

        Ok(Self {
            content_hash: content.to_string(),
            specification_hash: spec.to_string(),
            seed: seed
                .parse()
                .map_err(|_| NluError::Precondition(format!("invalid seed in model id \"{}\"", s)))?,
            language_code: lang.parse()?,
        })
    }
}

impl BriefId {
    pub fn from_factors(factors: BriefFactors<'_>) -> Self {
        let mut brief = BriefId::default();

        if let (Some(intents), Some(entities), Some(_)) =
            (factors.intents, factors.entities, factors.language)
        {
            brief.content_hash = Some(content_hash(intents, entities));
        }
        if let Some(language) = factors.language {
            brief.language_code = Some(language.clone());
        }
        if let Some(specs) = factors.specifications {
            brief.specification_hash = Some(specification_hash(specs));
        }
        brief.seed = factors.seed;

        brief
    }

    /// True when every populated field equals the corresponding field of `id`
    pub fn matches(&self, id: &ModelId) -> bool {
        self.content_hash.as_ref().is_none_or(|h| *h == id.content_hash)
            && self
                .specification_hash
                .as_ref()
                .is_none_or(|h| *h == id.specification_hash)
            && self.seed.is_none_or(|s| s == id.seed)
            && self
                .language_code
                .as_ref()
                .is_none_or(|l| *l == id.language_code)
    }
}

impl From<&ModelId> for BriefId {
    fn from(id: &ModelId) -> Self {
        Self {
            content_hash: Some(id.content_hash.clone()),
            specification_hash: Some(id.specification_hash.clone()),
            seed: Some(id.seed),
            language_code: Some(id.language_code.clone()),
        }
    }
}

pub fn content_hash(intents: &[IntentDefinition], entities: &[EntityDefinition]) -> String {
    half_hash(&canonical_json(&json!({
        "intentDefs": intents,
        "entityDefs": entities,
    })))
}

pub fn specification_hash(specifications: &Specifications) -> String {
    half_hash(&canonical_json(&json!({ "specifications": specifications })))
}

/// First 64 bits of SHA-256 as 16 hex characters
pub fn half_hash(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    let mut encoded = hex::encode(digest);
    encoded.truncate(HASH_LEN);
    encoded
}

fn is_half_hash(s: &str) -> bool {
    s.len() == HASH_LEN && s.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Serializes with object keys sorted at every depth
pub fn canonical_json(value: &Value) -> String {
    sort_keys(value.clone()).to_string()
}

fn sort_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let sorted: Map<String, Value> = entries
                .into_iter()
                .map(|(k, v)| (k, sort_keys(v)))
                .collect();
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_keys).collect()),
        other => other,
    }
}
