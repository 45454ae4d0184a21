//! Language code value type and the per-language model map

use crate::error::NluError;
use crate::model_id::ModelId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Two lowercase ASCII letters, e.g. `en`, `fr`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct LanguageCode(String);

/// Models a tenant currently serves, one per language
pub type ModelsByLanguage = BTreeMap<LanguageCode, ModelId>;

impl LanguageCode {
    pub fn is_valid(code: &str) -> bool {
        code.len() == 2 && code.bytes().all(|b| b.is_ascii_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for LanguageCode {
    type Err = NluError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if Self::is_valid(s) {
            Ok(Self(s.to_string()))
        } else {
            Err(NluError::Precondition(format!(
                "language code \"{}\" is not a two-letter lowercase code",
                s
            )))
        }
    }
}

impl TryFrom<String> for LanguageCode {
    type Error = NluError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<LanguageCode> for String {
    fn from(code: LanguageCode) -> Self {
        code.0
    }
}

impl fmt::Display for LanguageCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for LanguageCode {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
