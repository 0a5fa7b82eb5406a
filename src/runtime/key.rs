/*!
 * Language pair keys.
 *
 * A `LanguagePairKey` identifies one direction of translation and is the key
 * of the runtime cache. Its canonical string form is `"<source>-<target>"`,
 * which is also the name of the pair's model directory.
 */

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::RuntimeError;
use crate::language_utils;

/// Ordered (source, target) pair of language codes
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LanguagePairKey {
    source: String,
    target: String,
}

impl LanguagePairKey {
    /// Create a key, normalizing both codes to trimmed lowercase
    pub fn new(source: &str, target: &str) -> Self {
        Self {
            source: language_utils::normalize_code(source),
            target: language_utils::normalize_code(target),
        }
    }

    /// Source language code
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Target language code
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Whether source and target are the same language
    pub fn is_identity(&self) -> bool {
        self.source == self.target
    }
}

impl fmt::Display for LanguagePairKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.source, self.target)
    }
}

impl FromStr for LanguagePairKey {
    type Err = RuntimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('-') {
            Some((source, target))
                if !source.trim().is_empty() && !target.trim().is_empty() && !target.contains('-') =>
            {
                Ok(Self::new(source, target))
            }
            _ => Err(RuntimeError::InvalidRequest(format!(
                "Language pair must look like '<source>-<target>': {}",
                s
            ))),
        }
    }
}
