/*!
 * Pivot translation.
 *
 * Models only exist for some language pairs, usually to and from one hub
 * language. `PivotOrchestrator` routes a request either straight to the
 * runtime of its pair or through the pivot language in two hops.
 */

use async_trait::async_trait;
use log::debug;
use std::sync::Arc;

use crate::errors::RuntimeError;
use crate::language_utils;

use super::cache::RuntimeCache;
use super::key::LanguagePairKey;

/// Anything that can translate text for one direct language pair
#[async_trait]
pub trait PairTranslator: Send + Sync {
    /// Translate `text` with the model for `key`
    async fn translate_pair(&self, key: &LanguagePairKey, text: &str) -> Result<String, RuntimeError>;
}

#[async_trait]
impl PairTranslator for RuntimeCache {
    async fn translate_pair(&self, key: &LanguagePairKey, text: &str) -> Result<String, RuntimeError> {
        let runtime = self.acquire(key).await?;
        runtime.translate(text).await
    }
}

/// How a request is served
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Source and target are the same language
    Identity,
    /// One runtime for the pair
    Direct(LanguagePairKey),
    /// Source to pivot, then pivot to target
    Pivot(LanguagePairKey, LanguagePairKey),
}

impl Route {
    /// Pairs whose runtimes the route needs, in call order
    pub fn keys(&self) -> Vec<&LanguagePairKey> {
        match self {
            Self::Identity => Vec::new(),
            Self::Direct(key) => vec![key],
            Self::Pivot(first, second) => vec![first, second],
        }
    }
}

/// Routes requests directly or through the pivot language
pub struct PivotOrchestrator<T: PairTranslator> {
    backend: Arc<T>,
    pivot: String,
}

impl<T: PairTranslator> PivotOrchestrator<T> {
    /// Create an orchestrator over `backend` with a fixed pivot language
    pub fn new(backend: Arc<T>, pivot: &str) -> Self {
        Self {
            backend,
            pivot: language_utils::normalize_code(pivot),
        }
    }

    /// Pivot language code
    pub fn pivot(&self) -> &str {
        &self.pivot
    }

    /// Decide how `source -> target` is served
    pub fn route(&self, source: &str, target: &str) -> Route {
        let direct = LanguagePairKey::new(source, target);
        if direct.is_identity() {
            return Route::Identity;
        }

        if direct.source() == self.pivot || direct.target() == self.pivot {
            return Route::Direct(direct);
        }

        Route::Pivot(
            LanguagePairKey::new(direct.source(), &self.pivot),
            LanguagePairKey::new(&self.pivot, direct.target()),
        )
    }

    /// Translate `text` from `source` to `target`
    ///
    /// A failing hop is returned as is. Runtimes started for an earlier hop
    /// stay cached.
    pub async fn translate(&self, source: &str, target: &str, text: &str) -> Result<String, RuntimeError> {
        match self.route(source, target) {
            Route::Identity => Ok(text.to_string()),
            Route::Direct(key) => self.backend.translate_pair(&key, text).await,
            Route::Pivot(first, second) => {
                debug!("Pivoting {} through {}: {} then {}", LanguagePairKey::new(source, target), self.pivot, first, second);
                let intermediate = self.backend.translate_pair(&first, text).await?;
                self.backend.translate_pair(&second, &intermediate).await
            }
        }
    }
}
