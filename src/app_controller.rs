use anyhow::{Context, Result};
use log::{debug, info};
use std::sync::Arc;

use crate::app_config::Config;
use crate::errors::RuntimeError;
use crate::runtime::{LanguagePairKey, PivotOrchestrator, RuntimeCache, RuntimeStatus};

// @module: Application controller, the entry point front ends call into

/// Owns the runtime cache and the pivot orchestrator for one process
pub struct Controller {
    // @field: App configuration
    config: Config,

    // @field: Decoder runtimes, shared with the orchestrator
    cache: Arc<RuntimeCache>,

    // @field: Direct and pivot routing over the cache
    orchestrator: PivotOrchestrator<RuntimeCache>,
}

impl Controller {
    // @method: Create a new controller with the given configuration
    pub fn with_config(config: Config) -> Result<Self> {
        config.validate().context("Configuration validation failed")?;

        let cache = Arc::new(RuntimeCache::new(config.cache_settings()));
        let orchestrator = PivotOrchestrator::new(cache.clone(), &config.pivot_lang);

        info!(
            "Runtime cache ready: capacity {}, pivot '{}', models in {}",
            config.cache_size,
            orchestrator.pivot(),
            config.models_dir.display()
        );

        Ok(Self { config, cache, orchestrator })
    }

    /// Active configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Underlying runtime cache
    pub fn cache(&self) -> &Arc<RuntimeCache> {
        &self.cache
    }

    fn check_language(&self, code: &str) -> Result<(), RuntimeError> {
        if self.config.is_supported_language(code) {
            Ok(())
        } else {
            Err(RuntimeError::InvalidRequest(format!("Unsupported language code: '{}'", code)))
        }
    }

    fn validated_pair(&self, source: &str, target: &str) -> Result<LanguagePairKey, RuntimeError> {
        self.check_language(source)?;
        self.check_language(target)?;
        Ok(LanguagePairKey::new(source, target))
    }

    /// Start and cache the runtime for a pair
    pub async fn load_runtime(&self, source: &str, target: &str) -> Result<(), RuntimeError> {
        let key = self.validated_pair(source, target)?;
        self.cache.load(&key).await?;
        info!("Runtime {} loaded", key);
        Ok(())
    }

    /// Stop and drop the runtime for a pair; returns whether one was cached
    pub async fn unload_runtime(&self, source: &str, target: &str) -> bool {
        let key = LanguagePairKey::new(source, target);
        let removed = self.cache.release(&key).await;
        if removed {
            info!("Runtime {} unloaded", key);
        } else {
            debug!("Runtime {} was not loaded", key);
        }
        removed
    }

    /// Stop every runtime
    pub async fn clear_all(&self) {
        self.cache.clear().await;
        info!("Runtime cache cleared");
    }

    /// Cached runtimes, most recently used first
    pub fn status_snapshot(&self) -> Vec<RuntimeStatus> {
        self.cache.snapshot()
    }

    /// Translate text, pivoting when no direct pair applies
    pub async fn translate(&self, source: &str, target: &str, text: &str) -> Result<String, RuntimeError> {
        let key = self.validated_pair(source, target)?;
        self.orchestrator.translate(key.source(), key.target(), text).await
    }

    /// Translate lines in order, leaving blank lines untouched
    pub async fn translate_lines<F>(
        &self,
        source: &str,
        target: &str,
        lines: &[String],
        progress_callback: F,
    ) -> Result<Vec<String>, RuntimeError>
    where
        F: Fn(usize, usize),
    {
        let key = self.validated_pair(source, target)?;
        let total = lines.len();
        let mut translated = Vec::with_capacity(total);

        for (index, line) in lines.iter().enumerate() {
            if line.trim().is_empty() {
                translated.push(line.clone());
            } else {
                translated.push(self.orchestrator.translate(key.source(), key.target(), line).await?);
            }
            progress_callback(index + 1, total);
        }

        Ok(translated)
    }

    /// Make sure every runtime a pair needs is cached and running
    pub async fn warm_up(&self, source: &str, target: &str) -> Result<Vec<LanguagePairKey>, RuntimeError> {
        let key = self.validated_pair(source, target)?;
        let route = self.orchestrator.route(key.source(), key.target());
        let keys: Vec<LanguagePairKey> = route.keys().into_iter().cloned().collect();

        for key in &keys {
            let runtime = self.cache.acquire(key).await?;
            runtime.start().await?;
        }

        Ok(keys)
    }
}
