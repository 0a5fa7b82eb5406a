/*!
 * Runtime caching functionality.
 *
 * This module keeps a bounded set of decoder runtimes alive, keyed by
 * language pair and ordered by recency of use. Once a new runtime is up and
 * the cache is over capacity, the least recently used runtime is evicted; a
 * runtime that fails to start leaves the other entries alone. New runtimes
 * are started under a shared limiter so only a few decoders boot at the same
 * time.
 *
 * Locking is two-level: the entry list sits behind a `parking_lot` mutex that
 * is never held across an await, while each runtime serializes its own
 * process I/O behind its own async mutex.
 */

use chrono::{DateTime, Utc};
use futures::future::join_all;
use log::{debug, info};
use parking_lot::Mutex;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{OnceCell, Semaphore};

use crate::app_config::CacheSettings;
use crate::errors::RuntimeError;

use super::key::LanguagePairKey;
use super::process::{RuntimeProcess, RuntimeState};

/// Introspection record for one cached runtime
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuntimeStatus {
    /// Canonical pair key, e.g. "de-en"
    pub key: String,
    /// Source language code
    pub source_lang: String,
    /// Target language code
    pub target_lang: String,
    /// When the running decoder finished starting
    pub loaded_at: Option<DateTime<Utc>>,
    /// Lifecycle state at snapshot time
    pub state: RuntimeState,
}

/// Outcome of the first start of a cached runtime, shared by every caller
/// that reserved or hit the entry while it was starting
type Startup = Arc<OnceCell<Result<(), RuntimeError>>>;

struct CacheEntry {
    runtime: Arc<RuntimeProcess>,
    startup: Startup,
}

impl CacheEntry {
    fn is_started(&self) -> bool {
        matches!(self.startup.get(), Some(Ok(())))
    }
}

enum Reservation {
    Existing(Arc<RuntimeProcess>, Startup),
    Created(Arc<RuntimeProcess>, Startup),
}

/// Bounded LRU cache of decoder runtimes
pub struct RuntimeCache {
    settings: CacheSettings,

    /// Cached runtimes, least recently used first
    entries: Mutex<Vec<CacheEntry>>,

    /// Caps the number of decoders starting at once
    load_limiter: Semaphore,
}

impl RuntimeCache {
    /// Create an empty cache
    pub fn new(settings: CacheSettings) -> Self {
        let permits = settings.max_concurrent_loads.max(1);
        Self {
            load_limiter: Semaphore::new(permits),
            entries: Mutex::new(Vec::new()),
            settings,
        }
    }

    /// Maximum number of cached runtimes
    pub fn capacity(&self) -> usize {
        self.settings.capacity
    }

    /// Model directory for a language pair
    pub fn model_dir_for(&self, key: &LanguagePairKey) -> PathBuf {
        self.settings.models_dir.join(key.to_string())
    }

    /// Get the runtime for `key`, creating and starting it if absent
    ///
    /// A present key becomes the most recently used entry. An absent key is
    /// reserved in the cache before its decoder starts, so concurrent callers
    /// for the same key share one runtime and one startup outcome. The least
    /// recently used runtime is only evicted once the new one is running;
    /// until then the cache may hold one entry per pending start above its
    /// capacity.
    pub async fn acquire(&self, key: &LanguagePairKey) -> Result<Arc<RuntimeProcess>, RuntimeError> {
        match self.reserve(key, false)? {
            Reservation::Existing(runtime, startup) | Reservation::Created(runtime, startup) => {
                self.await_startup(runtime, startup).await
            }
        }
    }

    /// Create and start the runtime for `key`, failing if it is already cached
    pub async fn load(&self, key: &LanguagePairKey) -> Result<Arc<RuntimeProcess>, RuntimeError> {
        match self.reserve(key, true)? {
            Reservation::Existing(..) => Err(RuntimeError::AlreadyLoaded(key.to_string())),
            Reservation::Created(runtime, startup) => self.await_startup(runtime, startup).await,
        }
    }

    fn reserve(&self, key: &LanguagePairKey, exclusive: bool) -> Result<Reservation, RuntimeError> {
        if let Some(reservation) = self.touch(key, exclusive)? {
            return Ok(reservation);
        }

        let model_dir = self.model_dir_for(key);
        if !model_dir.is_dir() {
            return Err(RuntimeError::NotFound(format!(
                "Model directory for {} does not exist: {}",
                key,
                model_dir.display()
            )));
        }

        let mut entries = self.entries.lock();

        // Another caller may have inserted the key while the directory was checked
        if let Some(reservation) = Self::touch_locked(&mut entries, key, exclusive)? {
            return Ok(reservation);
        }

        debug!("Runtime cache miss for {}, reserving entry", key);
        let runtime = Arc::new(RuntimeProcess::new(
            key.clone(),
            model_dir,
            self.settings.runtime.clone(),
        ));
        let startup: Startup = Arc::new(OnceCell::new());
        entries.push(CacheEntry { runtime: runtime.clone(), startup: startup.clone() });
        Ok(Reservation::Created(runtime, startup))
    }

    fn touch(&self, key: &LanguagePairKey, exclusive: bool) -> Result<Option<Reservation>, RuntimeError> {
        let mut entries = self.entries.lock();
        Self::touch_locked(&mut entries, key, exclusive)
    }

    /// Move `key` to the most recently used end if present
    fn touch_locked(
        entries: &mut Vec<CacheEntry>,
        key: &LanguagePairKey,
        exclusive: bool,
    ) -> Result<Option<Reservation>, RuntimeError> {
        let Some(position) = entries.iter().position(|entry| entry.runtime.key() == key) else {
            return Ok(None);
        };
        if exclusive {
            return Err(RuntimeError::AlreadyLoaded(key.to_string()));
        }

        let entry = entries.remove(position);
        let reservation = Reservation::Existing(entry.runtime.clone(), entry.startup.clone());
        entries.push(entry);
        debug!("Runtime cache hit for {}", key);
        Ok(Some(reservation))
    }

    /// Wait for the first start of a reserved runtime, running it if no one else is
    ///
    /// If the caller running the start is cancelled, the next waiter takes it over.
    async fn await_startup(
        &self,
        runtime: Arc<RuntimeProcess>,
        startup: Startup,
    ) -> Result<Arc<RuntimeProcess>, RuntimeError> {
        let outcome = startup
            .get_or_init(|| runtime.start_limited(&self.load_limiter))
            .await
            .clone();

        match outcome {
            Ok(()) => {
                self.evict_over_capacity(&runtime);
                Ok(runtime)
            }
            Err(e) => {
                self.discard(&runtime);
                Err(e)
            }
        }
    }

    /// Evict least recently used running entries until the cache fits again
    ///
    /// Entries still starting are skipped; they evict for themselves once up.
    fn evict_over_capacity(&self, keep: &Arc<RuntimeProcess>) {
        let capacity = self.settings.capacity.max(1);
        let victims = {
            let mut entries = self.entries.lock();
            let mut victims = Vec::new();
            while entries.len() > capacity {
                let Some(position) = entries
                    .iter()
                    .position(|entry| entry.is_started() && !Arc::ptr_eq(&entry.runtime, keep))
                else {
                    break;
                };
                victims.push(entries.remove(position).runtime);
            }
            victims
        };

        for victim in victims {
            Self::evict(victim);
        }
    }

    /// Retire a removed runtime and stop it in the background
    fn evict(victim: Arc<RuntimeProcess>) {
        info!("Evicting least recently used runtime {}", victim.key());
        victim.retire();
        tokio::spawn(async move {
            victim.stop().await;
        });
    }

    /// Drop a reservation whose decoder failed to start
    fn discard(&self, runtime: &Arc<RuntimeProcess>) {
        let mut entries = self.entries.lock();
        if let Some(position) = entries.iter().position(|entry| Arc::ptr_eq(&entry.runtime, runtime)) {
            entries.remove(position);
            debug!("Discarded reservation for {}", runtime.key());
        }
        runtime.retire();
    }

    /// Stop and remove the runtime for `key`; returns whether one was cached
    pub async fn release(&self, key: &LanguagePairKey) -> bool {
        let removed = {
            let mut entries = self.entries.lock();
            entries
                .iter()
                .position(|entry| entry.runtime.key() == key)
                .map(|position| entries.remove(position).runtime)
        };

        match removed {
            Some(runtime) => {
                info!("Unloading runtime {}", key);
                runtime.retire();
                runtime.stop().await;
                true
            }
            None => false,
        }
    }

    /// Stop and remove every runtime, waiting for calls in flight to finish
    pub async fn clear(&self) {
        let drained: Vec<Arc<RuntimeProcess>> = std::mem::take(&mut *self.entries.lock())
            .into_iter()
            .map(|entry| entry.runtime)
            .collect();
        if drained.is_empty() {
            return;
        }

        info!("Stopping {} cached runtime(s)", drained.len());
        for runtime in &drained {
            runtime.retire();
        }
        join_all(drained.iter().map(|runtime| runtime.stop())).await;
    }

    /// Cached runtimes, most recently used first; does not change recency
    pub fn snapshot(&self) -> Vec<RuntimeStatus> {
        self.entries
            .lock()
            .iter()
            .rev()
            .map(|entry| &entry.runtime)
            .map(|runtime| RuntimeStatus {
                key: runtime.key().to_string(),
                source_lang: runtime.key().source().to_string(),
                target_lang: runtime.key().target().to_string(),
                loaded_at: runtime.loaded_at(),
                state: runtime.state(),
            })
            .collect()
    }

    /// Look up a runtime without touching recency
    pub fn peek(&self, key: &LanguagePairKey) -> Option<Arc<RuntimeProcess>> {
        self.entries
            .lock()
            .iter()
            .find(|entry| entry.runtime.key() == key)
            .map(|entry| entry.runtime.clone())
    }

    /// Whether a runtime for `key` is cached
    pub fn contains(&self, key: &LanguagePairKey) -> bool {
        self.peek(key).is_some()
    }

    /// Number of cached runtimes
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Check if the cache is empty
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
