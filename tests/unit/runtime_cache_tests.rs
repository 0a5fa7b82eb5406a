/*!
 * Tests for the runtime cache: capacity, recency and process lifecycle
 */

use std::sync::Arc;
use std::time::{Duration, Instant};

use fluentai::errors::RuntimeError;
use fluentai::runtime::{LanguagePairKey, RuntimeCache, RuntimeState};

use crate::common::{ModelStore, wait_until};

const PAIRS: [(&str, &str); 5] = [("de", "en"), ("en", "de"), ("fr", "en"), ("en", "fr"), ("es", "en")];

fn store_with_pairs() -> ModelStore {
    let store = ModelStore::new();
    for (source, target) in PAIRS {
        store.add_pair(source, target);
    }
    store
}

fn key(source: &str, target: &str) -> LanguagePairKey {
    LanguagePairKey::new(source, target)
}

fn snapshot_keys(cache: &RuntimeCache) -> Vec<String> {
    cache.snapshot().into_iter().map(|status| status.key).collect()
}

/// Test that the cache never grows beyond its capacity
#[tokio::test]
async fn test_acquire_beyondCapacity_shouldKeepExactlyCapacityEntries() {
    let store = store_with_pairs();
    let cache = RuntimeCache::new(store.cache_settings(3));

    for (index, (source, target)) in PAIRS.iter().enumerate() {
        cache.acquire(&key(source, target)).await.unwrap();
        assert_eq!(cache.len(), (index + 1).min(3));
    }

    // The two oldest were evicted
    assert!(!cache.contains(&key("de", "en")));
    assert!(!cache.contains(&key("en", "de")));
    assert_eq!(snapshot_keys(&cache), vec!["es-en", "en-fr", "fr-en"]);

    cache.clear().await;
}

/// Test that a hit refreshes recency so the other entry is evicted
#[tokio::test]
async fn test_acquire_withRecencyRefresh_shouldEvictLeastRecentlyUsed() {
    let store = store_with_pairs();
    let cache = RuntimeCache::new(store.cache_settings(2));

    let first = cache.acquire(&key("de", "en")).await.unwrap();
    cache.acquire(&key("en", "de")).await.unwrap();
    let again = cache.acquire(&key("de", "en")).await.unwrap();
    assert!(Arc::ptr_eq(&first, &again));

    cache.acquire(&key("fr", "en")).await.unwrap();
    assert_eq!(snapshot_keys(&cache), vec!["fr-en", "de-en"]);

    cache.clear().await;
}

/// Test that an evicted runtime's decoder is shut down
#[tokio::test]
async fn test_acquire_evictingEntry_shouldTerminateEvictedDecoder() {
    let store = store_with_pairs();
    let cache = RuntimeCache::new(store.cache_settings(1));

    let evicted = cache.acquire(&key("de", "en")).await.unwrap();
    cache.acquire(&key("en", "de")).await.unwrap();

    assert!(wait_until(|| store.stops().contains(&"de-en".to_string()), Duration::from_secs(5)).await);
    assert!(evicted.is_retired());

    // A runtime handed out before eviction refuses to come back
    let result = evicted.translate("hallo").await;
    assert!(matches!(result, Err(RuntimeError::RuntimeFailure { ref message, .. }) if message.contains("unloaded")));
    assert_eq!(store.starts().iter().filter(|pair| *pair == "de-en").count(), 1);

    cache.clear().await;
}

/// Test that snapshots list most recent first without touching recency
#[tokio::test]
async fn test_snapshot_shouldNotChangeRecency() {
    let store = store_with_pairs();
    let cache = RuntimeCache::new(store.cache_settings(2));

    cache.acquire(&key("de", "en")).await.unwrap();
    cache.acquire(&key("en", "de")).await.unwrap();

    let snapshot = cache.snapshot();
    assert_eq!(snapshot.len(), 2);
    assert_eq!(snapshot[0].key, "en-de");
    assert_eq!(snapshot[0].source_lang, "en");
    assert_eq!(snapshot[0].target_lang, "de");
    assert_eq!(snapshot[0].state, RuntimeState::Ready);
    assert!(snapshot[0].loaded_at.is_some());

    // Peeking and snapshotting leave de-en as the eviction candidate
    assert!(cache.peek(&key("de", "en")).is_some());
    let _ = cache.snapshot();
    cache.acquire(&key("fr", "en")).await.unwrap();
    assert_eq!(snapshot_keys(&cache), vec!["fr-en", "en-de"]);

    cache.clear().await;
}

/// Test that concurrent acquires of one key share a single decoder
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_acquire_concurrentSameKey_shouldStartOneDecoder() {
    let store = store_with_pairs();
    let cache = Arc::new(RuntimeCache::new(store.cache_settings(2)));

    let handles: Vec<_> = (0..6)
        .map(|_| {
            let cache = cache.clone();
            tokio::spawn(async move { cache.acquire(&key("de", "en")).await })
        })
        .collect();

    let mut runtimes = Vec::new();
    for handle in handles {
        runtimes.push(handle.await.unwrap().unwrap());
    }

    assert!(runtimes.windows(2).all(|pair| Arc::ptr_eq(&pair[0], &pair[1])));
    assert_eq!(cache.len(), 1);

    // Every holder translates on the same process
    for runtime in &runtimes {
        assert_eq!(runtime.translate("hallo").await.unwrap(), "hallo [de-en]");
    }
    assert_eq!(store.starts(), vec!["de-en".to_string()]);

    cache.clear().await;
}

/// Test that the load limiter serializes decoder starts
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_acquire_withSingleLoadSlot_shouldStartDecodersOneAtATime() {
    let store = store_with_pairs();
    let mut settings = store.cache_settings(5);
    settings.max_concurrent_loads = 1;
    settings.runtime.startup_grace = Duration::from_millis(300);
    let cache = Arc::new(RuntimeCache::new(settings));

    let started = Instant::now();
    let handles: Vec<_> = PAIRS[..3]
        .iter()
        .map(|(source, target)| {
            let cache = cache.clone();
            let key = key(source, target);
            tokio::spawn(async move { cache.acquire(&key).await })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert!(started.elapsed() >= Duration::from_millis(850), "took {:?}", started.elapsed());
    assert_eq!(cache.len(), 3);

    cache.clear().await;
}

/// Test explicit loading and unloading
#[tokio::test]
async fn test_loadAndRelease_shouldManageEntriesExplicitly() {
    let store = store_with_pairs();
    let cache = RuntimeCache::new(store.cache_settings(2));
    let pair = key("de", "en");

    let runtime = cache.load(&pair).await.unwrap();
    assert!(runtime.is_running());
    assert!(matches!(cache.load(&pair).await, Err(RuntimeError::AlreadyLoaded(_))));

    assert!(cache.release(&pair).await);
    assert!(!cache.contains(&pair));
    assert_eq!(runtime.state(), RuntimeState::Stopped);
    assert_eq!(store.stops(), vec!["de-en".to_string()]);

    assert!(!cache.release(&pair).await);
}

/// Test that a startup failure leaves no entry behind
#[tokio::test]
async fn test_acquire_withFailingDecoder_shouldNotCacheEntry() {
    let store = ModelStore::new();
    store.add_broken_pair("de", "en");
    let mut settings = store.cache_settings(2);
    settings.runtime.startup_grace = Duration::from_millis(500);
    let cache = RuntimeCache::new(settings);

    let result = cache.acquire(&key("de", "en")).await;
    assert!(matches!(result, Err(RuntimeError::StartupFailure { .. })), "got {:?}", result);
    assert!(cache.is_empty());
}

/// Test that clear stops every decoder
#[tokio::test]
async fn test_clear_withRunningDecoders_shouldStopAll() {
    let store = store_with_pairs();
    let cache = RuntimeCache::new(store.cache_settings(3));
    for (source, target) in &PAIRS[..3] {
        cache.acquire(&key(source, target)).await.unwrap();
    }

    cache.clear().await;

    assert!(cache.is_empty());
    let mut stops = store.stops();
    stops.sort();
    assert_eq!(stops, vec!["de-en", "en-de", "fr-en"]);
}

/// Test that a failed start at capacity keeps the running entry
#[tokio::test]
async fn test_acquire_atCapacityWithFailingDecoder_shouldKeepRunningEntry() {
    let store = ModelStore::new();
    store.add_pair("de", "en");
    store.add_broken_pair("fr", "en");
    let mut settings = store.cache_settings(1);
    settings.runtime.startup_grace = Duration::from_millis(500);
    let cache = RuntimeCache::new(settings);

    let running = cache.acquire(&key("de", "en")).await.unwrap();
    let result = cache.acquire(&key("fr", "en")).await;
    assert!(matches!(result, Err(RuntimeError::StartupFailure { .. })), "got {:?}", result);

    assert_eq!(snapshot_keys(&cache), vec!["de-en"]);
    assert!(!running.is_retired());
    assert!(store.stops().is_empty());
    assert_eq!(running.translate("hallo").await.unwrap(), "hallo [de-en]");

    cache.clear().await;
}

/// Test that a model directory missing a file at capacity keeps the running entry
#[tokio::test]
async fn test_acquire_atCapacityWithIncompleteModel_shouldKeepRunningEntry() {
    let store = ModelStore::new();
    store.add_pair("de", "en");
    let incomplete = store.add_pair("fr", "en");
    std::fs::remove_file(incomplete.join("decoder.yml")).unwrap();
    let cache = RuntimeCache::new(store.cache_settings(1));

    cache.acquire(&key("de", "en")).await.unwrap();
    let result = cache.acquire(&key("fr", "en")).await;
    assert!(matches!(result, Err(RuntimeError::NotFound(ref message)) if message.contains("decoder config")));

    assert_eq!(cache.len(), 1);
    assert!(cache.contains(&key("de", "en")));
    assert_eq!(cache.peek(&key("de", "en")).unwrap().state(), RuntimeState::Ready);
    assert!(store.stops().is_empty());

    cache.clear().await;
}

/// Test that callers joining a failing start get its error, not a retryable one
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_acquire_concurrentWithFailingDecoder_shouldShareStartupFailure() {
    let store = ModelStore::new();
    store.add_broken_pair("de", "en");
    let mut settings = store.cache_settings(2);
    settings.runtime.startup_grace = Duration::from_millis(500);
    let cache = Arc::new(RuntimeCache::new(settings));

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let cache = cache.clone();
            tokio::spawn(async move {
                let runtime = cache.acquire(&key("de", "en")).await?;
                runtime.translate("hallo").await
            })
        })
        .collect();

    for handle in handles {
        let result = handle.await.unwrap();
        match result {
            Err(error @ RuntimeError::StartupFailure { .. }) => {
                assert!(!error.is_retryable());
                assert!(error.to_string().contains("could not load model weights"), "got {}", error);
            }
            other => panic!("expected StartupFailure, got {:?}", other),
        }
    }

    // Both callers waited on the same attempt
    assert_eq!(store.failures(), vec!["de-en".to_string()]);
    assert!(cache.is_empty());
}

/// Test that a timed out call leaves the entry cached with a fresh decoder
#[tokio::test]
async fn test_translate_timingOutThroughCache_shouldKeepEntryWithNewDecoder() {
    let store = store_with_pairs();
    let mut settings = store.cache_settings(2);
    settings.runtime.translate_timeout = Duration::from_millis(500);
    let cache = RuntimeCache::new(settings);
    let pair = key("de", "en");

    let runtime = cache.acquire(&pair).await.unwrap();
    let first_pid = runtime.process_id().await;
    let first_loaded_at = cache.snapshot()[0].loaded_at;

    let result = cache.acquire(&pair).await.unwrap().translate("stall").await;
    assert!(matches!(result, Err(RuntimeError::Timeout { .. })), "got {:?}", result);

    assert!(cache.contains(&pair));
    let snapshot = cache.snapshot();
    assert_eq!(snapshot[0].key, "de-en");
    assert_eq!(snapshot[0].state, RuntimeState::Ready);
    assert!(snapshot[0].loaded_at > first_loaded_at);
    assert_ne!(runtime.process_id().await, first_pid);

    assert_eq!(cache.acquire(&pair).await.unwrap().translate("hallo").await.unwrap(), "hallo [de-en]");

    cache.clear().await;
}
