/*!
 * Common test utilities for the fluentai test suite
 *
 * Decoders are replaced by one small `/bin/sh` script that speaks the same
 * line protocol. It takes the language pair from the model directory it is
 * started with and records starts, failed starts and clean exits in
 * `starts.log`, `failures.log` and `stops.log` at the root of the models
 * directory.
 */

#![allow(dead_code)]

use once_cell::sync::OnceCell;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;

use fluentai::app_config::{CacheSettings, Config, RuntimeSettings};

const FAKE_DECODER_SCRIPT: &str = r#"#!/bin/sh
model_dir=$(dirname "$2")
pair=$(basename "$model_dir")
root=$(dirname "$model_dir")
if grep -q fail-startup "$7"; then
  echo "$pair" >> "$root/failures.log"
  echo "could not load model weights for $pair" >&2
  exit 1
fi
echo "$pair" >> "$root/starts.log"
echo "serving $pair" >&2
while IFS= read -r line; do
  case "$line" in
    crash) exit 3 ;;
    stall) sleep 5 ;;
    slow) sleep 1; printf '%s [%s]\n' "$line" "$pair" ;;
    escaped) printf '%s\n' "l&apos;homme &amp; la &quot;mer&quot;" ;;
    *) printf '%s [%s]\n' "$line" "$pair" ;;
  esac
done
echo "$pair" >> "$root/stops.log"
"#;

// Written once, before any test can fork, so no spawn races the open write handle
static FAKE_DECODER: OnceCell<PathBuf> = OnceCell::new();

/// Route `log` output through the test harness
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Path of the fake decoder script
pub fn fake_decoder() -> PathBuf {
    FAKE_DECODER
        .get_or_init(|| {
            let path = std::env::temp_dir().join(format!("fluentai-fake-decoder-{}.sh", std::process::id()));
            fs::write(&path, FAKE_DECODER_SCRIPT).expect("write fake decoder");
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod fake decoder");
            path
        })
        .clone()
}

/// Temporary models directory with one subdirectory per language pair
pub struct ModelStore {
    dir: TempDir,
}

impl ModelStore {
    pub fn new() -> Self {
        init_logging();
        fake_decoder();
        Self { dir: TempDir::new().expect("create temp dir") }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Add a complete model directory for `<source>-<target>`
    pub fn add_pair(&self, source: &str, target: &str) -> PathBuf {
        self.write_pair(source, target, "normalize: 0.6\nbeam-size: 6\n")
    }

    /// Add a model directory whose decoder exits right after it is spawned
    pub fn add_broken_pair(&self, source: &str, target: &str) -> PathBuf {
        self.write_pair(source, target, "# fail-startup\n")
    }

    fn write_pair(&self, source: &str, target: &str, decoder_config: &str) -> PathBuf {
        let model_dir = self.root().join(format!("{}-{}", source, target));
        fs::create_dir_all(&model_dir).expect("create model dir");
        fs::write(model_dir.join("opus.bpe32k-bpe32k.transformer.model1.npz"), "weights").unwrap();
        fs::write(model_dir.join("opus.bpe32k-bpe32k.vocab.yml"), "vocab").unwrap();
        fs::write(model_dir.join("decoder.yml"), decoder_config).unwrap();
        model_dir
    }

    /// Pairs whose decoder started, in start order
    pub fn starts(&self) -> Vec<String> {
        read_lines(&self.root().join("starts.log"))
    }

    /// Pairs whose decoder exited at startup
    pub fn failures(&self) -> Vec<String> {
        read_lines(&self.root().join("failures.log"))
    }

    /// Pairs whose decoder exited after its input was closed
    pub fn stops(&self) -> Vec<String> {
        read_lines(&self.root().join("stops.log"))
    }

    pub fn runtime_settings(&self) -> RuntimeSettings {
        RuntimeSettings {
            decoder_path: fake_decoder(),
            translate_timeout: Duration::from_secs(5),
            stop_grace: Duration::from_secs(2),
            startup_grace: Duration::from_millis(50),
        }
    }

    pub fn cache_settings(&self, capacity: usize) -> CacheSettings {
        CacheSettings {
            capacity,
            max_concurrent_loads: 5,
            models_dir: self.root().to_path_buf(),
            runtime: self.runtime_settings(),
        }
    }

    pub fn config(&self) -> Config {
        Config {
            models_dir: self.root().to_path_buf(),
            decoder_path: fake_decoder(),
            translate_timeout_secs: 5,
            stop_grace_secs: 2,
            startup_grace_ms: 50,
            ..Config::default()
        }
    }
}

fn read_lines(path: &Path) -> Vec<String> {
    fs::read_to_string(path)
        .map(|content| content.lines().map(str::to_string).collect())
        .unwrap_or_default()
}

/// Poll `condition` until it holds or `timeout` passes
pub async fn wait_until<F: Fn() -> bool>(condition: F, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    condition()
}
