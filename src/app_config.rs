use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::language_utils;

/// Application configuration module
/// This module handles loading, validating and saving the settings that the
/// runtime core consumes: cache sizing, pivot language, decoder invocation
/// and timeouts.
/// Represents the application configuration
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Config {
    /// Maximum number of decoder runtimes kept alive at once
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,

    /// Intermediate language used when no direct pair exists
    #[serde(default = "default_pivot_lang")]
    pub pivot_lang: String,

    /// Maximum number of decoder processes starting at the same time
    #[serde(default = "default_max_concurrent_loads")]
    pub max_concurrent_loads: usize,

    /// Deadline for one translate round-trip, in seconds
    #[serde(default = "default_translate_timeout_secs")]
    pub translate_timeout_secs: u64,

    /// Time a decoder gets to exit after its input is closed, in seconds
    #[serde(default = "default_stop_grace_secs")]
    pub stop_grace_secs: u64,

    /// Delay before checking that a freshly spawned decoder is still alive
    #[serde(default = "default_startup_grace_ms")]
    pub startup_grace_ms: u64,

    /// Root directory holding one `<src>-<tgt>` model directory per pair
    #[serde(default = "default_models_dir")]
    pub models_dir: PathBuf,

    /// Decoder executable, either a path or a command on PATH
    #[serde(default = "default_decoder_path")]
    pub decoder_path: PathBuf,

    /// Accepted language codes; empty accepts every valid ISO code
    #[serde(default)]
    pub supported_languages: Vec<String>,

    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Optional file that receives a copy of every log line
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

/// Log verbosity level
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Matching filter for the `log` facade
    pub fn to_level_filter(&self) -> log::LevelFilter {
        match self {
            Self::Error => log::LevelFilter::Error,
            Self::Warn => log::LevelFilter::Warn,
            Self::Info => log::LevelFilter::Info,
            Self::Debug => log::LevelFilter::Debug,
            Self::Trace => log::LevelFilter::Trace,
        }
    }
}

/// Settings a single decoder runtime needs
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeSettings {
    /// Decoder executable
    pub decoder_path: PathBuf,
    /// Deadline for one translate round-trip
    pub translate_timeout: Duration,
    /// Grace period between closing input and killing the decoder
    pub stop_grace: Duration,
    /// Delay before the post-spawn liveness check
    pub startup_grace: Duration,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Config::default().runtime_settings()
    }
}

/// Settings for the runtime cache
#[derive(Debug, Clone, PartialEq)]
pub struct CacheSettings {
    /// Maximum number of cached runtimes
    pub capacity: usize,
    /// Maximum number of simultaneous decoder starts
    pub max_concurrent_loads: usize,
    /// Root of the per-pair model directories
    pub models_dir: PathBuf,
    /// Settings handed to each runtime
    pub runtime: RuntimeSettings,
}

fn default_cache_size() -> usize {
    6
}

fn default_pivot_lang() -> String {
    "en".to_string()
}

fn default_max_concurrent_loads() -> usize {
    5
}

fn default_translate_timeout_secs() -> u64 {
    120
}

fn default_stop_grace_secs() -> u64 {
    5
}

fn default_startup_grace_ms() -> u64 {
    250
}

fn default_models_dir() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join("fluentai").join("models"))
        .unwrap_or_else(|| PathBuf::from("models"))
}

fn default_decoder_path() -> PathBuf {
    PathBuf::from("marian-decoder")
}

impl Config {
    /// Load configuration from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("Failed to open config file: {}", path.display()))?;

        let config: Config = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Load configuration, writing a default file first if none exists
    pub fn load_or_create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            return Self::load(path);
        }

        log::warn!("Config file not found at '{}', creating default config.", path.display());
        let config = Self::default();
        config.save(path)?;
        Ok(config)
    }

    /// Save configuration as pretty-printed JSON
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self)
            .context("Failed to serialize config to JSON")?;

        std::fs::write(path, json)
            .with_context(|| format!("Failed to write config to file: {}", path.display()))
    }

    /// Validate the configuration for consistency and required values
    pub fn validate(&self) -> Result<()> {
        if self.cache_size == 0 {
            return Err(anyhow!("cache_size must be at least 1"));
        }

        if self.max_concurrent_loads == 0 {
            return Err(anyhow!("max_concurrent_loads must be at least 1"));
        }

        if self.translate_timeout_secs == 0 {
            return Err(anyhow!("translate_timeout_secs must be at least 1"));
        }

        if !language_utils::is_valid_language_code(&self.pivot_lang) {
            return Err(anyhow!("Invalid pivot language code: {}", self.pivot_lang));
        }

        if let Some(invalid) = self
            .supported_languages
            .iter()
            .find(|code| !language_utils::is_valid_language_code(code))
        {
            return Err(anyhow!("Invalid code in supported_languages: {}", invalid));
        }

        if self.decoder_path.as_os_str().is_empty() {
            return Err(anyhow!("decoder_path cannot be empty"));
        }

        Ok(())
    }

    /// Whether a language code is accepted by this configuration
    pub fn is_supported_language(&self, code: &str) -> bool {
        let code = language_utils::normalize_code(code);
        if code == language_utils::normalize_code(&self.pivot_lang) {
            return true;
        }

        if !language_utils::is_valid_language_code(&code) {
            return false;
        }

        self.supported_languages.is_empty()
            || self
                .supported_languages
                .iter()
                .any(|supported| language_utils::normalize_code(supported) == code)
    }

    /// Settings for a single runtime
    pub fn runtime_settings(&self) -> RuntimeSettings {
        RuntimeSettings {
            decoder_path: self.decoder_path.clone(),
            translate_timeout: Duration::from_secs(self.translate_timeout_secs),
            stop_grace: Duration::from_secs(self.stop_grace_secs),
            startup_grace: Duration::from_millis(self.startup_grace_ms),
        }
    }

    /// Settings for the runtime cache
    pub fn cache_settings(&self) -> CacheSettings {
        CacheSettings {
            capacity: self.cache_size,
            max_concurrent_loads: self.max_concurrent_loads,
            models_dir: self.models_dir.clone(),
            runtime: self.runtime_settings(),
        }
    }
}

/// Default implementation for Config
impl Default for Config {
    fn default() -> Self {
        Config {
            cache_size: default_cache_size(),
            pivot_lang: default_pivot_lang(),
            max_concurrent_loads: default_max_concurrent_loads(),
            translate_timeout_secs: default_translate_timeout_secs(),
            stop_grace_secs: default_stop_grace_secs(),
            startup_grace_ms: default_startup_grace_ms(),
            models_dir: default_models_dir(),
            decoder_path: default_decoder_path(),
            supported_languages: Vec::new(),
            log_level: LogLevel::default(),
            log_file: None,
        }
    }
}
