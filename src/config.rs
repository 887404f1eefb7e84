//! Configuration file parser.
//!
//! The file lists the feeds to fetch and the limits applied while fetching.
//! Unlike most settings files a missing config is an error: without sources
//! there is nothing to run. Unknown keys are accepted and logged.
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::feed::{BatchOptions, FetcherConfig, Source};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// Config file exceeds maximum allowed size.
    #[error("Config file too large: {0}")]
    TooLarge(String),

    #[error("Invalid setting: {0}")]
    InvalidSetting(String),

    #[error("Invalid source '{name}': {reason}")]
    InvalidSource { name: String, reason: String },
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// Top-level configuration.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory the JSON output is written to.
    pub output_dir: PathBuf,

    /// Output file name. A timestamped name is used when absent.
    pub output_file: Option<String>,

    /// Treat a batch with no successful feed as a failed run.
    pub fail_on_empty: bool,

    pub fetch: FetchSettings,

    /// Feeds to fetch, in configuration order.
    pub sources: Vec<Source>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("data"),
            output_file: None,
            fail_on_empty: false,
            fetch: FetchSettings::default(),
            sources: Vec::new(),
        }
    }
}

/// `[fetch]` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FetchSettings {
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
    /// Response bodies are truncated to this many bytes.
    pub max_bytes: usize,
    /// Budget for the whole batch in seconds.
    pub batch_deadline_secs: u64,
    /// Maximum number of feeds fetched at once. Unbounded when absent.
    pub max_concurrency: Option<usize>,
}

impl Default for FetchSettings {
    fn default() -> Self {
        let fetcher = FetcherConfig::default();
        let batch = BatchOptions::default();
        Self {
            timeout_secs: fetcher.timeout.as_secs(),
            max_bytes: fetcher.max_bytes,
            batch_deadline_secs: batch.batch_deadline.as_secs(),
            max_concurrency: batch.max_concurrency,
        }
    }
}

impl FetchSettings {
    pub fn fetcher_config(&self) -> FetcherConfig {
        FetcherConfig {
            timeout: Duration::from_secs(self.timeout_secs),
            max_bytes: self.max_bytes,
        }
    }

    pub fn batch_options(&self) -> BatchOptions {
        BatchOptions {
            batch_deadline: Duration::from_secs(self.batch_deadline_secs),
            max_concurrency: self.max_concurrency,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout_secs == 0 {
            return Err(ConfigError::InvalidSetting(
                "fetch.timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.max_bytes == 0 {
            return Err(ConfigError::InvalidSetting(
                "fetch.max_bytes must be greater than 0".to_string(),
            ));
        }
        if self.batch_deadline_secs == 0 {
            return Err(ConfigError::InvalidSetting(
                "fetch.batch_deadline_secs must be greater than 0".to_string(),
            ));
        }
        if self.max_concurrency == Some(0) {
            return Err(ConfigError::InvalidSetting(
                "fetch.max_concurrency must be greater than 0 when set".to_string(),
            ));
        }
        Ok(())
    }
}

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    const KNOWN_KEYS: [&'static str; 5] =
        ["output_dir", "output_file", "fail_on_empty", "fetch", "sources"];

    /// Load configuration from a TOML file.
    ///
    /// - Missing or unreadable file → `Err(ConfigError::Io)`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Zero limits or a source without an http(s) URL → validation error
    /// - Unknown keys → accepted, logged as warning
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let io_err = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };

        let meta = std::fs::metadata(path).map_err(io_err)?;
        if meta.len() > Self::MAX_FILE_SIZE {
            return Err(ConfigError::TooLarge(format!(
                "Config file is {} bytes (max {} bytes)",
                meta.len(),
                Self::MAX_FILE_SIZE
            )));
        }

        let content = std::fs::read_to_string(path).map_err(io_err)?;
        let config = Self::from_toml(&content)?;
        tracing::info!(
            path = %path.display(),
            sources = config.sources.len(),
            "Loaded configuration"
        );
        Ok(config)
    }

    /// Parses and validates configuration text.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        if let Ok(raw) = content.parse::<toml::Table>() {
            for key in raw.keys() {
                if !Self::KNOWN_KEYS.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.fetch.validate()?;
        for source in &self.sources {
            validate_source(source)?;
        }
        if self.sources.is_empty() {
            tracing::warn!("No sources configured");
        }
        Ok(())
    }

    /// Source URLs in configuration order.
    pub fn endpoints(&self) -> Vec<&str> {
        self.sources.iter().map(|s| s.url.as_str()).collect()
    }
}

fn validate_source(source: &Source) -> Result<(), ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidSource {
        name: source.name.clone(),
        reason,
    };

    if source.name.trim().is_empty() {
        return Err(invalid("name must not be empty".to_string()));
    }
    let url = Url::parse(&source.url).map_err(|e| invalid(format!("invalid URL: {e}")))?;
    match url.scheme() {
        "http" | "https" => Ok(()),
        scheme => Err(invalid(format!(
            "unsupported scheme: {scheme} (only http/https allowed)"
        ))),
    }
}

// ============================================================================
// Tests
// ============================================================================
