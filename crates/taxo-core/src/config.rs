//! Taxo Configuration Management
//!
//! Handles configuration from environment variables and TOML config files
//! with defaults matching the pretrained linkers.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    /// Entity linker options
    pub linker: LinkerConfig,

    /// Pipeline composition
    pub pipeline: PipelineConfig,

    /// Offline index build parameters
    pub index: IndexBuildConfig,

    /// Artifact cache locations
    pub cache: CacheConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(k) = std::env::var("TAXO_K") {
            config.linker.k = parse_env("TAXO_K", k)?;
        }
        if let Ok(threshold) = std::env::var("TAXO_THRESHOLD") {
            config.linker.threshold = parse_env("TAXO_THRESHOLD", threshold)?;
        }
        if let Ok(threshold) = std::env::var("TAXO_NO_DEFINITION_THRESHOLD") {
            config.linker.no_definition_threshold =
                parse_env("TAXO_NO_DEFINITION_THRESHOLD", threshold)?;
        }
        if let Ok(max) = std::env::var("TAXO_MAX_ENTITIES") {
            config.linker.max_entities_per_mention = parse_env("TAXO_MAX_ENTITIES", max)?;
        }
        if let Ok(linker) = std::env::var("TAXO_LINKER") {
            config.linker.linker_name = Some(linker);
        }

        // Cache
        if let Ok(dir) = std::env::var("TAXO_CACHE_DIR") {
            config.cache.cache_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("TAXO_DATA_DIR") {
            config.cache.data_dir = PathBuf::from(dir);
        }

        // Logging
        if let Ok(level) = std::env::var("LOG_LEVEL") {
            config.logging.level = level;
        }

        Ok(config)
    }

    /// Load from a TOML file
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let content = std::fs::read_to_string(&path).map_err(|e| ConfigError::FileReadError {
            path: path.clone(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path,
            message: e.to_string(),
        })
    }

    /// Merge with environment variables (env takes precedence)
    pub fn with_env_override(mut self) -> Result<Self, ConfigError> {
        let env_config = Self::from_env()?;
        let defaults = Self::default();

        // Only override if env values differ from defaults
        if env_config.linker.k != defaults.linker.k {
            self.linker.k = env_config.linker.k;
        }
        if env_config.linker.threshold != defaults.linker.threshold {
            self.linker.threshold = env_config.linker.threshold;
        }
        if env_config.linker.no_definition_threshold != defaults.linker.no_definition_threshold {
            self.linker.no_definition_threshold = env_config.linker.no_definition_threshold;
        }
        if env_config.linker.max_entities_per_mention != defaults.linker.max_entities_per_mention
        {
            self.linker.max_entities_per_mention = env_config.linker.max_entities_per_mention;
        }
        if env_config.linker.linker_name.is_some() {
            self.linker.linker_name = env_config.linker.linker_name;
        }
        if env_config.cache.cache_dir != defaults.cache.cache_dir {
            self.cache.cache_dir = env_config.cache.cache_dir;
        }
        if env_config.cache.data_dir != defaults.cache.data_dir {
            self.cache.data_dir = env_config.cache.data_dir;
        }
        if env_config.logging.level != defaults.logging.level {
            self.logging.level = env_config.logging.level;
        }

        Ok(self)
    }

    /// Reject values the linker cannot work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.linker.validate()
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: String) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value,
    })
}

/// Entity linker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkerConfig {
    /// Number of nearest neighbours to retrieve per mention
    pub k: usize,

    /// Minimum score a candidate must exceed to be kept
    pub threshold: f32,

    /// Score a candidate without a definition must reach
    pub no_definition_threshold: f32,

    /// Apply the stricter threshold to concepts lacking a definition
    pub filter_for_definitions: bool,

    /// Maximum candidates kept per mention
    pub max_entities_per_mention: usize,

    /// Look up short forms through their resolved long form
    pub resolve_abbreviations: bool,

    /// Query-time search breadth of the ANN index
    pub ef_search: usize,

    /// Registry name or path of the linker to load
    pub linker_name: Option<String>,
}

impl Default for LinkerConfig {
    fn default() -> Self {
        Self {
            k: 30,
            threshold: 0.7,
            no_definition_threshold: 0.95,
            filter_for_definitions: true,
            max_entities_per_mention: 5,
            resolve_abbreviations: true,
            ef_search: 200,
            linker_name: None,
        }
    }
}

impl LinkerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (key, value) in [
            ("threshold", self.threshold),
            ("no_definition_threshold", self.no_definition_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    value: value.to_string(),
                });
            }
        }
        if self.k == 0 {
            return Err(ConfigError::InvalidValue {
                key: "k".to_string(),
                value: "0".to_string(),
            });
        }
        if self.max_entities_per_mention == 0 {
            return Err(ConfigError::InvalidValue {
                key: "max_entities_per_mention".to_string(),
                value: "0".to_string(),
            });
        }
        Ok(())
    }
}

/// Which stages the pipeline runs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Label given to recognized mentions
    pub label: String,

    /// Run abbreviation detection
    pub with_abbrev: bool,

    /// Run entity linking
    pub with_linking: bool,

    /// Attach sentence indices to output records
    pub with_sentence: bool,

    /// Unresolved abbreviated names point at themselves instead of nothing
    pub unresolved_self_reference: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            label: crate::DEFAULT_LABEL.to_string(),
            with_abbrev: false,
            with_linking: false,
            with_sentence: false,
            unresolved_self_reference: false,
        }
    }
}

/// Parameters for building linker artifacts from a knowledge base
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexBuildConfig {
    /// Drop n-grams seen in fewer aliases than this
    pub min_df: usize,

    /// Graph connectivity (bigger M -> higher recall, slower build)
    pub m: usize,

    /// Construction search breadth
    pub ef_construction: usize,

    /// Seed for level assignment
    pub seed: u64,
}

impl Default for IndexBuildConfig {
    fn default() -> Self {
        Self {
            min_df: 10,
            m: 100,
            ef_construction: 2000,
            seed: 42,
        }
    }
}

/// Artifact cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Where downloaded artifacts are kept
    pub cache_dir: PathBuf,

    /// Root for registry knowledge-base sources
    pub data_dir: PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self {
        let base = std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".taxo");
        Self {
            cache_dir: base.join("cache"),
            data_dir: base.join("data"),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// JSON format for logs
    pub json_format: bool,

    /// Include file/line in logs
    pub include_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            include_location: false,
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    ParseError { path: PathBuf, message: String },

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },

    #[error("Missing required configuration: {0}")]
    MissingRequired(String),
}
