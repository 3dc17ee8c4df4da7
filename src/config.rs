use crate::model::encoding::DEFAULT_UTF16_NULL_RATIO;
use crate::model::line_index::LineEndingMode;
use crate::primitives::highlighter::DEFAULT_TOKEN_CACHE_SIZE;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Bytes scanned by the line index between progress reports
pub const DEFAULT_INDEX_CHUNK_SIZE: usize = 4_000_000;

/// Maximum characters held by a single rope leaf
pub const DEFAULT_LEAF_SIZE: usize = 1024;

/// Untouched lines below which two edit windows are joined
pub const DEFAULT_MERGE_GAP_LINES: usize = 64;

/// Engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct EngineConfig {
    /// Background line index settings
    #[serde(default)]
    pub index: IndexConfig,

    /// Encoding detection settings
    #[serde(default)]
    pub encoding: EncodingConfig,

    /// Edit overlay settings
    #[serde(default)]
    pub rope: RopeConfig,

    /// Undo history settings
    #[serde(default)]
    pub undo: UndoConfig,

    /// Syntax state engine settings
    #[serde(default)]
    pub syntax: SyntaxConfig,
}

/// Line index configuration
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct IndexConfig {
    /// Number of bytes scanned per chunk before progress is reported
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Which byte sequences terminate a line
    #[serde(default)]
    pub line_endings: LineEndingMode,

    /// Capacity of the channel between the worker and the owning thread.
    /// A full queue makes the worker wait until events are processed.
    #[serde(default = "default_event_queue")]
    pub event_queue: usize,
}

fn default_chunk_size() -> usize {
    DEFAULT_INDEX_CHUNK_SIZE
}

fn default_event_queue() -> usize {
    64
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            line_endings: LineEndingMode::default(),
            event_queue: default_event_queue(),
        }
    }
}

/// Encoding detection configuration
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct EncodingConfig {
    /// Number of leading bytes inspected when guessing the encoding
    #[serde(default = "default_sample_size")]
    pub sample_size: usize,

    /// Share of zero bytes at odd (or even) positions above which a file
    /// without a byte-order mark is treated as UTF-16
    #[serde(default = "default_utf16_null_ratio")]
    pub utf16_null_ratio: f64,
}

fn default_sample_size() -> usize {
    4096
}

fn default_utf16_null_ratio() -> f64 {
    DEFAULT_UTF16_NULL_RATIO
}

impl Default for EncodingConfig {
    fn default() -> Self {
        Self {
            sample_size: default_sample_size(),
            utf16_null_ratio: default_utf16_null_ratio(),
        }
    }
}

/// Rope configuration
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RopeConfig {
    /// Maximum number of characters in one leaf fragment
    #[serde(default = "default_leaf_size")]
    pub leaf_size: usize,

    /// When an edit window grows to within this many original lines of
    /// another window, the two become one. 0 joins only windows that touch.
    #[serde(default = "default_merge_gap_lines")]
    pub merge_gap_lines: usize,
}

fn default_leaf_size() -> usize {
    DEFAULT_LEAF_SIZE
}

fn default_merge_gap_lines() -> usize {
    DEFAULT_MERGE_GAP_LINES
}

impl Default for RopeConfig {
    fn default() -> Self {
        Self {
            leaf_size: default_leaf_size(),
            merge_gap_lines: default_merge_gap_lines(),
        }
    }
}

/// Undo history configuration
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct UndoConfig {
    /// Maximum number of commands kept on the undo stack
    #[serde(default = "default_max_history")]
    pub max_history: usize,

    /// Adjacent single-character edits recorded within this many
    /// milliseconds of each other undo as one step. 0 disables merging.
    #[serde(default)]
    pub merge_window_ms: u64,
}

fn default_max_history() -> usize {
    10_000
}

impl UndoConfig {
    pub fn merge_window(&self) -> Option<Duration> {
        (self.merge_window_ms > 0).then(|| Duration::from_millis(self.merge_window_ms))
    }
}

impl Default for UndoConfig {
    fn default() -> Self {
        Self {
            max_history: default_max_history(),
            merge_window_ms: 0,
        }
    }
}

/// Syntax state engine configuration
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SyntaxConfig {
    /// Number of tokenized lines kept in the LRU token cache
    #[serde(default = "default_token_cache_size")]
    pub token_cache_size: usize,

    /// Language preset name ("rust", "python", "c", "plain").
    /// Detected from the file extension when unset.
    #[serde(default)]
    pub language: Option<String>,
}

fn default_token_cache_size() -> usize {
    DEFAULT_TOKEN_CACHE_SIZE
}

impl Default for SyntaxConfig {
    fn default() -> Self {
        Self {
            token_cache_size: default_token_cache_size(),
            language: None,
        }
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file. Missing fields take their defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::IoError(e.to_string()))?;

        let config: EngineConfig =
            serde_json::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a JSON file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let contents = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path.as_ref(), contents).map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// JSON Schema describing the configuration file
    pub fn json_schema() -> serde_json::Value {
        serde_json::to_value(schemars::schema_for!(EngineConfig)).unwrap_or_default()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.index.chunk_size < 2 {
            return Err(ConfigError::ValidationError(
                "index.chunk_size must be at least 2".to_string(),
            ));
        }

        if self.index.event_queue == 0 {
            return Err(ConfigError::ValidationError(
                "index.event_queue must be greater than 0".to_string(),
            ));
        }

        if self.rope.leaf_size == 0 {
            return Err(ConfigError::ValidationError(
                "rope.leaf_size must be greater than 0".to_string(),
            ));
        }

        if self.undo.max_history == 0 {
            return Err(ConfigError::ValidationError(
                "undo.max_history must be greater than 0".to_string(),
            ));
        }

        if self.syntax.token_cache_size == 0 {
            return Err(ConfigError::ValidationError(
                "syntax.token_cache_size must be greater than 0".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.encoding.utf16_null_ratio) {
            return Err(ConfigError::ValidationError(
                "encoding.utf16_null_ratio must be between 0 and 1".to_string(),
            ));
        }

        Ok(())
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("Serialize error: {0}")]
    SerializeError(String),
    #[error("Validation error: {0}")]
    ValidationError(String),
}
