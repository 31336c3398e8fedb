use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the collector
#[derive(Error, Debug)]
pub enum CollectorError {
    /// Configuration related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration validation errors
    #[error("Configuration validation failed: {errors:?}")]
    ConfigValidation { errors: Vec<ValidationError> },

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: PathBuf },

    /// Invalid configuration value
    #[error("Invalid configuration value at {path}: {message}")]
    InvalidConfigValue { path: String, message: String },

    /// IO errors
    #[error("IO error: {context}: {source}")]
    Io {
        source: std::io::Error,
        context: String,
    },

    /// TOML deserialization errors
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// TOML serialization errors
    #[error("TOML serialization error: {0}")]
    TomlSerialization(#[from] toml::ser::Error),

    /// JSON errors
    #[error("JSON error: {context}: {source}")]
    Json {
        source: serde_json::Error,
        context: String,
    },

    /// A stored or incoming record could not be encoded to attributes
    #[error("Failed to encode record {id} for comparison: {source}")]
    RecordEncoding {
        id: String,
        source: serde_json::Error,
    },

    /// Merged attributes could not be decoded back into a record
    #[error("Failed to decode patched record {id}: {source}")]
    RecordDecoding {
        id: String,
        source: serde_json::Error,
    },

    /// A record encoded to something other than an attribute map
    #[error("Record {id} did not encode to an attribute map")]
    RecordShape { id: String },

    /// A patch targeted an existing record of a different type
    #[error("Cannot patch {id}: stored {stored} but patch is {incoming}")]
    RecordTypeMismatch {
        id: String,
        stored: &'static str,
        incoming: &'static str,
    },

    /// Metric registration errors
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Generic errors
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Configuration validation error
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// Path to the configuration key that failed validation
    pub path: String,
    /// Error message describing the validation failure
    pub message: String,
}

impl ValidationError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Result type for collector operations
pub type Result<T> = std::result::Result<T, CollectorError>;
