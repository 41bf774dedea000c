//! Error types for the embargo transfer engine.
//!
//! Uses `thiserror` for public API error types with structured variants
//! covering validation, repository, catalog, configuration and retry domains.

use std::path::PathBuf;

/// Top-level error type for the embargo core library.
#[derive(Debug, thiserror::Error)]
pub enum EmbargoError {
    #[error("Validation error: {message}")]
    Validation { message: String },

    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Filter error: {0}")]
    Filter(#[from] FilterError),

    #[error("{label}: unable to communicate after {attempts} attempts: {message}")]
    RetriesExhausted {
        label: String,
        attempts: u32,
        message: String,
    },

    #[error("Archive error for {path}: {message}")]
    Archive { path: PathBuf, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl EmbargoError {
    /// Shorthand for a validation failure.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }
}

/// Errors reported by a dataset repository.
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("Connection failed: {message}")]
    Connection { message: String },

    #[error("Operational failure: {message}")]
    Operational { message: String },

    #[error("Repository not found at {path}")]
    NotFound { path: PathBuf },

    #[error("Conflicting definition: {message}")]
    ConflictingDefinition { message: String },

    #[error("Unknown dataset {id}")]
    UnknownDataset { id: uuid::Uuid },

    #[error("Missing artifact for dataset {id}: {path}")]
    MissingArtifact { id: uuid::Uuid, path: PathBuf },

    #[error("Invalid query: {message}")]
    InvalidQuery { message: String },

    #[error("Corrupt registry at {path}: {message}")]
    CorruptRegistry { path: PathBuf, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RepositoryError {
    /// Connectivity and operational failures are worth retrying; everything
    /// else is permanent for the call that produced it.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RepositoryError::Connection { .. } | RepositoryError::Operational { .. }
        )
    }
}

/// Errors reported by the replica catalog.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("Already exists: {name}")]
    AlreadyExists { name: String },

    #[error("Data identifier not found: {name}")]
    NotFound { name: String },

    #[error("Catalog database error: {message}")]
    Database { message: String },

    #[error("Catalog IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Catalog error: {message}")]
    Other { message: String },
}

impl CatalogError {
    pub fn is_transient(&self) -> bool {
        matches!(self, CatalogError::Database { .. })
    }
}

/// Errors from the configuration system.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Cannot read configuration file {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Configuration parse error: {message}")]
    ParseError { message: String },
}

/// Errors from parsing a `where` filter expression.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FilterError {
    #[error("Unexpected character '{ch}' at offset {offset}")]
    UnexpectedChar { ch: char, offset: usize },

    #[error("Unterminated string literal starting at offset {offset}")]
    UnterminatedString { offset: usize },

    #[error("Unexpected token {found} (expected {expected})")]
    UnexpectedToken { found: String, expected: String },

    #[error("Unexpected end of expression (expected {expected})")]
    UnexpectedEnd { expected: String },
}

/// A type alias for results using the top-level `EmbargoError`.
pub type Result<T> = std::result::Result<T, EmbargoError>;
