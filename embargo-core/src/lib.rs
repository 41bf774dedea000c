//! # Embargo Core
//!
//! Core library for embargo-aware dataset transfers.
//! Provides embargo window resolution, dataset type classification, batched
//! selection and transfer with retry, raw exposure packaging, replica
//! catalog registration, and the repository and catalog interfaces with
//! directory-backed implementations.

pub mod archive;
pub mod batch;
pub mod catalog;
pub mod classify;
pub mod config;
pub mod engine;
pub mod error;
pub mod filter;
pub mod inventory;
pub mod persistence;
pub mod raw;
pub mod registrar;
pub mod repository;
pub mod retry;
pub mod timespan;
pub mod types;

// Re-export commonly used types at the crate root.
pub use catalog::{LocalCatalog, ReplicaCatalog, ReplicaRecord};
pub use classify::{Classifier, TemporalAnchor};
pub use config::{DataQuery, EngineSettings, ResolvedQuery, load_settings};
pub use engine::{EmbargoTransfer, RunOptions, RunSummary, TransferContext};
pub use error::{CatalogError, EmbargoError, RepositoryError, Result};
pub use filter::Filter;
pub use registrar::{ContentHashes, ReplicaRegistrar};
pub use repository::{LocalRepository, Repository, TransferOptions};
pub use retry::RetryPolicy;
pub use timespan::{EmbargoWindow, Timespan};
pub use types::{DataCoordinate, DataValue, DatasetRef, DatasetType, DimensionRecord};
