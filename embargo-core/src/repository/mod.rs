//! Dataset repository interface.
//!
//! The engine talks to source and destination repositories exclusively
//! through the [`Repository`] trait. [`LocalRepository`] is a
//! directory-backed implementation used by the CLI and the test-suite.

pub mod local;

pub use local::LocalRepository;

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::path::Path;

use crate::error::RepositoryError;
use crate::filter::Filter;
use crate::timespan::EmbargoWindow;
use crate::types::{
    ArtifactLocation, DatasetRef, DatasetType, DimensionRecord, FileDataset, RetrievedArtifact,
};

/// Select dimension records whose validity ends inside an embargo window.
#[derive(Debug, Clone)]
pub struct DimensionQuery {
    pub element: String,
    pub instrument: String,
    pub window: EmbargoWindow,
    pub filter: Option<Filter>,
}

/// Structural constraint applied to a dataset query before the user filter.
#[derive(Debug, Clone, PartialEq)]
pub enum DatasetConstraint {
    /// Every dataset of the type in the collections.
    All,
    /// Datasets whose `dimension` value is one of `ids`.
    DimensionIn { dimension: String, ids: Vec<i64> },
    /// Datasets whose ingest date lies inside the window.
    IngestedWithin(EmbargoWindow),
    /// Datasets of a single exposure.
    Exposure(i64),
}

#[derive(Debug, Clone)]
pub struct DatasetQuery {
    pub dataset_type: String,
    pub collections: Vec<String>,
    pub constraint: DatasetConstraint,
    pub filter: Option<Filter>,
}

/// How `transfer_from` behaves for datasets and definitions it has not seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferOptions {
    pub skip_missing: bool,
    pub register_dataset_types: bool,
    pub register_run: bool,
    pub transfer_dimensions: bool,
}

impl TransferOptions {
    /// Options for embargo transfers: copy, skip missing artifacts, and
    /// register anything unknown along the way.
    pub fn embargo() -> Self {
        Self {
            skip_missing: true,
            register_dataset_types: true,
            register_run: true,
            transfer_dimensions: true,
        }
    }

    /// Options for list-driven transfers, where definitions must already exist.
    pub fn from_list() -> Self {
        Self {
            skip_missing: true,
            register_dataset_types: false,
            register_run: true,
            transfer_dimensions: false,
        }
    }
}

/// How ingested files are placed in the repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestMode {
    /// Reference the file where it already is.
    Direct,
    /// Copy the file into the repository.
    Copy,
}

#[async_trait]
pub trait Repository: Send + Sync {
    /// Human-readable label for logs.
    fn label(&self) -> String;

    /// Dataset types matching any of `patterns` that have datasets in any of
    /// the collections matching `collections`, sorted by name.
    async fn query_dataset_types(
        &self,
        patterns: &[String],
        collections: &[String],
    ) -> Result<Vec<DatasetType>, RepositoryError>;

    /// Dimension records matching the query, ordered by id.
    async fn query_dimension_records(
        &self,
        query: &DimensionQuery,
    ) -> Result<Vec<DimensionRecord>, RepositoryError>;

    async fn query_datasets(&self, query: &DatasetQuery)
    -> Result<Vec<DatasetRef>, RepositoryError>;

    /// Sky tracts overlapped by an exposure; empty when not on-sky.
    async fn query_tracts(
        &self,
        instrument: &str,
        exposure: i64,
    ) -> Result<BTreeSet<i64>, RepositoryError>;

    /// Dimension records referenced by the data ids of `refs`.
    async fn dimension_records_for(
        &self,
        refs: &[DatasetRef],
    ) -> Result<Vec<DimensionRecord>, RepositoryError>;

    /// Copy datasets (metadata and artifacts) from `source`. Datasets already
    /// known here are skipped. Returns the number newly transferred.
    async fn transfer_from(
        &self,
        source: &dyn Repository,
        refs: &[DatasetRef],
        options: TransferOptions,
    ) -> Result<usize, RepositoryError>;

    /// Copy only the dimension records referenced by `refs`.
    async fn transfer_dimension_records_from(
        &self,
        source: &dyn Repository,
        refs: &[DatasetRef],
    ) -> Result<(), RepositoryError>;

    async fn get_uri(&self, dataset: &DatasetRef) -> Result<ArtifactLocation, RepositoryError>;

    /// Copy the artifacts of `refs` into `destination`, flat.
    async fn retrieve_artifacts(
        &self,
        refs: &[DatasetRef],
        destination: &Path,
    ) -> Result<Vec<RetrievedArtifact>, RepositoryError>;

    /// The exposure record plus records of related elements
    /// (day_obs, group, visit, ...).
    async fn export_dimension_records(
        &self,
        exposure: &DimensionRecord,
    ) -> Result<Vec<DimensionRecord>, RepositoryError>;

    async fn ingest(&self, files: &[FileDataset], mode: IngestMode)
    -> Result<(), RepositoryError>;

    /// Whether the registry knows each dataset.
    async fn knows(&self, refs: &[DatasetRef]) -> Result<Vec<bool>, RepositoryError>;

    /// Whether each dataset's artifact is present.
    async fn artifacts_exist(&self, refs: &[DatasetRef]) -> Result<Vec<bool>, RepositoryError>;

    /// Remove datasets; destructive and never invoked by the transfer engine.
    async fn prune_datasets(
        &self,
        refs: &[DatasetRef],
        unstore: bool,
        purge: bool,
    ) -> Result<(), RepositoryError>;
}
