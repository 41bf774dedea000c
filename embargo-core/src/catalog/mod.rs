//! Replica catalog interface.
//!
//! The catalog tracks physical copies ("replicas") of files at storage
//! elements and groups them into named dataset buckets.

pub mod local;

pub use local::LocalCatalog;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::CatalogError;

/// A data identifier: a name within a scope.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Did {
    pub scope: String,
    pub name: String,
}

impl Did {
    pub fn new(scope: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for Did {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.scope, self.name)
    }
}

/// A file registered as a replica at a storage element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaRecord {
    /// Logical file name, `{instrument}/{day_obs}/{file}`.
    pub name: String,
    pub bytes: u64,
    pub md5: String,
    pub adler32: String,
    pub scope: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<BTreeMap<String, String>>,
}

impl ReplicaRecord {
    pub fn did(&self) -> Did {
        Did::new(&self.scope, &self.name)
    }
}

#[async_trait]
pub trait ReplicaCatalog: Send + Sync {
    /// Register a replica. Fails with `AlreadyExists` for a duplicate.
    async fn add_replica(&self, rse: &str, replica: &ReplicaRecord) -> Result<(), CatalogError>;

    /// Attach files to a dataset bucket. Fails with `NotFound` when the bucket
    /// does not exist and `AlreadyExists` when a file is already attached.
    async fn add_files_to_dataset(
        &self,
        scope: &str,
        name: &str,
        files: &[Did],
        rse: &str,
    ) -> Result<(), CatalogError>;

    /// Create a (monotonic) dataset bucket.
    async fn add_dataset(&self, scope: &str, name: &str, rse: &str) -> Result<(), CatalogError>;
}
