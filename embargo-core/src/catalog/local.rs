//! JSON-file replica catalog.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::{Did, ReplicaCatalog, ReplicaRecord};
use crate::error::CatalogError;
use crate::persistence::{atomic_write_json, load_json};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bucket {
    pub rse: String,
    pub monotonic: bool,
    pub files: BTreeSet<Did>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CatalogState {
    /// rse -> "scope:name" -> replica.
    #[serde(default)]
    replicas: BTreeMap<String, BTreeMap<String, ReplicaRecord>>,
    /// "scope:name" -> bucket.
    #[serde(default)]
    datasets: BTreeMap<String, Bucket>,
}

impl CatalogState {
    fn has_file(&self, did: &Did) -> bool {
        let key = did.to_string();
        self.replicas.values().any(|r| r.contains_key(&key))
    }
}

/// A catalog persisted as one JSON document; created empty on first write.
#[derive(Debug, Clone)]
pub struct LocalCatalog {
    path: PathBuf,
}

impl LocalCatalog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<CatalogState, CatalogError> {
        match load_json(&self.path) {
            Ok(state) => Ok(state.unwrap_or_default()),
            Err(e) if e.kind() == io::ErrorKind::InvalidData => Err(CatalogError::Other {
                message: format!("unreadable catalog {}: {e}", self.path.display()),
            }),
            Err(e) => Err(e.into()),
        }
    }

    fn update<T>(
        &self,
        f: impl FnOnce(&mut CatalogState) -> Result<T, CatalogError>,
    ) -> Result<T, CatalogError> {
        let mut state = self.load()?;
        let value = f(&mut state)?;
        atomic_write_json(&self.path, &state)?;
        Ok(value)
    }

    pub fn replicas(&self, rse: &str) -> Result<Vec<ReplicaRecord>, CatalogError> {
        Ok(self
            .load()?
            .replicas
            .remove(rse)
            .map(|m| m.into_values().collect())
            .unwrap_or_default())
    }

    pub fn bucket(&self, scope: &str, name: &str) -> Result<Option<Bucket>, CatalogError> {
        Ok(self.load()?.datasets.remove(&Did::new(scope, name).to_string()))
    }

    /// Names of every bucket, sorted.
    pub fn bucket_names(&self) -> Result<Vec<String>, CatalogError> {
        Ok(self.load()?.datasets.into_keys().collect())
    }
}

#[async_trait]
impl ReplicaCatalog for LocalCatalog {
    async fn add_replica(&self, rse: &str, replica: &ReplicaRecord) -> Result<(), CatalogError> {
        self.update(|state| {
            let key = replica.did().to_string();
            let at_rse = state.replicas.entry(rse.to_string()).or_default();
            if at_rse.contains_key(&key) {
                return Err(CatalogError::AlreadyExists { name: key });
            }
            debug!(rse, replica = %key, "Replica added");
            at_rse.insert(key, replica.clone());
            Ok(())
        })
    }

    async fn add_files_to_dataset(
        &self,
        scope: &str,
        name: &str,
        files: &[Did],
        rse: &str,
    ) -> Result<(), CatalogError> {
        self.update(|state| {
            if let Some(missing) = files.iter().find(|f| !state.has_file(f)) {
                return Err(CatalogError::NotFound {
                    name: missing.to_string(),
                });
            }
            let key = Did::new(scope, name).to_string();
            let bucket = state
                .datasets
                .get_mut(&key)
                .ok_or(CatalogError::NotFound { name: key.clone() })?;
            if let Some(attached) = files.iter().find(|f| bucket.files.contains(*f)) {
                return Err(CatalogError::AlreadyExists {
                    name: attached.to_string(),
                });
            }
            debug!(bucket = %key, rse, files = files.len(), "Files attached");
            bucket.files.extend(files.iter().cloned());
            Ok(())
        })
    }

    async fn add_dataset(&self, scope: &str, name: &str, rse: &str) -> Result<(), CatalogError> {
        self.update(|state| {
            let key = Did::new(scope, name).to_string();
            if state.datasets.contains_key(&key) {
                return Err(CatalogError::AlreadyExists { name: key });
            }
            state.datasets.insert(
                key,
                Bucket {
                    rse: rse.to_string(),
                    monotonic: true,
                    files: BTreeSet::new(),
                },
            );
            Ok(())
        })
    }
}
