//! Registration of installed files in the replica catalog.

use md5::{Digest, Md5};
use std::collections::{BTreeMap, BTreeSet};
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use crate::catalog::{Did, ReplicaCatalog, ReplicaRecord};
use crate::error::{CatalogError, EmbargoError, Result};
use crate::retry::{RetryError, RetryPolicy};

const HASH_CHUNK: usize = 10 * 1024 * 1024;
const OBS_ID_PREFIX: usize = 20;

/// Size and checksums of a file, captured right after it was written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentHashes {
    pub bytes: u64,
    pub md5: String,
    /// Eight lowercase hex digits.
    pub adler32: String,
}

impl ContentHashes {
    /// Stream a file in 10 MiB chunks.
    pub fn compute(path: &Path) -> std::io::Result<Self> {
        let mut file = std::fs::File::open(path)?;
        let mut buffer = vec![0u8; HASH_CHUNK];
        let mut md5 = Md5::new();
        let mut adler = adler::Adler32::new();
        let mut bytes = 0u64;
        loop {
            let n = file.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            bytes += n as u64;
            md5.update(&buffer[..n]);
            adler.write_slice(&buffer[..n]);
        }
        Ok(Self {
            bytes,
            md5: format!("{:x}", md5.finalize()),
            adler32: format!("{:08x}", adler.checksum()),
        })
    }
}

/// Bucket names for an exposure: one per overlapping tract, or `NoTract`.
pub fn bucket_names(
    tracts: &BTreeSet<i64>,
    instrument: &str,
    day_obs: &str,
    obs_id: &str,
) -> BTreeSet<String> {
    if tracts.is_empty() {
        return BTreeSet::from([format!("Dataset/{instrument}/raw/NoTract/{day_obs}/{obs_id}")]);
    }
    tracts
        .iter()
        .map(|tract| format!("Dataset/{instrument}/raw/{tract}/{day_obs}/{obs_id}"))
        .collect()
}

fn tolerate_existing(
    result: std::result::Result<(), RetryError<CatalogError>>,
) -> std::result::Result<(), RetryError<CatalogError>> {
    match result {
        Err(RetryError::Permanent(CatalogError::AlreadyExists { .. })) => Ok(()),
        other => other,
    }
}

/// Registers files as replicas at one storage element and files them into
/// dataset buckets.
pub struct ReplicaRegistrar {
    catalog: Arc<dyn ReplicaCatalog>,
    rse: String,
    scope: String,
    dry_run: bool,
    policy: RetryPolicy<CatalogError>,
}

impl ReplicaRegistrar {
    pub fn new(
        catalog: Arc<dyn ReplicaCatalog>,
        rse: impl Into<String>,
        scope: impl Into<String>,
    ) -> Self {
        Self {
            catalog,
            rse: rse.into(),
            scope: scope.into(),
            dry_run: false,
            policy: RetryPolicy::catalog(),
        }
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy<CatalogError>) -> Self {
        self.policy = policy;
        self
    }

    pub fn rse(&self) -> &str {
        &self.rse
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Replica record for a logical file name; zip archives are tagged so
    /// downstream tooling can unpack them.
    pub fn replica(&self, name: &str, hashes: &ContentHashes) -> ReplicaRecord {
        let meta = name.ends_with(".zip").then(|| {
            BTreeMap::from([("rubin_butler".to_string(), "zip_file".to_string())])
        });
        ReplicaRecord {
            name: name.trim_start_matches('/').to_string(),
            bytes: hashes.bytes,
            md5: hashes.md5.clone(),
            adler32: hashes.adler32.clone(),
            scope: self.scope.clone(),
            meta,
        }
    }

    /// Register `name` (`{instrument}/{day_obs}/{file}`) and attach it to the
    /// bucket of every tract it overlaps.
    pub async fn register(
        &self,
        name: &str,
        hashes: &ContentHashes,
        tracts: &BTreeSet<i64>,
    ) -> Result<()> {
        let parts: Vec<&str> = name.trim_start_matches('/').split('/').collect();
        let [instrument, day_obs, filename] = parts[..] else {
            return Err(EmbargoError::validation(format!(
                "logical file name must be instrument/day_obs/file, got '{name}'"
            )));
        };
        let obs_id: String = filename.chars().take(OBS_ID_PREFIX).collect();

        let replica = self.replica(name, hashes);
        self.add_replica(&replica).await?;
        for bucket in bucket_names(tracts, instrument, day_obs, &obs_id) {
            self.attach(&replica.did(), &bucket).await?;
        }
        Ok(())
    }

    async fn add_replica(&self, replica: &ReplicaRecord) -> Result<()> {
        info!(rse = %self.rse, replica = %replica.did(), bytes = replica.bytes, "Adding replica");
        if self.dry_run {
            return Ok(());
        }
        let result = self
            .policy
            .run("add_replica", move || self.catalog.add_replica(&self.rse, replica))
            .await;
        tolerate_existing(result)?;
        Ok(())
    }

    async fn try_attach(
        &self,
        did: &Did,
        bucket: &str,
    ) -> std::result::Result<(), RetryError<CatalogError>> {
        let files = std::slice::from_ref(did);
        let result = self
            .policy
            .run("add_files_to_dataset", move || {
                self.catalog
                    .add_files_to_dataset(&self.scope, bucket, files, &self.rse)
            })
            .await;
        tolerate_existing(result)
    }

    async fn attach(&self, did: &Did, bucket: &str) -> Result<()> {
        info!(file = %did, bucket, rse = %self.rse, "Registering in dataset");
        if self.dry_run {
            return Ok(());
        }
        match self.try_attach(did, bucket).await {
            Err(RetryError::Permanent(CatalogError::NotFound { .. })) => {}
            other => return Ok(other?),
        }

        info!(bucket, "Creating dataset bucket");
        let created = self
            .policy
            .run("add_dataset", move || {
                self.catalog.add_dataset(&self.scope, bucket, &self.rse)
            })
            .await;
        tolerate_existing(created)?;

        info!(bucket, "Retrying attach after bucket creation");
        self.try_attach(did, bucket).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::LocalCatalog;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    /// Fails the first `failures` replica registrations with a database error.
    struct FlakyCatalog {
        inner: LocalCatalog,
        failures: AtomicU32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl ReplicaCatalog for FlakyCatalog {
        async fn add_replica(
            &self,
            rse: &str,
            replica: &ReplicaRecord,
        ) -> std::result::Result<(), CatalogError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(CatalogError::Database {
                    message: "deadlock detected".into(),
                });
            }
            self.inner.add_replica(rse, replica).await
        }

        async fn add_files_to_dataset(
            &self,
            scope: &str,
            name: &str,
            files: &[Did],
            rse: &str,
        ) -> std::result::Result<(), CatalogError> {
            self.inner.add_files_to_dataset(scope, name, files, rse).await
        }

        async fn add_dataset(
            &self,
            scope: &str,
            name: &str,
            rse: &str,
        ) -> std::result::Result<(), CatalogError> {
            self.inner.add_dataset(scope, name, rse).await
        }
    }

    fn hashes() -> ContentHashes {
        ContentHashes {
            bytes: 11,
            md5: "5eb63bbbe01eeed093cb22bb8f5acdc3".into(),
            adler32: "1a0b045d".into(),
        }
    }

    fn instant() -> RetryPolicy<CatalogError> {
        RetryPolicy::new(2, CatalogError::is_transient)
    }

    const ZIP: &str = "LATISS/20200117/AT_O_20200117_000002.zip";

    #[test]
    fn test_content_hashes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"hello world").unwrap();
        assert_eq!(ContentHashes::compute(&path).unwrap(), hashes());

        std::fs::write(&path, b"").unwrap();
        let empty = ContentHashes::compute(&path).unwrap();
        assert_eq!(empty.bytes, 0);
        assert_eq!(empty.adler32, "00000001");
    }

    #[test]
    fn test_content_hashes_span_chunks() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("big");
        std::fs::write(&path, vec![b'x'; HASH_CHUNK + 5]).unwrap();
        let h = ContentHashes::compute(&path).unwrap();
        assert_eq!(h.bytes, (HASH_CHUNK + 5) as u64);
        assert_eq!(h.md5, "94b2626365c6599654fb5fd27a3f5894");
        assert_eq!(h.adler32, "e25b6795");
    }

    #[test]
    fn test_bucket_names() {
        let none = bucket_names(&BTreeSet::new(), "LATISS", "20200117", "AT_O_20200117_000002");
        assert_eq!(
            none.into_iter().collect::<Vec<_>>(),
            vec!["Dataset/LATISS/raw/NoTract/20200117/AT_O_20200117_000002"]
        );
        let two = bucket_names(&BTreeSet::from([9813, 10050]), "LSSTCam", "20250101", "MC_O");
        assert_eq!(two.len(), 2);
        assert!(two.contains("Dataset/LSSTCam/raw/9813/20250101/MC_O"));
    }

    #[test]
    fn test_zip_replicas_are_tagged() {
        let catalog = Arc::new(LocalCatalog::new("/nonexistent/catalog.json"));
        let registrar = ReplicaRegistrar::new(catalog, "SLAC_RAW", "raw");
        let zip = registrar.replica(ZIP, &hashes());
        assert_eq!(
            zip.meta.unwrap().get("rubin_butler").map(String::as_str),
            Some("zip_file")
        );
        let dims = registrar.replica("LATISS/20200117/AT_O_20200117_000002_dimensions.yaml", &hashes());
        assert!(dims.meta.is_none());
    }

    #[tokio::test]
    async fn test_register_creates_bucket_and_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let catalog = Arc::new(LocalCatalog::new(dir.path().join("catalog.json")));
        let registrar = ReplicaRegistrar::new(catalog.clone(), "SLAC_RAW", "raw")
            .with_retry_policy(instant());

        registrar.register(ZIP, &hashes(), &BTreeSet::new()).await.unwrap();
        registrar.register(ZIP, &hashes(), &BTreeSet::new()).await.unwrap();

        assert_eq!(catalog.replicas("SLAC_RAW").unwrap().len(), 1);
        let bucket = catalog
            .bucket("raw", "Dataset/LATISS/raw/NoTract/20200117/AT_O_20200117_000002")
            .unwrap()
            .unwrap();
        assert_eq!(bucket.files.len(), 1);
    }

    #[tokio::test]
    async fn test_register_attaches_to_every_tract() {
        let dir = TempDir::new().unwrap();
        let catalog = Arc::new(LocalCatalog::new(dir.path().join("catalog.json")));
        let registrar = ReplicaRegistrar::new(catalog.clone(), "SLAC_RAW", "raw")
            .with_retry_policy(instant());
        registrar
            .register(ZIP, &hashes(), &BTreeSet::from([1, 2, 3]))
            .await
            .unwrap();
        assert_eq!(catalog.bucket_names().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_dry_run_touches_nothing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("catalog.json");
        let catalog = Arc::new(LocalCatalog::new(&path));
        let registrar = ReplicaRegistrar::new(catalog, "SLAC_RAW", "raw").with_dry_run(true);
        registrar.register(ZIP, &hashes(), &BTreeSet::new()).await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_database_error_retried_once() {
        let dir = TempDir::new().unwrap();
        let flaky = Arc::new(FlakyCatalog {
            inner: LocalCatalog::new(dir.path().join("catalog.json")),
            failures: AtomicU32::new(1),
            calls: AtomicU32::new(0),
        });
        let registrar =
            ReplicaRegistrar::new(flaky.clone(), "SLAC_RAW", "raw").with_retry_policy(instant());
        registrar.register(ZIP, &hashes(), &BTreeSet::new()).await.unwrap();
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_persistent_database_error_is_fatal() {
        let dir = TempDir::new().unwrap();
        let flaky = Arc::new(FlakyCatalog {
            inner: LocalCatalog::new(dir.path().join("catalog.json")),
            failures: AtomicU32::new(5),
            calls: AtomicU32::new(0),
        });
        let registrar =
            ReplicaRegistrar::new(flaky.clone(), "SLAC_RAW", "raw").with_retry_policy(instant());
        let err = registrar
            .register(ZIP, &hashes(), &BTreeSet::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EmbargoError::RetriesExhausted { attempts: 2, .. }));
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_malformed_name_rejected() {
        let catalog = Arc::new(LocalCatalog::new("/nonexistent/catalog.json"));
        let registrar = ReplicaRegistrar::new(catalog, "SLAC_RAW", "raw");
        let err = registrar
            .register("just-a-file.zip", &hashes(), &BTreeSet::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EmbargoError::Validation { .. }));
    }
}
