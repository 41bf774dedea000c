//! Shared fixtures: a small LATISS-like source repository with exposures,
//! visits, raw files and calexps, plus helpers to inspect results.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tempfile::TempDir;
use walkdir::WalkDir;

use embargo_core::repository::{
    DatasetQuery, DimensionQuery, IngestMode, Repository, TransferOptions,
};
use embargo_core::types::{ArtifactLocation, FileDataset, RetrievedArtifact};
use embargo_core::{
    CatalogError, DataCoordinate, DataQuery, DatasetRef, DatasetType, DimensionRecord,
    EngineSettings, LocalCatalog, LocalRepository, ReplicaRegistrar, RepositoryError,
    ResolvedQuery, RetryPolicy, Timespan, TransferContext,
};

pub const INSTRUMENT: &str = "LATISS";
pub const RAW_RUN: &str = "LATISS/raw/all";
pub const CALEXP_RUN: &str = "LATISS/runs/nightly";
pub const RSE: &str = "LSST_USDF";
pub const SCOPE: &str = "raw";

/// 2020-01-17T16:55:11.3227 UTC.
pub fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2020, 1, 17, 16, 55, 11).unwrap() + Duration::microseconds(322_700)
}

/// End of the embargo window for a 0.1 hour embargo at [`now`].
pub fn embargo_end() -> DateTime<Utc> {
    now() - Duration::minutes(6)
}

fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2020, 1, 17, h, m, s).unwrap()
}

/// The seven exposures of the boundary scenario with the end of each
/// exposure's timespan.
pub fn boundary_exposures() -> Vec<(i64, DateTime<Utc>)> {
    vec![
        (
            2019111300059,
            Utc.with_ymd_and_hms(2019, 11, 13, 21, 4, 0).unwrap(),
        ),
        (
            2019111300061,
            Utc.with_ymd_and_hms(2019, 11, 13, 21, 9, 30).unwrap(),
        ),
        (2020011700002, at(16, 30, 0)),
        (2020011700003, embargo_end() - Duration::microseconds(1)),
        (2020011700004, embargo_end()),
        (2020011700005, at(16, 52, 0)),
        (2020011700006, at(16, 58, 0)),
    ]
}

pub fn day_obs(exposure: i64) -> i64 {
    exposure / 100_000
}

pub fn obs_id(exposure: i64) -> String {
    format!("AT_O_{}_{:06}", day_obs(exposure), exposure % 100_000)
}

pub fn raw_type() -> DatasetType {
    DatasetType::new("raw", ["instrument", "exposure", "detector"])
}

pub fn calexp_type() -> DatasetType {
    DatasetType::new("calexp", ["instrument", "visit", "detector"])
}

pub fn fast_policy() -> RetryPolicy<RepositoryError> {
    RetryPolicy::new(3, RepositoryError::is_transient)
}

pub fn fast_catalog_policy() -> RetryPolicy<CatalogError> {
    RetryPolicy::new(2, CatalogError::is_transient)
}

/// Source and destination repositories in one temporary directory.
pub struct Fixture {
    pub dir: TempDir,
    pub source: LocalRepository,
    pub dest: LocalRepository,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let source = LocalRepository::create(dir.path().join("embargo")).unwrap();
        let dest = LocalRepository::create(dir.path().join("main")).unwrap();
        Self { dir, source, dest }
    }

    /// Fixture holding every exposure of the boundary scenario, one detector each.
    pub fn boundary() -> Self {
        let fixture = Self::new();
        for (id, end) in boundary_exposures() {
            fixture.add_exposure(id, end, &[0]);
        }
        fixture
    }

    /// Insert the day_obs, exposure and visit records for one exposure and
    /// store a raw and a calexp per detector. Returns the raw refs.
    pub fn add_exposure(&self, id: i64, end: DateTime<Utc>, detectors: &[i64]) -> Vec<DatasetRef> {
        let day = day_obs(id);
        let obs = obs_id(id);
        let timespan = Timespan::bounded(end - Duration::seconds(30), end);
        self.source
            .insert_dimension_record(DimensionRecord::new("day_obs", INSTRUMENT, day))
            .unwrap();
        self.source
            .insert_dimension_record(
                DimensionRecord::new("exposure", INSTRUMENT, id)
                    .with_timespan(timespan)
                    .with_observation(day, obs.clone())
                    .with_field("observation_type", "science"),
            )
            .unwrap();
        self.source
            .insert_dimension_record(
                DimensionRecord::new("visit", INSTRUMENT, id)
                    .with_timespan(timespan)
                    .with_observation(day, obs.clone()),
            )
            .unwrap();

        let mut raws = Vec::new();
        for &detector in detectors {
            let raw = DatasetRef::new(raw_type(), data_id("exposure", id, detector), RAW_RUN);
            self.source
                .store_dataset(
                    &raw,
                    format!("raw/{day}/{obs}/{obs}_R00_S0{detector}.fits"),
                    format!("raw pixels {id} {detector}").as_bytes(),
                    end,
                )
                .unwrap();
            raws.push(raw);

            let calexp =
                DatasetRef::new(calexp_type(), data_id("visit", id, detector), CALEXP_RUN);
            self.source
                .store_dataset(
                    &calexp,
                    format!("calexp/{day}/{obs}_calexp_S0{detector}.fits"),
                    format!("calexp {id} {detector}").as_bytes(),
                    end,
                )
                .unwrap();
        }
        raws
    }

    /// Write a sensor manifest listing `count` science sensors next to an
    /// exposure's raw files.
    pub fn expect_sensors(&self, exposure: i64, count: usize) {
        let obs = obs_id(exposure);
        let dir = self
            .source
            .root()
            .join(format!("raw/{}/{obs}", day_obs(exposure)));
        std::fs::create_dir_all(&dir).unwrap();
        let sensors: BTreeMap<String, &str> = (0..count)
            .map(|i| (format!("R00_S{i:02}"), "SCIENCE"))
            .chain([("R00_SG0".to_string(), "GUIDER")])
            .collect();
        let manifest = serde_json::json!({ "expectedSensors": sensors });
        std::fs::write(
            dir.join(format!("{obs}_expectedSensors.json")),
            serde_json::to_vec(&manifest).unwrap(),
        )
        .unwrap();
    }

    pub fn prefix(&self) -> PathBuf {
        self.dir.path().join("prefix")
    }

    pub fn catalog(&self) -> LocalCatalog {
        LocalCatalog::new(self.dir.path().join("catalog.json"))
    }

    pub fn registrar(&self, dry_run: bool) -> ReplicaRegistrar {
        ReplicaRegistrar::new(Arc::new(self.catalog()), RSE, SCOPE)
            .with_dry_run(dry_run)
            .with_retry_policy(fast_catalog_policy())
    }

    pub fn context(&self, registrar: Option<ReplicaRegistrar>) -> TransferContext {
        TransferContext {
            source: Arc::new(self.source.clone()),
            dest: Arc::new(self.dest.clone()),
            settings: EngineSettings::default(),
            registrar,
        }
    }

    /// Dimension ids of the transferred datasets of one type.
    pub fn transferred_ids(&self, dataset_type: &str, dimension: &str) -> BTreeSet<i64> {
        self.dest
            .datasets()
            .unwrap()
            .iter()
            .filter(|d| d.dataset_type.name == dataset_type)
            .filter_map(|d| d.dimension_id(dimension))
            .collect()
    }
}

pub fn data_id(dimension: &str, id: i64, detector: i64) -> DataCoordinate {
    let mut data_id = DataCoordinate::new();
    data_id.insert("instrument".into(), INSTRUMENT.into());
    data_id.insert(dimension.into(), id.into());
    data_id.insert("detector".into(), detector.into());
    data_id
}

pub fn query(collection: &str, dataset_type: &str, hours: f64) -> ResolvedQuery {
    DataQuery::new(collection, dataset_type)
        .resolve(INSTRUMENT, Some(hours))
        .unwrap()
}

pub fn raw_query(hours: f64) -> ResolvedQuery {
    let mut data_query = DataQuery::new(RAW_RUN, "raw");
    data_query.is_raw = true;
    data_query.resolve(INSTRUMENT, Some(hours)).unwrap()
}

/// Every regular file below `root` with its contents.
pub fn snapshot(root: &Path) -> BTreeMap<PathBuf, Vec<u8>> {
    if !root.exists() {
        return BTreeMap::new();
    }
    WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| {
            let contents = std::fs::read(e.path()).unwrap();
            (e.path().to_path_buf(), contents)
        })
        .collect()
}

/// Repository operations a [`FlakyRepository`] interferes with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Call {
    TransferFrom,
    GetUri,
    RetrieveArtifacts,
    ExportDimensionRecords,
}

type Action = Box<dyn Fn() + Send + Sync>;

/// Wrapper whose first `failures` calls of one operation fail with a
/// connection error. An optional action runs on every such call first.
pub struct FlakyRepository {
    pub inner: LocalRepository,
    call: Call,
    failures: AtomicU32,
    calls: AtomicU32,
    action: Option<Action>,
}

impl FlakyRepository {
    pub fn new(inner: LocalRepository, failures: u32) -> Self {
        Self::failing(inner, Call::TransferFrom, failures)
    }

    pub fn failing(inner: LocalRepository, call: Call, failures: u32) -> Self {
        Self {
            inner,
            call,
            failures: AtomicU32::new(failures),
            calls: AtomicU32::new(0),
            action: None,
        }
    }

    pub fn with_action(mut self, action: impl Fn() + Send + Sync + 'static) -> Self {
        self.action = Some(Box::new(action));
        self
    }

    /// How often the intercepted operation was called.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn intercept(&self, call: Call) -> Result<(), RepositoryError> {
        if call != self.call {
            return Ok(());
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(action) = &self.action {
            action();
        }
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(RepositoryError::Connection {
                message: "server closed the connection unexpectedly".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Repository for FlakyRepository {
    fn label(&self) -> String {
        format!("flaky {}", self.inner.label())
    }

    async fn query_dataset_types(
        &self,
        patterns: &[String],
        collections: &[String],
    ) -> Result<Vec<DatasetType>, RepositoryError> {
        self.inner.query_dataset_types(patterns, collections).await
    }

    async fn query_dimension_records(
        &self,
        query: &DimensionQuery,
    ) -> Result<Vec<DimensionRecord>, RepositoryError> {
        self.inner.query_dimension_records(query).await
    }

    async fn query_datasets(
        &self,
        query: &DatasetQuery,
    ) -> Result<Vec<DatasetRef>, RepositoryError> {
        self.inner.query_datasets(query).await
    }

    async fn query_tracts(
        &self,
        instrument: &str,
        exposure: i64,
    ) -> Result<BTreeSet<i64>, RepositoryError> {
        self.inner.query_tracts(instrument, exposure).await
    }

    async fn dimension_records_for(
        &self,
        refs: &[DatasetRef],
    ) -> Result<Vec<DimensionRecord>, RepositoryError> {
        self.inner.dimension_records_for(refs).await
    }

    async fn transfer_from(
        &self,
        source: &dyn Repository,
        refs: &[DatasetRef],
        options: TransferOptions,
    ) -> Result<usize, RepositoryError> {
        self.intercept(Call::TransferFrom)?;
        self.inner.transfer_from(source, refs, options).await
    }

    async fn transfer_dimension_records_from(
        &self,
        source: &dyn Repository,
        refs: &[DatasetRef],
    ) -> Result<(), RepositoryError> {
        self.inner.transfer_dimension_records_from(source, refs).await
    }

    async fn get_uri(&self, dataset: &DatasetRef) -> Result<ArtifactLocation, RepositoryError> {
        self.intercept(Call::GetUri)?;
        self.inner.get_uri(dataset).await
    }

    async fn retrieve_artifacts(
        &self,
        refs: &[DatasetRef],
        destination: &Path,
    ) -> Result<Vec<RetrievedArtifact>, RepositoryError> {
        self.intercept(Call::RetrieveArtifacts)?;
        self.inner.retrieve_artifacts(refs, destination).await
    }

    async fn export_dimension_records(
        &self,
        exposure: &DimensionRecord,
    ) -> Result<Vec<DimensionRecord>, RepositoryError> {
        self.intercept(Call::ExportDimensionRecords)?;
        self.inner.export_dimension_records(exposure).await
    }

    async fn ingest(&self, files: &[FileDataset], mode: IngestMode) -> Result<(), RepositoryError> {
        self.inner.ingest(files, mode).await
    }

    async fn knows(&self, refs: &[DatasetRef]) -> Result<Vec<bool>, RepositoryError> {
        self.inner.knows(refs).await
    }

    async fn artifacts_exist(&self, refs: &[DatasetRef]) -> Result<Vec<bool>, RepositoryError> {
        self.inner.artifacts_exist(refs).await
    }

    async fn prune_datasets(
        &self,
        refs: &[DatasetRef],
        unstore: bool,
        purge: bool,
    ) -> Result<(), RepositoryError> {
        self.inner.prune_datasets(refs, unstore, purge).await
    }
}
