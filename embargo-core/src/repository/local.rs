//! Directory-backed repository.
//!
//! Layout:
//!
//! ```text
//! <root>/registry.json              dataset types, runs, dimension records,
//!                                   tract overlaps and stored datasets
//! <root>/<run>/<dataset_type>/<dataset_id>/<file>
//!                                   artifacts copied in by transfers
//! ```
//!
//! Artifacts are never overwritten: a copy whose target already exists fails
//! with a conflict.
//!
//! Every mutation reloads the registry from disk, applies the change and
//! writes it back atomically, so separate processes see each other's
//! committed work.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    DatasetConstraint, DatasetQuery, DimensionQuery, IngestMode, Repository, TransferOptions,
};
use crate::error::RepositoryError;
use crate::filter::{self, FieldSource};
use crate::persistence::{atomic_write_json, load_json};
use crate::types::{
    ArtifactLocation, DataValue, DatasetRef, DatasetType, DimensionRecord, FileDataset,
    RetrievedArtifact,
};

const REGISTRY_FILE: &str = "registry.json";

/// Elements exported alongside an exposure record.
pub const RELATED_ELEMENTS: [&str; 7] = [
    "day_obs",
    "group",
    "visit",
    "visit_definition",
    "visit_detector_region",
    "visit_system",
    "visit_system_membership",
];

/// A dataset known to the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredDataset {
    pub dataset: DatasetRef,
    /// Relative to the repository root unless ingested in place.
    pub location: ArtifactLocation,
    pub ingest_date: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Registry {
    #[serde(default)]
    dataset_types: BTreeMap<String, DatasetType>,
    #[serde(default)]
    runs: BTreeSet<String>,
    /// element -> records, kept sorted by (instrument, id).
    #[serde(default)]
    dimension_records: BTreeMap<String, Vec<DimensionRecord>>,
    /// instrument -> exposure -> tracts.
    #[serde(default)]
    tracts: BTreeMap<String, BTreeMap<i64, BTreeSet<i64>>>,
    #[serde(default)]
    datasets: BTreeMap<Uuid, StoredDataset>,
}

impl Registry {
    fn record(&self, element: &str, instrument: &str, id: i64) -> Option<&DimensionRecord> {
        self.dimension_records
            .get(element)?
            .iter()
            .find(|r| r.instrument == instrument && r.id == id)
    }

    /// Insert a record unless one with the same identity already exists.
    fn upsert_record(&mut self, record: DimensionRecord) -> bool {
        let records = self
            .dimension_records
            .entry(record.element.clone())
            .or_default();
        let key = (record.instrument.as_str(), record.id);
        match records.binary_search_by(|r| (r.instrument.as_str(), r.id).cmp(&key)) {
            Ok(_) => false,
            Err(pos) => {
                records.insert(pos, record);
                true
            }
        }
    }

    fn ensure_dataset_type(
        &mut self,
        dataset_type: &DatasetType,
        register: bool,
    ) -> Result<(), RepositoryError> {
        match self.dataset_types.get(&dataset_type.name) {
            Some(existing) if existing == dataset_type => Ok(()),
            Some(existing) => Err(RepositoryError::ConflictingDefinition {
                message: format!("dataset type {dataset_type} conflicts with registered {existing}"),
            }),
            None if register => {
                info!(dataset_type = %dataset_type, "Registering dataset type");
                self.dataset_types
                    .insert(dataset_type.name.clone(), dataset_type.clone());
                Ok(())
            }
            None => Err(RepositoryError::ConflictingDefinition {
                message: format!("dataset type {} is not registered", dataset_type.name),
            }),
        }
    }

    fn ensure_run(&mut self, run: &str, register: bool) -> Result<(), RepositoryError> {
        if self.runs.contains(run) {
            return Ok(());
        }
        if !register {
            return Err(RepositoryError::ConflictingDefinition {
                message: format!("run {run} is not registered"),
            });
        }
        debug!(run, "Registering run");
        self.runs.insert(run.to_string());
        Ok(())
    }

    /// Records referenced by a dataset's data id, plus the day_obs of each.
    fn records_for(&self, dataset: &DatasetRef) -> Vec<DimensionRecord> {
        let Some(instrument) = instrument_of(dataset) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for (dimension, value) in &dataset.data_id {
            let Some(id) = value.as_int() else { continue };
            if let Some(record) = self.record(dimension, instrument, id) {
                if let Some(day_obs) = record.day_obs
                    && let Some(day) = self.record("day_obs", instrument, day_obs)
                {
                    out.push(day.clone());
                }
                out.push(record.clone());
            }
        }
        out
    }
}

fn instrument_of(dataset: &DatasetRef) -> Option<&str> {
    match dataset.data_id.get("instrument") {
        Some(DataValue::Str(s)) => Some(s.as_str()),
        _ => None,
    }
}

impl FieldSource for DimensionRecord {
    fn field(&self, name: &str) -> Option<DataValue> {
        self.attribute(name)
    }
}

/// Filter view of a stored dataset: data id values, `run`, `dataset_type`,
/// and `element.attribute` lookups through referenced dimension records.
struct DatasetFields<'a> {
    stored: &'a StoredDataset,
    registry: &'a Registry,
}

impl FieldSource for DatasetFields<'_> {
    fn field(&self, name: &str) -> Option<DataValue> {
        let dataset = &self.stored.dataset;
        match name {
            "run" => return Some(DataValue::Str(dataset.run.clone())),
            "dataset_type" => return Some(DataValue::Str(dataset.dataset_type.name.clone())),
            _ => {}
        }
        if let Some(value) = dataset.data_id.get(name) {
            return Some(value.clone());
        }
        let (element, _) = name.split_once('.')?;
        let id = dataset.dimension_id(element)?;
        self.registry
            .record(element, instrument_of(dataset)?, id)?
            .attribute(name)
    }
}

fn glob_set(patterns: &[String]) -> Result<GlobSet, RepositoryError> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = GlobBuilder::new(pattern)
            .build()
            .map_err(|e| RepositoryError::InvalidQuery {
                message: format!("bad pattern '{pattern}': {e}"),
            })?;
        builder.add(glob);
    }
    builder.build().map_err(|e| RepositoryError::InvalidQuery {
        message: e.to_string(),
    })
}

fn zip_error(err: zip::result::ZipError) -> RepositoryError {
    RepositoryError::Io(io::Error::other(err))
}

/// Stream one member of a zip archive into `out`.
fn copy_member(archive: &Path, member: &str, out: &mut File) -> Result<(), RepositoryError> {
    let mut zip = zip::ZipArchive::new(File::open(archive)?).map_err(zip_error)?;
    let mut entry = zip.by_name(member).map_err(zip_error)?;
    io::copy(&mut entry, out)?;
    Ok(())
}

/// Copy an artifact to `target`, which must not exist yet.
fn copy_new(source: &ArtifactLocation, target: &Path) -> Result<(), RepositoryError> {
    let mut out = match OpenOptions::new().write(true).create_new(true).open(target) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            return Err(RepositoryError::ConflictingDefinition {
                message: format!("artifact {} already exists", target.display()),
            });
        }
        Err(e) => return Err(e.into()),
    };
    let copied = match &source.member {
        Some(member) => copy_member(&source.path, member, &mut out),
        None => File::open(&source.path)
            .and_then(|mut input| io::copy(&mut input, &mut out))
            .map(drop)
            .map_err(RepositoryError::from),
    };
    if copied.is_err() {
        let _ = std::fs::remove_file(target);
    }
    copied
}

/// Files written by an operation that has not committed yet. They are
/// removed on drop unless `keep` is called.
#[derive(Debug, Default)]
struct Written(Vec<PathBuf>);

impl Written {
    fn keep(mut self) {
        self.0.clear();
    }
}

impl Drop for Written {
    fn drop(&mut self) {
        for path in &self.0 {
            let _ = std::fs::remove_file(path);
        }
    }
}

fn member_exists(archive: &Path, member: &str) -> bool {
    File::open(archive)
        .ok()
        .and_then(|f| zip::ZipArchive::new(f).ok())
        .is_some_and(|zip| zip.file_names().any(|n| n == member))
}

/// A repository stored in a local directory.
#[derive(Debug, Clone)]
pub struct LocalRepository {
    root: PathBuf,
}

impl LocalRepository {
    /// Create an empty repository. Fails if one already exists at `root`.
    pub fn create(root: impl AsRef<Path>) -> Result<Self, RepositoryError> {
        let root = std::path::absolute(root.as_ref())?;
        let registry = root.join(REGISTRY_FILE);
        if registry.exists() {
            return Err(RepositoryError::ConflictingDefinition {
                message: format!("a repository already exists at {}", root.display()),
            });
        }
        std::fs::create_dir_all(&root)?;
        atomic_write_json(&registry, &Registry::default())?;
        info!(root = %root.display(), "Created repository");
        Ok(Self { root })
    }

    /// Open an existing repository.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, RepositoryError> {
        let root = std::path::absolute(root.as_ref())?;
        if !root.join(REGISTRY_FILE).is_file() {
            return Err(RepositoryError::NotFound { path: root });
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn registry_path(&self) -> PathBuf {
        self.root.join(REGISTRY_FILE)
    }

    fn load(&self) -> Result<Registry, RepositoryError> {
        let path = self.registry_path();
        match load_json(&path) {
            Ok(Some(registry)) => Ok(registry),
            Ok(None) => Err(RepositoryError::NotFound {
                path: self.root.clone(),
            }),
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                Err(RepositoryError::CorruptRegistry {
                    path,
                    message: e.to_string(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Reload, mutate and atomically persist the registry.
    fn update<T>(
        &self,
        f: impl FnOnce(&mut Registry) -> Result<T, RepositoryError>,
    ) -> Result<T, RepositoryError> {
        let mut registry = self.load()?;
        let value = f(&mut registry)?;
        atomic_write_json(&self.registry_path(), &registry)?;
        Ok(value)
    }

    fn absolute(&self, location: &ArtifactLocation) -> ArtifactLocation {
        ArtifactLocation {
            path: self.root.join(&location.path),
            member: location.member.clone(),
        }
    }

    fn relative(&self, location: ArtifactLocation) -> ArtifactLocation {
        match location.path.strip_prefix(&self.root) {
            Ok(rel) => ArtifactLocation {
                path: rel.to_path_buf(),
                member: location.member,
            },
            Err(_) => location,
        }
    }

    fn artifact_dir(&self, dataset: &DatasetRef) -> PathBuf {
        self.root
            .join(&dataset.run)
            .join(&dataset.dataset_type.name)
            .join(dataset.id.to_string())
    }

    pub fn register_dataset_type(&self, dataset_type: &DatasetType) -> Result<(), RepositoryError> {
        self.update(|reg| reg.ensure_dataset_type(dataset_type, true))
    }

    pub fn register_run(&self, run: &str) -> Result<(), RepositoryError> {
        self.update(|reg| reg.ensure_run(run, true))
    }

    pub fn insert_dimension_record(&self, record: DimensionRecord) -> Result<(), RepositoryError> {
        self.update(|reg| {
            reg.upsert_record(record);
            Ok(())
        })
    }

    pub fn insert_tract_overlap(
        &self,
        instrument: &str,
        exposure: i64,
        tract: i64,
    ) -> Result<(), RepositoryError> {
        self.update(|reg| {
            reg.tracts
                .entry(instrument.to_string())
                .or_default()
                .entry(exposure)
                .or_default()
                .insert(tract);
            Ok(())
        })
    }

    /// Write `contents` to `relative_path` under the root and register the
    /// dataset, its type and its run.
    pub fn store_dataset(
        &self,
        dataset: &DatasetRef,
        relative_path: impl AsRef<Path>,
        contents: &[u8],
        ingest_date: DateTime<Utc>,
    ) -> Result<ArtifactLocation, RepositoryError> {
        let relative_path = relative_path.as_ref();
        let target = self.root.join(relative_path);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&target, contents)?;
        let location = ArtifactLocation::file(relative_path);
        let stored = StoredDataset {
            dataset: dataset.clone(),
            location: location.clone(),
            ingest_date,
        };
        self.update(|reg| {
            reg.ensure_dataset_type(&dataset.dataset_type, true)?;
            reg.ensure_run(&dataset.run, true)?;
            reg.datasets.insert(dataset.id, stored);
            Ok(())
        })?;
        Ok(location)
    }

    /// Every dataset in the registry, ordered by type, data id and id.
    pub fn datasets(&self) -> Result<Vec<DatasetRef>, RepositoryError> {
        let registry = self.load()?;
        let mut refs: Vec<DatasetRef> = registry
            .datasets
            .into_values()
            .map(|s| s.dataset)
            .collect();
        sort_refs(&mut refs);
        Ok(refs)
    }

    pub fn stored(&self, id: Uuid) -> Result<Option<StoredDataset>, RepositoryError> {
        Ok(self.load()?.datasets.remove(&id))
    }

    pub fn dimension_record(
        &self,
        element: &str,
        instrument: &str,
        id: i64,
    ) -> Result<Option<DimensionRecord>, RepositoryError> {
        Ok(self.load()?.record(element, instrument, id).cloned())
    }

    fn copy_artifact(
        &self,
        source: &ArtifactLocation,
        dataset: &DatasetRef,
        written: &mut Written,
    ) -> Result<ArtifactLocation, RepositoryError> {
        let dir = self.artifact_dir(dataset);
        std::fs::create_dir_all(&dir)?;
        let name = source
            .file_name()
            .ok_or_else(|| RepositoryError::MissingArtifact {
                id: dataset.id,
                path: source.path.clone(),
            })?;
        let target = dir.join(&name);
        copy_new(source, &target)?;
        written.0.push(target.clone());
        Ok(self.relative(ArtifactLocation::file(target)))
    }

    fn merge_records(&self, records: Vec<DimensionRecord>) -> Result<usize, RepositoryError> {
        if records.is_empty() {
            return Ok(0);
        }
        self.update(|reg| Ok(records.into_iter().filter(|r| reg.upsert_record(r.clone())).count()))
    }
}

fn sort_refs(refs: &mut [DatasetRef]) {
    refs.sort_by(|a, b| {
        (&a.dataset_type.name, &a.data_id, &a.run, a.id).cmp(&(
            &b.dataset_type.name,
            &b.data_id,
            &b.run,
            b.id,
        ))
    });
}

#[async_trait]
impl Repository for LocalRepository {
    fn label(&self) -> String {
        self.root.display().to_string()
    }

    async fn query_dataset_types(
        &self,
        patterns: &[String],
        collections: &[String],
    ) -> Result<Vec<DatasetType>, RepositoryError> {
        let types = glob_set(patterns)?;
        let runs = glob_set(collections)?;
        let registry = self.load()?;
        let mut found: BTreeMap<String, DatasetType> = BTreeMap::new();
        for stored in registry.datasets.values() {
            let dataset = &stored.dataset;
            if types.is_match(&dataset.dataset_type.name) && runs.is_match(&dataset.run) {
                found
                    .entry(dataset.dataset_type.name.clone())
                    .or_insert_with(|| dataset.dataset_type.clone());
            }
        }
        Ok(found.into_values().collect())
    }

    async fn query_dimension_records(
        &self,
        query: &DimensionQuery,
    ) -> Result<Vec<DimensionRecord>, RepositoryError> {
        let registry = self.load()?;
        let Some(records) = registry.dimension_records.get(&query.element) else {
            return Ok(Vec::new());
        };
        let mut selected: Vec<DimensionRecord> = records
            .iter()
            .filter(|r| r.instrument == query.instrument)
            .filter(|r| query.window.admits_timespan(r.timespan.as_ref()))
            .filter(|r| filter::admits(query.filter.as_ref(), *r))
            .cloned()
            .collect();
        selected.sort_by_key(|r| r.id);
        Ok(selected)
    }

    async fn query_datasets(
        &self,
        query: &DatasetQuery,
    ) -> Result<Vec<DatasetRef>, RepositoryError> {
        let runs = glob_set(&query.collections)?;
        let registry = self.load()?;
        let ids: HashSet<i64> = match &query.constraint {
            DatasetConstraint::DimensionIn { ids, .. } => ids.iter().copied().collect(),
            _ => HashSet::new(),
        };
        let mut refs: Vec<DatasetRef> = registry
            .datasets
            .values()
            .filter(|s| s.dataset.dataset_type.name == query.dataset_type)
            .filter(|s| runs.is_match(&s.dataset.run))
            .filter(|s| match &query.constraint {
                DatasetConstraint::All => true,
                DatasetConstraint::DimensionIn { dimension, .. } => s
                    .dataset
                    .dimension_id(dimension)
                    .is_some_and(|id| ids.contains(&id)),
                DatasetConstraint::IngestedWithin(window) => window.admits(s.ingest_date),
                DatasetConstraint::Exposure(exposure) => {
                    s.dataset.dimension_id("exposure") == Some(*exposure)
                }
            })
            .filter(|s| {
                let fields = DatasetFields {
                    stored: s,
                    registry: &registry,
                };
                filter::admits(query.filter.as_ref(), &fields)
            })
            .map(|s| s.dataset.clone())
            .collect();
        sort_refs(&mut refs);
        Ok(refs)
    }

    async fn query_tracts(
        &self,
        instrument: &str,
        exposure: i64,
    ) -> Result<BTreeSet<i64>, RepositoryError> {
        let registry = self.load()?;
        Ok(registry
            .tracts
            .get(instrument)
            .and_then(|m| m.get(&exposure))
            .cloned()
            .unwrap_or_default())
    }

    async fn dimension_records_for(
        &self,
        refs: &[DatasetRef],
    ) -> Result<Vec<DimensionRecord>, RepositoryError> {
        let registry = self.load()?;
        let mut unique: BTreeMap<(String, String, i64), DimensionRecord> = BTreeMap::new();
        for dataset in refs {
            for record in registry.records_for(dataset) {
                unique
                    .entry((record.element.clone(), record.instrument.clone(), record.id))
                    .or_insert(record);
            }
        }
        Ok(unique.into_values().collect())
    }

    async fn transfer_from(
        &self,
        source: &dyn Repository,
        refs: &[DatasetRef],
        options: TransferOptions,
    ) -> Result<usize, RepositoryError> {
        let known = self.knows(refs).await?;
        let mut candidates: Vec<&DatasetRef> = refs
            .iter()
            .zip(known)
            .filter_map(|(r, k)| (!k).then_some(r))
            .collect();
        let skipped_known = refs.len() - candidates.len();
        if candidates.is_empty() {
            debug!(skipped = skipped_known, "Nothing new to transfer");
            return Ok(0);
        }

        if options.skip_missing {
            let owned: Vec<DatasetRef> = candidates.iter().map(|r| (*r).clone()).collect();
            let present = source.artifacts_exist(&owned).await?;
            candidates = candidates
                .into_iter()
                .zip(present)
                .filter_map(|(r, ok)| {
                    if !ok {
                        warn!(dataset = %r, "Skipping dataset with missing artifact");
                    }
                    ok.then_some(r)
                })
                .collect();
        }

        // Definitions first, so a rejected batch leaves no stray artifacts.
        self.update(|reg| {
            for dataset in &candidates {
                reg.ensure_dataset_type(&dataset.dataset_type, options.register_dataset_types)?;
                reg.ensure_run(&dataset.run, options.register_run)?;
            }
            Ok(())
        })?;

        let mut written = Written::default();
        let mut stored = Vec::with_capacity(candidates.len());
        for dataset in &candidates {
            let uri = source.get_uri(dataset).await?;
            let location = self.copy_artifact(&uri, dataset, &mut written)?;
            stored.push(StoredDataset {
                dataset: (*dataset).clone(),
                location,
                ingest_date: Utc::now(),
            });
        }

        if options.transfer_dimensions {
            let owned: Vec<DatasetRef> = candidates.iter().map(|r| (*r).clone()).collect();
            let records = source.dimension_records_for(&owned).await?;
            self.merge_records(records)?;
        }

        let transferred = stored.len();
        self.update(|reg| {
            for s in stored {
                reg.datasets.insert(s.dataset.id, s);
            }
            Ok(())
        })?;
        written.keep();
        debug!(transferred, skipped = skipped_known, "Transfer committed");
        Ok(transferred)
    }

    async fn transfer_dimension_records_from(
        &self,
        source: &dyn Repository,
        refs: &[DatasetRef],
    ) -> Result<(), RepositoryError> {
        let records = source.dimension_records_for(refs).await?;
        let added = self.merge_records(records)?;
        debug!(added, "Dimension records transferred");
        Ok(())
    }

    async fn get_uri(&self, dataset: &DatasetRef) -> Result<ArtifactLocation, RepositoryError> {
        let registry = self.load()?;
        registry
            .datasets
            .get(&dataset.id)
            .map(|s| self.absolute(&s.location))
            .ok_or(RepositoryError::UnknownDataset { id: dataset.id })
    }

    async fn retrieve_artifacts(
        &self,
        refs: &[DatasetRef],
        destination: &Path,
    ) -> Result<Vec<RetrievedArtifact>, RepositoryError> {
        std::fs::create_dir_all(destination)?;
        let mut written = Written::default();
        let mut retrieved = Vec::with_capacity(refs.len());
        for dataset in refs {
            let location = self.get_uri(dataset).await?;
            let missing = || RepositoryError::MissingArtifact {
                id: dataset.id,
                path: location.path.clone(),
            };
            if !location.path.is_file() {
                return Err(missing());
            }
            let name = location.file_name().ok_or_else(missing)?;
            let target = destination.join(name);
            copy_new(&location, &target)?;
            written.0.push(target.clone());
            retrieved.push(RetrievedArtifact {
                dataset: dataset.clone(),
                path: target,
            });
        }
        written.keep();
        Ok(retrieved)
    }

    async fn export_dimension_records(
        &self,
        exposure: &DimensionRecord,
    ) -> Result<Vec<DimensionRecord>, RepositoryError> {
        let registry = self.load()?;
        let exposure = registry
            .record(&exposure.element, &exposure.instrument, exposure.id)
            .cloned()
            .unwrap_or_else(|| exposure.clone());

        let mut exported = vec![exposure.clone()];
        let mut visits = BTreeSet::new();
        for element in RELATED_ELEMENTS {
            let Some(records) = registry.dimension_records.get(element) else {
                continue;
            };
            for record in records.iter().filter(|r| r.instrument == exposure.instrument) {
                let related = match element {
                    "day_obs" => exposure.day_obs == Some(record.id),
                    _ => {
                        record.fields.get("exposure") == Some(&DataValue::Int(exposure.id))
                            || exposure.fields.get(element).and_then(DataValue::as_int)
                                == Some(record.id)
                    }
                };
                if related {
                    if let Some(visit) = record.fields.get("visit").and_then(DataValue::as_int) {
                        visits.insert(visit);
                    }
                    exported.push(record.clone());
                }
            }
        }
        // Visits reached only through a visit_definition.
        for visit in visits {
            let already = exported
                .iter()
                .any(|r| r.element == "visit" && r.id == visit);
            if !already && let Some(record) = registry.record("visit", &exposure.instrument, visit) {
                exported.push(record.clone());
            }
        }
        Ok(exported)
    }

    async fn ingest(&self, files: &[FileDataset], mode: IngestMode) -> Result<(), RepositoryError> {
        let mut written = Written::default();
        let mut stored = Vec::new();
        for file in files {
            if !file.location.path.is_file() {
                let id = file.refs.first().map(|r| r.id).unwrap_or_default();
                return Err(RepositoryError::MissingArtifact {
                    id,
                    path: file.location.path.clone(),
                });
            }
            for dataset in &file.refs {
                let location = match mode {
                    IngestMode::Direct => self.relative(file.location.clone()),
                    IngestMode::Copy => {
                        self.copy_artifact(&file.location, dataset, &mut written)?
                    }
                };
                stored.push(StoredDataset {
                    dataset: dataset.clone(),
                    location,
                    ingest_date: Utc::now(),
                });
            }
        }
        let count = stored.len();
        self.update(|reg| {
            for s in stored {
                if reg.datasets.contains_key(&s.dataset.id) {
                    return Err(RepositoryError::ConflictingDefinition {
                        message: format!("dataset {} is already registered", s.dataset.id),
                    });
                }
                reg.ensure_dataset_type(&s.dataset.dataset_type, true)?;
                reg.ensure_run(&s.dataset.run, true)?;
                reg.datasets.insert(s.dataset.id, s);
            }
            Ok(())
        })?;
        written.keep();
        debug!(datasets = count, ?mode, "Ingested");
        Ok(())
    }

    async fn knows(&self, refs: &[DatasetRef]) -> Result<Vec<bool>, RepositoryError> {
        let registry = self.load()?;
        Ok(refs
            .iter()
            .map(|r| registry.datasets.contains_key(&r.id))
            .collect())
    }

    async fn artifacts_exist(&self, refs: &[DatasetRef]) -> Result<Vec<bool>, RepositoryError> {
        let registry = self.load()?;
        Ok(refs
            .iter()
            .map(|r| {
                registry.datasets.get(&r.id).is_some_and(|s| {
                    let location = self.absolute(&s.location);
                    match &location.member {
                        Some(member) => member_exists(&location.path, member),
                        None => location.path.is_file(),
                    }
                })
            })
            .collect())
    }

    async fn prune_datasets(
        &self,
        refs: &[DatasetRef],
        unstore: bool,
        purge: bool,
    ) -> Result<(), RepositoryError> {
        if purge && !unstore {
            return Err(RepositoryError::InvalidQuery {
                message: "purge requires unstore".into(),
            });
        }
        let ids: HashSet<Uuid> = refs.iter().map(|r| r.id).collect();
        let registry = self.load()?;
        if unstore {
            for stored in registry.datasets.values().filter(|s| ids.contains(&s.dataset.id)) {
                // Archives may hold other datasets; only plain files go.
                if stored.location.member.is_none() && stored.location.path.is_relative() {
                    let path = self.absolute(&stored.location).path;
                    if let Err(e) = std::fs::remove_file(&path)
                        && e.kind() != io::ErrorKind::NotFound
                    {
                        return Err(e.into());
                    }
                }
            }
        }
        if purge {
            self.update(|reg| {
                reg.datasets.retain(|id, _| !ids.contains(id));
                Ok(())
            })?;
        }
        info!(datasets = ids.len(), unstore, purge, "Pruned datasets");
        Ok(())
    }
}
