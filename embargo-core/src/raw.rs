//! Packaging of raw exposures into zip archives.
//!
//! Each exposure becomes one archive under
//! `{prefix}/{instrument}/{day_obs}/{obs_id}.zip`, with its exported
//! dimension records next to it. Other invocations may be packaging the same
//! exposure concurrently, so the final archive is looked for again before
//! each expensive step, and installation itself never overwrites.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::archive::{self, InstallOutcome};
use crate::error::{EmbargoError, RepositoryError, Result};
use crate::registrar::{ContentHashes, ReplicaRegistrar};
use crate::repository::{DatasetConstraint, DatasetQuery, IngestMode, Repository};
use crate::retry::RetryPolicy;
use crate::types::{
    ArtifactLocation, DataCoordinate, DatasetRef, DimensionRecord, FileDataset, RetrievedArtifact,
};

pub const INDEX_FILE: &str = "_metadata_index.json";
pub const DIMENSIONS_FILE: &str = "_dimensions.yaml";
const EXPECTED_SENSORS_SUFFIX: &str = "_expectedSensors.json";

/// What happened to one exposure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExposureOutcome {
    Packaged { members: usize },
    /// The archive was found at the numbered checkpoint (1-5).
    AlreadyInstalled { checkpoint: u8 },
    NoDatasets,
    Incomplete { found: usize, expected: usize },
    /// The exposure record lacks an observation id or day.
    Unidentified,
}

/// Where an exposure's products land.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExposurePaths {
    pub directory: PathBuf,
    pub archive: PathBuf,
    pub dimensions: PathBuf,
    /// `{instrument}/{day_obs}` prefix of catalog logical names.
    pub logical_dir: String,
}

impl ExposurePaths {
    pub fn new(prefix: &Path, instrument: &str, day_obs: i64, obs_id: &str) -> Self {
        let directory = prefix.join(instrument).join(day_obs.to_string());
        Self {
            archive: directory.join(format!("{obs_id}.zip")),
            dimensions: directory.join(format!("{obs_id}_dimensions.yaml")),
            directory,
            logical_dir: format!("{instrument}/{day_obs}"),
        }
    }

    fn logical_name(&self, path: &Path) -> String {
        let file = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        format!("{}/{file}", self.logical_dir)
    }
}

/// One entry of the archive's metadata index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub dataset_id: Uuid,
    pub dataset_type: String,
    pub run: String,
    pub data_id: DataCoordinate,
    pub bytes: u64,
}

/// Build the file name to index entry map for retrieved artifacts.
pub fn build_index(retrieved: &[RetrievedArtifact]) -> Result<BTreeMap<String, IndexEntry>> {
    let mut index = BTreeMap::new();
    for artifact in retrieved {
        let name = artifact
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| EmbargoError::Archive {
                path: artifact.path.clone(),
                message: "retrieved artifact has no file name".into(),
            })?;
        let bytes = std::fs::metadata(&artifact.path)?.len();
        index.insert(
            name,
            IndexEntry {
                dataset_id: artifact.dataset.id,
                dataset_type: artifact.dataset.dataset_type.name.clone(),
                run: artifact.dataset.run.clone(),
                data_id: artifact.dataset.data_id.clone(),
                bytes,
            },
        );
    }
    Ok(index)
}

#[derive(Debug, Deserialize)]
struct ExpectedSensors {
    #[serde(rename = "expectedSensors")]
    expected_sensors: BTreeMap<String, String>,
}

/// Number of science sensors an exposure should have, if a manifest exists.
pub fn expected_science_sensors(manifest: &Path) -> Result<Option<usize>> {
    if !manifest.is_file() {
        return Ok(None);
    }
    let parsed: ExpectedSensors = serde_json::from_slice(&std::fs::read(manifest)?)?;
    Ok(Some(
        parsed
            .expected_sensors
            .values()
            .filter(|kind| kind.as_str() == "SCIENCE")
            .count(),
    ))
}

#[derive(Debug, Serialize)]
struct DimensionExport<'a> {
    description: String,
    data: Vec<ElementRecords<'a>>,
}

#[derive(Debug, Serialize)]
struct ElementRecords<'a> {
    element: &'a str,
    records: Vec<&'a DimensionRecord>,
}

/// Render exported records as YAML, grouped by element in first-seen order.
pub fn dimensions_yaml(obs_id: &str, records: &[DimensionRecord]) -> Result<String> {
    let mut data: Vec<ElementRecords<'_>> = Vec::new();
    for record in records {
        match data.iter_mut().find(|g| g.element == record.element) {
            Some(group) => group.records.push(record),
            None => data.push(ElementRecords {
                element: &record.element,
                records: vec![record],
            }),
        }
    }
    let export = DimensionExport {
        description: format!("Dimension records for {obs_id}"),
        data,
    };
    Ok(serde_yaml::to_string(&export)?)
}

fn log_elapsed(step: &str, started: Instant) {
    info!(step, elapsed_ms = started.elapsed().as_millis() as u64, "Step finished");
}

/// Which datasets make up an exposure.
#[derive(Debug, Clone)]
pub struct RawSelection<'a> {
    pub instrument: &'a str,
    pub dataset_types: &'a [String],
    pub collections: &'a [String],
}

/// Packages exposures from `source` into archives under `prefix` and
/// ingests them into `dest`.
pub struct RawPackager<'a> {
    source: &'a dyn Repository,
    dest: &'a dyn Repository,
    prefix: &'a Path,
    registrar: Option<&'a ReplicaRegistrar>,
    dry_run: bool,
    policy: RetryPolicy<RepositoryError>,
}

impl<'a> RawPackager<'a> {
    pub fn new(source: &'a dyn Repository, dest: &'a dyn Repository, prefix: &'a Path) -> Self {
        Self {
            source,
            dest,
            prefix,
            registrar: None,
            dry_run: false,
            policy: RetryPolicy::repository(),
        }
    }

    pub fn with_registrar(mut self, registrar: Option<&'a ReplicaRegistrar>) -> Self {
        self.registrar = registrar;
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy<RepositoryError>) -> Self {
        self.policy = policy;
        self
    }

    /// Package, install, ingest and register one exposure.
    pub async fn process_exposure(
        &self,
        selection: &RawSelection<'_>,
        exposure: &DimensionRecord,
    ) -> Result<ExposureOutcome> {
        let (Some(day_obs), Some(obs_id)) = (exposure.day_obs, exposure.obs_id.as_deref()) else {
            warn!(exposure = exposure.id, "Exposure has no observation id or day, skipping");
            return Ok(ExposureOutcome::Unidentified);
        };
        let paths = ExposurePaths::new(self.prefix, selection.instrument, day_obs, obs_id);
        if paths.archive.exists() {
            info!(archive = %paths.archive.display(), "Zip exists, skipping processing");
            return Ok(ExposureOutcome::AlreadyInstalled { checkpoint: 1 });
        }

        let instrument = selection.instrument;
        let exposure_id = exposure.id;
        let tracts: BTreeSet<i64> = self
            .policy
            .run("query tracts", move || {
                self.source.query_tracts(instrument, exposure_id)
            })
            .await?;

        let refs = self.exposure_refs(selection, exposure_id).await?;
        if refs.is_empty() {
            warn!(exposure = %obs_id, "No datasets for exposure");
            return Ok(ExposureOutcome::NoDatasets);
        }
        info!(exposure = %obs_id, refs = refs.len(), "Handling exposure");

        let first_ref = &refs[0];
        let first = self
            .policy
            .run("get uri", move || self.source.get_uri(first_ref))
            .await?;
        let source_dir = first
            .dirname()
            .map(Path::to_path_buf)
            .ok_or_else(|| EmbargoError::Archive {
                path: first.path.clone(),
                message: "artifact has no parent directory".into(),
            })?;
        debug!(source_dir = %source_dir.display(), "Source directory");

        let manifest = source_dir.join(format!("{obs_id}{EXPECTED_SENSORS_SUFFIX}"));
        if let Some(expected) = expected_science_sensors(&manifest)?
            && refs.len() < expected
        {
            warn!(
                exposure = %obs_id,
                found = refs.len(),
                expected,
                "Skipping incomplete exposure"
            );
            return Ok(ExposureOutcome::Incomplete {
                found: refs.len(),
                expected,
            });
        }

        let scratch = tempfile::Builder::new().prefix("embargo-").tempdir()?;
        let inputs = scratch.path().join("inputs");
        std::fs::create_dir(&inputs)?;
        if paths.archive.exists() {
            info!(archive = %paths.archive.display(), "Zip exists, not retrieving datasets");
            return Ok(ExposureOutcome::AlreadyInstalled { checkpoint: 2 });
        }

        let started = Instant::now();
        let (all_refs, inputs_dir) = (refs.as_slice(), inputs.as_path());
        let retrieved = self
            .policy
            .run("retrieve artifacts", move || {
                self.source.retrieve_artifacts(all_refs, inputs_dir)
            })
            .await?;
        log_elapsed("artifact retrieval", started);

        let index = build_index(&retrieved)?;
        std::fs::write(inputs.join(INDEX_FILE), serde_json::to_vec(&index)?)?;
        debug!(entries = index.len(), "Index written");

        let auxiliary = auxiliary_files(&source_dir, &inputs)?;
        if paths.archive.exists() {
            info!(archive = %paths.archive.display(), "Zip exists, not copying others");
            return Ok(ExposureOutcome::AlreadyInstalled { checkpoint: 3 });
        }
        debug!(files = ?auxiliary, "Also copying");
        for file in &auxiliary {
            if let Some(name) = file.file_name() {
                std::fs::copy(file, inputs.join(name))?;
            }
        }

        let started = Instant::now();
        let zip_path = scratch.path().join(format!("{obs_id}.zip"));
        let members = archive::write_archive(&inputs, &zip_path)?;
        log_elapsed("zip creation", started);

        // Hash right after writing, before the copy to its final home.
        let hashes = match self.registrar {
            Some(_) => Some(ContentHashes::compute(&zip_path)?),
            None => None,
        };

        if let Some(outcome) = install_archive(&zip_path, &paths.archive, self.dry_run)? {
            return Ok(outcome);
        }

        debug!("Exporting dimensions");
        let records = self
            .policy
            .run("export dimension records", move || {
                self.source.export_dimension_records(exposure)
            })
            .await?;
        let dimensions_file = scratch.path().join(DIMENSIONS_FILE);
        std::fs::write(&dimensions_file, dimensions_yaml(obs_id, &records)?)?;
        info!(path = %paths.dimensions.display(), records = records.len(), "Saving exported dimensions");
        if !self.dry_run
            && archive::install_if_absent(&dimensions_file, &paths.dimensions)?
                == InstallOutcome::AlreadyPresent
        {
            debug!(path = %paths.dimensions.display(), "Dimensions file already present");
        }
        let dimension_hashes = match self.registrar {
            Some(_) => Some(ContentHashes::compute(&dimensions_file)?),
            None => None,
        };
        drop(scratch);

        info!("Transferring dimension records to destination repository");
        if !self.dry_run {
            let refs = refs.as_slice();
            self.policy
                .run("transfer dimension records", move || {
                    self.dest.transfer_dimension_records_from(self.source, refs)
                })
                .await?;
        }

        info!(archive = %paths.archive.display(), "Ingesting zip");
        if !self.dry_run {
            let files: Vec<FileDataset> = retrieved
                .iter()
                .filter_map(|artifact| {
                    let member = artifact.path.file_name()?.to_string_lossy().into_owned();
                    Some(FileDataset {
                        location: ArtifactLocation::zip_member(&paths.archive, member),
                        refs: vec![artifact.dataset.clone()],
                    })
                })
                .collect();
            let started = Instant::now();
            let files = files.as_slice();
            self.policy
                .run("ingest zip", move || self.dest.ingest(files, IngestMode::Direct))
                .await?;
            log_elapsed("ingesting zip", started);
        }

        if let (Some(registrar), Some(hashes), Some(dimension_hashes)) =
            (self.registrar, hashes, dimension_hashes)
        {
            info!("Registering zip in replica catalog");
            let started = Instant::now();
            registrar
                .register(&paths.logical_name(&paths.archive), &hashes, &tracts)
                .await?;
            info!("Registering dimensions in replica catalog");
            registrar
                .register(
                    &paths.logical_name(&paths.dimensions),
                    &dimension_hashes,
                    &tracts,
                )
                .await?;
            log_elapsed("registering in replica catalog", started);
        }

        Ok(ExposureOutcome::Packaged {
            members: members.len(),
        })
    }

    async fn exposure_refs(
        &self,
        selection: &RawSelection<'_>,
        exposure: i64,
    ) -> Result<Vec<DatasetRef>> {
        let mut refs = Vec::new();
        for dataset_type in selection.dataset_types {
            let query = DatasetQuery {
                dataset_type: dataset_type.clone(),
                collections: selection.collections.to_vec(),
                constraint: DatasetConstraint::Exposure(exposure),
                filter: None,
            };
            let query = &query;
            let found = self
                .policy
                .run("query exposure datasets", move || {
                    self.source.query_datasets(query)
                })
                .await?;
            refs.extend(found);
        }
        Ok(refs)
    }
}

/// Install a finished archive unless another invocation got there first.
fn install_archive(zip: &Path, archive: &Path, dry_run: bool) -> Result<Option<ExposureOutcome>> {
    if archive.exists() {
        info!(archive = %archive.display(), "Zip exists, not installing");
        return Ok(Some(ExposureOutcome::AlreadyInstalled { checkpoint: 4 }));
    }
    info!(archive = %archive.display(), "Installing zip");
    if dry_run {
        return Ok(None);
    }
    let started = Instant::now();
    let outcome = archive::install_new(zip, archive)?;
    log_elapsed("installing zip", started);
    if outcome == InstallOutcome::AlreadyPresent {
        info!(archive = %archive.display(), "Zip appeared during install, stopping");
        return Ok(Some(ExposureOutcome::AlreadyInstalled { checkpoint: 5 }));
    }
    Ok(None)
}

/// Files under `source_dir` whose names are not already in `inputs`.
fn auxiliary_files(source_dir: &Path, inputs: &Path) -> Result<Vec<PathBuf>> {
    let mut seen: HashSet<String> = archive::list_files(inputs)?.into_iter().collect();
    let mut files = Vec::new();
    for entry in WalkDir::new(source_dir).sort_by_file_name() {
        let entry = entry.map_err(|e| EmbargoError::Io(e.into()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if seen.insert(name) {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}
