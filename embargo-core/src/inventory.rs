//! List-driven tools: dump dataset refs, check them against a repository,
//! and transfer them from a list.
//!
//! Lists hold one JSON dataset ref per line. `check` prefixes each line with
//! `True` or `False`; `transfer_from_list` skips `True` lines and strips the
//! `False` prefix, so a checked list can be fed straight back in.

use std::collections::BTreeSet;
use std::io::{BufRead, Write};
use tracing::{info, warn};

use crate::batch::Batches;
use crate::error::{EmbargoError, RepositoryError, Result};
use crate::repository::{DatasetConstraint, DatasetQuery, Repository, TransferOptions};
use crate::retry::RetryPolicy;
use crate::types::DatasetRef;

/// Dataset types `generate` leaves out by default.
pub const DEFAULT_EXCLUDED_TYPES: [&str; 2] = ["raw", "guider_raw"];

/// Parse one list line; `Ok(None)` for blank and already-transferred lines.
pub fn parse_line(line: &str) -> Result<Option<DatasetRef>> {
    let line = line.trim_end();
    if line.trim().is_empty() || line.starts_with("True ") {
        return Ok(None);
    }
    let json = line.strip_prefix("False ").unwrap_or(line);
    Ok(Some(DatasetRef::from_json(json)?))
}

/// Lazily read dataset refs from a list.
pub fn read_refs<R: BufRead>(reader: R) -> impl Iterator<Item = Result<DatasetRef>> {
    reader
        .lines()
        .map(|line| line.map_err(EmbargoError::from).and_then(|l| parse_line(&l)))
        .filter_map(Result::transpose)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListSummary {
    pub batches: usize,
    pub datasets: usize,
    pub transferred: usize,
}

/// Knobs shared by the list-driven commands.
#[derive(Debug, Clone, Copy)]
pub struct ListOptions {
    pub batch_size: usize,
    /// 1-based batch number to start at; earlier batches are skipped.
    pub restart: Option<usize>,
    pub policy: RetryPolicy<RepositoryError>,
}

impl ListOptions {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size,
            restart: None,
            policy: RetryPolicy::repository(),
        }
    }

    fn skips(&self, batch: usize) -> bool {
        self.restart.is_some_and(|r| batch < r)
    }
}

/// Transfer the refs of a list into `dest`. Dataset types and dimension
/// records must already exist there.
pub async fn transfer_from_list<R: BufRead>(
    source: &dyn Repository,
    dest: &dyn Repository,
    reader: R,
    options: ListOptions,
) -> Result<ListSummary> {
    let mut summary = ListSummary::default();
    for (i, batch) in Batches::new(read_refs(reader), options.batch_size).enumerate() {
        let number = i + 1;
        if options.skips(number) {
            continue;
        }
        let refs = batch.into_iter().collect::<Result<Vec<_>>>()?;
        info!(batch = number, datasets = refs.len(), "Processing batch");
        let label = format!("Batch {number}");
        let refs_slice = refs.as_slice();
        let transferred = options
            .policy
            .run(&label, move || {
                dest.transfer_from(source, refs_slice, TransferOptions::from_list())
            })
            .await?;
        summary.batches += 1;
        summary.datasets += refs.len();
        summary.transferred += transferred;
    }
    info!(
        batches = summary.batches,
        datasets = summary.datasets,
        transferred = summary.transferred,
        "List transfer complete"
    );
    Ok(summary)
}

/// Write `<True|False> <ref json>` for each listed ref: whether the registry
/// knows it, or with `exists` whether its artifact is present.
pub async fn check_refs<R: BufRead, W: Write>(
    repo: &dyn Repository,
    reader: R,
    out: &mut W,
    exists: bool,
    options: ListOptions,
) -> Result<ListSummary> {
    let mut summary = ListSummary::default();
    for (i, batch) in Batches::new(read_refs(reader), options.batch_size).enumerate() {
        let number = i + 1;
        if options.skips(number) {
            continue;
        }
        let refs = batch.into_iter().collect::<Result<Vec<_>>>()?;
        info!(batch = number, datasets = refs.len(), "Processing batch");
        let label = format!("Batch {number}");
        let refs_slice = refs.as_slice();
        let flags = if exists {
            options
                .policy
                .run(&label, move || repo.artifacts_exist(refs_slice))
                .await?
        } else {
            options
                .policy
                .run(&label, move || repo.knows(refs_slice))
                .await?
        };
        for (dataset, flag) in refs.iter().zip(flags) {
            let word = if flag { "True" } else { "False" };
            writeln!(out, "{word} {}", dataset.to_json()?)?;
        }
        summary.batches += 1;
        summary.datasets += refs.len();
    }
    Ok(summary)
}

/// Write every dataset ref in `collection` as a JSON line, type by type in
/// name order. Types in `exclude` are skipped, as are types named before
/// `restart`.
pub async fn generate_refs<W: Write>(
    repo: &dyn Repository,
    collection: &str,
    exclude: &[String],
    restart: Option<&str>,
    policy: RetryPolicy<RepositoryError>,
    out: &mut W,
) -> Result<usize> {
    let everything = ["*".to_string()];
    let collections = [collection.to_string()];
    let (patterns, colls) = (everything.as_slice(), collections.as_slice());
    let excluded: BTreeSet<&str> = exclude.iter().map(String::as_str).collect();
    let types: Vec<_> = policy
        .run("query dataset types", move || {
            repo.query_dataset_types(patterns, colls)
        })
        .await?
        .into_iter()
        .filter(|t| !excluded.contains(t.name.as_str()))
        .collect();
    info!(count = types.len(), "Dataset types");
    if types.is_empty() {
        warn!(collection, "No dataset types in collection");
    }

    let total_types = types.len();
    let mut total = 0;
    for (i, dataset_type) in types.iter().enumerate() {
        if restart.is_some_and(|r| dataset_type.name.as_str() < r) {
            continue;
        }
        let query = DatasetQuery {
            dataset_type: dataset_type.name.clone(),
            collections: collections.to_vec(),
            constraint: DatasetConstraint::All,
            filter: None,
        };
        let query = &query;
        let label = format!("{}: {i}/{total_types}", dataset_type.name);
        let refs = policy
            .run(&label, move || repo.query_datasets(query))
            .await?;
        for dataset in &refs {
            writeln!(out, "{}", dataset.to_json()?)?;
        }
        info!(dataset_type = %dataset_type.name, refs = refs.len(), "Dataset type done");
        total += refs.len();
    }
    info!(total, "Total refs");
    Ok(total)
}
