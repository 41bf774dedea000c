//! The embargo transfer engine.
//!
//! For each data query the engine resolves the embargo window, finds the
//! matching dataset types, classifies each by its temporal anchor, selects
//! eligible datasets in batches and transfers them. Raw queries are instead
//! packaged exposure by exposure.

use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::batch::batched;
use crate::classify::{Classifier, TemporalAnchor};
use crate::config::{EngineSettings, ResolvedQuery};
use crate::error::{EmbargoError, RepositoryError, Result};
use crate::raw::{ExposureOutcome, RawPackager, RawSelection};
use crate::registrar::ReplicaRegistrar;
use crate::repository::{
    DatasetConstraint, DatasetQuery, DimensionQuery, Repository, TransferOptions,
};
use crate::retry::RetryPolicy;
use crate::timespan::EmbargoWindow;
use crate::types::{DatasetRef, DatasetType};

/// Everything a run talks to.
pub struct TransferContext {
    pub source: Arc<dyn Repository>,
    pub dest: Arc<dyn Repository>,
    pub settings: EngineSettings,
    pub registrar: Option<ReplicaRegistrar>,
}

/// Per-invocation options.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub now: DateTime<Utc>,
    pub window: Option<chrono::Duration>,
    pub dry_run: bool,
    pub dest_uri_prefix: Option<PathBuf>,
    /// Deleting from the source is not supported; setting this is an error.
    pub move_datasets: bool,
}

impl RunOptions {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now,
            window: None,
            dry_run: false,
            dest_uri_prefix: None,
            move_datasets: false,
        }
    }
}

/// Counters reported at the end of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub queries: usize,
    pub dataset_types: usize,
    pub batches: usize,
    pub datasets_selected: usize,
    pub datasets_transferred: usize,
    pub exposures_packaged: usize,
    pub exposures_skipped: usize,
}

/// Check that `rse` and `scope` are given together.
pub fn catalog_target(
    rse: Option<String>,
    scope: Option<String>,
) -> Result<Option<(String, String)>> {
    match (rse, scope) {
        (Some(rse), Some(scope)) => Ok(Some((rse, scope))),
        (None, None) => Ok(None),
        (Some(_), None) => Err(EmbargoError::validation("--rse requires --scope")),
        (None, Some(_)) => Err(EmbargoError::validation("--scope requires --rse")),
    }
}

pub struct EmbargoTransfer {
    ctx: TransferContext,
    options: RunOptions,
    classifier: Classifier,
    policy: RetryPolicy<RepositoryError>,
}

impl EmbargoTransfer {
    pub fn new(ctx: TransferContext, options: RunOptions) -> Result<Self> {
        if options.move_datasets {
            return Err(EmbargoError::validation(
                "--move is not supported; datasets are only ever copied",
            ));
        }
        if options.now > Utc::now() {
            return Err(EmbargoError::validation(format!(
                "--now is in the future: {}",
                options.now.to_rfc3339()
            )));
        }
        if let Some(window) = options.window
            && window < chrono::Duration::zero()
        {
            return Err(EmbargoError::validation("--window must not be negative"));
        }
        ctx.settings.validate()?;
        let policy = ctx.settings.repository_policy();
        Ok(Self {
            ctx,
            options,
            classifier: Classifier::new(),
            policy,
        })
    }

    /// Replace the repository retry policy (tests use zero delays).
    pub fn with_retry_policy(mut self, policy: RetryPolicy<RepositoryError>) -> Self {
        self.policy = policy;
        self
    }

    pub fn context(&self) -> &TransferContext {
        &self.ctx
    }

    /// Reject query lists that cannot run with these options.
    pub fn validate(&self, queries: &[ResolvedQuery]) -> Result<()> {
        if self.options.dest_uri_prefix.is_none() && queries.iter().any(|q| q.is_raw) {
            return Err(EmbargoError::validation(
                "raw queries need --dest-uri-prefix",
            ));
        }
        Ok(())
    }

    /// Process every query in order. A query that fails aborts the run;
    /// batches committed before the failure stay committed.
    pub async fn run(&mut self, queries: &[ResolvedQuery]) -> Result<RunSummary> {
        self.validate(queries)?;
        if self.options.dry_run {
            warn!("Dry run; no transfers will occur");
        }
        let mut summary = RunSummary::default();
        for (i, query) in queries.iter().enumerate() {
            let span = info_span!(
                "query",
                index = i + 1,
                types = ?query.dataset_types,
                raw = query.is_raw
            );
            self.run_query(query, &mut summary).instrument(span).await?;
            summary.queries += 1;
        }
        info!(
            queries = summary.queries,
            dataset_types = summary.dataset_types,
            selected = summary.datasets_selected,
            transferred = summary.datasets_transferred,
            packaged = summary.exposures_packaged,
            skipped = summary.exposures_skipped,
            "Run complete"
        );
        Ok(summary)
    }

    async fn run_query(&mut self, query: &ResolvedQuery, summary: &mut RunSummary) -> Result<()> {
        let window = EmbargoWindow::resolve(self.options.now, query.embargo_hours, self.options.window)?;
        info!(window = %window, collections = ?query.collections, filter = %query.where_clause, "Processing query");

        let dataset_types = self.resolve_dataset_types(query).await?;
        info!(
            dataset_types = ?dataset_types.iter().map(|t| t.name.as_str()).collect::<Vec<_>>(),
            "Dataset types"
        );
        summary.dataset_types += dataset_types.len();
        if dataset_types.is_empty() {
            warn!("No dataset types match the query");
            return Ok(());
        }

        if query.is_raw {
            return self.transfer_raw(query, &dataset_types, window, summary).await;
        }

        for dataset_type in &dataset_types {
            let anchor = self.classifier.classify(dataset_type);
            info!(dataset_type = %dataset_type.name, anchor = %anchor, "Handling dataset type");
            match anchor.dimension() {
                Some(element) => {
                    self.transfer_dimension_bound(query, dataset_type, element, window, summary)
                        .await?
                }
                None => {
                    self.transfer_timestamp_bound(query, dataset_type, window, summary)
                        .await?
                }
            }
        }
        Ok(())
    }

    /// Types matching the query patterns with datasets in its collections,
    /// minus any present in the avoid collections.
    pub async fn resolve_dataset_types(&self, query: &ResolvedQuery) -> Result<Vec<DatasetType>> {
        let source = self.ctx.source.as_ref();
        let patterns = query.dataset_types.as_slice();
        let collections = query.collections.as_slice();
        let mut types = self
            .policy
            .run("query dataset types", move || {
                source.query_dataset_types(patterns, collections)
            })
            .await?;

        if !query.avoid_collections.is_empty() {
            let everything = ["*".to_string()];
            let everything = everything.as_slice();
            let avoid = query.avoid_collections.as_slice();
            let avoided: BTreeSet<String> = self
                .policy
                .run("query avoided dataset types", move || {
                    source.query_dataset_types(everything, avoid)
                })
                .await?
                .into_iter()
                .map(|t| t.name)
                .collect();
            if !avoided.is_empty() {
                debug!(avoided = ?avoided, "Excluding dataset types");
            }
            types.retain(|t| !avoided.contains(&t.name));
        }
        Ok(types)
    }

    async fn transfer_dimension_bound(
        &self,
        query: &ResolvedQuery,
        dataset_type: &DatasetType,
        element: &str,
        window: EmbargoWindow,
        summary: &mut RunSummary,
    ) -> Result<()> {
        let dimension_query = DimensionQuery {
            element: element.to_string(),
            instrument: query.instrument.clone(),
            window,
            filter: query.filter.clone(),
        };
        info!(element, window = %window, "Querying dimension records");
        let source = self.ctx.source.as_ref();
        let dq = &dimension_query;
        let ids: Vec<i64> = self
            .policy
            .run("query dimension records", move || {
                source.query_dimension_records(dq)
            })
            .await?
            .into_iter()
            .map(|r| r.id)
            .collect();
        if ids.is_empty() {
            warn!(element, "No matching records");
            return Ok(());
        }
        info!(count = ids.len(), element, "Got dimension values");

        for id_batch in batched(&ids, self.ctx.settings.dimension_batch_size) {
            let dataset_query = DatasetQuery {
                dataset_type: dataset_type.name.clone(),
                collections: query.collections.clone(),
                constraint: DatasetConstraint::DimensionIn {
                    dimension: element.to_string(),
                    ids: id_batch.to_vec(),
                },
                filter: query.filter.clone(),
            };
            let refs = self.query_datasets(&dataset_query).await?;
            self.transfer_refs(&refs, summary).await?;
        }
        Ok(())
    }

    async fn transfer_timestamp_bound(
        &self,
        query: &ResolvedQuery,
        dataset_type: &DatasetType,
        window: EmbargoWindow,
        summary: &mut RunSummary,
    ) -> Result<()> {
        let dataset_query = DatasetQuery {
            dataset_type: dataset_type.name.clone(),
            collections: query.collections.clone(),
            constraint: DatasetConstraint::IngestedWithin(window),
            filter: query.filter.clone(),
        };
        let refs = self.query_datasets(&dataset_query).await?;
        self.transfer_refs(&refs, summary).await
    }

    async fn query_datasets(&self, query: &DatasetQuery) -> Result<Vec<DatasetRef>> {
        debug!(dataset_type = %query.dataset_type, constraint = ?query.constraint, "Querying datasets");
        let source = self.ctx.source.as_ref();
        let refs = self
            .policy
            .run("query datasets", move || source.query_datasets(query))
            .await?;
        info!(count = refs.len(), "Got datasets");
        Ok(refs)
    }

    /// Transfer refs in batches, retrying each batch on transient failures.
    async fn transfer_refs(&self, refs: &[DatasetRef], summary: &mut RunSummary) -> Result<()> {
        summary.datasets_selected += refs.len();
        for batch in batched(refs, self.ctx.settings.dataset_batch_size) {
            summary.batches += 1;
            let label = format!("Batch {}", summary.batches);
            debug!(batch = %label, datasets = batch.len(), "transfer_from");
            if self.options.dry_run {
                continue;
            }
            let source = self.ctx.source.as_ref();
            let dest = self.ctx.dest.as_ref();
            let transferred = self
                .policy
                .run(&label, move || {
                    dest.transfer_from(source, batch, TransferOptions::embargo())
                })
                .await?;
            summary.datasets_transferred += transferred;
        }
        Ok(())
    }

    async fn transfer_raw(
        &self,
        query: &ResolvedQuery,
        dataset_types: &[DatasetType],
        window: EmbargoWindow,
        summary: &mut RunSummary,
    ) -> Result<()> {
        let prefix = self
            .options
            .dest_uri_prefix
            .as_deref()
            .ok_or_else(|| EmbargoError::validation("raw queries need --dest-uri-prefix"))?;
        let exposure_query = DimensionQuery {
            element: "exposure".into(),
            instrument: query.instrument.clone(),
            window,
            filter: query.filter.clone(),
        };
        let source = self.ctx.source.as_ref();
        let eq = &exposure_query;
        let exposures = self
            .policy
            .run("query exposures", move || source.query_dimension_records(eq))
            .await?;
        if exposures.is_empty() {
            warn!("No exposures outside the embargo window");
            return Ok(());
        }
        info!(count = exposures.len(), "Got exposures");

        let names: Vec<String> = dataset_types.iter().map(|t| t.name.clone()).collect();
        let selection = RawSelection {
            instrument: &query.instrument,
            dataset_types: &names,
            collections: &query.collections,
        };
        let packager = RawPackager::new(source, self.ctx.dest.as_ref(), prefix)
            .with_registrar(self.ctx.registrar.as_ref())
            .with_dry_run(self.options.dry_run)
            .with_retry_policy(self.policy);

        for exposure in &exposures {
            let span = info_span!("exposure", id = exposure.id);
            let outcome = packager
                .process_exposure(&selection, exposure)
                .instrument(span)
                .await?;
            match outcome {
                ExposureOutcome::Packaged { .. } => summary.exposures_packaged += 1,
                _ => summary.exposures_skipped += 1,
            }
        }
        Ok(())
    }
}
