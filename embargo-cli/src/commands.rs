//! CLI subcommand handlers.

use crate::{Commands, TransferArgs};
use chrono::Utc;
use embargo_core::engine::catalog_target;
use embargo_core::inventory::{self, ListOptions};
use embargo_core::timespan::{parse_window, resolve_now};
use embargo_core::{
    DataQuery, EmbargoError, EmbargoTransfer, EngineSettings, LocalCatalog, LocalRepository,
    ReplicaRegistrar, RunOptions, TransferContext,
};
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::sync::Arc;
use tracing::{Instrument, info, info_span};

/// File name of the replica catalog when `--catalog` is not given.
const DEFAULT_CATALOG_FILE: &str = "replica-catalog.json";

/// Handle a CLI subcommand.
pub async fn handle_command(command: Commands, settings: EngineSettings) -> anyhow::Result<()> {
    match command {
        Commands::Transfer(args) => handle_transfer(args, settings).await,
        Commands::FromList {
            from_repo,
            to_repo,
            infile,
            batch,
            restart,
        } => {
            let source = LocalRepository::open(&from_repo)?;
            let dest = LocalRepository::open(&to_repo)?;
            let options = list_options(batch, restart, &settings)?;
            let summary =
                inventory::transfer_from_list(&source, &dest, open_input(infile.as_deref())?, options)
                    .await?;
            println!(
                "Transferred {} of {} datasets in {} batches",
                summary.transferred, summary.datasets, summary.batches
            );
            Ok(())
        }
        Commands::Check {
            repo,
            infile,
            exists,
            batch,
            restart,
        } => {
            let repo = LocalRepository::open(&repo)?;
            let options = list_options(batch, restart, &settings)?;
            let mut out = std::io::stdout().lock();
            inventory::check_refs(&repo, open_input(infile.as_deref())?, &mut out, exists, options)
                .await?;
            out.flush()?;
            Ok(())
        }
        Commands::Generate {
            repo,
            collection,
            restart,
            exclude,
        } => {
            let repo = LocalRepository::open(&repo)?;
            let mut out = std::io::stdout().lock();
            inventory::generate_refs(
                &repo,
                &collection,
                &exclude,
                restart.as_deref(),
                settings.repository_policy(),
                &mut out,
            )
            .await?;
            out.flush()?;
            Ok(())
        }
        Commands::Init { repo } => {
            LocalRepository::create(&repo)?;
            println!("Created repository at: {}", repo.display());
            Ok(())
        }
    }
}

async fn handle_transfer(args: TransferArgs, settings: EngineSettings) -> anyhow::Result<()> {
    // Everything a user can get wrong is checked before either repository is touched.
    let now = resolve_now(args.now.as_deref(), Utc::now())?;
    let window = args.window.as_deref().map(parse_window).transpose()?;

    let queries = match (&args.config_file, &args.data_queries) {
        (Some(path), None) => DataQuery::from_yaml_file(path)?,
        (None, Some(inline)) => DataQuery::from_yaml(inline)?,
        _ => {
            return Err(EmbargoError::validation(
                "exactly one of --config-file and --data-queries is required",
            )
            .into());
        }
    };
    let queries = queries
        .iter()
        .map(|q| q.resolve(&args.instrument, args.embargo_hours))
        .collect::<Result<Vec<_>, _>>()?;

    let target = catalog_target(
        args.rse.or_else(|| settings.rse.clone()),
        args.scope.or_else(|| settings.scope.clone()),
    )?;

    let source = LocalRepository::open(&args.from_repo)?;
    let dest = LocalRepository::open(&args.to_repo)?;

    let registrar = target.map(|(rse, scope)| {
        let path = args
            .catalog
            .clone()
            .unwrap_or_else(|| args.to_repo.join(DEFAULT_CATALOG_FILE));
        info!(rse = %rse, scope = %scope, catalog = %path.display(), "Registering replicas");
        ReplicaRegistrar::new(Arc::new(LocalCatalog::new(path)), rse, scope)
            .with_dry_run(args.dry_run)
            .with_retry_policy(settings.catalog_policy())
    });

    let options = RunOptions {
        now,
        window,
        dry_run: args.dry_run,
        dest_uri_prefix: args.dest_uri_prefix.clone(),
        move_datasets: args.move_datasets,
    };
    let ctx = TransferContext {
        source: Arc::new(source),
        dest: Arc::new(dest),
        settings,
        registrar,
    };
    let mut engine = EmbargoTransfer::new(ctx, options)?;
    engine.validate(&queries)?;

    let span = info_span!(
        "run",
        now = %now.to_rfc3339(),
        window = ?window.map(|w| w.to_string())
    );
    let summary = engine.run(&queries).instrument(span).await?;
    println!(
        "{} datasets selected, {} transferred in {} batches; {} exposures packaged, {} skipped",
        summary.datasets_selected,
        summary.datasets_transferred,
        summary.batches,
        summary.exposures_packaged,
        summary.exposures_skipped
    );
    Ok(())
}

fn list_options(
    batch: usize,
    restart: Option<usize>,
    settings: &EngineSettings,
) -> anyhow::Result<ListOptions> {
    if batch == 0 {
        return Err(EmbargoError::validation("--batch must be positive").into());
    }
    Ok(ListOptions {
        restart,
        policy: settings.repository_policy(),
        ..ListOptions::new(batch)
    })
}

fn open_input(infile: Option<&Path>) -> anyhow::Result<Box<dyn BufRead>> {
    Ok(match infile {
        Some(path) => Box::new(BufReader::new(File::open(path)?)),
        None => Box::new(std::io::stdin().lock()),
    })
}
