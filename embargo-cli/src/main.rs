//! transfer-embargo: move datasets out of an embargoed repository once their
//! embargo period has elapsed.

mod commands;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Transfer datasets whose embargo period has elapsed
#[derive(Parser, Debug)]
#[command(name = "transfer-embargo", version, about, long_about = None)]
pub(crate) struct Cli {
    /// Engine settings file (TOML): batch sizes, retry policy, default rse/scope
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Log level, either a single level (INFO) or target=LEVEL pairs separated by commas
    #[arg(long, global = true, default_value = "INFO")]
    log_level: String,

    /// Also write JSON logs to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
pub(crate) enum Commands {
    /// Transfer everything the data queries select from one repository to another
    Transfer(TransferArgs),
    /// Transfer the dataset refs listed in a file (or stdin), one JSON ref per line
    FromList {
        from_repo: PathBuf,
        to_repo: PathBuf,
        /// List file; stdin when omitted
        infile: Option<PathBuf>,
        /// Refs per transfer call
        #[arg(long, default_value_t = 1000)]
        batch: usize,
        /// Batch number to resume from
        #[arg(long)]
        restart: Option<usize>,
    },
    /// Print `True`/`False` for each listed ref depending on whether REPO knows it
    Check {
        repo: PathBuf,
        /// List file; stdin when omitted
        infile: Option<PathBuf>,
        /// Check artifact existence instead of registry knowledge
        #[arg(long)]
        exists: bool,
        #[arg(long, default_value_t = 1000)]
        batch: usize,
        #[arg(long)]
        restart: Option<usize>,
    },
    /// Print every dataset ref in a collection as JSON lines
    Generate {
        repo: PathBuf,
        collection: String,
        /// Dataset type name to resume from
        #[arg(long)]
        restart: Option<String>,
        /// Dataset types to leave out
        #[arg(
            long,
            value_delimiter = ',',
            default_values_t = embargo_core::inventory::DEFAULT_EXCLUDED_TYPES.map(String::from).to_vec()
        )]
        exclude: Vec<String>,
    },
    /// Create an empty local repository
    Init { repo: PathBuf },
}

#[derive(clap::Args, Debug)]
pub(crate) struct TransferArgs {
    /// Source (embargo) repository
    pub from_repo: PathBuf,
    /// Destination repository
    pub to_repo: PathBuf,
    /// Instrument name, e.g. LATISS
    pub instrument: String,

    /// Embargo period in hours for queries that do not set their own
    #[arg(long)]
    pub embargo_hours: Option<f64>,

    /// Only transfer data that left embargo within this window, e.g. "3hr 5min"
    #[arg(long)]
    pub window: Option<String>,

    /// Reference instant (ISO-8601, UTC); defaults to the current time
    #[arg(long)]
    pub now: Option<String>,

    /// Log what would be done without changing anything
    #[arg(long)]
    pub dry_run: bool,

    /// YAML file holding the list of data queries
    #[arg(long, conflicts_with = "data_queries", required_unless_present = "data_queries")]
    pub config_file: Option<PathBuf>,

    /// Inline YAML list of data queries
    #[arg(long)]
    pub data_queries: Option<String>,

    /// Directory raw exposure archives are installed under
    #[arg(long)]
    pub dest_uri_prefix: Option<PathBuf>,

    /// Storage element to register replicas at
    #[arg(long)]
    pub rse: Option<String>,

    /// Replica catalog scope
    #[arg(long)]
    pub scope: Option<String>,

    /// Replica catalog file; defaults to replica-catalog.json in TO_REPO
    #[arg(long)]
    pub catalog: Option<PathBuf>,

    /// Remove transferred datasets from the source (not supported)
    #[arg(long = "move")]
    pub move_datasets: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let stderr_filter = EnvFilter::try_new(&cli.log_level)
        .map_err(|e| anyhow::anyhow!("invalid --log-level '{}': {}", cli.log_level, e))?;
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(stderr_filter);

    // Optional JSON file layer; the guard flushes on drop.
    let mut _guard = None;
    let json_layer = match &cli.log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| std::path::Path::new("."));
            let file_name = path
                .file_name()
                .ok_or_else(|| anyhow::anyhow!("--log-file has no file name"))?;
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::never(dir, file_name);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            _guard = Some(guard);
            Some(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(non_blocking)
                    .with_filter(EnvFilter::try_new(&cli.log_level)?),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let settings = embargo_core::load_settings(cli.settings.as_deref())
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;

    commands::handle_command(cli.command, settings).await
}
