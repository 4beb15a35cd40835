//! regharvest: resumable harvester for search-only public registries

use anyhow::Result;
use clap::{Parser, Subcommand};
use regharvest::commands;
use regharvest::config::{Config, FetchPath};
use regharvest::prefix::PlanMode;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "regharvest")]
#[command(about = "Resumable, rate-governed harvester for search-only public registries")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Data directory (overrides the config file)
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enumerate the search space and collect identifiers
    Discover {
        /// Enumeration mode
        #[arg(short, long, value_enum, default_value = "adaptive")]
        mode: CliPlanMode,

        /// Maximum prefix depth (overrides the config file)
        #[arg(long)]
        depth: Option<usize>,

        /// Re-enumerate all partitions, keeping discovered identifiers
        #[arg(long)]
        no_resume: bool,

        /// Restrict the run to partitions under this prefix
        #[arg(long)]
        prefix: Option<String>,
    },

    /// Fetch detail pages for discovered identifiers and write records
    Extract {
        /// Stop after this many identifiers
        #[arg(short, long)]
        limit: Option<usize>,

        /// Fetch path to use (overrides the config file)
        #[arg(long, value_enum)]
        path: Option<CliFetchPath>,

        /// Quiet mode (no progress bar)
        #[arg(short, long)]
        quiet: bool,
    },

    /// Show harvest progress
    Status,

    /// Delete checkpoint state (output files are kept)
    Reset {
        /// Actually delete; without this the command only explains itself
        #[arg(long)]
        confirm: bool,
    },

    /// Fetch and parse a single identifier as a diagnostic
    Probe {
        /// Registration identifier, e.g. NMW0001943612
        reg_id: String,
    },
}

/// CLI enumeration mode (mirrors PlanMode with clap support)
#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum CliPlanMode {
    /// Depth-1 seeds, subdivided only where results are truncated
    Adaptive,
    /// Every prefix at every depth
    Comprehensive,
    /// Profession x region x prefix cross product
    Faceted,
}

impl From<CliPlanMode> for PlanMode {
    fn from(mode: CliPlanMode) -> Self {
        match mode {
            CliPlanMode::Adaptive => PlanMode::Adaptive,
            CliPlanMode::Comprehensive => PlanMode::Comprehensive,
            CliPlanMode::Faceted => PlanMode::Faceted,
        }
    }
}

/// CLI fetch path (mirrors FetchPath with clap support)
#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum CliFetchPath {
    /// One-shot request per identifier
    Direct,
    /// Warmed session with cookie jar and UA rotation
    Session,
}

impl From<CliFetchPath> for FetchPath {
    fn from(path: CliFetchPath) -> Self {
        match path {
            CliFetchPath::Direct => FetchPath::Direct,
            CliFetchPath::Session => FetchPath::Session,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = if cli.config.exists() {
        Config::load(&cli.config)?
    } else {
        Config::default()
    };
    if let Some(data_dir) = cli.data_dir {
        config.paths.data_dir = data_dir;
    }
    std::fs::create_dir_all(&config.paths.data_dir)?;

    // One Ctrl-C stops after the current item with the checkpoint saved
    let cancel = Arc::new(AtomicBool::new(false));
    let cancel_flag = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received; finishing the current item");
            cancel_flag.store(true, Ordering::Relaxed);
        }
    });

    match cli.command {
        Commands::Discover {
            mode,
            depth,
            no_resume,
            prefix,
        } => {
            commands::discover::run_discovery(config, mode.into(), depth, no_resume, prefix, cancel)
                .await
        }
        Commands::Extract { limit, path, quiet } => {
            commands::extract::run_extraction(config, limit, path.map(Into::into), quiet, cancel)
                .await
        }
        Commands::Status => commands::status::show_status(config).await,
        Commands::Reset { confirm } => commands::reset::reset_progress(config, confirm).await,
        Commands::Probe { reg_id } => commands::probe::probe_identifier(config, reg_id).await,
    }
}
