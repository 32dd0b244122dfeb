//! # EvilLens CLI (`evillens`)
//!
//! The `evillens` binary runs the governance backend: database setup, file
//! ingestion, the inbox watcher, link liveness checks, evidence reports and
//! the dashboard HTTP API.
//!
//! ## Usage
//!
//! ```bash
//! evillens --config ./config/evillens.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `evillens init` | Create the SQLite database and run schema migrations |
//! | `evillens ingest <file>` | Run one CSV/JSON export through the pipeline |
//! | `evillens watch` | Watch the inbox directory in the foreground |
//! | `evillens check-links` | Run one liveness pass over stored media URLs |
//! | `evillens report` | Generate the evidence report for unreported videos |
//! | `evillens stats` | Print database statistics |
//! | `evillens serve` | Start the HTTP API with background workers |
//!
//! Log verbosity follows `RUST_LOG` (default `evillens=info,tower_http=info`).

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use evillens::{config, ingest, liveness, migrate, report, server, stats, watcher};

/// EvilLens — ingestion, analysis and detection backend for harmful
/// short-video governance.
#[derive(Parser)]
#[command(
    name = "evillens",
    about = "EvilLens — governance backend for harmful short-video monitoring",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/evillens.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema and the bootstrap account.
    ///
    /// Idempotent: running it multiple times is safe.
    Init,

    /// Ingest one CSV or JSON export.
    ///
    /// Loads and normalizes the file, downloads cover images when enabled,
    /// upserts the videos and recomputes every derived table.
    Ingest {
        /// Path to the export file.
        file: PathBuf,

        /// Attach the ingested videos to this detection task.
        #[arg(long)]
        task_id: Option<String>,

        /// Move the file into `<inbox>/processed/` afterwards.
        #[arg(long)]
        archive: bool,
    },

    /// Watch the inbox directory and ingest new files until Ctrl-C.
    Watch,

    /// Probe every active video's media URL once.
    CheckLinks,

    /// Write the evidence report for videos not reported yet.
    Report,

    /// Show database statistics.
    Stats,

    /// Start the HTTP API, task workers, liveness scheduler and watcher.
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("evillens=info,tower_http=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Ingest {
            file,
            task_id,
            archive,
        } => {
            ingest::run_ingest(&cfg, &file, task_id.as_deref(), archive).await?;
        }
        Commands::Watch => {
            watcher::run_watch(&cfg).await?;
        }
        Commands::CheckLinks => {
            liveness::run_check_links(&cfg).await?;
        }
        Commands::Report => {
            report::run_report(&cfg).await?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
