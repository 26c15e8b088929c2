//! # permit-leads CLI (`leads`)
//!
//! ## Usage
//!
//! ```bash
//! leads --config ./config/leads.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `leads serve` | Start the HTTP server (startup refresh and schedule per config) |
//! | `leads sources` | List configured sources |
//! | `leads refresh <source\|all>` | Run sources to completion and print bucket counts |
//!
//! ## Examples
//!
//! ```bash
//! # Refresh the DOB feed over the last three days
//! leads refresh dob --days 3
//!
//! # Refresh everything and write CSV files
//! leads refresh all --output-dir ./out
//!
//! # Serve feeds on the configured bind address
//! RUST_LOG=permit_leads=debug leads serve
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use permit_leads::config;
use permit_leads::export::ExportFormat;
use permit_leads::pipeline::RefreshOptions;
use permit_leads::{refresh_cmd, server, sources};

/// permit-leads: reconcile municipal open-data feeds against permit ownership filings.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. When the file does not exist, built-in defaults are used.
#[derive(Parser)]
#[command(
    name = "leads",
    about = "Reconcile municipal open-data feeds against permit ownership filings",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/leads.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server.
    ///
    /// Serves `/data/{source}/{bucket}.{csv,json}`, `/refresh`, `/sources`,
    /// and the live progress log at `/logs`.
    Serve,

    /// List configured sources.
    Sources,

    /// Refresh one source, or `all` enabled sources, and wait for completion.
    Refresh {
        /// Source name (e.g. `dob`, `complaints`) or `all`.
        source: String,

        /// Look-back window in days; `0` fetches without a window.
        #[arg(long)]
        days: Option<u32>,

        /// Maximum number of records to request.
        #[arg(long)]
        limit: Option<u32>,

        /// Write each bucket to `<source>-<bucket>.<ext>` in this directory.
        #[arg(long)]
        output_dir: Option<PathBuf>,

        /// File format for `--output-dir`.
        #[arg(long, value_enum, default_value = "csv")]
        format: ExportFormat,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_or_minimal(&cli.config)?;

    match cli.command {
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Sources => {
            sources::list_sources(&cfg)?;
        }
        Commands::Refresh {
            source,
            days,
            limit,
            output_dir,
            format,
        } => {
            refresh_cmd::run_refresh(
                &cfg,
                &source,
                RefreshOptions { days, limit },
                output_dir.as_deref(),
                format,
            )
            .await?;
        }
    }

    Ok(())
}
