use anyhow::{bail, Result};
use std::path::Path;
use std::sync::Arc;

use crate::config::Config;
use crate::export::{write_files, ExportFormat};
use crate::orchestrator::Orchestrator;
use crate::pipeline::RefreshOptions;
use crate::progress::{format_number, ProgressLog};

/// Run one source (or `all` enabled sources) to completion and report counts.
///
/// With `output_dir`, every tracked bucket is also written to
/// `<source>-<bucket-slug>.<ext>` in that directory.
pub async fn run_refresh(
    config: &Config,
    target: &str,
    options: RefreshOptions,
    output_dir: Option<&Path>,
    format: ExportFormat,
) -> Result<()> {
    let log = Arc::new(ProgressLog::new(
        config.logging.history_limit,
        config.logging.channel_capacity,
    ));
    let orchestrator = Orchestrator::from_config(config, log)?;

    let names: Vec<String> = if target == "all" {
        orchestrator
            .sources()
            .iter()
            .filter(|s| s.enabled)
            .map(|s| s.name().to_string())
            .collect()
    } else {
        vec![orchestrator.source(target)?.name().to_string()]
    };

    let runs = names
        .iter()
        .map(|name| orchestrator.refresh_and_wait(name, options));
    let outcomes = futures::future::join_all(runs).await;

    let mut failed = 0usize;
    for (name, outcome) in names.iter().zip(outcomes) {
        match outcome? {
            Some(result) => {
                let counts = result
                    .counts()
                    .into_iter()
                    .map(|(bucket, n)| format!("{} {}", bucket, format_number(n as u64)))
                    .collect::<Vec<_>>()
                    .join(", ");
                println!("{}: {}", name, counts);

                if let Some(dir) = output_dir {
                    for path in write_files(&result, dir, format, &config.output.empty_field)? {
                        println!("  wrote {}", path.display());
                    }
                }
            }
            None => {
                let reason = orchestrator
                    .status(name)?
                    .last_error
                    .unwrap_or_else(|| "unknown error".to_string());
                eprintln!("{}: refresh failed: {}", name, reason);
                failed += 1;
            }
        }
    }

    if failed > 0 {
        bail!("{} of {} sources failed to refresh", failed, names.len());
    }
    Ok(())
}
