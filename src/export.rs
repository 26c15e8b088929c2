//! CSV and JSON serialization of output records.
//!
//! CSV columns follow [`OUTPUT_COLUMNS`]; absent contact fields are written
//! as the configured empty-field placeholder. [`write_files`] writes one file
//! per tracked bucket, named `<source>-<bucket-slug>.<ext>`.

use anyhow::{Context, Result};
use permit_leads_core::models::{Bucket, OutputRecord, OUTPUT_COLUMNS};
use std::path::{Path, PathBuf};

use crate::store::ResultSet;

#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ExportFormat {
    Csv,
    Json,
}

impl ExportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Csv => "csv",
            ExportFormat::Json => "json",
        }
    }

    /// Parse a file extension, case-insensitively.
    pub fn from_extension(ext: &str) -> Option<Self> {
        if ext.eq_ignore_ascii_case("csv") {
            Some(ExportFormat::Csv)
        } else if ext.eq_ignore_ascii_case("json") {
            Some(ExportFormat::Json)
        } else {
            None
        }
    }
}

/// Serialize records to CSV text with a header row.
pub fn to_csv(records: &[OutputRecord], empty_field: &str) -> Result<String> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(OUTPUT_COLUMNS)?;
    for record in records {
        writer.write_record(record.values().map(|v| v.unwrap_or(empty_field)))?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|e| anyhow::anyhow!("failed to flush CSV writer: {}", e.error()))?;
    String::from_utf8(bytes).context("CSV output is not valid UTF-8")
}

pub fn to_json(records: &[OutputRecord]) -> Result<String> {
    Ok(serde_json::to_string_pretty(records)?)
}

/// File name for one bucket of a source, e.g. `dob-with-contacts.csv`.
pub fn file_name(source: &str, bucket: Bucket, format: ExportFormat) -> String {
    format!(
        "{}-{}.{}",
        source.to_lowercase(),
        bucket.slug(),
        format.extension()
    )
}

/// Write every tracked bucket of `result` into `dir`.
pub fn write_files(
    result: &ResultSet,
    dir: &Path,
    format: ExportFormat,
    empty_field: &str,
) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create output directory: {}", dir.display()))?;

    let mut written = Vec::new();
    for bucket in result.buckets.tracked() {
        let records = result.records(bucket).unwrap_or_default();
        let body = match format {
            ExportFormat::Csv => match result.csv(bucket) {
                Some(text) => text.to_string(),
                None => to_csv(records, empty_field)?,
            },
            ExportFormat::Json => to_json(records)?,
        };
        let path = dir.join(file_name(&result.source, bucket, format));
        std::fs::write(&path, body)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        written.push(path);
    }
    Ok(written)
}
