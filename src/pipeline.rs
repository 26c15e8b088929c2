//! The per-source refresh pipeline.
//!
//! [`run_source`] takes one source from raw API rows to a finished
//! [`ResultSet`]:
//!
//! ```text
//! fetch records ─▶ normalize ─▶ unique keys ─▶ permit filter ─▶ fetch permits
//!                                                                    │
//!         ResultSet ◀── CSV ◀── classify ◀── index ◀── dedupe ◀──────┘
//! ```
//!
//! A records-fetch failure aborts the run. A permits-fetch failure is logged
//! and the run continues with no permits, so every record lands in
//! `withoutContacts`.

use std::collections::BTreeMap;
use std::time::Instant;

use chrono::{NaiveDate, Utc};
use permit_leads_core::classify::{classify, ClassifyOptions};
use permit_leads_core::matcher::{
    build_permit_filter, dedupe_permits, unique_keys, PermitIndex,
};
use permit_leads_core::models::{CleanRecord, Permit};
use permit_leads_core::normalize::normalize;
use uuid::Uuid;

use crate::client::{FetchError, FetchRequest, RecordFetcher};
use crate::config::{Config, PermitsConfig, SourceConfig};
use crate::export::{file_name, to_csv, ExportFormat};
use crate::progress::{format_number, percent, ProgressLog};
use crate::store::ResultSet;

/// Settings shared by every source's run.
#[derive(Debug, Clone, Default)]
pub struct PipelineSettings {
    pub permits: PermitsConfig,
    pub empty_field: String,
    pub track_all: bool,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            permits: config.permits.clone(),
            empty_field: config.output.empty_field.clone(),
            track_all: config.output.track_all,
        }
    }
}

/// Per-run overrides of a source's window and row ceiling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Deserialize)]
pub struct RefreshOptions {
    pub days: Option<u32>,
    pub limit: Option<u32>,
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("records fetch failed: {0}")]
    Records(#[from] FetchError),
    #[error("CSV serialization failed: {0}")]
    Serialize(String),
}

/// Run the whole pipeline for one source.
pub async fn run_source(
    source: &SourceConfig,
    fetcher: &dyn RecordFetcher,
    log: &ProgressLog,
    settings: &PipelineSettings,
    options: RefreshOptions,
    today: NaiveDate,
) -> Result<ResultSet, PipelineError> {
    let started = Instant::now();
    let rules = source.rules.as_ref();
    let descriptor = &rules.descriptor;
    let label = descriptor.label();
    let days = options.days.unwrap_or(source.days);
    let limit = options.limit.unwrap_or(source.limit);

    if days > 0 {
        log.info(&label, format!("Requesting {} days of {} records...", days, label));
    } else {
        log.info(&label, format!("Requesting {} records...", label));
    }

    let request = FetchRequest {
        endpoint: descriptor.endpoint.clone(),
        filter: descriptor.filter.clone(),
        date_field: Some(descriptor.date_field.clone()),
        days,
        order_by: descriptor.order_by().to_string(),
        limit,
    };
    let raw = match fetcher.fetch(&request, today).await {
        Ok(raw) => raw,
        Err(e) => {
            log.error(&label, format!("RECORDS ERROR: {}", e));
            return Err(e.into());
        }
    };
    log.info(
        &label,
        format!("Got {} records", format_number(raw.len() as u64)),
    );

    let normalized = normalize(&raw, rules, today);
    if normalized.dropped_undated > 0 {
        log.info(
            &label,
            format!(
                "Dropped {} undated or future-dated records",
                format_number(normalized.dropped_undated as u64)
            ),
        );
    }
    if !descriptor.site_fields.is_empty() {
        log.info(
            &label,
            format!(
                "Folded {} records at the same site",
                format_number(normalized.folded as u64)
            ),
        );
    }
    let records = normalized.records;

    let permits = if descriptor.uses_permits() {
        let permits = fetch_permits(&records, source, fetcher, log, settings, today).await;
        log.info(
            &label,
            format!(
                "Applying {} permits to {} records...",
                format_number(permits.len() as u64),
                format_number(records.len() as u64)
            ),
        );
        permits
    } else {
        PermitIndex::default()
    };

    let classified = classify(
        &records,
        &permits,
        ClassifyOptions {
            track_all: settings.track_all,
        },
    );
    let report = classified.report;
    if report.duplicates_removed > 0 {
        log.info(
            &label,
            format!(
                "Removed {} duplicate rows",
                format_number(report.duplicates_removed as u64)
            ),
        );
    }
    log.info(
        &label,
        format!(
            "Combined {} notes based on same date and address...",
            format_number(report.coalesced as u64)
        ),
    );

    let buckets = classified.buckets;
    let total = buckets.total();
    let mut csv = BTreeMap::new();
    for bucket in buckets.tracked() {
        let rows = buckets.get(bucket).unwrap_or_default();
        log.info(
            &label,
            format!(
                "Pushing {} leads ({}%) to {}...",
                format_number(rows.len() as u64),
                percent(rows.len(), total),
                file_name(rules.name(), bucket, ExportFormat::Csv)
            ),
        );
        let text = to_csv(rows, &settings.empty_field).map_err(|e| {
            log.error(&label, format!("CSV ERROR: {:#}", e));
            PipelineError::Serialize(format!("{:#}", e))
        })?;
        csv.insert(bucket, text);
    }

    log.info(
        &label,
        format!(
            "Response cache holds {} entries",
            format_number(fetcher.cached_responses() as u64)
        ),
    );
    log.info(
        &label,
        format!("Done in {:.1}s", started.elapsed().as_secs_f64()),
    );

    Ok(ResultSet {
        source: rules.name().to_string(),
        run_id: Uuid::new_v4(),
        refreshed_at: Utc::now(),
        buckets,
        csv,
        report,
    })
}

async fn fetch_permits(
    records: &[CleanRecord],
    source: &SourceConfig,
    fetcher: &dyn RecordFetcher,
    log: &ProgressLog,
    settings: &PipelineSettings,
    today: NaiveDate,
) -> PermitIndex {
    let descriptor = source.descriptor();
    let label = descriptor.label();
    let spec = &descriptor.join_key;

    let keys = unique_keys(records);
    log.info(
        &label,
        format!(
            "Found {} unique {} keys",
            format_number(keys.len() as u64),
            spec.describe()
        ),
    );
    if keys.is_empty() {
        return PermitIndex::default();
    }

    let filter = build_permit_filter(&keys, settings.permits.max_filter_len);
    if filter.truncated() {
        log.warn(
            &label,
            format!(
                "Permit filter truncated: requesting {} of {} keys ({} character limit)",
                format_number(filter.included as u64),
                format_number(keys.len() as u64),
                format_number(settings.permits.max_filter_len as u64)
            ),
        );
    }
    if filter.is_empty() {
        return PermitIndex::default();
    }

    log.info(&label, "Requesting permits...");
    let request = FetchRequest {
        endpoint: settings.permits.endpoint.clone(),
        filter: Some(filter.expression),
        date_field: None,
        days: 0,
        order_by: settings.permits.order_by.clone(),
        limit: settings.permits.limit,
    };
    let raw = match fetcher.fetch(&request, today).await {
        Ok(raw) => raw,
        Err(e) => {
            log.error(&label, format!("PERMITS ERROR: {}", e));
            Vec::new()
        }
    };

    let permits: Vec<Permit> = raw.iter().filter_map(Permit::from_raw).collect();
    let fetched = permits.len();
    let unique = dedupe_permits(permits, spec, settings.permits.dedupe);
    log.info(
        &label,
        format!(
            "Filtering {} permits down to {} uniques...",
            format_number(fetched as u64),
            format_number(unique.len() as u64)
        ),
    );

    PermitIndex::new(unique, spec)
}
