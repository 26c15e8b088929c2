//! Configuration parsing and source resolution.
//!
//! permit-leads is configured with a single TOML file (default
//! `./config/leads.toml`). Every section is optional; a missing file falls
//! back to [`Config::minimal`], which serves the built-in sources against the
//! public NYC open-data API.
//!
//! # Example
//!
//! ```toml
//! [server]
//! bind = "0.0.0.0:3000"
//! static_dir = "public"
//!
//! [api]
//! app_token = "abc123"
//!
//! [permits]
//! dedupe = "most_recent_filing"
//!
//! [refresh]
//! default_days = 5
//! interval_minutes = 60
//!
//! [sources.complaints]
//! enabled = false
//!
//! [sources.dob]
//! days = 3
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use permit_leads_core::matcher::{DedupePolicy, DEFAULT_MAX_FILTER_LEN};
use permit_leads_core::source::{builtin_descriptors, SourceDescriptor, SourceRules};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub permits: PermitsConfig,
    #[serde(default)]
    pub refresh: RefreshConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Per-source overrides keyed by source name.
    #[serde(default)]
    pub sources: BTreeMap<String, SourceOverride>,
    /// Additional sources declared in full.
    #[serde(default)]
    pub custom_sources: Vec<SourceDescriptor>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Directory served for paths no route claims.
    #[serde(default)]
    pub static_dir: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            static_dir: None,
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:3000".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ApiConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub app_token: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Response cache lifetime; `0` disables caching.
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            app_token: None,
            timeout_secs: default_timeout_secs(),
            cache_ttl_secs: default_cache_ttl_secs(),
        }
    }
}

fn default_base_url() -> String {
    "https://data.cityofnewyork.us/resource".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_cache_ttl_secs() -> u64 {
    3600
}

#[derive(Debug, Deserialize, Clone)]
pub struct PermitsConfig {
    #[serde(default = "default_permits_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_permits_order_by")]
    pub order_by: String,
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default = "default_max_filter_len")]
    pub max_filter_len: usize,
    #[serde(default)]
    pub dedupe: DedupePolicy,
}

impl Default for PermitsConfig {
    fn default() -> Self {
        Self {
            endpoint: default_permits_endpoint(),
            order_by: default_permits_order_by(),
            limit: default_limit(),
            max_filter_len: default_max_filter_len(),
            dedupe: DedupePolicy::default(),
        }
    }
}

fn default_permits_endpoint() -> String {
    "/ipu4-2q9a.json".to_string()
}
fn default_permits_order_by() -> String {
    "filing_date".to_string()
}
fn default_limit() -> u32 {
    50_000
}
fn default_max_filter_len() -> usize {
    DEFAULT_MAX_FILTER_LEN
}

#[derive(Debug, Deserialize, Clone)]
pub struct RefreshConfig {
    /// Look-back window in days; `0` fetches without a window.
    #[serde(default = "default_days")]
    pub default_days: u32,
    #[serde(default = "default_limit")]
    pub default_limit: u32,
    #[serde(default = "default_true")]
    pub on_startup: bool,
    /// Scheduled refresh period; `0` disables the schedule.
    #[serde(default)]
    pub interval_minutes: u64,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            default_days: default_days(),
            default_limit: default_limit(),
            on_startup: true,
            interval_minutes: 0,
        }
    }
}

fn default_days() -> u32 {
    5
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct OutputConfig {
    /// Placeholder written to CSV for absent contact fields.
    #[serde(default)]
    pub empty_field: String,
    /// Also publish the `all` bucket.
    #[serde(default)]
    pub track_all: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            history_limit: default_history_limit(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

fn default_history_limit() -> usize {
    10_000
}
fn default_channel_capacity() -> usize {
    256
}

/// Overrides applied to a built-in or custom source.
#[derive(Debug, Deserialize, Clone)]
pub struct SourceOverride {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub days: Option<u32>,
    #[serde(default)]
    pub limit: Option<u32>,
    /// Replaces the descriptor's record filter.
    #[serde(default)]
    pub filter: Option<String>,
}

/// A source with its overrides applied and rules compiled.
#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub rules: Arc<SourceRules>,
    pub enabled: bool,
    pub days: u32,
    pub limit: u32,
}

impl SourceConfig {
    pub fn name(&self) -> &str {
        self.rules.name()
    }

    pub fn descriptor(&self) -> &SourceDescriptor {
        &self.rules.descriptor
    }
}

impl Config {
    /// All defaults and the built-in sources.
    pub fn minimal() -> Self {
        Self::default()
    }

    /// Built-in descriptors followed by custom ones, with overrides applied.
    ///
    /// Disabled sources are included with `enabled = false`.
    pub fn resolve_sources(&self) -> Result<Vec<SourceConfig>> {
        let mut descriptors = builtin_descriptors();
        let mut seen: HashSet<String> = descriptors.iter().map(|d| d.name.clone()).collect();

        for custom in &self.custom_sources {
            if !seen.insert(custom.name.clone()) {
                bail!("custom source '{}' is declared more than once", custom.name);
            }
            descriptors.push(custom.clone());
        }

        for name in self.sources.keys() {
            if !seen.contains(name) {
                bail!("[sources.{}] does not match any known source", name);
            }
        }

        descriptors
            .into_iter()
            .map(|mut descriptor| {
                let overrides = self.sources.get(&descriptor.name);
                if let Some(filter) = overrides.and_then(|o| o.filter.clone()) {
                    descriptor.filter = Some(filter);
                }
                let rules = SourceRules::compile(descriptor)?;
                Ok(SourceConfig {
                    rules: Arc::new(rules),
                    enabled: overrides.map_or(true, |o| o.enabled),
                    days: overrides
                        .and_then(|o| o.days)
                        .unwrap_or(self.refresh.default_days),
                    limit: overrides
                        .and_then(|o| o.limit)
                        .unwrap_or(self.refresh.default_limit),
                })
            })
            .collect()
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.bind.trim().is_empty() {
            bail!("server.bind must not be empty");
        }
        if self.api.base_url.trim().is_empty() {
            bail!("api.base_url must not be empty");
        }
        if self.permits.endpoint.trim().is_empty() {
            bail!("permits.endpoint must not be empty");
        }
        if self.permits.max_filter_len < 64 {
            bail!("permits.max_filter_len must be >= 64");
        }
        if self.permits.limit < 1 {
            bail!("permits.limit must be >= 1");
        }
        if self.refresh.default_limit < 1 {
            bail!("refresh.default_limit must be >= 1");
        }
        if self.logging.channel_capacity < 1 {
            bail!("logging.channel_capacity must be >= 1");
        }
        for (name, o) in &self.sources {
            if o.limit == Some(0) {
                bail!("sources.{}.limit must be >= 1", name);
            }
        }

        self.resolve_sources()?;
        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    config.validate()?;
    Ok(config)
}

/// Load `path`, or fall back to [`Config::minimal`] when the file does not exist.
pub fn load_or_minimal(path: &Path) -> Result<Config> {
    if path.exists() {
        load_config(path)
    } else {
        tracing::warn!(
            "Config file {} not found; using built-in defaults",
            path.display()
        );
        Ok(Config::minimal())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_text: &str) -> Result<Config> {
        let config: Config = toml::from_str(toml_text)?;
        config.validate()?;
        Ok(config)
    }

    #[test]
    fn empty_file_uses_defaults() {
        let config = parse("").unwrap();
        assert_eq!(config.server.bind, "127.0.0.1:3000");
        assert_eq!(config.permits.limit, 50_000);
        assert_eq!(config.permits.max_filter_len, 32_768);
        assert_eq!(config.permits.dedupe, DedupePolicy::FirstSeen);
        assert_eq!(config.refresh.default_days, 5);
        assert_eq!(config.api.cache_ttl_secs, 3600);

        let sources = config.resolve_sources().unwrap();
        let names: Vec<_> = sources.iter().map(|s| s.name().to_string()).collect();
        assert_eq!(names, vec!["dob", "complaints", "inspections", "doh"]);
        assert!(sources.iter().all(|s| s.enabled && s.days == 5));
    }

    #[test]
    fn overrides_apply() {
        let config = parse(
            r#"
            [permits]
            dedupe = "most_recent_filing"

            [sources.dob]
            days = 3
            limit = 100
            filter = "boro = 'BRONX'"

            [sources.doh]
            enabled = false
            "#,
        )
        .unwrap();
        assert_eq!(config.permits.dedupe, DedupePolicy::MostRecentFiling);

        let sources = config.resolve_sources().unwrap();
        let dob = sources.iter().find(|s| s.name() == "dob").unwrap();
        assert_eq!((dob.days, dob.limit), (3, 100));
        assert_eq!(dob.descriptor().filter.as_deref(), Some("boro = 'BRONX'"));
        let doh = sources.iter().find(|s| s.name() == "doh").unwrap();
        assert!(!doh.enabled);
    }

    #[test]
    fn custom_source_declared_in_toml() {
        let config = parse(
            r#"
            [[custom_sources]]
            name = "heat"
            label = "Heat"
            endpoint = "/abcd-1234.json"
            date_field = "received_date"
            join_key = { kind = "bin", field = "bin" }
            description_field = "problem"
            notes_template = "{address} {description}"
            "#,
        )
        .unwrap();
        let sources = config.resolve_sources().unwrap();
        assert_eq!(sources.len(), 5);
        assert_eq!(sources[4].name(), "heat");
        assert_eq!(sources[4].descriptor().label(), "Heat");
    }

    #[test]
    fn unknown_override_rejected() {
        let err = parse("[sources.nope]\nenabled = false\n").unwrap_err();
        assert!(err.to_string().contains("does not match any known source"));
    }

    #[test]
    fn duplicate_custom_name_rejected() {
        let err = parse(
            r#"
            [[custom_sources]]
            name = "dob"
            endpoint = "/x.json"
            date_field = "d"
            join_key = { kind = "bin", field = "bin" }
            notes_template = "{description}"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn small_filter_budget_rejected() {
        assert!(parse("[permits]\nmax_filter_len = 10\n").is_err());
    }

    #[test]
    fn missing_file_falls_back_to_minimal() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_or_minimal(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.server.bind, "127.0.0.1:3000");
    }

    #[test]
    fn unreadable_file_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[server\n").unwrap();
        let err = load_config(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to parse config file"));
    }
}
