//! Source orchestration.
//!
//! The [`Orchestrator`] owns the source registry, the fetcher, the result
//! store, and the progress log. Refreshes are spawned as independent tokio
//! tasks; each one marks its slot as refreshing, runs the pipeline, and swaps
//! in the result when it finishes. Sources never wait on each other.

use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use permit_leads_core::models::Bucket;
use tokio::task::JoinHandle;

use crate::cache::cache_for_ttl;
use crate::client::{RecordFetcher, SodaClient};
use crate::config::{Config, SourceConfig};
use crate::pipeline::{run_source, PipelineSettings, RefreshOptions};
use crate::progress::ProgressLog;
use crate::store::{DataView, ResultSet, ResultStore, SlotStatus, StoreError};

pub struct Orchestrator {
    sources: Vec<SourceConfig>,
    fetcher: Arc<dyn RecordFetcher>,
    store: Arc<ResultStore>,
    log: Arc<ProgressLog>,
    settings: PipelineSettings,
}

/// Settles a store slot when a run ends, including by panic or abort.
struct RefreshGuard {
    store: Arc<ResultStore>,
    source: String,
    settled: bool,
}

impl RefreshGuard {
    fn begin(store: Arc<ResultStore>, source: &str) -> Result<Self, StoreError> {
        store.begin(source)?;
        Ok(Self {
            store,
            source: source.to_string(),
            settled: false,
        })
    }

    fn finish(mut self, outcome: Result<ResultSet, String>) {
        self.settled = true;
        self.store.finish(&self.source, outcome);
    }
}

impl Drop for RefreshGuard {
    fn drop(&mut self) {
        if !self.settled {
            self.store
                .finish(&self.source, Err("refresh aborted".to_string()));
        }
    }
}

impl Orchestrator {
    pub fn new(
        sources: Vec<SourceConfig>,
        fetcher: Arc<dyn RecordFetcher>,
        log: Arc<ProgressLog>,
        settings: PipelineSettings,
    ) -> Self {
        let store = Arc::new(ResultStore::new(sources.iter().map(|s| s.name().to_string())));
        Self {
            sources,
            fetcher,
            store,
            log,
            settings,
        }
    }

    /// Wire the HTTP client, response cache, and source registry from config.
    pub fn from_config(config: &Config, log: Arc<ProgressLog>) -> anyhow::Result<Self> {
        let cache = cache_for_ttl(config.api.cache_ttl_secs);
        let client = SodaClient::new(&config.api, cache)?;
        Ok(Self::new(
            config.resolve_sources()?,
            Arc::new(client),
            log,
            PipelineSettings::from_config(config),
        ))
    }

    pub fn sources(&self) -> &[SourceConfig] {
        &self.sources
    }

    pub fn source(&self, name: &str) -> Result<&SourceConfig, StoreError> {
        self.sources
            .iter()
            .find(|s| s.name() == name)
            .ok_or_else(|| StoreError::UnknownSource(name.to_string()))
    }

    pub fn store(&self) -> &Arc<ResultStore> {
        &self.store
    }

    pub fn log(&self) -> &Arc<ProgressLog> {
        &self.log
    }

    /// Start a refresh of one source in the background.
    pub fn refresh(
        self: &Arc<Self>,
        name: &str,
        options: RefreshOptions,
    ) -> Result<JoinHandle<()>, StoreError> {
        self.source(name)?;
        let this = Arc::clone(self);
        let name = name.to_string();
        Ok(tokio::spawn(async move {
            if let Err(e) = this.refresh_and_wait(&name, options).await {
                tracing::error!(source = %name, "refresh failed to start: {}", e);
            }
        }))
    }

    /// Start a background refresh of every enabled source. Returns their names.
    pub fn refresh_all(self: &Arc<Self>, options: RefreshOptions) -> Vec<String> {
        let names: Vec<String> = self
            .sources
            .iter()
            .filter(|s| s.enabled)
            .map(|s| s.name().to_string())
            .collect();
        for name in &names {
            if let Err(e) = self.refresh(name, options) {
                tracing::error!(source = %name, "could not start refresh: {}", e);
            }
        }
        names
    }

    /// Run a refresh of one source to completion.
    ///
    /// Returns the new result set, or `None` when the run failed; failures are
    /// reported to the progress log and leave the previous result visible.
    pub async fn refresh_and_wait(
        &self,
        name: &str,
        options: RefreshOptions,
    ) -> Result<Option<Arc<ResultSet>>, StoreError> {
        let source = self.source(name)?;
        let guard = RefreshGuard::begin(Arc::clone(&self.store), name)?;
        let today = Local::now().date_naive();

        let outcome = run_source(
            source,
            self.fetcher.as_ref(),
            &self.log,
            &self.settings,
            options,
            today,
        )
        .await;

        match outcome {
            Ok(result) => {
                guard.finish(Ok(result));
                self.store.get(name)
            }
            Err(e) => {
                guard.finish(Err(e.to_string()));
                Ok(None)
            }
        }
    }

    /// Refresh every enabled source every `interval`, starting one interval from now.
    pub fn spawn_schedule(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                tracing::info!("scheduled refresh of all sources");
                this.refresh_all(RefreshOptions::default());
            }
        })
    }

    pub fn get_data(&self, name: &str, bucket: Bucket) -> Result<DataView, StoreError> {
        self.store.get_data(name, bucket)
    }

    pub fn status(&self, name: &str) -> Result<SlotStatus, StoreError> {
        self.store.status(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{FetchError, FetchRequest};
    use crate::config::Config;
    use crate::store::SlotState;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use permit_leads_core::models::RawRecord;
    use serde_json::json;

    struct Static(Vec<RawRecord>);

    #[async_trait]
    impl RecordFetcher for Static {
        async fn fetch(
            &self,
            request: &FetchRequest,
            _today: NaiveDate,
        ) -> Result<Vec<RawRecord>, FetchError> {
            if request.endpoint == "/ipu4-2q9a.json" {
                Ok(Vec::new())
            } else {
                Ok(self.0.clone())
            }
        }
    }

    struct Failing;

    #[async_trait]
    impl RecordFetcher for Failing {
        async fn fetch(
            &self,
            request: &FetchRequest,
            _today: NaiveDate,
        ) -> Result<Vec<RawRecord>, FetchError> {
            Err(FetchError::Status {
                url: request.endpoint.clone(),
                status: 500,
            })
        }
    }

    fn orchestrator(fetcher: Arc<dyn RecordFetcher>) -> Arc<Orchestrator> {
        let config = Config::minimal();
        Arc::new(Orchestrator::new(
            config.resolve_sources().unwrap(),
            fetcher,
            Arc::new(ProgressLog::default()),
            PipelineSettings::from_config(&config),
        ))
    }

    fn one_record() -> Vec<RawRecord> {
        vec![json!({"inspectiondate": "2021-08-06", "novdescription": "MICE", "bin": "1", "housenumber": "1", "streetname": "A ST"})
            .as_object()
            .cloned()
            .unwrap()]
    }

    #[tokio::test]
    async fn unknown_source_rejected() {
        let orch = orchestrator(Arc::new(Static(Vec::new())));
        assert!(matches!(
            orch.refresh("nope", RefreshOptions::default()),
            Err(StoreError::UnknownSource(_))
        ));
        assert!(orch.get_data("nope", Bucket::WithContacts).is_err());
    }

    #[tokio::test]
    async fn spawned_refresh_becomes_ready() {
        let orch = orchestrator(Arc::new(Static(one_record())));
        assert!(matches!(
            orch.get_data("dob", Bucket::WithoutContacts).unwrap(),
            DataView::StillLoading
        ));
        orch.refresh("dob", RefreshOptions::default())
            .unwrap()
            .await
            .unwrap();
        assert_eq!(orch.status("dob").unwrap().state, SlotState::Ready);
        match orch.get_data("dob", Bucket::WithoutContacts).unwrap() {
            DataView::Ready(r) => assert_eq!(r.buckets.without_contacts.len(), 1),
            DataView::StillLoading => panic!("expected data"),
        }
        assert_eq!(orch.status("doh").unwrap().state, SlotState::Uninitialized);
    }

    #[tokio::test]
    async fn fetch_failure_leaves_still_loading() {
        let orch = orchestrator(Arc::new(Failing));
        let result = orch
            .refresh_and_wait("dob", RefreshOptions::default())
            .await
            .unwrap();
        assert!(result.is_none());
        assert!(matches!(
            orch.get_data("dob", Bucket::WithContacts).unwrap(),
            DataView::StillLoading
        ));
        let status = orch.status("dob").unwrap();
        assert_eq!(status.state, SlotState::Uninitialized);
        assert!(status.last_error.unwrap().contains("records fetch failed"));
    }

    #[tokio::test]
    async fn refresh_all_skips_disabled() {
        let mut config = Config::minimal();
        config.sources.insert(
            "doh".into(),
            toml::from_str("enabled = false").unwrap(),
        );
        let orch = Arc::new(Orchestrator::new(
            config.resolve_sources().unwrap(),
            Arc::new(Static(Vec::new())),
            Arc::new(ProgressLog::default()),
            PipelineSettings::from_config(&config),
        ));
        let names = orch.refresh_all(RefreshOptions::default());
        assert_eq!(names, vec!["dob", "complaints", "inspections"]);
    }

    #[test]
    fn guard_settles_slot_on_drop() {
        let store = Arc::new(ResultStore::new(["dob"]));
        {
            let _guard = RefreshGuard::begin(Arc::clone(&store), "dob").unwrap();
            assert_eq!(store.state("dob").unwrap(), SlotState::Refreshing);
        }
        let status = store.status("dob").unwrap();
        assert_eq!(status.state, SlotState::Uninitialized);
        assert_eq!(status.last_error.as_deref(), Some("refresh aborted"));
    }
}
