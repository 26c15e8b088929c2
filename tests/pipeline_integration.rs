//! End-to-end refreshes through the orchestrator with an in-memory fetcher.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::NaiveDate;
use permit_leads::client::{FetchError, FetchRequest, RecordFetcher};
use permit_leads::config::Config;
use permit_leads::orchestrator::Orchestrator;
use permit_leads::pipeline::{PipelineSettings, RefreshOptions};
use permit_leads::progress::ProgressLog;
use permit_leads::store::{DataView, SlotState};
use permit_leads_core::models::{Bucket, RawRecord};
use serde_json::json;

const PERMITS: &str = "/ipu4-2q9a.json";

/// Serves canned batches by endpoint; fails record fetches while `failing` is set.
#[derive(Default)]
struct Scripted {
    batches: HashMap<String, Vec<RawRecord>>,
    failing: AtomicBool,
    requests: Mutex<Vec<FetchRequest>>,
}

impl Scripted {
    fn with(mut self, endpoint: &str, rows: Vec<RawRecord>) -> Self {
        self.batches.insert(endpoint.to_string(), rows);
        self
    }

    fn permit_requests(&self) -> Vec<FetchRequest> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.endpoint == PERMITS)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl RecordFetcher for Scripted {
    async fn fetch(
        &self,
        request: &FetchRequest,
        _today: NaiveDate,
    ) -> Result<Vec<RawRecord>, FetchError> {
        self.requests.lock().unwrap().push(request.clone());
        if request.endpoint != PERMITS && self.failing.load(Ordering::SeqCst) {
            return Err(FetchError::Status {
                url: request.endpoint.clone(),
                status: 500,
            });
        }
        Ok(self
            .batches
            .get(&request.endpoint)
            .cloned()
            .unwrap_or_default())
    }
}

fn row(value: serde_json::Value) -> RawRecord {
    value.as_object().cloned().unwrap()
}

fn orchestrator(fetcher: Arc<Scripted>, log: Arc<ProgressLog>) -> Arc<Orchestrator> {
    let config = Config::minimal();
    Arc::new(Orchestrator::new(
        config.resolve_sources().unwrap(),
        fetcher,
        log,
        PipelineSettings::from_config(&config),
    ))
}

fn ready(orch: &Orchestrator, source: &str, bucket: Bucket) -> Arc<permit_leads::store::ResultSet> {
    match orch.get_data(source, bucket).unwrap() {
        DataView::Ready(result) => result,
        DataView::StillLoading => panic!("{} has no result yet", source),
    }
}

fn dob_rows() -> Vec<RawRecord> {
    vec![
        row(json!({
            "inspectiondate": "2021-08-06T00:00:00.000",
            "novdescription": "§ 27-2017.3 HMC: ABATE THE INFESTATION CONSISTING OF MICE",
            "bin": "2013917",
            "housenumber": "2377",
            "streetname": "CRESTON AVENUE",
            "apartment": "3I",
            "boro": "BRONX",
            "zip": "10468"
        })),
        row(json!({
            "inspectiondate": "2021-08-07T00:00:00.000",
            "novdescription": "ABATE THE INFESTATION CONSISTING OF ROACHES",
            "bin": "3000001",
            "housenumber": "10",
            "streetname": "MAIN STREET",
            "boro": "BROOKLYN",
            "zip": "11201"
        })),
    ]
}

fn dob_permits() -> Vec<RawRecord> {
    vec![
        row(json!({
            "bin__": "2013917",
            "owner_s_first_name": "JOHN",
            "owner_s_last_name": "SMITH",
            "owner_s_business_name": "SHAH GROUP",
            "owner_s_house__": "128-24",
            "owner_s_house_street_name": "140TH STREET",
            "city": "QUEENS",
            "state": "NY",
            "owner_s_zip_code": "11436",
            "owner_s_phone__": "7187389500",
            "filing_date": "2021-06-01T00:00:00.000"
        })),
        // Same owner filed twice; only one contact survives.
        row(json!({
            "bin__": "2013917",
            "owner_s_business_name": "SHAH GROUP",
            "owner_s_house__": "128-24",
            "owner_s_house_street_name": "140TH STREET",
            "owner_s_phone__": "7187389500",
            "filing_date": "2020-01-01T00:00:00.000"
        })),
    ]
}

#[tokio::test]
async fn dob_records_matched_by_bin() {
    let fetcher = Arc::new(
        Scripted::default()
            .with("/mkgf-zjhb.json", dob_rows())
            .with(PERMITS, dob_permits()),
    );
    let log = Arc::new(ProgressLog::default());
    let orch = orchestrator(Arc::clone(&fetcher), Arc::clone(&log));

    let result = orch
        .refresh_and_wait("dob", RefreshOptions::default())
        .await
        .unwrap()
        .expect("refresh succeeds");

    assert_eq!(result.buckets.with_contacts.len(), 1);
    assert_eq!(result.buckets.without_contacts.len(), 1);
    assert!(result.buckets.all.is_none());

    let lead = &result.buckets.with_contacts[0];
    assert_eq!(lead.contact.company.as_deref(), Some("SHAH GROUP"));
    assert_eq!(lead.contact.phone.as_deref(), Some("7187389500"));
    assert!(lead.notes.contains("HAS MICE"));

    let filters: Vec<String> = fetcher
        .permit_requests()
        .into_iter()
        .filter_map(|r| r.filter)
        .collect();
    assert_eq!(filters, vec!["bin__ in('2013917','3000001')".to_string()]);

    let history = log.history_text();
    assert!(history.contains("(DOB) Filtering 2 permits down to 1 uniques..."));
    assert!(history.contains("(DOB) Pushing 1 leads (50%) to dob-with-contacts.csv..."));
    assert!(history.contains("(DOB) Pushing 1 leads (50%) to dob-without-contacts.csv..."));
    assert_eq!(orch.status("dob").unwrap().state, SlotState::Ready);
}

#[tokio::test]
async fn failed_refresh_keeps_previous_result() {
    let fetcher = Arc::new(
        Scripted::default()
            .with("/mkgf-zjhb.json", dob_rows())
            .with(PERMITS, dob_permits()),
    );
    let log = Arc::new(ProgressLog::default());
    let orch = orchestrator(Arc::clone(&fetcher), Arc::clone(&log));

    let first = orch
        .refresh_and_wait("dob", RefreshOptions::default())
        .await
        .unwrap()
        .unwrap();

    fetcher.failing.store(true, Ordering::SeqCst);
    let second = orch
        .refresh_and_wait("dob", RefreshOptions::default())
        .await
        .unwrap();
    assert!(second.is_none());

    let visible = ready(&orch, "dob", Bucket::WithContacts);
    assert_eq!(visible.run_id, first.run_id);
    assert_eq!(visible.buckets, first.buckets);

    let status = orch.status("dob").unwrap();
    assert_eq!(status.state, SlotState::Ready);
    assert!(status
        .last_error
        .unwrap()
        .contains("records fetch failed"));
    assert!(log.history_text().contains("(DOB) RECORDS ERROR"));
}

#[tokio::test]
async fn sources_refresh_independently() {
    let complaints = vec![row(json!({
        "created_date": "2021-08-08T00:00:00.000",
        "complaint_type": "Rodent",
        "descriptor": "Rat Sighting",
        "incident_address": "55 WATER STREET",
        "borough": "MANHATTAN",
        "incident_zip": "10041"
    }))];
    let fetcher = Arc::new(
        Scripted::default()
            .with("/mkgf-zjhb.json", dob_rows())
            .with("/erm2-nwe9.json", complaints),
    );
    let orch = orchestrator(fetcher, Arc::new(ProgressLog::default()));

    let (dob, complaints) = tokio::join!(
        orch.refresh_and_wait("dob", RefreshOptions::default()),
        orch.refresh_and_wait("complaints", RefreshOptions::default()),
    );
    assert!(dob.unwrap().is_some());
    let complaints = complaints.unwrap().unwrap();
    assert_eq!(complaints.buckets.without_contacts.len(), 1);
    assert!(complaints.buckets.without_contacts[0]
        .notes
        .contains("311 COMPLAINT: RODENT RAT SIGHTING"));

    assert!(matches!(
        orch.get_data("inspections", Bucket::WithContacts).unwrap(),
        DataView::StillLoading
    ));
}

#[tokio::test]
async fn oversized_key_set_truncates_permit_filter() {
    let rows: Vec<RawRecord> = (0..10_000)
        .map(|i| {
            row(json!({
                "inspectiondate": "2021-08-06T00:00:00.000",
                "novdescription": format!("CONSISTING OF MICE {}", i),
                "bin": format!("{:0>38}", i),
                "housenumber": i.to_string(),
                "streetname": "LONG AVENUE",
                "boro": "QUEENS",
                "zip": "11101"
            }))
        })
        .collect();
    let fetcher = Arc::new(Scripted::default().with("/mkgf-zjhb.json", rows));
    let log = Arc::new(ProgressLog::default());
    let orch = orchestrator(Arc::clone(&fetcher), Arc::clone(&log));

    let result = orch
        .refresh_and_wait("dob", RefreshOptions::default())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.buckets.without_contacts.len(), 10_000);

    let requests = fetcher.permit_requests();
    assert_eq!(requests.len(), 1);
    let filter = requests[0].filter.clone().unwrap();
    assert!(filter.len() <= 32_768, "filter is {} bytes", filter.len());
    assert!(filter.starts_with("bin__ in('"));
    assert!(log.history_text().contains("Permit filter truncated"));
}
