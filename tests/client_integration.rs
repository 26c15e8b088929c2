//! SodaClient behavior against a mock open-data API.

use std::sync::Arc;

use chrono::NaiveDate;
use permit_leads::cache::{MemoryCache, NoCache, ResponseCache};
use permit_leads::client::{FetchError, FetchRequest, RecordFetcher, SodaClient};
use permit_leads::config::ApiConfig;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn today() -> NaiveDate {
    NaiveDate::from_ymd_opt(2021, 8, 10).unwrap()
}

fn api(server: &MockServer, token: Option<&str>) -> ApiConfig {
    ApiConfig {
        base_url: format!("{}/resource", server.uri()),
        app_token: token.map(str::to_string),
        timeout_secs: 5,
        cache_ttl_secs: 3600,
    }
}

fn dob_request() -> FetchRequest {
    FetchRequest {
        endpoint: "/mkgf-zjhb.json".into(),
        filter: None,
        date_field: Some("inspectiondate".into()),
        days: 5,
        order_by: "inspectiondate".into(),
        limit: 50_000,
    }
}

#[tokio::test]
async fn sends_soql_params_and_app_token() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/resource/mkgf-zjhb.json"))
        .and(query_param("$where", "inspectiondate >= '2021-08-05'"))
        .and(query_param("$order", "inspectiondate DESC"))
        .and(query_param("$limit", "50000"))
        .and(header("X-App-Token", "secret-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
            { "bin": "2013917", "inspectiondate": "2021-08-06T00:00:00.000" },
            { "bin": 1000000, "inspectiondate": "2021-08-07T00:00:00.000" }
        ])))
        .expect(1)
        .mount(&server)
        .await;

    let client = SodaClient::new(&api(&server, Some("secret-token")), Arc::new(NoCache)).unwrap();
    let records = client.fetch(&dob_request(), today()).await.unwrap();

    assert_eq!(records.len(), 2);
    assert_eq!(records[0]["bin"], "2013917");
}

#[tokio::test]
async fn identical_requests_hit_the_cache() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/resource/mkgf-zjhb.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([{ "bin": "1" }])))
        .expect(1)
        .mount(&server)
        .await;

    let cache: Arc<dyn ResponseCache> =
        Arc::new(MemoryCache::new(std::time::Duration::from_secs(60)));
    let client = SodaClient::new(&api(&server, None), cache).unwrap();

    let first = client.fetch(&dob_request(), today()).await.unwrap();
    let second = client.fetch(&dob_request(), today()).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(client.cached_responses(), 1);
}

#[tokio::test]
async fn different_windows_are_cached_separately() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
        .expect(2)
        .mount(&server)
        .await;

    let cache: Arc<dyn ResponseCache> =
        Arc::new(MemoryCache::new(std::time::Duration::from_secs(60)));
    let client = SodaClient::new(&api(&server, None), cache).unwrap();

    let mut request = dob_request();
    client.fetch(&request, today()).await.unwrap();
    request.days = 3;
    client.fetch(&request, today()).await.unwrap();
    assert_eq!(client.cached_responses(), 2);
}

#[tokio::test]
async fn http_error_status_is_reported() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let client = SodaClient::new(&api(&server, None), Arc::new(NoCache)).unwrap();
    let err = client.fetch(&dob_request(), today()).await.unwrap_err();
    assert!(matches!(err, FetchError::Status { status: 503, .. }));
    assert!(err.to_string().contains("HTTP 503"));
}

#[tokio::test]
async fn non_array_body_is_a_decode_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({ "error": true })),
        )
        .mount(&server)
        .await;

    let client = SodaClient::new(&api(&server, None), Arc::new(NoCache)).unwrap();
    let err = client.fetch(&dob_request(), today()).await.unwrap_err();
    assert!(matches!(err, FetchError::Decode { .. }));
}

#[tokio::test]
async fn unreachable_host_is_a_transport_error() {
    let config = ApiConfig {
        base_url: "http://127.0.0.1:9/resource".into(),
        app_token: None,
        timeout_secs: 2,
        cache_ttl_secs: 0,
    };
    let client = SodaClient::new(&config, Arc::new(NoCache)).unwrap();
    let err = client.fetch(&dob_request(), today()).await.unwrap_err();
    assert!(matches!(err, FetchError::Transport { .. }));
}
