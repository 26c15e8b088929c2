//! # permit-leads
//!
//! Reconciles municipal open-data feeds (building violations, 311 complaints,
//! rodent inspections, restaurant inspections) against the permit ownership
//! filings dataset and publishes the result as contactable lead lists.
//!
//! The pure reconciliation logic lives in the `permit-leads-core` crate. This
//! crate adds everything around it: configuration, the remote API client and
//! its response cache, the progress log, the per-source pipeline runner, the
//! in-memory result store, the orchestrator, CSV/JSON export, and the HTTP
//! server.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//! │ Orchestrator │──▶│   Pipeline   │──▶│  SodaClient  │──▶ open-data API
//! │  (per-source │   │ normalize →  │   │ + Response   │
//! │   refresh)   │   │ match →      │   │   Cache      │
//! └──────┬───────┘   │ classify     │   └──────────────┘
//!        │           └──────┬───────┘
//!        ▼                  ▼
//! ┌──────────────┐   ┌──────────────┐
//! │ ResultStore  │◀──│  ResultSet   │
//! └──────┬───────┘   └──────────────┘
//!        ▼
//! ┌──────────────┐
//! │  HTTP / CLI  │   /data/{source}/{bucket}.csv, /logs (SSE)
//! └──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! leads sources                             # list configured sources
//! leads refresh dob --days 3                # run one source to completion
//! leads refresh all --output-dir out/       # write every bucket to files
//! leads serve                               # start the HTTP server
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration and source resolution |
//! | [`cache`] | Response cache keyed by request URL |
//! | [`client`] | Remote open-data client |
//! | [`progress`] | Progress log with history and broadcast |
//! | [`pipeline`] | Per-source refresh pipeline |
//! | [`store`] | In-memory result store |
//! | [`orchestrator`] | Background refreshes and schedule |
//! | [`export`] | CSV and JSON serialization |
//! | [`refresh_cmd`] | `leads refresh` command |
//! | [`server`] | HTTP server |

pub mod cache;
pub mod client;
pub mod config;
pub mod export;
pub mod orchestrator;
pub mod pipeline;
pub mod progress;
pub mod refresh_cmd;
pub mod server;
pub mod sources;
pub mod store;
