//! # permit-leads core
//!
//! Pure reconciliation logic for permit-leads: record models, per-source
//! descriptors, normalization, permit matching, and classification.
//!
//! This crate contains no tokio, network, or filesystem dependencies. Every
//! function takes its inputs by value or reference and returns a result, so the
//! whole pipeline can be exercised from plain unit tests.
//!
//! ```text
//! RawRecord ──normalize──▶ CleanRecord ──match──▶ (CleanRecord, Permit?)
//!                                                      │
//!                                        classify ─────┘
//!                                            ▼
//!                              withContacts / withoutContacts
//! ```

pub mod classify;
pub mod matcher;
pub mod models;
pub mod normalize;
pub mod source;
pub mod text;
