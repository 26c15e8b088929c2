//! In-memory result store.
//!
//! One slot per configured source. A slot moves `Uninitialized → Refreshing →
//! Ready`; a finished run swaps its [`ResultSet`] in under a short write lock.
//! A failed run leaves the previous result set in place, so readers never see
//! a half-built or empty-looking result after the first success.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use permit_leads_core::classify::ClassifyReport;
use permit_leads_core::models::{Bucket, Buckets, OutputRecord};
use serde::Serialize;
use uuid::Uuid;

/// Everything one successful refresh of a source produced.
#[derive(Debug, Clone)]
pub struct ResultSet {
    pub source: String,
    pub run_id: Uuid,
    pub refreshed_at: DateTime<Utc>,
    pub buckets: Buckets,
    /// CSV text per tracked bucket, rendered once at refresh time.
    pub csv: BTreeMap<Bucket, String>,
    pub report: ClassifyReport,
}

impl ResultSet {
    pub fn records(&self, bucket: Bucket) -> Option<&[OutputRecord]> {
        self.buckets.get(bucket)
    }

    pub fn csv(&self, bucket: Bucket) -> Option<&str> {
        self.csv.get(&bucket).map(String::as_str)
    }

    /// Record counts for every tracked bucket.
    pub fn counts(&self) -> BTreeMap<String, usize> {
        self.buckets
            .tracked()
            .into_iter()
            .filter_map(|b| self.buckets.get(b).map(|r| (b.as_str().to_string(), r.len())))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotState {
    Uninitialized,
    Refreshing,
    Ready,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("unknown source: '{0}'")]
    UnknownSource(String),
    #[error("bucket '{bucket}' is not tracked for source '{name}'")]
    BucketNotTracked { name: String, bucket: Bucket },
}

/// Result of reading a bucket.
#[derive(Debug, Clone)]
pub enum DataView {
    /// No refresh of this source has completed yet.
    StillLoading,
    Ready(Arc<ResultSet>),
}

/// Point-in-time view of a slot for listings.
#[derive(Debug, Clone, Serialize)]
pub struct SlotStatus {
    pub state: SlotState,
    pub refreshed_at: Option<DateTime<Utc>>,
    pub run_id: Option<Uuid>,
    pub counts: BTreeMap<String, usize>,
    pub last_error: Option<String>,
}

#[derive(Debug)]
struct Slot {
    state: SlotState,
    in_flight: usize,
    result: Option<Arc<ResultSet>>,
    last_error: Option<String>,
}

impl Slot {
    fn new() -> Self {
        Self {
            state: SlotState::Uninitialized,
            in_flight: 0,
            result: None,
            last_error: None,
        }
    }

    fn settle(&mut self) {
        self.state = if self.in_flight > 0 {
            SlotState::Refreshing
        } else if self.result.is_some() {
            SlotState::Ready
        } else {
            SlotState::Uninitialized
        };
    }
}

pub struct ResultStore {
    slots: RwLock<HashMap<String, Slot>>,
}

impl ResultStore {
    /// A store with one empty slot per source name.
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let slots = names.into_iter().map(|n| (n.into(), Slot::new())).collect();
        Self {
            slots: RwLock::new(slots),
        }
    }

    pub fn contains(&self, source: &str) -> bool {
        self.read().contains_key(source)
    }

    /// Mark a run as started.
    pub fn begin(&self, source: &str) -> Result<(), StoreError> {
        let mut slots = self.write();
        let slot = slots
            .get_mut(source)
            .ok_or_else(|| StoreError::UnknownSource(source.to_string()))?;
        slot.in_flight += 1;
        slot.settle();
        Ok(())
    }

    /// Mark a run as finished, swapping in its result on success.
    ///
    /// A failure records the error and keeps whatever result was there.
    pub fn finish(&self, source: &str, outcome: Result<ResultSet, String>) {
        let mut slots = self.write();
        let Some(slot) = slots.get_mut(source) else {
            return;
        };
        slot.in_flight = slot.in_flight.saturating_sub(1);
        match outcome {
            Ok(result) => {
                slot.result = Some(Arc::new(result));
                slot.last_error = None;
            }
            Err(message) => slot.last_error = Some(message),
        }
        slot.settle();
    }

    pub fn get(&self, source: &str) -> Result<Option<Arc<ResultSet>>, StoreError> {
        self.read()
            .get(source)
            .map(|slot| slot.result.clone())
            .ok_or_else(|| StoreError::UnknownSource(source.to_string()))
    }

    /// Read one bucket of a source.
    pub fn get_data(&self, source: &str, bucket: Bucket) -> Result<DataView, StoreError> {
        match self.get(source)? {
            None => Ok(DataView::StillLoading),
            Some(result) if result.records(bucket).is_some() => Ok(DataView::Ready(result)),
            Some(_) => Err(StoreError::BucketNotTracked {
                name: source.to_string(),
                bucket,
            }),
        }
    }

    pub fn state(&self, source: &str) -> Result<SlotState, StoreError> {
        self.read()
            .get(source)
            .map(|slot| slot.state)
            .ok_or_else(|| StoreError::UnknownSource(source.to_string()))
    }

    pub fn status(&self, source: &str) -> Result<SlotStatus, StoreError> {
        let slots = self.read();
        let slot = slots
            .get(source)
            .ok_or_else(|| StoreError::UnknownSource(source.to_string()))?;
        Ok(SlotStatus {
            state: slot.state,
            refreshed_at: slot.result.as_ref().map(|r| r.refreshed_at),
            run_id: slot.result.as_ref().map(|r| r.run_id),
            counts: slot.result.as_ref().map(|r| r.counts()).unwrap_or_default(),
            last_error: slot.last_error.clone(),
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Slot>> {
        self.slots.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Slot>> {
        self.slots.write().unwrap_or_else(PoisonError::into_inner)
    }
}
