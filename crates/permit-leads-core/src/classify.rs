//! Merging matched records into output rows and bucketing them.
//!
//! Each [`CleanRecord`] is merged with its contact (the best-matching permit
//! owner, or the contact carried inline on the record) into an
//! [`OutputRecord`], then routed to `withContacts` when it has a phone number
//! and `withoutContacts` otherwise. Within each bucket exact duplicates are
//! removed and rows sharing a date and address are coalesced.

use std::collections::{HashMap, HashSet};

use serde::Serialize;

use crate::matcher::PermitIndex;
use crate::models::{Buckets, CleanRecord, Contact, OutputRecord};
use crate::text::normalize_company;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClassifyOptions {
    /// Also populate the `all` bucket.
    pub track_all: bool,
}

/// Counts describing one classification run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ClassifyReport {
    /// Normalized records classified.
    pub records: usize,
    /// Records that found a matching permit.
    pub matched: usize,
    /// Output rows removed as exact duplicates.
    pub duplicates_removed: usize,
    /// Output rows absorbed into another row by date/address coalescing.
    pub coalesced: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Classified {
    pub buckets: Buckets,
    pub report: ClassifyReport,
}

/// Merge a record with its contact into an output row.
///
/// With no contact every contact column is absent.
pub fn merge_record(record: &CleanRecord, contact: Option<Contact>) -> OutputRecord {
    let mut contact = contact.unwrap_or_default();
    if let Some(company) = contact.company.as_mut() {
        *company = normalize_company(company);
    }
    OutputRecord {
        date: record.date_string(),
        notes: record.notes.clone(),
        contact,
    }
}

/// Drop rows structurally equal to an earlier row. Returns the survivors and
/// the number removed.
pub fn remove_exact_duplicates(records: Vec<OutputRecord>) -> (Vec<OutputRecord>, usize) {
    let before = records.len();
    let mut seen = HashSet::new();
    let out: Vec<OutputRecord> = records
        .into_iter()
        .filter(|r| seen.insert(r.clone()))
        .collect();
    let removed = before - out.len();
    (out, removed)
}

/// Combine rows sharing `(date, address)` into the first such row.
///
/// Notes are joined with `" AND "` in input order and the combined row's notes
/// are prefixed with the group size, e.g. `"(2) A AND B"`. Rows with an empty
/// address are never combined. Returns the survivors and the number absorbed.
pub fn coalesce_notes(records: Vec<OutputRecord>) -> (Vec<OutputRecord>, usize) {
    let mut out: Vec<OutputRecord> = Vec::with_capacity(records.len());
    let mut sizes: Vec<usize> = Vec::with_capacity(records.len());
    let mut groups: HashMap<(String, String), usize> = HashMap::new();

    for record in records {
        let address = record.address().trim().to_string();
        if address.is_empty() {
            out.push(record);
            sizes.push(1);
            continue;
        }
        match groups.get(&(record.date.clone(), address.clone())) {
            Some(&index) => {
                let target = &mut out[index];
                target.notes.push_str(" AND ");
                target.notes.push_str(&record.notes);
                sizes[index] += 1;
            }
            None => {
                groups.insert((record.date.clone(), address), out.len());
                out.push(record);
                sizes.push(1);
            }
        }
    }

    let mut absorbed = 0;
    for (record, size) in out.iter_mut().zip(sizes) {
        if size > 1 {
            record.notes = format!("({}) {}", size, record.notes);
            absorbed += size - 1;
        }
    }

    (out, absorbed)
}

/// Merge, bucket, deduplicate, and coalesce a source's records.
pub fn classify(
    records: &[CleanRecord],
    permits: &PermitIndex,
    options: ClassifyOptions,
) -> Classified {
    let mut report = ClassifyReport {
        records: records.len(),
        ..Default::default()
    };

    let mut with_contacts = Vec::new();
    let mut without_contacts = Vec::new();

    for record in records {
        let contact = match &record.contact {
            Some(inline) => Some(inline.clone()),
            None => permits.get(&record.join_key).map(|permit| {
                report.matched += 1;
                permit.contact()
            }),
        };
        let output = merge_record(record, contact);
        if output.has_phone() {
            with_contacts.push(output);
        } else {
            without_contacts.push(output);
        }
    }

    let (with_contacts, dup_with) = remove_exact_duplicates(with_contacts);
    let (without_contacts, dup_without) = remove_exact_duplicates(without_contacts);
    report.duplicates_removed = dup_with + dup_without;

    let (with_contacts, co_with) = coalesce_notes(with_contacts);
    let (without_contacts, co_without) = coalesce_notes(without_contacts);
    report.coalesced = co_with + co_without;

    let all = options.track_all.then(|| {
        with_contacts
            .iter()
            .chain(without_contacts.iter())
            .cloned()
            .collect()
    });

    Classified {
        buckets: Buckets {
            with_contacts,
            without_contacts,
            all,
        },
        report,
    }
}
