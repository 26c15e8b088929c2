//! Record normalization: raw API rows → [`CleanRecord`]s.
//!
//! Normalization runs in three passes over the fetched rows, which arrive in
//! the source's descending date order:
//!
//! 1. **Clean** — collapse whitespace in address fields, prefix and regex-clean
//!    the description, parse the date, and derive the join key.
//! 2. **Fold** — merge each record into the immediately preceding surviving
//!    record when both share the same site fields.
//! 3. **Render** — build the upper-cased notes string from the source template.
//!
//! The fold is adjacency-based: two records for the same site separated by a
//! record for another site are not merged.

use chrono::NaiveDate;

use crate::models::{flatten_fields, CleanRecord, Contact, Fields, JoinKey, RawRecord};
use crate::source::{ContactSpec, InlineContact, JoinKeySpec, SourceRules};
use crate::text::{collapse_whitespace, normalize_company, parse_date, split_address, zero_pad};

/// Width block and lot numbers are padded to for the permits join.
pub const BLOCK_LOT_WIDTH: usize = 5;

/// Normalized records plus counts for progress reporting.
#[derive(Debug, Clone, Default)]
pub struct Normalized {
    pub records: Vec<CleanRecord>,
    /// Rows dropped because their date was missing or in the future.
    pub dropped_undated: usize,
    /// Rows folded into their predecessor.
    pub folded: usize,
}

/// Normalize fetched rows for one source.
///
/// `today` bounds the future-date check for sources with `drop_undated`.
pub fn normalize(raw: &[RawRecord], rules: &SourceRules, today: NaiveDate) -> Normalized {
    let descriptor = &rules.descriptor;
    let mut dropped_undated = 0;
    let mut cleaned = Vec::with_capacity(raw.len());

    for row in raw {
        let record = clean_record(row, rules);
        if descriptor.drop_undated && record.date.map_or(true, |d| d > today) {
            dropped_undated += 1;
            continue;
        }
        cleaned.push(record);
    }

    let (mut records, folded) = if descriptor.site_fields.is_empty() {
        (cleaned, 0)
    } else {
        fold_adjacent(cleaned)
    };

    for record in &mut records {
        record.notes = render_notes(rules, record);
    }

    Normalized {
        records,
        dropped_undated,
        folded,
    }
}

/// Clean a single row without folding or rendering notes.
pub fn clean_record(raw: &RawRecord, rules: &SourceRules) -> CleanRecord {
    let descriptor = &rules.descriptor;
    let mut fields = flatten_fields(raw);

    for name in &descriptor.address_fields {
        if let Some(value) = fields.get_mut(name) {
            *value = collapse_whitespace(value);
        }
    }

    let date = field(&fields, &descriptor.date_field).and_then(parse_date);

    let mut description = descriptor
        .description_field
        .as_deref()
        .and_then(|name| field(&fields, name))
        .unwrap_or_default()
        .to_string();

    if let Some(rule) = &descriptor.description_prefix {
        let prefix = field(&fields, &rule.field).unwrap_or_default().trim();
        let is_standard = rule.unless.as_deref().is_some_and(|u| u.trim() == prefix);
        if !prefix.is_empty() && !is_standard {
            description = format!("{} {}", prefix, description);
        }
    }

    for (re, replacement) in &rules.cleanup {
        description = re.replace_all(&description, replacement.as_str()).into_owned();
    }

    let join_key = derive_join_key(&descriptor.join_key, &fields);

    let site = descriptor
        .site_fields
        .iter()
        .map(|name| field(&fields, name).unwrap_or_default().trim().to_string())
        .collect();

    let contact = match &descriptor.contact {
        ContactSpec::Permits => None,
        ContactSpec::Inline(spec) => Some(inline_contact(spec, &fields)),
    };

    CleanRecord {
        date,
        site,
        join_key,
        description: collapse_whitespace(&description),
        notes: String::new(),
        contact,
        fields,
    }
}

/// Derive the join key for a record from its (already whitespace-collapsed) fields.
pub fn derive_join_key(spec: &JoinKeySpec, fields: &Fields) -> JoinKey {
    match spec {
        JoinKeySpec::Bin { field: name } => JoinKey::bin(field(fields, name).unwrap_or_default()),
        JoinKeySpec::Address { field: name } => {
            let (house, street) = split_address(field(fields, name).unwrap_or_default());
            JoinKey::address(&house, &street)
        }
        JoinKeySpec::BlockLot {
            block_field,
            lot_field,
        } => {
            let pad = |name: &str| {
                field(fields, name)
                    .map(str::trim)
                    .filter(|v| !v.is_empty())
                    .map(|v| zero_pad(v, BLOCK_LOT_WIDTH))
                    .unwrap_or_default()
            };
            JoinKey::block_lot(&pad(block_field), &pad(lot_field))
        }
        JoinKeySpec::None => JoinKey::Missing,
    }
}

/// Merge each record into the preceding surviving record when their sites match.
///
/// Returns the surviving records and the number folded away. Records with no
/// site values never fold. Running the fold on its own output folds nothing.
pub fn fold_adjacent(records: Vec<CleanRecord>) -> (Vec<CleanRecord>, usize) {
    let mut out: Vec<CleanRecord> = Vec::with_capacity(records.len());
    let mut folded = 0;

    for record in records {
        if let Some(prev) = out.last_mut() {
            if record.has_site() && prev.site == record.site {
                if !record.description.is_empty() {
                    if prev.description.is_empty() {
                        prev.description = record.description;
                    } else {
                        prev.description.push_str(" AND ");
                        prev.description.push_str(&record.description);
                    }
                }
                folded += 1;
                continue;
            }
        }
        out.push(record);
    }

    (out, folded)
}

fn render_notes(rules: &SourceRules, record: &CleanRecord) -> String {
    rules
        .notes
        .render(|name| {
            if name == "description" {
                Some(record.description.as_str())
            } else {
                record.fields.get(name).map(String::as_str)
            }
        })
        .to_uppercase()
}

fn inline_contact(spec: &InlineContact, fields: &Fields) -> Contact {
    let get = |name: &Option<String>| -> String {
        name.as_deref()
            .and_then(|n| field(fields, n))
            .map(collapse_whitespace)
            .unwrap_or_default()
    };

    let address = spec
        .address_fields
        .iter()
        .filter_map(|name| field(fields, name))
        .map(collapse_whitespace)
        .filter(|v| !v.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
        .to_uppercase();

    let phone = get(&spec.phone_field);

    Contact {
        company: Some(normalize_company(&get(&spec.company_field).to_uppercase())),
        first_name: None,
        last_name: None,
        address: Some(address).filter(|a| !a.is_empty()),
        city: Some(get(&spec.city_field).to_uppercase()),
        state: None,
        zip: Some(get(&spec.zip_field)),
        phone: Some(phone).filter(|p| !p.is_empty()),
    }
}

fn field<'a>(fields: &'a Fields, name: &str) -> Option<&'a str> {
    fields.get(name).map(String::as_str)
}
