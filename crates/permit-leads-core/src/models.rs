//! Core data models that flow through the reconciliation pipeline.
//!
//! A fetched [`RawRecord`] becomes a [`CleanRecord`] in the normalizer, is
//! paired with at most one [`Permit`] by the matcher, and ends up as an
//! [`OutputRecord`] in one of the [`Buckets`].

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::text::{collapse_whitespace, normalize_company, parse_date};

/// A row exactly as returned by the remote query API.
pub type RawRecord = serde_json::Map<String, serde_json::Value>;

/// Flattened string view of a [`RawRecord`].
///
/// Strings are kept as-is, numbers and booleans are stringified, and nulls,
/// arrays, and nested objects are dropped.
pub type Fields = BTreeMap<String, String>;

pub fn flatten_fields(raw: &RawRecord) -> Fields {
    raw.iter()
        .filter_map(|(k, v)| {
            let value = match v {
                serde_json::Value::String(s) => s.clone(),
                serde_json::Value::Number(n) => n.to_string(),
                serde_json::Value::Bool(b) => b.to_string(),
                _ => return None,
            };
            Some((k.clone(), value))
        })
        .collect()
}

/// The key a record is joined to permits on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JoinKey {
    /// Building identification number.
    Bin(String),
    /// Street address split at the first space.
    Address {
        house_number: String,
        street_name: String,
    },
    /// Zero-padded tax block and lot.
    BlockLot { block: String, lot: String },
    /// A required field was absent; never matches a permit.
    Missing,
}

impl JoinKey {
    pub fn bin(value: &str) -> Self {
        let value = value.trim();
        if value.is_empty() {
            JoinKey::Missing
        } else {
            JoinKey::Bin(value.to_string())
        }
    }

    pub fn address(house_number: &str, street_name: &str) -> Self {
        let house_number = collapse_whitespace(house_number);
        let street_name = collapse_whitespace(street_name);
        if house_number.is_empty() || street_name.is_empty() {
            JoinKey::Missing
        } else {
            JoinKey::Address {
                house_number,
                street_name,
            }
        }
    }

    pub fn block_lot(block: &str, lot: &str) -> Self {
        let block = block.trim();
        let lot = lot.trim();
        if block.is_empty() || lot.is_empty() {
            JoinKey::Missing
        } else {
            JoinKey::BlockLot {
                block: block.to_string(),
                lot: lot.to_string(),
            }
        }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, JoinKey::Missing)
    }
}

impl fmt::Display for JoinKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinKey::Bin(bin) => write!(f, "BIN {}", bin),
            JoinKey::Address {
                house_number,
                street_name,
            } => write!(f, "{} {}", house_number, street_name),
            JoinKey::BlockLot { block, lot } => write!(f, "block {} lot {}", block, lot),
            JoinKey::Missing => f.write_str("(missing)"),
        }
    }
}

/// A normalized record ready for matching.
#[derive(Debug, Clone, PartialEq)]
pub struct CleanRecord {
    /// Calendar date of the record, if it had a parseable one.
    pub date: Option<NaiveDate>,
    /// Values of the source's site fields, used by the adjacency fold.
    pub site: Vec<String>,
    pub join_key: JoinKey,
    /// Cleaned free-text description; folded records are joined with `" AND "`.
    pub description: String,
    /// Upper-cased human-readable notes rendered from the source template.
    pub notes: String,
    /// Contact data carried on the record itself, for sources without permits.
    pub contact: Option<Contact>,
    pub fields: Fields,
}

impl CleanRecord {
    /// Whether the fold may merge this record with a neighbour.
    pub fn has_site(&self) -> bool {
        self.site.iter().any(|v| !v.is_empty())
    }

    pub fn date_string(&self) -> String {
        self.date
            .map(|d| d.format("%Y-%m-%d").to_string())
            .unwrap_or_default()
    }
}

/// An ownership filing from the permits dataset.
///
/// Field names follow the permits resource schema; anything not listed here is
/// ignored on deserialization.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Permit {
    #[serde(rename = "bin__", default)]
    pub bin: Option<String>,
    #[serde(rename = "house__", default)]
    pub house_number: Option<String>,
    #[serde(default)]
    pub street_name: Option<String>,
    #[serde(default)]
    pub block: Option<String>,
    #[serde(default)]
    pub lot: Option<String>,
    #[serde(default)]
    pub filing_date: Option<String>,
    #[serde(rename = "owner_s_business_name", default)]
    pub owner_business_name: Option<String>,
    #[serde(rename = "owner_s_first_name", default)]
    pub owner_first_name: Option<String>,
    #[serde(rename = "owner_s_last_name", default)]
    pub owner_last_name: Option<String>,
    #[serde(rename = "owner_s_house__", default)]
    pub owner_house_number: Option<String>,
    #[serde(rename = "owner_s_house_street_name", default)]
    pub owner_street_name: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(rename = "owner_s_zip_code", default)]
    pub owner_zip: Option<String>,
    #[serde(rename = "owner_s_phone__", default)]
    pub owner_phone: Option<String>,
}

impl Permit {
    /// Build a permit from a raw API row, stringifying numeric fields.
    pub fn from_raw(raw: &RawRecord) -> Option<Self> {
        let fields = flatten_fields(raw);
        let value = serde_json::to_value(fields).ok()?;
        serde_json::from_value(value).ok()
    }

    pub fn filing_date(&self) -> Option<NaiveDate> {
        self.filing_date.as_deref().and_then(parse_date)
    }

    /// Owner contact fields as they appear in output records.
    ///
    /// Names, city, and state are upper-cased; `address` is only set when both
    /// the owner's house number and street are present; `phone` is only set
    /// when non-empty.
    pub fn contact(&self) -> Contact {
        let upper = |v: &Option<String>| -> String {
            v.as_deref()
                .map(|s| collapse_whitespace(s).to_uppercase())
                .unwrap_or_default()
        };
        let non_empty = |v: &Option<String>| -> Option<String> {
            v.as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };

        let address = match (
            non_empty(&self.owner_house_number),
            non_empty(&self.owner_street_name),
        ) {
            (Some(house), Some(street)) => Some(format!(
                "{} {}",
                house,
                collapse_whitespace(&street).to_uppercase()
            )),
            _ => None,
        };

        Contact {
            company: Some(normalize_company(
                self.owner_business_name.as_deref().unwrap_or_default(),
            )),
            first_name: Some(upper(&self.owner_first_name)),
            last_name: Some(upper(&self.owner_last_name)),
            address,
            city: Some(upper(&self.city)),
            state: Some(upper(&self.state)),
            zip: Some(non_empty(&self.owner_zip).unwrap_or_default()),
            phone: non_empty(&self.owner_phone),
        }
    }
}

/// Contact columns of an [`OutputRecord`].
///
/// A field that is `None` is omitted from JSON output and written as the
/// empty-field placeholder in CSV.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize)]
pub struct Contact {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub company: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
}

/// Column order of serialized output records.
pub const OUTPUT_COLUMNS: [&str; 10] = [
    "date",
    "notes",
    "company",
    "first_name",
    "last_name",
    "address",
    "city",
    "state",
    "zip",
    "phone",
];

/// A merged, externally visible lead row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct OutputRecord {
    pub date: String,
    pub notes: String,
    #[serde(flatten)]
    pub contact: Contact,
}

impl OutputRecord {
    pub fn has_phone(&self) -> bool {
        self.contact
            .phone
            .as_deref()
            .is_some_and(|p| !p.trim().is_empty())
    }

    pub fn address(&self) -> &str {
        self.contact.address.as_deref().unwrap_or_default()
    }

    /// Column values in [`OUTPUT_COLUMNS`] order.
    pub fn values(&self) -> [Option<&str>; 10] {
        let c = &self.contact;
        [
            Some(self.date.as_str()),
            Some(self.notes.as_str()),
            c.company.as_deref(),
            c.first_name.as_deref(),
            c.last_name.as_deref(),
            c.address.as_deref(),
            c.city.as_deref(),
            c.state.as_deref(),
            c.zip.as_deref(),
            c.phone.as_deref(),
        ]
    }
}

/// Classification outcome of an output record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Bucket {
    WithContacts,
    WithoutContacts,
    All,
}

impl Bucket {
    pub const ALL: [Bucket; 3] = [Bucket::WithContacts, Bucket::WithoutContacts, Bucket::All];

    pub fn as_str(&self) -> &'static str {
        match self {
            Bucket::WithContacts => "withContacts",
            Bucket::WithoutContacts => "withoutContacts",
            Bucket::All => "all",
        }
    }

    /// Hyphenated form used in file names (`with-contacts`).
    pub fn slug(&self) -> &'static str {
        match self {
            Bucket::WithContacts => "with-contacts",
            Bucket::WithoutContacts => "without-contacts",
            Bucket::All => "all",
        }
    }
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Bucket {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Bucket::ALL
            .into_iter()
            .find(|b| s == b.as_str() || s.eq_ignore_ascii_case(b.slug()))
            .ok_or_else(|| format!("unknown bucket: '{}'", s))
    }
}

/// Output records grouped by [`Bucket`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Buckets {
    pub with_contacts: Vec<OutputRecord>,
    pub without_contacts: Vec<OutputRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub all: Option<Vec<OutputRecord>>,
}

impl Buckets {
    pub fn get(&self, bucket: Bucket) -> Option<&[OutputRecord]> {
        match bucket {
            Bucket::WithContacts => Some(&self.with_contacts),
            Bucket::WithoutContacts => Some(&self.without_contacts),
            Bucket::All => self.all.as_deref(),
        }
    }

    /// Buckets that are populated, in display order.
    pub fn tracked(&self) -> Vec<Bucket> {
        Bucket::ALL
            .into_iter()
            .filter(|b| self.get(*b).is_some())
            .collect()
    }

    /// Total across `withContacts` and `withoutContacts`.
    pub fn total(&self) -> usize {
        self.with_contacts.len() + self.without_contacts.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(value: serde_json::Value) -> RawRecord {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn permit_from_raw_maps_schema_fields() {
        let permit = Permit::from_raw(&raw(json!({
            "bin__": "2013917",
            "filing_date": "2019-06-24 ",
            "owner_s_business_name": "SHAH GROUP ENTERPRISES INC",
            "owner_s_first_name": "Manjinder",
            "owner_s_last_name": "Singh",
            "owner_s_house__": "128-24",
            "owner_s_house_street_name": "140th  street",
            "city": "Jamaica",
            "state": "NY",
            "owner_s_zip_code": "11436",
            "owner_s_phone__": "7187389500",
            "job__": 12345
        })))
        .unwrap();

        assert_eq!(permit.bin.as_deref(), Some("2013917"));
        assert_eq!(
            permit.filing_date(),
            NaiveDate::from_ymd_opt(2019, 6, 24)
        );

        let contact = permit.contact();
        assert_eq!(contact.first_name.as_deref(), Some("MANJINDER"));
        assert_eq!(contact.address.as_deref(), Some("128-24 140TH STREET"));
        assert_eq!(contact.city.as_deref(), Some("JAMAICA"));
        assert_eq!(contact.phone.as_deref(), Some("7187389500"));
    }

    #[test]
    fn permit_contact_blanks_placeholder_company() {
        let permit = Permit {
            owner_business_name: Some("N/A".into()),
            ..Default::default()
        };
        let contact = permit.contact();
        assert_eq!(contact.company.as_deref(), Some(""));
        assert_eq!(contact.address, None);
        assert_eq!(contact.phone, None);
    }

    #[test]
    fn join_key_missing_parts() {
        assert!(JoinKey::bin("  ").is_missing());
        assert!(JoinKey::address("345", "").is_missing());
        assert!(JoinKey::block_lot("", "00012").is_missing());
        assert_eq!(
            JoinKey::address("345", "3  STREET"),
            JoinKey::Address {
                house_number: "345".into(),
                street_name: "3 STREET".into()
            }
        );
    }

    #[test]
    fn bucket_parses_both_spellings() {
        assert_eq!("withContacts".parse::<Bucket>(), Ok(Bucket::WithContacts));
        assert_eq!(
            "without-contacts".parse::<Bucket>(),
            Ok(Bucket::WithoutContacts)
        );
        assert!("contacts".parse::<Bucket>().is_err());
    }

    #[test]
    fn output_record_json_omits_absent_contact_fields() {
        let record = OutputRecord {
            date: "2021-08-06".into(),
            notes: "MICE".into(),
            contact: Contact::default(),
        };
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value, json!({ "date": "2021-08-06", "notes": "MICE" }));
        assert!(!record.has_phone());
    }
}
