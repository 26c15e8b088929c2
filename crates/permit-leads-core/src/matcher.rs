//! Permit matching.
//!
//! The matcher turns a source's normalized records into a SoQL filter over the
//! permits dataset, reduces the fetched permits to one per owner location, and
//! pairs each record with its best-matching permit.
//!
//! Join keys map onto permit columns as follows:
//!
//! | Key | Permit columns |
//! |-----|----------------|
//! | `Bin` | `bin__` |
//! | `Address` | `house__`, `street_name` |
//! | `BlockLot` | `block`, `lot` (zero-padded) |

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::models::{CleanRecord, JoinKey, Permit};
use crate::normalize::BLOCK_LOT_WIDTH;
use crate::source::JoinKeySpec;
use crate::text::{collapse_whitespace, soql_literal, zero_pad};

/// Default ceiling on the length of a permits `$where` expression.
pub const DEFAULT_MAX_FILTER_LEN: usize = 32_768;

/// Distinct resolvable join keys in first-seen order. Missing keys are skipped.
pub fn unique_keys(records: &[CleanRecord]) -> Vec<JoinKey> {
    let mut seen = HashSet::new();
    records
        .iter()
        .filter(|r| !r.join_key.is_missing())
        .filter(|r| seen.insert(&r.join_key))
        .map(|r| r.join_key.clone())
        .collect()
}

/// A permits query predicate built from a set of join keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PermitFilter {
    pub expression: String,
    /// Keys represented in `expression`.
    pub included: usize,
    /// Keys left out because they would have exceeded the length budget.
    pub dropped: usize,
}

impl PermitFilter {
    pub fn is_empty(&self) -> bool {
        self.expression.is_empty()
    }

    pub fn truncated(&self) -> bool {
        self.dropped > 0
    }
}

/// Build the permits filter for `keys`, keeping it within `max_len` characters.
///
/// Keys are considered in order; a key whose clause would push the expression
/// past the budget is dropped and later (shorter) keys may still fit. BIN keys
/// share a single `bin__ in(...)` clause listed first; pair keys each get a
/// parenthesized clause, all joined by `OR`.
pub fn build_permit_filter(keys: &[JoinKey], max_len: usize) -> PermitFilter {
    const BIN_OPEN: &str = "bin__ in(";
    const OR: &str = " OR ";

    let mut bins: Vec<String> = Vec::new();
    let mut clauses: Vec<String> = Vec::new();
    let mut len = 0usize;
    let mut dropped = 0usize;

    for key in keys {
        let any = !bins.is_empty() || !clauses.is_empty();
        match key {
            JoinKey::Bin(bin) => {
                let literal = soql_literal(bin);
                let extra = if bins.is_empty() {
                    BIN_OPEN.len() + literal.len() + 1 + if any { OR.len() } else { 0 }
                } else {
                    1 + literal.len()
                };
                if len + extra > max_len {
                    dropped += 1;
                    continue;
                }
                len += extra;
                bins.push(literal);
            }
            JoinKey::Missing => {}
            pair => {
                let clause = pair_clause(pair);
                let extra = clause.len() + if any { OR.len() } else { 0 };
                if len + extra > max_len {
                    dropped += 1;
                    continue;
                }
                len += extra;
                clauses.push(clause);
            }
        }
    }

    let included = bins.len() + clauses.len();
    let mut parts = Vec::with_capacity(clauses.len() + 1);
    if !bins.is_empty() {
        parts.push(format!("{}{})", BIN_OPEN, bins.join(",")));
    }
    parts.extend(clauses);

    PermitFilter {
        expression: parts.join(OR),
        included,
        dropped,
    }
}

fn pair_clause(key: &JoinKey) -> String {
    match key {
        JoinKey::Address {
            house_number,
            street_name,
        } => format!(
            "(house__ = {} AND street_name = {})",
            soql_literal(house_number),
            soql_literal(street_name)
        ),
        JoinKey::BlockLot { block, lot } => format!(
            "(block = {} AND lot = {})",
            soql_literal(block),
            soql_literal(lot)
        ),
        JoinKey::Bin(_) | JoinKey::Missing => String::new(),
    }
}

/// The join key a permit carries under the given key derivation.
pub fn permit_key(permit: &Permit, spec: &JoinKeySpec) -> JoinKey {
    let get = |v: &Option<String>| v.as_deref().unwrap_or_default().trim().to_string();
    match spec {
        JoinKeySpec::Bin { .. } => JoinKey::bin(&get(&permit.bin)),
        JoinKeySpec::Address { .. } => {
            JoinKey::address(&get(&permit.house_number), &get(&permit.street_name))
        }
        JoinKeySpec::BlockLot { .. } => {
            let pad = |v: &Option<String>| {
                let v = get(v);
                if v.is_empty() {
                    v
                } else {
                    zero_pad(&v, BLOCK_LOT_WIDTH)
                }
            };
            JoinKey::block_lot(&pad(&permit.block), &pad(&permit.lot))
        }
        JoinKeySpec::None => JoinKey::Missing,
    }
}

/// Which permit survives when several share an owner location.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupePolicy {
    /// Keep the first permit in API order.
    #[default]
    FirstSeen,
    /// Keep the permit with the latest `filing_date`; ties keep the earlier one.
    MostRecentFiling,
}

impl std::fmt::Display for DedupePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            DedupePolicy::FirstSeen => "first_seen",
            DedupePolicy::MostRecentFiling => "most_recent_filing",
        })
    }
}

type OwnerLocation = (JoinKey, String, String);

fn owner_location(permit: &Permit, spec: &JoinKeySpec) -> OwnerLocation {
    let norm = |v: &Option<String>| collapse_whitespace(v.as_deref().unwrap_or_default()).to_uppercase();
    (
        permit_key(permit, spec),
        norm(&permit.owner_house_number),
        norm(&permit.owner_street_name),
    )
}

/// Reduce permits to at most one per `(join key, owner house number, owner street)`.
///
/// Permits with no resolvable join key are discarded. Survivors keep the
/// position of the first permit seen for their owner location.
pub fn dedupe_permits(permits: Vec<Permit>, spec: &JoinKeySpec, policy: DedupePolicy) -> Vec<Permit> {
    let mut positions: HashMap<OwnerLocation, usize> = HashMap::new();
    let mut out: Vec<Permit> = Vec::new();

    for permit in permits {
        let location = owner_location(&permit, spec);
        if location.0.is_missing() {
            continue;
        }
        match positions.get(&location) {
            None => {
                positions.insert(location, out.len());
                out.push(permit);
            }
            Some(&index) => {
                if policy == DedupePolicy::MostRecentFiling
                    && permit.filing_date() > out[index].filing_date()
                {
                    out[index] = permit;
                }
            }
        }
    }

    out
}

/// First permit whose join key equals the record's; `None` for missing keys.
pub fn best_match<'a>(
    record: &CleanRecord,
    permits: &'a [Permit],
    spec: &JoinKeySpec,
) -> Option<&'a Permit> {
    if record.join_key.is_missing() {
        return None;
    }
    permits
        .iter()
        .find(|p| permit_key(p, spec) == record.join_key)
}

/// Hash index over deduplicated permits, equivalent to [`best_match`].
#[derive(Debug, Clone, Default)]
pub struct PermitIndex {
    permits: Vec<Permit>,
    by_key: HashMap<JoinKey, usize>,
}

impl PermitIndex {
    pub fn new(permits: Vec<Permit>, spec: &JoinKeySpec) -> Self {
        let mut by_key = HashMap::new();
        for (i, permit) in permits.iter().enumerate() {
            let key = permit_key(permit, spec);
            if !key.is_missing() {
                by_key.entry(key).or_insert(i);
            }
        }
        Self { permits, by_key }
    }

    pub fn get(&self, key: &JoinKey) -> Option<&Permit> {
        if key.is_missing() {
            return None;
        }
        self.by_key.get(key).map(|&i| &self.permits[i])
    }

    pub fn len(&self) -> usize {
        self.permits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.permits.is_empty()
    }

    pub fn permits(&self) -> &[Permit] {
        &self.permits
    }
}
