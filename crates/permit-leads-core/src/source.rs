//! Per-source pipeline descriptors.
//!
//! Every municipal dataset runs through the same fetch → normalize → match →
//! classify pipeline. What differs between datasets is captured here as data:
//! where the records live, how their join key is derived, how their free-text
//! description is cleaned, and how notes are rendered.
//!
//! Descriptors deserialize from TOML, so additional datasets can be declared
//! in configuration without code changes:
//!
//! ```toml
//! [[custom_sources]]
//! name = "heat"
//! label = "Heat"
//! endpoint = "/abcd-1234.json"
//! date_field = "received_date"
//! join_key = { kind = "bin", field = "bin" }
//! notes_template = "{address} {description}"
//! description_field = "problem"
//! ```

use anyhow::{bail, Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::text::Template;

/// How a record's [`JoinKey`](crate::models::JoinKey) is derived.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JoinKeySpec {
    /// Pass an identifier field through unchanged.
    Bin { field: String },
    /// Split a single address field at the first space.
    Address { field: String },
    /// Zero-pad block and lot fields to five digits.
    BlockLot { block_field: String, lot_field: String },
    /// The source is not joined against permits.
    None,
}

impl JoinKeySpec {
    pub fn describe(&self) -> String {
        match self {
            JoinKeySpec::Bin { field } => format!("bin({})", field),
            JoinKeySpec::Address { field } => format!("address({})", field),
            JoinKeySpec::BlockLot {
                block_field,
                lot_field,
            } => format!("block/lot({}, {})", block_field, lot_field),
            JoinKeySpec::None => "none".to_string(),
        }
    }
}

/// Record fields that hold contact data for sources that carry it inline.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct InlineContact {
    #[serde(default)]
    pub company_field: Option<String>,
    /// Joined with a space, skipping empty parts.
    #[serde(default)]
    pub address_fields: Vec<String>,
    #[serde(default)]
    pub city_field: Option<String>,
    #[serde(default)]
    pub zip_field: Option<String>,
    #[serde(default)]
    pub phone_field: Option<String>,
}

/// Where an output record's contact columns come from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContactSpec {
    /// Best-matching permit owner.
    #[default]
    Permits,
    /// Fields on the record itself.
    Inline(InlineContact),
}

/// A regex replacement applied to the description field.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct CleanupRule {
    pub pattern: String,
    #[serde(default)]
    pub replace: String,
}

/// Prepend `field` to the description unless it equals `unless`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct PrefixRule {
    pub field: String,
    #[serde(default)]
    pub unless: Option<String>,
}

/// Declarative description of one data source.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct SourceDescriptor {
    /// Identifier used in routes and file names (e.g. `"dob"`).
    pub name: String,
    /// Short tag used in progress lines (e.g. `"DOB"`). Defaults to the upper-cased name.
    #[serde(default)]
    pub label: Option<String>,
    /// Resource path of the records endpoint, relative to the API base URL.
    pub endpoint: String,
    /// SoQL predicate ANDed into every records query.
    #[serde(default)]
    pub filter: Option<String>,
    /// Field used for the time window and for record dates.
    pub date_field: String,
    /// Sort field; always descending. Defaults to `date_field`.
    #[serde(default)]
    pub order_by: Option<String>,
    pub join_key: JoinKeySpec,
    #[serde(default)]
    pub contact: ContactSpec,
    /// Fields whose internal whitespace is collapsed before key derivation.
    #[serde(default)]
    pub address_fields: Vec<String>,
    /// Fields that identify a site for the adjacency fold; empty disables folding.
    #[serde(default)]
    pub site_fields: Vec<String>,
    /// Free-text field cleaned by `cleanup` and folded across records.
    #[serde(default)]
    pub description_field: Option<String>,
    #[serde(default)]
    pub description_prefix: Option<PrefixRule>,
    #[serde(default)]
    pub cleanup: Vec<CleanupRule>,
    /// Notes template; `{description}` is the cleaned, folded description.
    pub notes_template: String,
    /// Drop records whose date is missing or in the future.
    #[serde(default)]
    pub drop_undated: bool,
}

impl SourceDescriptor {
    pub fn label(&self) -> String {
        self.label
            .clone()
            .unwrap_or_else(|| self.name.to_uppercase())
    }

    pub fn order_by(&self) -> &str {
        self.order_by.as_deref().unwrap_or(&self.date_field)
    }

    /// Whether records are joined against the permits dataset.
    pub fn uses_permits(&self) -> bool {
        matches!(self.contact, ContactSpec::Permits) && self.join_key != JoinKeySpec::None
    }
}

/// A [`SourceDescriptor`] with its regexes and template compiled.
#[derive(Debug, Clone)]
pub struct SourceRules {
    pub descriptor: SourceDescriptor,
    pub cleanup: Vec<(Regex, String)>,
    pub notes: Template,
}

impl SourceRules {
    pub fn compile(descriptor: SourceDescriptor) -> Result<Self> {
        if descriptor.name.trim().is_empty() {
            bail!("source name must not be empty");
        }
        if descriptor.name.contains(['/', ' ', '.']) {
            bail!(
                "source name '{}' must not contain '/', '.', or spaces",
                descriptor.name
            );
        }
        if descriptor.endpoint.trim().is_empty() {
            bail!("source '{}': endpoint must not be empty", descriptor.name);
        }
        if descriptor.date_field.trim().is_empty() {
            bail!("source '{}': date_field must not be empty", descriptor.name);
        }
        if matches!(descriptor.contact, ContactSpec::Permits)
            && descriptor.join_key == JoinKeySpec::None
        {
            bail!(
                "source '{}': contact = permits requires a join_key",
                descriptor.name
            );
        }

        let cleanup = descriptor
            .cleanup
            .iter()
            .map(|rule| {
                Regex::new(&rule.pattern)
                    .map(|re| (re, rule.replace.clone()))
                    .with_context(|| {
                        format!(
                            "source '{}': invalid cleanup pattern '{}'",
                            descriptor.name, rule.pattern
                        )
                    })
            })
            .collect::<Result<Vec<_>>>()?;

        let notes = Template::parse(&descriptor.notes_template)
            .with_context(|| format!("source '{}': invalid notes_template", descriptor.name))?;

        Ok(Self {
            descriptor,
            cleanup,
            notes,
        })
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }
}

/// Descriptors for the datasets supported out of the box.
pub fn builtin_descriptors() -> Vec<SourceDescriptor> {
    vec![
        SourceDescriptor {
            name: "dob".into(),
            label: Some("DOB".into()),
            endpoint: "/mkgf-zjhb.json".into(),
            filter: None,
            date_field: "inspectiondate".into(),
            order_by: None,
            join_key: JoinKeySpec::Bin {
                field: "bin".into(),
            },
            contact: ContactSpec::Permits,
            address_fields: vec!["housenumber".into(), "streetname".into()],
            site_fields: vec![
                "housenumber".into(),
                "streetname".into(),
                "apartment".into(),
            ],
            description_field: Some("novdescription".into()),
            description_prefix: None,
            cleanup: vec![
                CleanupRule {
                    pattern: r".+CONSISTING OF ".into(),
                    replace: String::new(),
                },
                CleanupRule {
                    pattern: r"IN THE ENTIRE APARTMENT LOCATED AT ".into(),
                    replace: String::new(),
                },
                CleanupRule {
                    pattern: r", \d+?.. STORY, .+".into(),
                    replace: String::new(),
                },
            ],
            notes_template: "{housenumber} {streetname} {boro} {zip} HAS {description}".into(),
            drop_undated: false,
        },
        SourceDescriptor {
            name: "complaints".into(),
            label: Some("311".into()),
            endpoint: "/erm2-nwe9.json".into(),
            filter: Some("descriptor in('PESTS') OR complaint_type = 'Rodent'".into()),
            date_field: "created_date".into(),
            order_by: None,
            join_key: JoinKeySpec::Address {
                field: "incident_address".into(),
            },
            contact: ContactSpec::Permits,
            address_fields: vec!["incident_address".into()],
            site_fields: vec!["incident_address".into()],
            description_field: Some("descriptor".into()),
            description_prefix: Some(PrefixRule {
                field: "complaint_type".into(),
                unless: None,
            }),
            cleanup: Vec::new(),
            notes_template: "{incident_address} {borough} {incident_zip} 311 COMPLAINT: {description}"
                .into(),
            drop_undated: false,
        },
        SourceDescriptor {
            name: "inspections".into(),
            label: Some("Inspections".into()),
            endpoint: "/p937-wjvj.json".into(),
            filter: Some("result not in('Passed')".into()),
            date_field: "inspection_date".into(),
            order_by: None,
            join_key: JoinKeySpec::BlockLot {
                block_field: "block".into(),
                lot_field: "lot".into(),
            },
            contact: ContactSpec::Permits,
            address_fields: vec!["house_number".into(), "street_name".into()],
            site_fields: Vec::new(),
            description_field: Some("result".into()),
            description_prefix: None,
            cleanup: Vec::new(),
            notes_template:
                "{house_number} {street_name} {borough} {zip_code} {inspection_type} INSPECTION: {description}"
                    .into(),
            drop_undated: true,
        },
        SourceDescriptor {
            name: "doh".into(),
            label: Some("DOH".into()),
            endpoint: "/43nn-pn8j.json".into(),
            filter: Some("violation_code in('04L','04K','04M','04N','08A','08C')".into()),
            date_field: "inspection_date".into(),
            order_by: None,
            join_key: JoinKeySpec::None,
            contact: ContactSpec::Inline(InlineContact {
                company_field: Some("dba".into()),
                address_fields: vec!["building".into(), "street".into()],
                city_field: Some("boro".into()),
                zip_field: Some("zipcode".into()),
                phone_field: Some("phone".into()),
            }),
            address_fields: vec!["building".into(), "street".into()],
            site_fields: vec!["building".into(), "street".into()],
            description_field: Some("violation_description".into()),
            description_prefix: Some(PrefixRule {
                field: "action".into(),
                unless: Some("Violations were cited in the following area(s).".into()),
            }),
            cleanup: Vec::new(),
            notes_template: "{description}".into(),
            drop_undated: false,
        },
    ]
}
