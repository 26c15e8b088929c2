//! String helpers shared by the normalizer, matcher, and classifier.

use anyhow::{bail, Result};
use chrono::NaiveDate;

/// Collapse every run of whitespace to a single space and trim both ends.
pub fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Parse the calendar date out of an API timestamp.
///
/// Accepts `2021-08-06T00:00:00.000`, `2019-06-24 `, and `08/06/2021`.
/// The time component, if any, is discarded.
pub fn parse_date(s: &str) -> Option<NaiveDate> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if let Some(prefix) = s.get(..10) {
        if let Ok(d) = NaiveDate::parse_from_str(prefix, "%Y-%m-%d") {
            return Some(d);
        }
        if let Ok(d) = NaiveDate::parse_from_str(prefix, "%m/%d/%Y") {
            return Some(d);
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()
}

/// Left-pad a numeric string with zeros to `width` characters.
///
/// Strings already at least `width` long are returned unchanged.
pub fn zero_pad(s: &str, width: usize) -> String {
    format!("{:0>width$}", s.trim(), width = width)
}

/// Split an address at its first space into `(house_number, street_name)`.
///
/// `"345 3 STREET"` becomes `("345", "3 STREET")`. An address without a space
/// yields an empty street name.
pub fn split_address(address: &str) -> (String, String) {
    let address = collapse_whitespace(address);
    match address.split_once(' ') {
        Some((house, street)) => (house.to_string(), street.to_string()),
        None => (address, String::new()),
    }
}

/// Quote a literal for a SoQL expression, doubling embedded single quotes.
pub fn soql_literal(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

/// Blank out placeholder company names (`NA`, `N/A`, case-insensitive).
pub fn normalize_company(company: &str) -> String {
    let trimmed = company.trim();
    if trimmed.eq_ignore_ascii_case("NA") || trimmed.eq_ignore_ascii_case("N/A") {
        String::new()
    } else {
        trimmed.to_string()
    }
}

/// A piece of a parsed [`Template`].
#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Field(String),
}

/// A `{field}` placeholder template used to build record notes.
///
/// `"{housenumber} {streetname} HAS {description}"` renders each placeholder
/// from a lookup function. Unknown or empty fields render as nothing, and the
/// result has its whitespace collapsed so missing parts leave no gaps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    segments: Vec<Segment>,
}

impl Template {
    pub fn parse(source: &str) -> Result<Self> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = source.chars();

        while let Some(c) = chars.next() {
            match c {
                '{' => {
                    let mut name = String::new();
                    let mut closed = false;
                    for c in chars.by_ref() {
                        if c == '}' {
                            closed = true;
                            break;
                        }
                        name.push(c);
                    }
                    if !closed {
                        bail!("unclosed '{{' in template: {}", source);
                    }
                    let name = name.trim();
                    if name.is_empty() {
                        bail!("empty placeholder in template: {}", source);
                    }
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(Segment::Field(name.to_string()));
                }
                '}' => bail!("unmatched '}}' in template: {}", source),
                other => literal.push(other),
            }
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(Self { segments })
    }

    /// Names of all placeholders, in order of appearance.
    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Field(name) => Some(name.as_str()),
            Segment::Literal(_) => None,
        })
    }

    pub fn render<'a, F>(&self, lookup: F) -> String
    where
        F: Fn(&str) -> Option<&'a str>,
    {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Field(name) => {
                    if let Some(value) = lookup(name) {
                        out.push_str(value);
                    }
                }
            }
        }
        collapse_whitespace(&out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collapse_whitespace_runs() {
        assert_eq!(collapse_whitespace("  12   EAST    4 ST "), "12 EAST 4 ST");
        assert_eq!(collapse_whitespace(""), "");
    }

    #[test]
    fn parse_date_formats() {
        let expected = NaiveDate::from_ymd_opt(2021, 8, 6).unwrap();
        assert_eq!(parse_date("2021-08-06T00:00:00.000"), Some(expected));
        assert_eq!(parse_date("2021-08-06 "), Some(expected));
        assert_eq!(parse_date("08/06/2021"), Some(expected));
        assert_eq!(parse_date("not a date"), None);
        assert_eq!(parse_date(""), None);
    }

    #[test]
    fn zero_pad_to_five() {
        assert_eq!(zero_pad("123", 5), "00123");
        assert_eq!(zero_pad("12345", 5), "12345");
        assert_eq!(zero_pad("1234567", 5), "1234567");
    }

    #[test]
    fn split_address_first_space() {
        assert_eq!(
            split_address("345  3 STREET"),
            ("345".to_string(), "3 STREET".to_string())
        );
        assert_eq!(split_address("345"), ("345".to_string(), String::new()));
    }

    #[test]
    fn soql_literal_escapes_quotes() {
        assert_eq!(soql_literal("O'BRIEN"), "'O''BRIEN'");
    }

    #[test]
    fn company_placeholders_blank() {
        assert_eq!(normalize_company("NA"), "");
        assert_eq!(normalize_company("n/a"), "");
        assert_eq!(normalize_company(" N/A "), "");
        assert_eq!(normalize_company("NAPA REALTY"), "NAPA REALTY");
    }

    #[test]
    fn template_renders_and_skips_missing() {
        let t = Template::parse("{house} {street} HAS {description}").unwrap();
        let rendered = t.render(|name| match name {
            "street" => Some("EAST 184 STREET"),
            "description" => Some("MICE"),
            _ => None,
        });
        assert_eq!(rendered, "EAST 184 STREET HAS MICE");
        assert_eq!(
            t.fields().collect::<Vec<_>>(),
            vec!["house", "street", "description"]
        );
    }

    #[test]
    fn template_rejects_unbalanced_braces() {
        assert!(Template::parse("{house").is_err());
        assert!(Template::parse("house}").is_err());
        assert!(Template::parse("{}").is_err());
    }
}
