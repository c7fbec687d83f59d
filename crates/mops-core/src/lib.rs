//! Core disclosure model, listing-key normalization and record matching for the MOPS digest.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "mops-core";

pub const COMPANY_ID_KEY: &str = "companyId";
pub const HYPERLINK_KEY: &str = "hyperlink";

/// One listing row exactly as the remote service keyed it.
pub type RawRow = BTreeMap<String, String>;

/// Listing row whose keys have all been rewritten to canonical camelCase.
///
/// Only [`normalize_row`] builds one, so nothing downstream ever sees a raw key.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct CanonicalRow(BTreeMap<String, String>);

impl CanonicalRow {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }
}

impl From<CanonicalRow> for RawRow {
    fn from(row: CanonicalRow) -> Self {
        row.0
    }
}

/// Rewrite a raw field name into camelCase (`CO_ID` -> `coId`).
///
/// Keys that already look canonical (no separators, no leading capital) are
/// returned untouched. Anything else comes out purely alphanumeric, so a second
/// pass always takes that early return.
pub fn canonical_key(raw: &str) -> String {
    let already_canonical = raw.chars().all(char::is_alphanumeric)
        && !raw.chars().next().is_some_and(char::is_uppercase);
    if already_canonical {
        return raw.to_string();
    }

    let mut out = String::with_capacity(raw.len());
    for (i, word) in split_words(raw).iter().enumerate() {
        let lower = word.to_lowercase();
        if i == 0 {
            out.extend(lower.chars().filter(|c| c.is_alphanumeric()));
            continue;
        }
        let mut chars = lower.chars();
        if let Some(first) = chars.next() {
            out.extend(first.to_uppercase().filter(|c| c.is_alphanumeric()));
            out.extend(chars.filter(|c| c.is_alphanumeric()));
        }
    }
    out
}

fn split_words(raw: &str) -> Vec<String> {
    let mut words = Vec::new();
    for chunk in raw
        .split(|c: char| !c.is_alphanumeric())
        .filter(|chunk| !chunk.is_empty())
    {
        let chars: Vec<char> = chunk.chars().collect();
        let mut current = String::new();
        for (i, &ch) in chars.iter().enumerate() {
            if i > 0 && ch.is_uppercase() {
                let prev = chars[i - 1];
                let next_is_lower = chars.get(i + 1).is_some_and(|c| c.is_lowercase());
                if prev.is_lowercase() || prev.is_numeric() || (prev.is_uppercase() && next_is_lower) {
                    words.push(std::mem::take(&mut current));
                }
            }
            current.push(ch);
        }
        if !current.is_empty() {
            words.push(current);
        }
    }
    words
}

/// Normalize every key of one row; on a canonical-key collision the first raw key wins.
pub fn normalize_row(raw: &RawRow) -> CanonicalRow {
    let mut out = BTreeMap::new();
    for (key, value) in raw {
        out.entry(canonical_key(key)).or_insert_with(|| value.clone());
    }
    CanonicalRow(out)
}

pub fn normalize_rows(rows: &[RawRow]) -> Vec<CanonicalRow> {
    rows.iter().map(normalize_row).collect()
}

/// Date range handed to the bulk listing query, in the remote service's own date format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingWindow {
    pub start_date: String,
    pub end_date: String,
}

/// One company's disclosure entry from the bulk listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DisclosureRecord {
    pub company_id: String,
    /// Query-string fragment (or partial URL) pointing at the detail page.
    pub hyperlink: String,
    pub fields: CanonicalRow,
}

impl DisclosureRecord {
    /// Returns `None` when the row carries no `companyId`.
    pub fn from_row(fields: CanonicalRow) -> Option<Self> {
        let company_id = fields.get(COMPANY_ID_KEY)?.to_string();
        let hyperlink = fields.get(HYPERLINK_KEY).unwrap_or_default().to_string();
        Some(Self {
            company_id,
            hyperlink,
            fields,
        })
    }

    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields.get(key)
    }
}

/// Immutable lookup from `companyId` to the first record listed with it.
#[derive(Debug, Clone, Default)]
pub struct RecordIndex {
    records: Vec<DisclosureRecord>,
    by_company: HashMap<String, usize>,
}

impl RecordIndex {
    pub fn new(records: Vec<DisclosureRecord>) -> Self {
        let mut by_company = HashMap::with_capacity(records.len());
        for (position, record) in records.iter().enumerate() {
            by_company
                .entry(record.company_id.clone())
                .or_insert(position);
        }
        Self {
            records,
            by_company,
        }
    }

    /// Exact, case-sensitive match on `companyId`.
    pub fn lookup(&self, stock_id: &str) -> Option<&DisclosureRecord> {
        self.by_company
            .get(stock_id)
            .and_then(|&position| self.records.get(position))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Listed records shadowed by an earlier record with the same `companyId`.
    pub fn shadowed_duplicates(&self) -> usize {
        self.records.len() - self.by_company.len()
    }
}

/// Per-identifier outcome of the resolve stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Resolution {
    Detailed { stock_id: String, fragment: String },
    NoDetail { stock_id: String },
    Unmatched { stock_id: String },
}

impl Resolution {
    pub fn stock_id(&self) -> &str {
        match self {
            Resolution::Detailed { stock_id, .. }
            | Resolution::NoDetail { stock_id }
            | Resolution::Unmatched { stock_id } => stock_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(pairs: &[(&str, &str)]) -> RawRow {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn record(company_id: &str, hyperlink: &str) -> DisclosureRecord {
        DisclosureRecord::from_row(normalize_row(&raw(&[
            ("COMPANY_ID", company_id),
            ("HYPERLINK", hyperlink),
        ])))
        .expect("record has companyId")
    }

    #[test]
    fn canonical_key_handles_upper_snake_and_mixed_casing() {
        assert_eq!(canonical_key("CO_ID"), "coId");
        assert_eq!(canonical_key("COMPANY_ID"), "companyId");
        assert_eq!(canonical_key("HYPERLINK"), "hyperlink");
        assert_eq!(canonical_key("company-name"), "companyName");
        assert_eq!(canonical_key("CompanyName"), "companyName");
        assert_eq!(canonical_key("HTTPServer"), "httpServer");
        assert_eq!(canonical_key("SPOKE_DATE_2"), "spokeDate2");
        assert_eq!(canonical_key("公司_代號"), "公司代號");
        assert_eq!(canonical_key("__"), "");
    }

    #[test]
    fn canonical_key_is_idempotent() {
        for key in ["CO_ID", "A_B_C", "x-y", "HTTPServer", "Subject", "SPOKE_DATE_2"] {
            let once = canonical_key(key);
            assert_eq!(canonical_key(&once), once, "{key}");
        }
    }

    #[test]
    fn canonical_key_drops_marks_that_lowercasing_introduces() {
        // U+0130 lowercases to "i" plus a combining dot, which is not alphanumeric.
        let once = canonical_key("A_\u{130}");
        assert!(once.chars().all(char::is_alphanumeric), "{once:?}");
        assert_eq!(canonical_key(&once), once);
        assert_eq!(canonical_key("\u{130}_X"), "iX");
    }

    #[test]
    fn normalize_row_rewrites_keys_and_keeps_values() {
        let row = normalize_row(&raw(&[("CO_ID", "1101"), ("SUBJECT", "x")]));
        assert_eq!(
            RawRow::from(row),
            raw(&[("coId", "1101"), ("subject", "x")])
        );
    }

    #[test]
    fn normalizing_a_canonical_row_is_a_no_op() {
        let canonical = raw(&[("coId", "1101"), ("subject", " spaced  value ")]);
        assert_eq!(RawRow::from(normalize_row(&canonical)), canonical);
    }

    #[test]
    fn key_collisions_keep_the_first_raw_key() {
        // BTreeMap order: "CO_ID" sorts before "coId".
        let row = normalize_row(&raw(&[("coId", "later"), ("CO_ID", "first")]));
        assert_eq!(row.get("coId"), Some("first"));
        assert_eq!(RawRow::from(row).len(), 1);
    }

    #[test]
    fn rows_without_company_id_are_not_records() {
        let row = normalize_row(&raw(&[("SUBJECT", "x")]));
        assert!(DisclosureRecord::from_row(row).is_none());

        let row = normalize_row(&raw(&[("COMPANY_ID", "2330")]));
        let record = DisclosureRecord::from_row(row).unwrap();
        assert_eq!(record.hyperlink, "");
    }

    #[test]
    fn index_lookup_is_exact_and_first_wins() {
        let index = RecordIndex::new(vec![
            record("1101", "a=1"),
            record("2330", "b=2"),
            record("1101", "a=2"),
        ]);
        assert_eq!(index.lookup("1101").map(|r| r.hyperlink.as_str()), Some("a=1"));
        assert_eq!(index.lookup("2330").map(|r| r.hyperlink.as_str()), Some("b=2"));
        assert!(index.lookup("9999").is_none());
        assert!(index.lookup("1101 ").is_none());
        assert_eq!(index.len(), 3);
        assert_eq!(index.shadowed_duplicates(), 1);
    }

    #[test]
    fn index_lookup_is_case_sensitive() {
        let index = RecordIndex::new(vec![record("abc", "x=1")]);
        assert!(index.lookup("ABC").is_none());
        assert!(index.lookup("abc").is_some());
    }

    #[test]
    fn resolution_stock_id_covers_every_outcome() {
        let detailed = Resolution::Detailed {
            stock_id: "1101".into(),
            fragment: "<table></table>".into(),
        };
        assert_eq!(detailed.stock_id(), "1101");
        assert_eq!(Resolution::NoDetail { stock_id: "2330".into() }.stock_id(), "2330");
        assert_eq!(Resolution::Unmatched { stock_id: "9".into() }.stock_id(), "9");
    }
}
