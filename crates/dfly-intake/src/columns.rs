//! Header normalization and column aliasing for intake CSV files.
//!
//! Export sources disagree on column naming ("Case #", "index_number",
//! "docket"), so headers are normalized and matched against a canonical
//! alias table. Columns that match nothing are kept in a separate raw map
//! for audit; they never flow into the typed judgment entity.

use std::collections::HashMap;

use csv::StringRecord;

/// Canonical field names of the judgment entity, in ingest order.
pub const CANONICAL_FIELDS: &[&str] = &[
    "case_number",
    "plaintiff_name",
    "defendant_name",
    "judgment_amount",
    "judgment_date",
    "court",
    "county",
];

/// Alias table: canonical name to the source spellings that map onto it.
pub const COLUMN_ALIASES: &[(&str, &[&str])] = &[
    (
        "case_number",
        &[
            "case_number",
            "case #",
            "case#",
            "caseno",
            "case_no",
            "index_number",
            "index number",
            "index #",
            "index#",
            "docket_number",
            "docket",
            "matter_id",
        ],
    ),
    (
        "plaintiff_name",
        &["plaintiff_name", "plaintiff", "creditor", "creditor_name", "title", "petitioner"],
    ),
    (
        "defendant_name",
        &["defendant_name", "defendant", "debtor", "debtor_name", "respondent"],
    ),
    (
        "judgment_amount",
        &[
            "judgment_amount",
            "amount_awarded",
            "amount",
            "total_amount",
            "judgment_amt",
            "principal",
            "principal_amount",
        ],
    ),
    (
        "judgment_date",
        &[
            "judgment_date",
            "entry_date",
            "filing_date",
            "date_filed",
            "date_entered",
            "decision_date",
        ],
    ),
    ("court", &["court", "court_name", "court_type", "venue"]),
    ("county", &["county", "county_name", "jurisdiction"]),
];

/// Normalize a column name: lowercase, trim, spaces/dashes/`#` to
/// underscores, runs collapsed, edges trimmed.
///
/// "Case #", "case#" and "CASE" all normalize to "case"; "Index Number"
/// normalizes to "index_number".
pub fn normalize_column_name(col: &str) -> String {
    let mut out = String::with_capacity(col.len());
    let mut last_was_sep = true; // suppress a leading underscore
    for ch in col.trim().chars() {
        let mapped = match ch {
            ' ' | '-' | '#' | '_' => None,
            other => Some(other.to_ascii_lowercase()),
        };
        match mapped {
            Some(c) => {
                out.push(c);
                last_was_sep = false;
            }
            None => {
                if !last_was_sep {
                    out.push('_');
                    last_was_sep = true;
                }
            }
        }
    }
    while out.ends_with('_') {
        out.pop();
    }
    out
}

/// How one CSV column maps into a row.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ColumnTarget {
    Canonical(&'static str),
    Raw(String),
}

/// Resolved header layout for one file.
#[derive(Debug, Clone)]
pub struct HeaderMap {
    targets: Vec<ColumnTarget>,
}

impl HeaderMap {
    /// Build the header map. The first column matching a canonical field
    /// wins; later duplicates fall through to the raw map.
    pub fn build(headers: &StringRecord) -> Self {
        let mut claimed: HashMap<&'static str, ()> = HashMap::new();
        let mut targets = Vec::with_capacity(headers.len());

        for header in headers.iter() {
            let normalized = normalize_column_name(header);
            let canonical = COLUMN_ALIASES.iter().find_map(|(canonical, aliases)| {
                aliases
                    .iter()
                    .any(|a| normalize_column_name(a) == normalized)
                    .then_some(*canonical)
            });

            match canonical {
                Some(c) if !claimed.contains_key(c) => {
                    claimed.insert(c, ());
                    targets.push(ColumnTarget::Canonical(c));
                }
                _ => targets.push(ColumnTarget::Raw(header.trim().to_string())),
            }
        }

        HeaderMap { targets }
    }

    /// Names of the canonical fields this file actually provides.
    pub fn mapped_fields(&self) -> Vec<&'static str> {
        self.targets
            .iter()
            .filter_map(|t| match t {
                ColumnTarget::Canonical(c) => Some(*c),
                ColumnTarget::Raw(_) => None,
            })
            .collect()
    }

    /// Project a CSV record into canonical + raw maps.
    pub fn project(&self, record: &StringRecord) -> RowData {
        let mut canonical = HashMap::new();
        let mut raw = HashMap::new();

        for (i, target) in self.targets.iter().enumerate() {
            let Some(value) = record.get(i) else { continue };
            match target {
                ColumnTarget::Canonical(c) => {
                    canonical.insert(*c, value.to_string());
                }
                ColumnTarget::Raw(name) => {
                    raw.insert(name.clone(), value.to_string());
                }
            }
        }

        RowData { canonical, raw }
    }
}

/// One CSV row split into the canonical field map and the audit-only raw
/// remainder.
#[derive(Debug, Clone, Default)]
pub struct RowData {
    pub canonical: HashMap<&'static str, String>,
    pub raw: HashMap<String, String>,
}

impl RowData {
    pub fn get(&self, field: &str) -> Option<&str> {
        self.canonical.get(field).map(|s| s.as_str())
    }

    /// True when every cell is empty after trimming (a blank filler line).
    pub fn is_blank(&self) -> bool {
        self.canonical.values().all(|v| v.trim().is_empty())
            && self.raw.values().all(|v| v.trim().is_empty())
    }
}
