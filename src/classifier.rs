//! Report classification and structural schema checks.
//!
//! Rules are evaluated in order, first match wins:
//! 1. filename glob per report kind (case-insensitive);
//! 2. header column signatures;
//! 3. filename keywords;
//! 4. `unknown`.

use crate::models::{PageKind, ReportKind};
use globset::{GlobBuilder, GlobMatcher};
use once_cell::sync::Lazy;
use tracing::warn;

const FILENAME_PATTERNS: &[(ReportKind, &str)] = &[
    (ReportKind::Orders, "ebay-awaiting-shipment-report-*.csv"),
    (ReportKind::Listings, "ebay-all-active-listings-report-*.csv"),
    (ReportKind::SoldListings, "ebay-sold-listings-report-*.csv"),
];

static FILENAME_RULES: Lazy<Vec<(ReportKind, GlobMatcher)>> = Lazy::new(|| {
    FILENAME_PATTERNS
        .iter()
        .filter_map(|(kind, pattern)| {
            match GlobBuilder::new(pattern).case_insensitive(true).build() {
                Ok(glob) => Some((*kind, glob.compile_matcher())),
                Err(err) => {
                    warn!(target = "ingest.capture", pattern, error = %err, "report_pattern_invalid");
                    None
                }
            }
        })
        .collect()
});

pub fn classify(filename: &str, url: Option<&str>, header_line: Option<&str>) -> ReportKind {
    let name = effective_filename(filename, url);

    if let Some(kind) = match_filename(&name) {
        return kind;
    }

    if let Some(kind) = header_line.and_then(match_header) {
        return kind;
    }

    let lowered = name.to_lowercase();
    if lowered.contains("order") || lowered.contains("shipment") {
        return ReportKind::Orders;
    }
    if lowered.contains("listing") || lowered.contains("active") {
        return ReportKind::Listings;
    }

    ReportKind::Unknown
}

/// Classifies from raw CSV bytes, peeking the first non-empty line as the header.
pub fn classify_payload(filename: &str, url: Option<&str>, payload: &[u8]) -> ReportKind {
    let header = header_line(payload);
    classify(filename, url, header.as_deref())
}

/// Filename-only check used by the download observer before any bytes exist.
pub fn matches_report_filename(filename: &str, url: Option<&str>) -> bool {
    classify(filename, url, None) != ReportKind::Unknown
}

pub fn classify_page(url: &str) -> PageKind {
    let lowered = url.to_lowercase();
    if lowered.contains("/ord") || lowered.contains("awaiting") || lowered.contains("orders") {
        PageKind::Orders
    } else if lowered.contains("/lstng") || lowered.contains("listing") || lowered.contains("/active")
    {
        PageKind::Listings
    } else {
        PageKind::Unknown
    }
}

fn effective_filename(filename: &str, url: Option<&str>) -> String {
    let base = basename(filename);
    if !base.is_empty() {
        return base.to_string();
    }
    url.and_then(|raw| reqwest::Url::parse(raw).ok())
        .and_then(|parsed| {
            parsed
                .path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_string))
        })
        .unwrap_or_default()
}

fn basename(path: &str) -> &str {
    path.trim()
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
}

fn match_filename(name: &str) -> Option<ReportKind> {
    FILENAME_RULES
        .iter()
        .find(|(_, matcher)| matcher.is_match(name))
        .map(|(kind, _)| *kind)
}

fn match_header(line: &str) -> Option<ReportKind> {
    let columns = parse_columns(line);
    let has = |name: &str| columns.iter().any(|col| col == name);

    if has("sales record number") {
        Some(ReportKind::Orders)
    } else if has("item number") && has("sold for") {
        Some(ReportKind::SoldListings)
    } else if has("item number") && has("current price") {
        Some(ReportKind::Listings)
    } else {
        None
    }
}

/// Lowercased, trimmed header column names; tolerates quoted fields.
fn parse_columns(line: &str) -> Vec<String> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(line.as_bytes());
    match reader.records().next() {
        Some(Ok(record)) => record
            .iter()
            .map(|col| col.trim().trim_start_matches('\u{FEFF}').to_lowercase())
            .collect(),
        _ => line
            .split(',')
            .map(|col| col.trim().trim_matches('"').to_lowercase())
            .collect(),
    }
}

/// First non-empty line of the payload, BOM stripped.
pub fn header_line(payload: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(payload);
    text.trim_start_matches('\u{FEFF}')
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
}

/// Structural expectations for a report kind. Column names compare
/// case-insensitively.
#[derive(Debug, Clone, Copy)]
pub struct ReportSchema {
    pub kind: ReportKind,
    pub required: &'static [&'static str],
    pub optional: &'static [&'static str],
    pub min_data_rows: usize,
}

pub const ORDERS_SCHEMA: ReportSchema = ReportSchema {
    kind: ReportKind::Orders,
    required: &["Sales Record Number", "Order Number", "Item Number"],
    optional: &[
        "Buyer Username",
        "Buyer Name",
        "Ship To Name",
        "Quantity",
        "Sold For",
        "Total Price",
        "Sale Date",
        "Tracking Number",
    ],
    min_data_rows: 0,
};

pub const LISTINGS_SCHEMA: ReportSchema = ReportSchema {
    kind: ReportKind::Listings,
    required: &["Item number", "Title", "Current price"],
    optional: &[
        "Custom label (SKU)",
        "Available quantity",
        "Format",
        "Currency",
        "Start date",
    ],
    min_data_rows: 0,
};

pub const SOLD_LISTINGS_SCHEMA: ReportSchema = ReportSchema {
    kind: ReportKind::SoldListings,
    required: &["Item number", "Title", "Sold for"],
    optional: &["Sold date", "Quantity sold", "Custom label (SKU)", "Buyer username"],
    min_data_rows: 0,
};

pub fn schema_for(kind: ReportKind) -> Option<&'static ReportSchema> {
    match kind {
        ReportKind::Orders => Some(&ORDERS_SCHEMA),
        ReportKind::Listings => Some(&LISTINGS_SCHEMA),
        ReportKind::SoldListings => Some(&SOLD_LISTINGS_SCHEMA),
        ReportKind::Unknown => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaViolation {
    MissingHeader,
    MissingColumns(Vec<String>),
    TooFewRows { expected: usize, found: usize },
    UnknownKind,
}

impl std::fmt::Display for SchemaViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchemaViolation::MissingHeader => f.write_str("missing header row"),
            SchemaViolation::MissingColumns(cols) => {
                write!(f, "missing required columns: {}", cols.join(", "))
            }
            SchemaViolation::TooFewRows { expected, found } => {
                write!(f, "expected at least {expected} data rows, found {found}")
            }
            SchemaViolation::UnknownKind => f.write_str("no schema for unknown report kind"),
        }
    }
}

/// Surface-level check only: a header row carrying the required columns and
/// the minimum number of data rows. Values are never inspected.
pub fn check_structure(kind: ReportKind, payload: &[u8]) -> Result<usize, SchemaViolation> {
    let schema = schema_for(kind).ok_or(SchemaViolation::UnknownKind)?;
    let text = String::from_utf8_lossy(payload);
    let mut lines = text
        .trim_start_matches('\u{FEFF}')
        .lines()
        .filter(|line| !line.trim().is_empty());

    let header = lines.next().ok_or(SchemaViolation::MissingHeader)?;
    let columns = parse_columns(header);
    let missing: Vec<String> = schema
        .required
        .iter()
        .filter(|required| !columns.iter().any(|col| *col == required.to_lowercase()))
        .map(|required| required.to_string())
        .collect();
    if !missing.is_empty() {
        return Err(SchemaViolation::MissingColumns(missing));
    }

    let rows = lines.count();
    if rows < schema.min_data_rows {
        return Err(SchemaViolation::TooFewRows {
            expected: schema.min_data_rows,
            found: rows,
        });
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filename_patterns_win_first() {
        assert_eq!(
            classify("eBay-awaiting-shipment-report-2025-01-07.csv", None, None),
            ReportKind::Orders
        );
        assert_eq!(
            classify("eBay-all-active-listings-report-2025.csv", None, None),
            ReportKind::Listings
        );
        assert_eq!(
            classify("ebay-sold-listings-report-7.csv", None, Some("Sales Record Number")),
            ReportKind::SoldListings
        );
    }

    #[test]
    fn extension_case_does_not_matter() {
        assert_eq!(
            classify("EBAY-AWAITING-SHIPMENT-REPORT-1.CSV", None, None),
            ReportKind::Orders
        );
        assert_eq!(
            classify(r"C:\Users\me\Downloads\eBay-all-active-listings-report-3 (1).CSV", None, None),
            ReportKind::Listings
        );
    }

    #[test]
    fn header_signatures_apply_when_filename_is_opaque() {
        assert_eq!(
            classify("export.csv", None, Some("\"Sales Record Number\",\"Order Number\"")),
            ReportKind::Orders
        );
        assert_eq!(
            classify("export.csv", None, Some("Item number,Title,Current price")),
            ReportKind::Listings
        );
        assert_eq!(
            classify("export.csv", None, Some("Item number,Title,Sold for,Sold date")),
            ReportKind::SoldListings
        );
    }

    #[test]
    fn keyword_fallback_then_unknown() {
        assert_eq!(classify("my-orders.csv", None, None), ReportKind::Orders);
        assert_eq!(classify("shipment_export.csv", None, None), ReportKind::Orders);
        assert_eq!(classify("active-stuff.csv", None, None), ReportKind::Listings);
        assert_eq!(classify("random.csv", None, Some("a,b,c")), ReportKind::Unknown);
    }

    #[test]
    fn filename_falls_back_to_url_path() {
        let url = "https://www.ebay.com/sh/reports/eBay-awaiting-shipment-report-9.csv?x=1";
        assert_eq!(classify("", Some(url), None), ReportKind::Orders);
        assert!(matches_report_filename("", Some(url)));
        assert!(!matches_report_filename("random.csv", None));
    }

    #[test]
    fn payload_header_is_first_non_empty_line() {
        let payload = b"\r\n\xEF\xBB\xBFItem number,Title,Current price\r\n1,Hat,9.99\r\n";
        assert_eq!(
            header_line(payload).as_deref(),
            Some("\u{FEFF}Item number,Title,Current price")
        );
        assert_eq!(classify_payload("download.csv", None, payload), ReportKind::Listings);
    }

    #[test]
    fn structure_check_reports_missing_columns() {
        let payload = b"Sales Record Number,Order Number\n1,2\n";
        let err = check_structure(ReportKind::Orders, payload).unwrap_err();
        assert_eq!(
            err,
            SchemaViolation::MissingColumns(vec!["Item Number".to_string()])
        );
        assert_eq!(
            check_structure(ReportKind::Orders, b"").unwrap_err(),
            SchemaViolation::MissingHeader
        );
    }

    #[test]
    fn structure_check_accepts_header_only_and_counts_rows() {
        let header_only = b"Item number,Title,Current price\n";
        assert_eq!(check_structure(ReportKind::Listings, header_only), Ok(0));
        let rows = b"item NUMBER, title ,Current price\n1,a,1\n2,b,2\n\n";
        assert_eq!(check_structure(ReportKind::Listings, rows), Ok(2));
    }

    #[test]
    fn page_classification_from_url() {
        assert_eq!(classify_page("https://www.ebay.com/sh/ord/?filter=status:AWAITING_SHIPMENT"), PageKind::Orders);
        assert_eq!(classify_page("https://www.ebay.com/sh/lst/active"), PageKind::Listings);
        assert_eq!(classify_page("https://www.ebay.com/sh/ovw"), PageKind::Unknown);
    }
}
