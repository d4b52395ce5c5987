use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, sync::Arc, time::Instant};
use thiserror::Error;
use uuid::Uuid;

/// Placeholder account used only when attribution failed and unattributed
/// uploads are explicitly permitted.
pub const DEFAULT_ACCOUNT: &str = "default_account";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum ReportKind {
    Orders,
    Listings,
    SoldListings,
    Unknown,
}

impl ReportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportKind::Orders => "orders",
            ReportKind::Listings => "listings",
            ReportKind::SoldListings => "sold-listings",
            ReportKind::Unknown => "unknown",
        }
    }

    pub fn from_str(input: &str) -> Option<Self> {
        match input.trim().to_lowercase().replace('_', "-").as_str() {
            "orders" => Some(ReportKind::Orders),
            "listings" => Some(ReportKind::Listings),
            "sold-listings" => Some(ReportKind::SoldListings),
            "unknown" => Some(ReportKind::Unknown),
            _ => None,
        }
    }
}

impl fmt::Display for ReportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum CaptureSource {
    PageIntercept,
    DownloadObserver,
    ManualTest,
}

impl CaptureSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaptureSource::PageIntercept => "page-intercept",
            CaptureSource::DownloadObserver => "download-observer",
            CaptureSource::ManualTest => "manual-test",
        }
    }
}

/// One observation of a CSV download, owned by its originating component
/// until the Coordinator accepts or rejects it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capture {
    #[serde(default = "Uuid::new_v4")]
    pub capture_id: Uuid,
    pub source: CaptureSource,
    pub filename: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "Utc::now")]
    pub captured_at: DateTime<Utc>,
    #[serde(skip, default = "Instant::now")]
    pub captured_mono: Instant,
    #[serde(rename = "content_base64", with = "base64_bytes")]
    pub raw_bytes: Vec<u8>,
    #[serde(default)]
    pub tab_id: Option<i64>,
    /// Account attributed in-band by the page, when the agent knew it.
    #[serde(default)]
    pub account: Option<AccountId>,
}

impl Capture {
    pub fn new(source: CaptureSource, filename: impl Into<String>, raw_bytes: Vec<u8>) -> Self {
        Self {
            capture_id: Uuid::new_v4(),
            source,
            filename: filename.into(),
            url: None,
            captured_at: Utc::now(),
            captured_mono: Instant::now(),
            raw_bytes,
            tab_id: None,
            account: None,
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_tab(mut self, tab_id: i64) -> Self {
        self.tab_id = Some(tab_id);
        self
    }

    pub fn with_account(mut self, account: AccountId) -> Self {
        self.account = Some(account);
        self
    }
}

/// Opaque seller-account label as seen from the browsing context.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct AccountId(String);

impl AccountId {
    /// Returns `None` for blank input so callers never carry empty identities.
    pub fn new(raw: impl AsRef<str>) -> Option<Self> {
        let trimmed = raw.as_ref().trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_string()))
        }
    }

    pub fn unattributed() -> Self {
        Self(DEFAULT_ACCOUNT.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Hex-encoded SHA-256 over the canonicalized CSV.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "kebab-case")]
pub enum PageKind {
    Orders,
    Listings,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum ItemState {
    Pending,
    Inflight,
    RetryWait,
    Succeeded,
    Rejected,
    Abandoned,
}

impl ItemState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemState::Pending => "pending",
            ItemState::Inflight => "inflight",
            ItemState::RetryWait => "retry-wait",
            ItemState::Succeeded => "succeeded",
            ItemState::Rejected => "rejected",
            ItemState::Abandoned => "abandoned",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ItemState::Succeeded | ItemState::Rejected | ItemState::Abandoned
        )
    }

    /// Edges of the item state machine. `Inflight -> Pending` is the
    /// cancellation edge taken on shutdown; the attempt does not count.
    pub fn can_transition_to(&self, next: ItemState) -> bool {
        use ItemState::*;
        matches!(
            (self, next),
            (Pending, Inflight)
                | (Inflight, Succeeded)
                | (Inflight, Rejected)
                | (Inflight, RetryWait)
                | (Inflight, Pending)
                | (RetryWait, Pending)
                | (RetryWait, Abandoned)
        )
    }
}

impl fmt::Display for ItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    ClassifyFailed,
    SchemaInvalid,
    TransientNetwork,
    PermanentHttp,
    PayloadLost,
    DedupSkipped,
    CaptureFailed,
    Abandoned,
    AccountUnresolved,
    QueueFull,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ClassifyFailed => "classify-failed",
            ErrorKind::SchemaInvalid => "schema-invalid",
            ErrorKind::TransientNetwork => "transient-network",
            ErrorKind::PermanentHttp => "permanent-http",
            ErrorKind::PayloadLost => "payload-lost",
            ErrorKind::DedupSkipped => "dedup-skipped",
            ErrorKind::CaptureFailed => "capture-failed",
            ErrorKind::Abandoned => "abandoned",
            ErrorKind::AccountUnresolved => "account-unresolved",
            ErrorKind::QueueFull => "queue-full",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure carrying its taxonomy kind; what the Coordinator answers a
/// rejected request with.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct IngestError {
    pub kind: ErrorKind,
    pub message: String,
}

impl IngestError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ItemError {
    pub kind: ErrorKind,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl ItemError {
    pub fn new(kind: ErrorKind, message: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            kind,
            message: message.into(),
            at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ItemMetadata {
    pub captured_at: DateTime<Utc>,
    #[serde(default)]
    pub source_url: Option<String>,
    pub extension_version: String,
    pub source: CaptureSource,
    #[serde(default)]
    pub tab_id: Option<i64>,
}

impl ItemMetadata {
    /// Strictly newer: a higher extension version, or the same version with a
    /// later capture time.
    pub fn is_newer_than(&self, other: &ItemMetadata) -> bool {
        match compare_versions(&self.extension_version, &other.extension_version) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => self.captured_at > other.captured_at,
        }
    }
}

fn compare_versions(left: &str, right: &str) -> std::cmp::Ordering {
    let parse = |raw: &str| -> Vec<u64> {
        raw.trim()
            .trim_start_matches('v')
            .split(['.', '-', '+'])
            .map(|part| part.parse::<u64>().unwrap_or(0))
            .collect()
    };
    let (mut l, mut r) = (parse(left), parse(right));
    let width = l.len().max(r.len());
    l.resize(width, 0);
    r.resize(width, 0);
    l.cmp(&r)
}

/// Unit of work in the ingestion queue. The payload lives here for the
/// item's lifetime and is dropped with the item on its terminal transition.
#[derive(Debug, Clone)]
pub struct QueueItem {
    pub item_id: Uuid,
    pub fingerprint: Fingerprint,
    pub account: AccountId,
    pub kind: ReportKind,
    pub filename: String,
    pub payload: Arc<[u8]>,
    pub metadata: ItemMetadata,
    pub state: ItemState,
    pub attempts: u32,
    pub next_attempt_at: DateTime<Utc>,
    pub enqueued_at: DateTime<Utc>,
    pub last_error: Option<ItemError>,
    /// States visited in this process, oldest first.
    pub trail: Vec<ItemState>,
}

/// Durable form of a queue item; carries no payload and no error detail.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersistedItem {
    pub item_id: Uuid,
    pub fingerprint: Fingerprint,
    pub kind: ReportKind,
    pub account: AccountId,
    pub filename: String,
    pub metadata: ItemMetadata,
    pub state: ItemState,
    pub attempts: u32,
    pub next_attempt_at: DateTime<Utc>,
    pub enqueued_at: DateTime<Utc>,
}

impl From<&QueueItem> for PersistedItem {
    fn from(item: &QueueItem) -> Self {
        Self {
            item_id: item.item_id,
            fingerprint: item.fingerprint.clone(),
            kind: item.kind,
            account: item.account.clone(),
            filename: item.filename.clone(),
            metadata: item.metadata.clone(),
            state: item.state,
            attempts: item.attempts,
            next_attempt_at: item.next_attempt_at,
            enqueued_at: item.enqueued_at,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum HistoryOutcome {
    Succeeded,
    Rejected,
    Abandoned,
    DedupSkipped,
}

impl HistoryOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            HistoryOutcome::Succeeded => "succeeded",
            HistoryOutcome::Rejected => "rejected",
            HistoryOutcome::Abandoned => "abandoned",
            HistoryOutcome::DedupSkipped => "dedup-skipped",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryEntry {
    pub item_id: Uuid,
    pub fingerprint: Fingerprint,
    pub account: AccountId,
    pub kind: ReportKind,
    pub filename: String,
    pub outcome: HistoryOutcome,
    #[serde(default)]
    pub error_kind: Option<ErrorKind>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub rows_processed: Option<u64>,
    #[serde(default)]
    pub rows_skipped: Option<u64>,
    #[serde(default)]
    pub import_id: Option<String>,
    pub attempts: u32,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionStatus {
    Healthy,
    Degraded,
    Down,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Healthy => "healthy",
            ConnectionStatus::Degraded => "degraded",
            ConnectionStatus::Down => "down",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Settings {
    #[serde(default)]
    pub debug_mode: bool,
    #[serde(default = "default_true")]
    pub auto_process: bool,
    #[serde(default = "default_true")]
    pub notifications: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            debug_mode: false,
            auto_process: true,
            notifications: true,
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SettingsPatch {
    #[serde(default)]
    pub debug_mode: Option<bool>,
    #[serde(default)]
    pub auto_process: Option<bool>,
    #[serde(default)]
    pub notifications: Option<bool>,
}

impl Settings {
    pub fn apply(&mut self, patch: &SettingsPatch) {
        if let Some(value) = patch.debug_mode {
            self.debug_mode = value;
        }
        if let Some(value) = patch.auto_process {
            self.auto_process = value;
        }
        if let Some(value) = patch.notifications {
            self.notifications = value;
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct QueueCounts {
    pub pending: usize,
    pub inflight: usize,
    pub retry_wait: usize,
}

pub mod base64_bytes {
    use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        BASE64
            .decode(raw.trim())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn metadata(version: &str, at: DateTime<Utc>) -> ItemMetadata {
        ItemMetadata {
            captured_at: at,
            source_url: None,
            extension_version: version.to_string(),
            source: CaptureSource::PageIntercept,
            tab_id: None,
        }
    }

    #[test]
    fn state_graph_allows_only_documented_edges() {
        use ItemState::*;
        assert!(Pending.can_transition_to(Inflight));
        assert!(RetryWait.can_transition_to(Abandoned));
        assert!(!Pending.can_transition_to(Succeeded));
        assert!(!RetryWait.can_transition_to(Inflight));
        assert!(!Succeeded.can_transition_to(Pending));
        assert!(Abandoned.is_terminal() && !RetryWait.is_terminal());
    }

    #[test]
    fn metadata_newer_by_version_then_time() {
        let now = Utc::now();
        let old = metadata("1.2.0", now);
        assert!(metadata("1.10.0", now - Duration::hours(1)).is_newer_than(&old));
        assert!(metadata("1.2.0", now + Duration::seconds(1)).is_newer_than(&old));
        assert!(!metadata("1.2", now).is_newer_than(&old));
        assert!(!metadata("1.1.9", now + Duration::days(1)).is_newer_than(&old));
    }

    #[test]
    fn account_id_rejects_blank() {
        assert!(AccountId::new("   ").is_none());
        assert_eq!(AccountId::new(" seller123 ").unwrap().as_str(), "seller123");
    }

    #[test]
    fn capture_json_carries_base64_content() {
        let json = serde_json::json!({
            "source": "page-intercept",
            "filename": "eBay-all-active-listings-report-1.csv",
            "content_base64": "YSxiCjEsMgo=",
            "tab_id": 7
        });
        let capture: Capture = serde_json::from_value(json).expect("capture");
        assert_eq!(capture.raw_bytes, b"a,b\n1,2\n");
        assert_eq!(capture.tab_id, Some(7));
        assert!(capture.account.is_none());
    }

    #[test]
    fn report_kind_parses_kebab_and_snake() {
        assert_eq!(ReportKind::from_str("sold_listings"), Some(ReportKind::SoldListings));
        assert_eq!(ReportKind::from_str("Orders"), Some(ReportKind::Orders));
        assert_eq!(ReportKind::from_str("refunds"), None);
    }
}
