//! Control-plane messages between page agents, the popup and the
//! coordinator. Every request gets exactly one reply.

use crate::account::{ButtonStatus, PageSnapshot};
use crate::models::{
    AccountId, Capture, ConnectionStatus, ErrorKind, HistoryEntry, IngestError, ItemError,
    ItemState, PageKind, PersistedItem, QueueCounts, ReportKind, Settings, SettingsPatch,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use serde_with::skip_serializing_none;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("coordinator is not running")]
    CoordinatorGone,
    #[error("{error}: {message}")]
    Rejected {
        error: String,
        kind: Option<ErrorKind>,
        message: String,
    },
    #[error("malformed reply: {0}")]
    Decode(#[from] serde_json::Error),
}

impl ControlError {
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            ControlError::Rejected { kind, .. } => *kind,
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Request {
    CaptureSubmit(Capture),
    StatusGet,
    AccountRedetect(RedetectRequest),
    TestSimulate(SimulateRequest),
    PageReady(PageReady),
    DownloadInitiated(DownloadInitiated),
    SettingsGet,
    SettingsUpdate(SettingsPatch),
    LogsClear,
    LogsExport,
    QueueProcess,
}

impl Request {
    pub fn kind(&self) -> &'static str {
        match self {
            Request::CaptureSubmit(_) => "capture.submit",
            Request::StatusGet => "status.get",
            Request::AccountRedetect(_) => "account.redetect",
            Request::TestSimulate(_) => "test.simulate",
            Request::PageReady(_) => "page.ready",
            Request::DownloadInitiated(_) => "download.initiated",
            Request::SettingsGet => "settings.get",
            Request::SettingsUpdate(_) => "settings.update",
            Request::LogsClear => "logs.clear",
            Request::LogsExport => "logs.export",
            Request::QueueProcess => "queue.process",
        }
    }

    /// Parses `{kind, payload?}`. Unknown kinds and malformed payloads are
    /// answered with the reply to send back instead.
    pub fn from_value(message: Value) -> Result<Self, Reply> {
        let Some(kind) = message.get("kind").and_then(Value::as_str).map(str::to_string) else {
            return Err(Reply::unsupported("missing message kind"));
        };
        let payload = message.get("payload").cloned().unwrap_or(Value::Null);
        match kind.as_str() {
            "capture.submit" => decode(&kind, payload).map(Request::CaptureSubmit),
            "status.get" => Ok(Request::StatusGet),
            "account.redetect" => decode(&kind, payload).map(Request::AccountRedetect),
            "test.simulate" => decode(&kind, payload).map(Request::TestSimulate),
            "page.ready" => decode(&kind, payload).map(Request::PageReady),
            "download.initiated" => decode(&kind, payload).map(Request::DownloadInitiated),
            "settings.get" => Ok(Request::SettingsGet),
            "settings.update" => decode(&kind, payload).map(Request::SettingsUpdate),
            "logs.clear" => Ok(Request::LogsClear),
            "logs.export" => Ok(Request::LogsExport),
            "queue.process" => Ok(Request::QueueProcess),
            other => Err(Reply::unsupported(format!("unknown message kind `{other}`"))),
        }
    }
}

fn decode<T: DeserializeOwned>(kind: &str, payload: Value) -> Result<T, Reply> {
    serde_json::from_value(payload)
        .map_err(|err| Reply::invalid(format!("invalid `{kind}` payload: {err}")))
}

/// `{ok: true, value}` or `{ok: false, error, kind?, message}`.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Reply {
    pub ok: bool,
    pub value: Option<Value>,
    pub error: Option<String>,
    pub kind: Option<ErrorKind>,
    pub message: Option<String>,
}

impl Reply {
    pub fn ok<T: Serialize>(value: T) -> Self {
        match serde_json::to_value(value) {
            Ok(value) => Self {
                ok: true,
                value: Some(value),
                error: None,
                kind: None,
                message: None,
            },
            Err(err) => Self::invalid(format!("unserializable reply: {err}")),
        }
    }

    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            value: None,
            error: Some(kind.as_str().to_string()),
            kind: Some(kind),
            message: Some(message.into()),
        }
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            value: None,
            error: Some("unsupported".to_string()),
            kind: None,
            message: Some(message.into()),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            value: None,
            error: Some("invalid-request".to_string()),
            kind: None,
            message: Some(message.into()),
        }
    }

    pub fn into_result<T: DeserializeOwned>(self) -> Result<T, ControlError> {
        if self.ok {
            Ok(serde_json::from_value(self.value.unwrap_or(Value::Null))?)
        } else {
            Err(ControlError::Rejected {
                error: self.error.unwrap_or_else(|| "error".to_string()),
                kind: self.kind,
                message: self.message.unwrap_or_default(),
            })
        }
    }
}

impl From<IngestError> for Reply {
    fn from(err: IngestError) -> Self {
        Reply::error(err.kind, err.message)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Disposition {
    Queued,
    AlreadyQueued,
    DedupSkipped,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubmitReceipt {
    pub item_id: Uuid,
    pub deduplicated: bool,
    pub disposition: Disposition,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusView {
    pub connection: ConnectionStatus,
    pub queue: QueueCounts,
    pub account: Option<AccountId>,
    pub recent: Vec<HistoryEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedetectRequest {
    pub tab_id: i64,
    #[serde(default)]
    pub page: Option<PageSnapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RedetectView {
    pub tab_id: i64,
    pub account: Option<AccountId>,
    pub resolved_from: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulateRequest {
    pub kind: ReportKind,
    #[serde(default)]
    pub account: Option<AccountId>,
    #[serde(default)]
    pub tab_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageReady {
    pub tab_id: i64,
    pub url: String,
    #[serde(default)]
    pub page_kind: PageKind,
    #[serde(default)]
    pub account: Option<AccountId>,
    #[serde(default)]
    pub download_button: ButtonStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadInitiated {
    #[serde(default)]
    pub tab_id: Option<i64>,
    pub button_text: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "Utc::now")]
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessSummary {
    pub started: usize,
    pub inflight: usize,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExportedItem {
    #[serde(flatten)]
    pub item: PersistedItem,
    pub last_error: Option<ItemError>,
    pub trail: Option<Vec<ItemState>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogExport {
    pub exported_at: DateTime<Utc>,
    pub history: Vec<HistoryEntry>,
    pub queue: Vec<ExportedItem>,
}

pub(crate) struct Envelope {
    pub request: Request,
    pub reply: oneshot::Sender<Reply>,
}

/// Cloneable sender side of the coordinator's mailbox.
#[derive(Clone)]
pub struct ControlHandle {
    tx: mpsc::Sender<Envelope>,
}

impl ControlHandle {
    pub(crate) fn new(tx: mpsc::Sender<Envelope>) -> Self {
        Self { tx }
    }

    pub async fn request(&self, request: Request) -> Result<Reply, ControlError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Envelope {
                request,
                reply: reply_tx,
            })
            .await
            .map_err(|_| ControlError::CoordinatorGone)?;
        reply_rx.await.map_err(|_| ControlError::CoordinatorGone)
    }

    /// Entry point for JSON messages arriving over HTTP.
    pub async fn dispatch(&self, message: Value) -> Reply {
        let request = match Request::from_value(message) {
            Ok(request) => request,
            Err(reply) => return reply,
        };
        match self.request(request).await {
            Ok(reply) => reply,
            Err(err) => Reply {
                ok: false,
                value: None,
                error: Some("unavailable".to_string()),
                kind: None,
                message: Some(err.to_string()),
            },
        }
    }

    async fn call<T: DeserializeOwned>(&self, request: Request) -> Result<T, ControlError> {
        self.request(request).await?.into_result()
    }

    pub async fn submit(&self, capture: Capture) -> Result<SubmitReceipt, ControlError> {
        self.call(Request::CaptureSubmit(capture)).await
    }

    pub async fn status(&self) -> Result<StatusView, ControlError> {
        self.call(Request::StatusGet).await
    }

    pub async fn redetect(
        &self,
        tab_id: i64,
        page: Option<PageSnapshot>,
    ) -> Result<RedetectView, ControlError> {
        self.call(Request::AccountRedetect(RedetectRequest { tab_id, page }))
            .await
    }

    pub async fn simulate(&self, kind: ReportKind) -> Result<SubmitReceipt, ControlError> {
        self.call(Request::TestSimulate(SimulateRequest {
            kind,
            account: None,
            tab_id: None,
        }))
        .await
    }

    pub async fn settings(&self) -> Result<Settings, ControlError> {
        self.call(Request::SettingsGet).await
    }

    pub async fn update_settings(&self, patch: SettingsPatch) -> Result<Settings, ControlError> {
        self.call(Request::SettingsUpdate(patch)).await
    }

    pub async fn clear_logs(&self) -> Result<usize, ControlError> {
        let value: Value = self.call(Request::LogsClear).await?;
        Ok(value
            .get("cleared")
            .and_then(Value::as_u64)
            .unwrap_or_default() as usize)
    }

    pub async fn export_logs(&self) -> Result<LogExport, ControlError> {
        self.call(Request::LogsExport).await
    }

    pub async fn process_queue(&self) -> Result<ProcessSummary, ControlError> {
        self.call(Request::QueueProcess).await
    }
}

/// Where page-side components send their messages.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn send(&self, request: Request) -> Result<Reply, ControlError>;
}

#[async_trait]
impl EventSink for ControlHandle {
    async fn send(&self, request: Request) -> Result<Reply, ControlError> {
        self.request(request).await
    }
}
