//! Page-side capture agent. One instance per tab, constructed with the tab
//! it serves; it only ever talks to the coordinator through an
//! [`EventSink`]. The host's content scripts post DOM snapshots, trigger
//! clicks and in-page blobs to `POST /pages`, where [`AgentRegistry`] routes
//! them to the tab's agent.

use super::fetch::ContentFetcher;
use crate::account::{self, ButtonStatus, PageSnapshot};
use crate::classifier;
use crate::control::{DownloadInitiated, EventSink, PageReady, Request, SubmitReceipt};
use crate::models::{AccountId, Capture, CaptureSource, ErrorKind, PageKind};
use chrono::Utc;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const TRIGGER_SELECTORS: &[&str] = &["a[download]", "a[href]", "button", "[role='button']"];

/// A DOM element that starts a CSV report download.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DownloadTrigger {
    pub label: String,
    pub url: Option<String>,
    pub filename: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PageObservation {
    pub page_kind: PageKind,
    pub account: Option<AccountId>,
    pub triggers: Vec<DownloadTrigger>,
}

impl PageObservation {
    pub fn button_status(&self) -> ButtonStatus {
        match self.triggers.first() {
            Some(trigger) => ButtonStatus::Found {
                label: trigger.label.clone(),
            },
            None => ButtonStatus::Missing,
        }
    }
}

/// Pure read of one DOM snapshot. Malformed markup yields an empty
/// observation rather than an error.
pub fn observe(page: &PageSnapshot) -> PageObservation {
    let page_kind = classifier::classify_page(&page.url);
    let account = account::resolve(page, None, Utc::now()).map(|(account, _)| account);
    let triggers = if page.html.is_empty() {
        Vec::new()
    } else {
        find_triggers(&Html::parse_document(&page.html), &page.url)
    };
    PageObservation {
        page_kind,
        account,
        triggers,
    }
}

fn find_triggers(document: &Html, page_url: &str) -> Vec<DownloadTrigger> {
    let base = reqwest::Url::parse(page_url).ok();
    let mut found: Vec<DownloadTrigger> = Vec::new();
    for raw in TRIGGER_SELECTORS {
        let Ok(selector) = Selector::parse(raw) else {
            continue;
        };
        for element in document.select(&selector) {
            if let Some(trigger) = as_trigger(element, base.as_ref())
                && !found.contains(&trigger)
            {
                found.push(trigger);
            }
        }
    }
    found
}

fn as_trigger(element: ElementRef<'_>, base: Option<&reqwest::Url>) -> Option<DownloadTrigger> {
    let label = element
        .text()
        .collect::<Vec<_>>()
        .join(" ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    let value = element.value();
    let href = value.attr("href").map(str::trim).filter(|h| !h.is_empty());
    let download_attr = value.attr("download");

    let mentions_download = label.to_lowercase().contains("download");
    let csv_href = href.is_some_and(|h| h.to_lowercase().split('?').next().is_some_and(|p| p.ends_with(".csv")));
    if !(download_attr.is_some() || csv_href || mentions_download) {
        return None;
    }

    let url = href
        .filter(|h| !h.starts_with("javascript:") && !h.starts_with('#'))
        .and_then(|h| match base {
            Some(base) => base.join(h).ok().map(|u| u.to_string()),
            None => reqwest::Url::parse(h).ok().map(|u| u.to_string()),
        });
    let filename = download_attr
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string);
    Some(DownloadTrigger {
        label: if label.is_empty() { "Download".to_string() } else { label },
        url,
        filename,
    })
}

fn filename_from_url(url: &str) -> Option<String> {
    reqwest::Url::parse(url)
        .ok()?
        .path_segments()?
        .next_back()
        .filter(|segment| !segment.is_empty())
        .map(str::to_string)
}

pub struct CaptureAgent {
    tab_id: i64,
    sink: Arc<dyn EventSink>,
    fetcher: Arc<dyn ContentFetcher>,
    deadline: Duration,
    account: Option<AccountId>,
    last_reported: Option<(PageKind, Option<AccountId>, ButtonStatus)>,
}

impl CaptureAgent {
    pub fn new(
        tab_id: i64,
        sink: Arc<dyn EventSink>,
        fetcher: Arc<dyn ContentFetcher>,
        deadline: Duration,
    ) -> Self {
        Self {
            tab_id,
            sink,
            fetcher,
            deadline,
            account: None,
            last_reported: None,
        }
    }

    pub fn account(&self) -> Option<&AccountId> {
        self.account.as_ref()
    }

    /// DOM mutation callback. Reports `page.ready` whenever the page kind,
    /// identity or download affordance changed.
    pub async fn on_mutation(&mut self, page: &PageSnapshot) -> PageObservation {
        let observation = observe(page);
        if let Some(account) = &observation.account {
            self.account = Some(account.clone());
        }
        let button = observation.button_status();
        let report = (observation.page_kind, self.account.clone(), button.clone());
        if self.last_reported.as_ref() == Some(&report) {
            return observation;
        }

        let request = Request::PageReady(PageReady {
            tab_id: self.tab_id,
            url: page.url.clone(),
            page_kind: observation.page_kind,
            account: self.account.clone(),
            download_button: button,
        });
        match self.sink.send(request).await {
            Ok(_) => {
                debug!(
                    target = "ingest.capture",
                    tab_id = self.tab_id,
                    page_kind = ?observation.page_kind,
                    triggers = observation.triggers.len(),
                    "page_ready_sent"
                );
                self.last_reported = Some(report);
            }
            Err(err) => warn!(target = "ingest.capture", tab_id = self.tab_id, error = %err, "page_ready_failed"),
        }
        observation
    }

    /// A download affordance fired: announce it, fetch the report within the
    /// acquisition deadline and submit it.
    pub async fn on_trigger(
        &mut self,
        trigger: &DownloadTrigger,
        cookies: Option<&str>,
    ) -> Option<SubmitReceipt> {
        let announced = Request::DownloadInitiated(DownloadInitiated {
            tab_id: Some(self.tab_id),
            button_text: trigger.label.clone(),
            url: trigger.url.clone(),
            at: Utc::now(),
        });
        if let Err(err) = self.sink.send(announced).await {
            warn!(target = "ingest.capture", tab_id = self.tab_id, error = %err, "download_initiated_failed");
        }

        let Some(url) = trigger.url.as_deref() else {
            debug!(target = "ingest.capture", tab_id = self.tab_id, label = %trigger.label, "trigger_without_url");
            return None;
        };
        let bytes = match tokio::time::timeout(self.deadline, self.fetcher.fetch(url, cookies)).await {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(err)) => {
                warn!(
                    target = "ingest.capture",
                    tab_id = self.tab_id,
                    error_kind = %ErrorKind::CaptureFailed,
                    url,
                    error = %err,
                    "capture_fetch_failed"
                );
                return None;
            }
            Err(_) => {
                warn!(
                    target = "ingest.capture",
                    tab_id = self.tab_id,
                    error_kind = %ErrorKind::CaptureFailed,
                    url,
                    deadline_secs = self.deadline.as_secs(),
                    "capture_deadline_exceeded"
                );
                return None;
            }
        };
        let filename = trigger
            .filename
            .clone()
            .or_else(|| filename_from_url(url))
            .unwrap_or_else(|| "report.csv".to_string());
        self.on_blob(&filename, bytes, Some(url)).await
    }

    /// Content already observable in-page (for instance a fetched blob).
    pub async fn on_blob(
        &mut self,
        filename: &str,
        bytes: Vec<u8>,
        url: Option<&str>,
    ) -> Option<SubmitReceipt> {
        let mut capture = Capture::new(CaptureSource::PageIntercept, filename, bytes).with_tab(self.tab_id);
        if let Some(url) = url {
            capture = capture.with_url(url);
        }
        if let Some(account) = &self.account {
            capture = capture.with_account(account.clone());
        }

        let reply = match self.sink.send(Request::CaptureSubmit(capture)).await {
            Ok(reply) => reply,
            Err(err) => {
                warn!(target = "ingest.capture", tab_id = self.tab_id, error = %err, "capture_submit_failed");
                return None;
            }
        };
        match reply.into_result::<SubmitReceipt>() {
            Ok(receipt) => {
                info!(
                    target = "ingest.capture",
                    tab_id = self.tab_id,
                    item_id = %receipt.item_id,
                    deduplicated = receipt.deduplicated,
                    filename,
                    "capture_submitted"
                );
                Some(receipt)
            }
            Err(err) => {
                info!(
                    target = "ingest.capture",
                    tab_id = self.tab_id,
                    error_kind = err.kind().map(|k| k.as_str()).unwrap_or("unknown"),
                    error = %err,
                    filename,
                    "capture_not_accepted"
                );
                None
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum PageEvent {
    Snapshot {
        tab_id: i64,
        url: String,
        #[serde(default)]
        html: String,
    },
    Trigger {
        tab_id: i64,
        label: String,
        #[serde(default)]
        url: Option<String>,
        #[serde(default)]
        filename: Option<String>,
        #[serde(default)]
        cookies: Option<String>,
    },
    Blob {
        tab_id: i64,
        filename: String,
        #[serde(default)]
        url: Option<String>,
        #[serde(rename = "content_base64", with = "crate::models::base64_bytes")]
        bytes: Vec<u8>,
    },
    Closed {
        tab_id: i64,
    },
}

impl PageEvent {
    pub fn tab_id(&self) -> i64 {
        match self {
            PageEvent::Snapshot { tab_id, .. }
            | PageEvent::Trigger { tab_id, .. }
            | PageEvent::Blob { tab_id, .. }
            | PageEvent::Closed { tab_id } => *tab_id,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
pub enum PageOutcome {
    Observed(PageObservation),
    Submitted(SubmitReceipt),
    NotSubmitted,
    Closed { known: bool },
}

/// One [`CaptureAgent`] per open tab, created on the tab's first event and
/// dropped when the tab closes. Events for one tab are handled in order.
pub struct AgentRegistry {
    sink: Arc<dyn EventSink>,
    fetcher: Arc<dyn ContentFetcher>,
    deadline: Duration,
    agents: Mutex<HashMap<i64, Arc<Mutex<CaptureAgent>>>>,
}

impl AgentRegistry {
    pub fn new(sink: Arc<dyn EventSink>, fetcher: Arc<dyn ContentFetcher>, deadline: Duration) -> Self {
        Self {
            sink,
            fetcher,
            deadline,
            agents: Mutex::new(HashMap::new()),
        }
    }

    pub async fn len(&self) -> usize {
        self.agents.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.agents.lock().await.is_empty()
    }

    async fn agent(&self, tab_id: i64) -> Arc<Mutex<CaptureAgent>> {
        let mut agents = self.agents.lock().await;
        agents
            .entry(tab_id)
            .or_insert_with(|| {
                Arc::new(Mutex::new(CaptureAgent::new(
                    tab_id,
                    self.sink.clone(),
                    self.fetcher.clone(),
                    self.deadline,
                )))
            })
            .clone()
    }

    pub async fn handle(&self, event: PageEvent) -> PageOutcome {
        let tab_id = event.tab_id();
        if let PageEvent::Closed { .. } = event {
            let known = self.agents.lock().await.remove(&tab_id).is_some();
            debug!(target = "ingest.capture", tab_id, known, "tab_closed");
            return PageOutcome::Closed { known };
        }

        let agent = self.agent(tab_id).await;
        let mut agent = agent.lock().await;
        let receipt = match event {
            PageEvent::Snapshot { url, html, .. } => {
                let page = PageSnapshot::new(Some(tab_id), url, html);
                return PageOutcome::Observed(agent.on_mutation(&page).await);
            }
            PageEvent::Trigger {
                label,
                url,
                filename,
                cookies,
                ..
            } => {
                let trigger = DownloadTrigger { label, url, filename };
                agent.on_trigger(&trigger, cookies.as_deref()).await
            }
            PageEvent::Blob {
                filename, url, bytes, ..
            } => agent.on_blob(&filename, bytes, url.as_deref()).await,
            PageEvent::Closed { .. } => None,
        };
        match receipt {
            Some(receipt) => PageOutcome::Submitted(receipt),
            None => PageOutcome::NotSubmitted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::fetch::FetchError;
    use crate::control::{ControlError, Disposition, Reply};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use uuid::Uuid;

    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<Request>>,
    }

    impl RecordingSink {
        fn kinds(&self) -> Vec<&'static str> {
            self.sent.lock().unwrap().iter().map(Request::kind).collect()
        }
    }

    #[async_trait]
    impl EventSink for RecordingSink {
        async fn send(&self, request: Request) -> Result<Reply, ControlError> {
            let reply = match &request {
                Request::CaptureSubmit(capture) if capture.filename.starts_with("random") => {
                    Reply::error(ErrorKind::ClassifyFailed, "unknown report")
                }
                Request::CaptureSubmit(_) => Reply::ok(SubmitReceipt {
                    item_id: Uuid::new_v4(),
                    deduplicated: false,
                    disposition: Disposition::Queued,
                }),
                _ => Reply::ok(serde_json::json!({})),
            };
            self.sent.lock().unwrap().push(request);
            Ok(reply)
        }
    }

    enum Canned {
        Bytes(&'static [u8]),
        Fail,
        Stall,
    }

    struct CannedFetcher(Canned);

    #[async_trait]
    impl ContentFetcher for CannedFetcher {
        async fn fetch(&self, _url: &str, _cookies: Option<&str>) -> Result<Vec<u8>, FetchError> {
            match self.0 {
                Canned::Bytes(bytes) => Ok(bytes.to_vec()),
                Canned::Fail => Err(FetchError::Status(403)),
                Canned::Stall => {
                    tokio::time::sleep(Duration::from_secs(600)).await;
                    Err(FetchError::Empty)
                }
            }
        }
    }

    const ORDERS_PAGE: &str = r#"
        <html><body>
          <span id="gh-un">seller123</span>
          <div class="toolbar">
            <a class="btn" href="/sh/reports/download?id=42" download="eBay-awaiting-shipment-report-2025-01-07.csv">Download report</a>
            <a href="/help">Help</a>
          </div>
        </body></html>"#;

    fn agent(fetcher: Canned) -> (CaptureAgent, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let agent = CaptureAgent::new(
            9,
            sink.clone(),
            Arc::new(CannedFetcher(fetcher)),
            Duration::from_secs(30),
        );
        (agent, sink)
    }

    #[test]
    fn observation_finds_trigger_kind_and_account() {
        let page = PageSnapshot::new(Some(9), "https://www.ebay.com/sh/ord/?filter=awaiting", ORDERS_PAGE);
        let observation = observe(&page);
        assert_eq!(observation.page_kind, PageKind::Orders);
        assert_eq!(observation.account.as_ref().map(AccountId::as_str), Some("seller123"));
        assert_eq!(
            observation.triggers,
            vec![DownloadTrigger {
                label: "Download report".into(),
                url: Some("https://www.ebay.com/sh/reports/download?id=42".into()),
                filename: Some("eBay-awaiting-shipment-report-2025-01-07.csv".into()),
            }]
        );
    }

    #[test]
    fn broken_markup_yields_empty_observation() {
        let page = PageSnapshot::new(None, "about:blank", "<div><a download></p></table");
        let observation = observe(&page);
        assert_eq!(observation.page_kind, PageKind::Unknown);
        assert!(observation.account.is_none());
        assert_eq!(observation.button_status(), ButtonStatus::Found { label: "Download".into() });
        assert!(observation.triggers[0].url.is_none());
    }

    #[tokio::test]
    async fn page_ready_is_sent_only_on_change() {
        let (mut agent, sink) = agent(Canned::Fail);
        let page = PageSnapshot::new(Some(9), "https://www.ebay.com/sh/ord", ORDERS_PAGE);
        agent.on_mutation(&page).await;
        agent.on_mutation(&page).await;
        assert_eq!(sink.kinds(), vec!["page.ready"]);

        let bare = PageSnapshot::new(Some(9), "https://www.ebay.com/sh/ord", "<html></html>");
        agent.on_mutation(&bare).await;
        assert_eq!(sink.kinds(), vec!["page.ready", "page.ready"]);
        assert_eq!(agent.account().map(AccountId::as_str), Some("seller123"));
    }

    #[tokio::test]
    async fn trigger_fetches_and_submits_with_account() {
        let (mut agent, sink) = agent(Canned::Bytes(b"Sales Record Number,Order Number,Item Number\n1,2,3\n"));
        let page = PageSnapshot::new(Some(9), "https://www.ebay.com/sh/ord", ORDERS_PAGE);
        let observation = agent.on_mutation(&page).await;
        let receipt = agent.on_trigger(&observation.triggers[0], Some("s=1")).await;
        assert!(receipt.is_some());
        assert_eq!(sink.kinds(), vec!["page.ready", "download.initiated", "capture.submit"]);

        let sent = sink.sent.lock().unwrap();
        let Request::CaptureSubmit(capture) = &sent[2] else {
            panic!("expected capture");
        };
        assert_eq!(capture.source, CaptureSource::PageIntercept);
        assert_eq!(capture.tab_id, Some(9));
        assert_eq!(capture.filename, "eBay-awaiting-shipment-report-2025-01-07.csv");
        assert_eq!(capture.account.as_ref().map(AccountId::as_str), Some("seller123"));
    }

    #[tokio::test]
    async fn failed_fetch_is_logged_not_submitted() {
        let (mut agent, sink) = agent(Canned::Fail);
        let trigger = DownloadTrigger {
            label: "Download".into(),
            url: Some("https://www.ebay.com/x.csv".into()),
            filename: None,
        };
        assert!(agent.on_trigger(&trigger, None).await.is_none());
        assert_eq!(sink.kinds(), vec!["download.initiated"]);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_fetch_hits_deadline() {
        let (mut agent, sink) = agent(Canned::Stall);
        let trigger = DownloadTrigger {
            label: "Download".into(),
            url: Some("https://www.ebay.com/x.csv".into()),
            filename: None,
        };
        assert!(agent.on_trigger(&trigger, None).await.is_none());
        assert_eq!(sink.kinds(), vec!["download.initiated"]);
    }

    #[tokio::test]
    async fn rejected_blob_returns_none() {
        let (mut agent, sink) = agent(Canned::Fail);
        assert!(agent.on_blob("random.csv", b"foo,bar\n".to_vec(), None).await.is_none());
        assert_eq!(sink.kinds(), vec!["capture.submit"]);
    }

    #[tokio::test]
    async fn registry_keeps_one_agent_per_tab_until_closed() {
        let sink = Arc::new(RecordingSink::default());
        let registry = AgentRegistry::new(
            sink.clone(),
            Arc::new(CannedFetcher(Canned::Fail)),
            Duration::from_secs(30),
        );
        let snapshot = || PageEvent::Snapshot {
            tab_id: 7,
            url: "https://www.ebay.com/sh/ord".into(),
            html: ORDERS_PAGE.into(),
        };

        match registry.handle(snapshot()).await {
            PageOutcome::Observed(observation) => {
                assert_eq!(observation.page_kind, PageKind::Orders);
                assert_eq!(observation.triggers.len(), 1);
            }
            other => panic!("unexpected {other:?}"),
        }
        registry.handle(snapshot()).await;

        let blob: PageEvent = serde_json::from_value(serde_json::json!({
            "event": "blob",
            "tab_id": 7,
            "filename": "eBay-awaiting-shipment-report-2025-01-07.csv",
            "content_base64": "U2FsZXMgUmVjb3JkIE51bWJlcgox"
        }))
        .unwrap();
        assert!(matches!(registry.handle(blob).await, PageOutcome::Submitted(_)));
        assert_eq!(sink.kinds(), vec!["page.ready", "capture.submit"]);
        match &sink.sent.lock().unwrap()[1] {
            Request::CaptureSubmit(capture) => {
                assert_eq!(capture.tab_id, Some(7));
                assert_eq!(capture.account.as_ref().map(AccountId::as_str), Some("seller123"));
                assert_eq!(capture.raw_bytes, b"Sales Record Number\n1");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(registry.len().await, 1);

        assert!(matches!(
            registry.handle(PageEvent::Closed { tab_id: 7 }).await,
            PageOutcome::Closed { known: true }
        ));
        assert!(matches!(
            registry.handle(PageEvent::Closed { tab_id: 7 }).await,
            PageOutcome::Closed { known: false }
        ));
        assert!(registry.is_empty().await);
    }
}
