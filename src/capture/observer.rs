//! Background download observer: filters browser download events by report
//! filename, acquires the bytes from disk or by refetching, and submits a
//! capture.

use super::fetch::{ContentFetcher, read_local};
use crate::classifier;
use crate::control::{EventSink, Request, SubmitReceipt};
use crate::models::{Capture, CaptureSource, ErrorKind};
use serde::{Deserialize, Serialize};
use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum DownloadState {
    InProgress,
    Complete,
    Interrupted,
}

/// A browser download event as reported by the host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DownloadEvent {
    pub download_id: String,
    pub filename: String,
    #[serde(default)]
    pub url: Option<String>,
    pub state: DownloadState,
    #[serde(default)]
    pub local_path: Option<PathBuf>,
    #[serde(default)]
    pub tab_id: Option<i64>,
    /// Session cookies for a refetch of `url`.
    #[serde(default)]
    pub cookies: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
pub enum ObserveOutcome {
    Ignored,
    Waiting,
    Submitted(SubmitReceipt),
    NotAccepted {
        kind: Option<ErrorKind>,
        message: String,
    },
    CaptureFailed {
        reason: String,
    },
}

pub struct DownloadObserver {
    sink: Arc<dyn EventSink>,
    fetcher: Arc<dyn ContentFetcher>,
    deadline: Duration,
}

impl DownloadObserver {
    pub fn new(sink: Arc<dyn EventSink>, fetcher: Arc<dyn ContentFetcher>, deadline: Duration) -> Self {
        Self {
            sink,
            fetcher,
            deadline,
        }
    }

    pub async fn handle(&self, event: DownloadEvent) -> ObserveOutcome {
        if !classifier::matches_report_filename(&event.filename, event.url.as_deref()) {
            debug!(target = "ingest.observer", download_id = %event.download_id, filename = %event.filename, "download_ignored");
            return ObserveOutcome::Ignored;
        }

        match event.state {
            DownloadState::InProgress => return ObserveOutcome::Waiting,
            DownloadState::Interrupted => {
                let reason = "download interrupted".to_string();
                warn!(
                    target = "ingest.observer",
                    download_id = %event.download_id,
                    error_kind = %ErrorKind::CaptureFailed,
                    reason = %reason,
                    "capture_dropped"
                );
                return ObserveOutcome::CaptureFailed { reason };
            }
            DownloadState::Complete => {}
        }

        let bytes = match tokio::time::timeout(self.deadline, self.acquire(&event)).await {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(reason)) => return self.drop_capture(&event, reason),
            Err(_) => {
                return self.drop_capture(
                    &event,
                    format!("content not acquired within {}s", self.deadline.as_secs()),
                );
            }
        };

        let filename = Path::new(&event.filename)
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or(&event.filename)
            .to_string();
        let mut capture = Capture::new(CaptureSource::DownloadObserver, filename, bytes);
        if let Some(url) = &event.url {
            capture = capture.with_url(url.clone());
        }
        if let Some(tab_id) = event.tab_id {
            capture = capture.with_tab(tab_id);
        }

        let reply = match self.sink.send(Request::CaptureSubmit(capture)).await {
            Ok(reply) => reply,
            Err(err) => return self.drop_capture(&event, err.to_string()),
        };
        match reply.into_result::<SubmitReceipt>() {
            Ok(receipt) => {
                info!(
                    target = "ingest.observer",
                    download_id = %event.download_id,
                    item_id = %receipt.item_id,
                    deduplicated = receipt.deduplicated,
                    "download_captured"
                );
                ObserveOutcome::Submitted(receipt)
            }
            Err(err) => ObserveOutcome::NotAccepted {
                kind: err.kind(),
                message: err.to_string(),
            },
        }
    }

    /// Disk first, then a refetch with the session cookies.
    async fn acquire(&self, event: &DownloadEvent) -> Result<Vec<u8>, String> {
        let mut failures = Vec::new();
        if let Some(path) = &event.local_path {
            match read_local(path).await {
                Ok(bytes) => return Ok(bytes),
                Err(err) => failures.push(format!("{}: {err}", path.display())),
            }
        }
        if let Some(url) = &event.url {
            match self.fetcher.fetch(url, event.cookies.as_deref()).await {
                Ok(bytes) => return Ok(bytes),
                Err(err) => failures.push(format!("{url}: {err}")),
            }
        }
        if failures.is_empty() {
            Err("no local path or url to read from".to_string())
        } else {
            Err(failures.join("; "))
        }
    }

    fn drop_capture(&self, event: &DownloadEvent, reason: String) -> ObserveOutcome {
        warn!(
            target = "ingest.observer",
            download_id = %event.download_id,
            filename = %event.filename,
            error_kind = %ErrorKind::CaptureFailed,
            reason = %reason,
            "capture_dropped"
        );
        ObserveOutcome::CaptureFailed { reason }
    }
}

/// Polls a download directory and turns newly finished report files into
/// complete download events. Files present at startup are left alone; a
/// file is reported once its size is unchanged across two polls.
pub struct DownloadDirWatcher {
    dir: PathBuf,
    seen: HashSet<PathBuf>,
    sizes: HashMap<PathBuf, u64>,
}

impl DownloadDirWatcher {
    pub async fn new(dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = dir.into();
        let mut watcher = Self {
            dir,
            seen: HashSet::new(),
            sizes: HashMap::new(),
        };
        for (path, _) in watcher.list().await? {
            watcher.seen.insert(path);
        }
        Ok(watcher)
    }

    async fn list(&self) -> std::io::Result<Vec<(PathBuf, u64)>> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let metadata = entry.metadata().await?;
            if metadata.is_file() {
                files.push((entry.path(), metadata.len()));
            }
        }
        Ok(files)
    }

    /// Entries for files that have left the directory are forgotten, so a
    /// later download under the same name is reported again.
    pub async fn scan(&mut self) -> std::io::Result<Vec<DownloadEvent>> {
        let listed = self.list().await?;
        let present: HashSet<&PathBuf> = listed.iter().map(|(path, _)| path).collect();
        self.seen.retain(|path| present.contains(path));
        self.sizes.retain(|path, _| present.contains(path));

        let mut events = Vec::new();
        for (path, size) in listed {
            if self.seen.contains(&path) {
                continue;
            }
            let name = path
                .file_name()
                .and_then(|name| name.to_str())
                .unwrap_or_default()
                .to_string();
            if name.ends_with(".crdownload") || name.ends_with(".part") || name.ends_with(".tmp") {
                continue;
            }
            if !classifier::matches_report_filename(&name, None) {
                self.seen.insert(path);
                continue;
            }
            let stable = self.sizes.get(&path) == Some(&size) && size > 0;
            if !stable {
                self.sizes.insert(path, size);
                continue;
            }
            self.sizes.remove(&path);
            self.seen.insert(path.clone());
            events.push(DownloadEvent {
                download_id: format!("file:{}", path.display()),
                filename: name,
                url: None,
                state: DownloadState::Complete,
                local_path: Some(path),
                tab_id: None,
                cookies: None,
            });
        }
        Ok(events)
    }

    pub async fn run(
        mut self,
        observer: Arc<DownloadObserver>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(target = "ingest.observer", dir = %self.dir.display(), "download_watcher_started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => break,
            }
            match self.scan().await {
                Ok(events) => {
                    for event in events {
                        observer.handle(event).await;
                    }
                }
                Err(err) => warn!(target = "ingest.observer", dir = %self.dir.display(), error = %err, "download_scan_failed"),
            }
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
    struct CollectingSink {
        captures: Mutex<Vec<Capture>>,
    }

    #[async_trait]
    impl EventSink for CollectingSink {
        async fn send(&self, request: Request) -> Result<Reply, ControlError> {
            if let Request::CaptureSubmit(capture) = request {
                self.captures.lock().unwrap().push(capture);
            }
            Ok(Reply::ok(SubmitReceipt {
                item_id: Uuid::new_v4(),
                deduplicated: false,
                disposition: Disposition::Queued,
            }))
        }
    }

    struct RefetchOnly {
        stall: bool,
    }

    #[async_trait]
    impl ContentFetcher for RefetchOnly {
        async fn fetch(&self, _url: &str, cookies: Option<&str>) -> Result<Vec<u8>, FetchError> {
            if self.stall {
                tokio::time::sleep(Duration::from_secs(120)).await;
            }
            match cookies {
                Some(_) => Ok(b"Item number,Title,Current price\n1,Lamp,9.99\n".to_vec()),
                None => Err(FetchError::Status(401)),
            }
        }
    }

    fn observer(stall: bool) -> (DownloadObserver, Arc<CollectingSink>) {
        let sink = Arc::new(CollectingSink::default());
        let observer = DownloadObserver::new(
            sink.clone(),
            Arc::new(RefetchOnly { stall }),
            Duration::from_secs(30),
        );
        (observer, sink)
    }

    fn event(filename: &str, state: DownloadState) -> DownloadEvent {
        DownloadEvent {
            download_id: "7".into(),
            filename: filename.into(),
            url: Some("https://www.ebay.com/sh/reports/7".into()),
            state,
            local_path: None,
            tab_id: Some(3),
            cookies: Some("s=1".into()),
        }
    }

    #[tokio::test]
    async fn non_report_downloads_are_ignored() {
        let (observer, sink) = observer(false);
        assert_eq!(
            observer.handle(event("holiday-photo.png", DownloadState::Complete)).await,
            ObserveOutcome::Ignored
        );
        assert!(sink.captures.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn completed_download_is_read_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("eBay-all-active-listings-report-2025.CSV");
        std::fs::write(&path, b"Item number,Title,Current price\n1,Lamp,9.99\n").unwrap();
        let (observer, sink) = observer(false);
        let mut download = event("eBay-all-active-listings-report-2025.CSV", DownloadState::Complete);
        download.local_path = Some(path);
        download.cookies = None;

        assert!(matches!(observer.handle(download).await, ObserveOutcome::Submitted(_)));
        let captures = sink.captures.lock().unwrap();
        assert_eq!(captures[0].source, CaptureSource::DownloadObserver);
        assert_eq!(captures[0].tab_id, Some(3));
        assert!(captures[0].account.is_none());
    }

    #[tokio::test]
    async fn missing_file_falls_back_to_refetch() {
        let (observer, sink) = observer(false);
        let mut download = event("eBay-all-active-listings-report-1.csv", DownloadState::Complete);
        download.local_path = Some(PathBuf::from("/nonexistent/report.csv"));
        assert!(matches!(observer.handle(download).await, ObserveOutcome::Submitted(_)));
        assert_eq!(sink.captures.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unreadable_download_is_dropped_as_capture_failed() {
        let (observer, sink) = observer(false);
        let mut download = event("eBay-all-active-listings-report-1.csv", DownloadState::Complete);
        download.cookies = None;
        assert!(matches!(observer.handle(download).await, ObserveOutcome::CaptureFailed { .. }));
        assert!(matches!(
            observer
                .handle(event("eBay-all-active-listings-report-1.csv", DownloadState::Interrupted))
                .await,
            ObserveOutcome::CaptureFailed { .. }
        ));
        assert_eq!(
            observer
                .handle(event("eBay-all-active-listings-report-1.csv", DownloadState::InProgress))
                .await,
            ObserveOutcome::Waiting
        );
        assert!(sink.captures.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn acquisition_deadline_drops_capture() {
        let (observer, sink) = observer(true);
        let outcome = observer
            .handle(event("eBay-all-active-listings-report-1.csv", DownloadState::Complete))
            .await;
        match outcome {
            ObserveOutcome::CaptureFailed { reason } => assert!(reason.contains("30s")),
            other => panic!("unexpected {other:?}"),
        }
        assert!(sink.captures.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn watcher_reports_new_stable_report_files_once() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("eBay-sold-listings-report-old.csv"), b"x").unwrap();
        let mut watcher = DownloadDirWatcher::new(dir.path()).await.unwrap();

        let fresh = dir.path().join("eBay-sold-listings-report-new.csv");
        std::fs::write(&fresh, b"Item number,Title,Sold for\n1,Lamp,5\n").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"hello").unwrap();
        std::fs::write(dir.path().join("eBay-sold-listings-report-x.csv.crdownload"), b"partial").unwrap();

        assert!(watcher.scan().await.unwrap().is_empty());
        let events = watcher.scan().await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].local_path.as_deref(), Some(fresh.as_path()));
        assert_eq!(events[0].state, DownloadState::Complete);
        assert!(watcher.scan().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn watcher_forgets_removed_files() {
        let dir = tempfile::tempdir().unwrap();
        let report = dir.path().join("eBay-all-active-listings-report-1.csv");
        std::fs::write(&report, b"Item number,Title,Current price\n1,Lamp,5\n").unwrap();
        std::fs::write(dir.path().join("readme.txt"), b"hello").unwrap();
        let mut watcher = DownloadDirWatcher::new(dir.path()).await.unwrap();
        assert_eq!(watcher.seen.len(), 2);

        std::fs::remove_file(&report).unwrap();
        std::fs::remove_file(dir.path().join("readme.txt")).unwrap();
        assert!(watcher.scan().await.unwrap().is_empty());
        assert!(watcher.seen.is_empty());
        assert!(watcher.sizes.is_empty());

        std::fs::write(&report, b"Item number,Title,Current price\n2,Hook,4\n").unwrap();
        assert!(watcher.scan().await.unwrap().is_empty());
        let events = watcher.scan().await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].local_path.as_deref(), Some(report.as_path()));
    }
}
