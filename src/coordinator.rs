//! The background worker. A single task owns the queue, history, account
//! cache and connection status; everything else reaches it through the
//! control-plane mailbox, so no state here is shared or locked.

use crate::account::{self, AccountCache, AccountSession, ButtonStatus, ResolvedFrom};
use crate::backend::Backend;
use crate::classifier;
use crate::clock::Clock;
use crate::config::IngestConfig;
use crate::control::{
    ControlHandle, Disposition, DownloadInitiated, Envelope, ExportedItem, LogExport, PageReady,
    ProcessSummary, RedetectRequest, RedetectView, Reply, Request, SimulateRequest, StatusView,
    SubmitReceipt,
};
use crate::fingerprint::fingerprint;
use crate::health::{self, ProbeReport};
use crate::history::History;
use crate::models::{
    AccountId, Capture, CaptureSource, ConnectionStatus, ErrorKind, HistoryEntry, HistoryOutcome,
    IngestError, ItemError, ItemMetadata, ItemState, PersistedItem, QueueItem, ReportKind,
    Settings,
};
use crate::notify::{Notification, Notifier, NotifyLevel};
use crate::queue::{EnqueueOutcome, IngestionQueue, NewItem, RetryDecision};
use crate::store::{
    PersistedAccounts, PersistedQueue, PersistedState, SCHEMA_VERSION, StateStore, load_state,
    save_state,
};
use crate::uploader::{AttemptOutcome, AttemptReport, RetryPolicy, UploadJob, Uploader};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::{
    sync::{broadcast, mpsc, watch},
    task::{Id as TaskId, JoinError, JoinHandle, JoinSet},
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};
use uuid::Uuid;

const MAILBOX_CAPACITY: usize = 64;
const NOTIFY_CAPACITY: usize = 64;
const RECENT_LIMIT: usize = 10;
const TICK: Duration = Duration::from_secs(1);

pub struct CoordinatorDeps {
    pub config: IngestConfig,
    pub backend: Arc<dyn Backend>,
    pub store: Arc<dyn StateStore>,
}

/// Owner-side handle: control access, notification feed and shutdown.
pub struct CoordinatorHandle {
    control: ControlHandle,
    notifications: broadcast::Sender<Notification>,
    shutdown: watch::Sender<bool>,
    worker: JoinHandle<()>,
    probe: JoinHandle<()>,
}

impl CoordinatorHandle {
    pub fn control(&self) -> ControlHandle {
        self.control.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.notifications.subscribe()
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Cancels inflight uploads, returns their items to pending and flushes
    /// state before returning.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.worker.await {
            warn!(target = "ingest.coordinator", error = %err, "coordinator_join_failed");
        }
        if let Err(err) = self.probe.await {
            warn!(target = "ingest.coordinator", error = %err, "probe_join_failed");
        }
    }
}

/// Restores persisted state, then starts the worker and the health probe.
pub async fn spawn(deps: CoordinatorDeps) -> CoordinatorHandle {
    let CoordinatorDeps {
        config,
        backend,
        store,
    } = deps;
    let (mailbox_tx, mailbox_rx) = mpsc::channel(MAILBOX_CAPACITY);
    let (probe_tx, probe_rx) = mpsc::channel(4);
    let (notify_tx, _) = broadcast::channel(NOTIFY_CAPACITY);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut coordinator = Coordinator::new(config, backend.clone(), store, notify_tx.clone());
    coordinator.restore().await;

    let probe = health::spawn_probe_loop(
        backend,
        coordinator.config.health_interval(),
        coordinator.config.health_down_interval(),
        probe_tx,
        shutdown_rx.clone(),
    );
    let worker = tokio::spawn(coordinator.run(mailbox_rx, probe_rx, shutdown_rx));

    CoordinatorHandle {
        control: ControlHandle::new(mailbox_tx),
        notifications: notify_tx,
        shutdown: shutdown_tx,
        worker,
        probe,
    }
}

struct Coordinator {
    clock: Clock,
    config: IngestConfig,
    store: Arc<dyn StateStore>,
    uploader: Uploader,
    retry: RetryPolicy,
    queue: IngestionQueue,
    history: History,
    accounts: AccountCache,
    sessions: HashMap<i64, AccountSession>,
    last_account: Option<AccountId>,
    settings: Settings,
    connection: ConnectionStatus,
    connection_tx: watch::Sender<ConnectionStatus>,
    probed: bool,
    notifier: Notifier,
    inflight: JoinSet<AttemptReport>,
    inflight_items: HashMap<TaskId, Uuid>,
    dirty: bool,
}

impl Coordinator {
    fn new(
        config: IngestConfig,
        backend: Arc<dyn Backend>,
        store: Arc<dyn StateStore>,
        notify_tx: broadcast::Sender<Notification>,
    ) -> Self {
        let (connection_tx, connection_rx) = watch::channel(ConnectionStatus::Down);
        Self {
            clock: Clock::start(),
            uploader: Uploader::new(backend, config.upload_timeout()).with_connection(connection_rx),
            retry: config.retry_policy(),
            queue: IngestionQueue::new(config.queue_config()),
            history: History::new(config.history_capacity),
            accounts: AccountCache::new(config.account_ttl()),
            sessions: HashMap::new(),
            last_account: None,
            settings: Settings::default(),
            connection: ConnectionStatus::Down,
            connection_tx,
            probed: false,
            notifier: Notifier::new(notify_tx, config.notify_coalesce()),
            inflight: JoinSet::new(),
            inflight_items: HashMap::new(),
            dirty: false,
            store,
            config,
        }
    }

    async fn run(
        mut self,
        mut mailbox: mpsc::Receiver<Envelope>,
        mut probes: mpsc::Receiver<ProbeReport>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(
            target = "ingest.coordinator",
            store = %self.store.describe(),
            concurrency = self.config.upload_concurrency,
            "coordinator_started"
        );
        let mut tick = tokio::time::interval(TICK);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let wake = self.next_wake();
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                envelope = mailbox.recv() => match envelope {
                    Some(envelope) => {
                        let reply = self.dispatch(envelope.request).await;
                        let _ = envelope.reply.send(reply);
                    }
                    None => break,
                },
                Some(joined) = self.inflight.join_next_with_id(), if !self.inflight.is_empty() => {
                    self.on_joined(joined).await;
                }
                Some(report) = probes.recv() => self.on_probe(report),
                _ = sleep_until(wake) => {}
                _ = tick.tick() => self.on_tick().await,
            }
            self.schedule(false);
        }

        self.stop().await;
    }

    /// Earliest future wake time among waiting items.
    fn next_wake(&self) -> Option<Instant> {
        let now = self.clock.now();
        self.queue
            .items()
            .iter()
            .filter(|item| matches!(item.state, ItemState::Pending | ItemState::RetryWait))
            .map(|item| item.next_attempt_at)
            .filter(|at| *at > now)
            .min()
            .map(|at| self.clock.deadline_for(at))
    }

    async fn dispatch(&mut self, request: Request) -> Reply {
        debug!(target = "ingest.coordinator", kind = request.kind(), "control_request");
        match request {
            Request::CaptureSubmit(capture) => into_reply(self.submit(capture).await),
            Request::StatusGet => Reply::ok(self.status()),
            Request::AccountRedetect(request) => Reply::ok(self.redetect(request)),
            Request::TestSimulate(request) => into_reply(self.simulate(request).await),
            Request::PageReady(ready) => Reply::ok(self.page_ready(ready)),
            Request::DownloadInitiated(initiated) => Reply::ok(self.download_initiated(initiated)),
            Request::SettingsGet => Reply::ok(self.settings),
            Request::SettingsUpdate(patch) => {
                self.settings.apply(&patch);
                self.notifier.set_enabled(self.settings.notifications);
                self.dirty = true;
                info!(
                    target = "ingest.coordinator",
                    debug_mode = self.settings.debug_mode,
                    auto_process = self.settings.auto_process,
                    notifications = self.settings.notifications,
                    "settings_updated"
                );
                Reply::ok(self.settings)
            }
            Request::LogsClear => {
                let cleared = self.history.clear();
                self.dirty = true;
                info!(target = "ingest.coordinator", cleared, "history_cleared");
                Reply::ok(json!({ "cleared": cleared }))
            }
            Request::LogsExport => Reply::ok(self.export()),
            Request::QueueProcess => {
                let started = self.schedule(true);
                Reply::ok(ProcessSummary {
                    started,
                    inflight: self.inflight.len(),
                })
            }
        }
    }

    async fn submit(&mut self, capture: Capture) -> Result<SubmitReceipt, IngestError> {
        let now = self.clock.now();
        crate::metrics::capture_received(capture.source);

        let kind =
            classifier::classify_payload(&capture.filename, capture.url.as_deref(), &capture.raw_bytes);
        if kind == ReportKind::Unknown {
            return Err(self.refuse(
                &capture,
                ErrorKind::ClassifyFailed,
                format!("{} is not a recognised eBay report", capture.filename),
                now,
            ));
        }
        if let Err(violation) = classifier::check_structure(kind, &capture.raw_bytes) {
            return Err(self.refuse(
                &capture,
                ErrorKind::SchemaInvalid,
                format!("{}: {violation}", capture.filename),
                now,
            ));
        }
        let account = match self.attribute(&capture, now) {
            Some(account) => account,
            None => {
                return Err(self.refuse(
                    &capture,
                    ErrorKind::AccountUnresolved,
                    format!("no seller account known for {}", capture.filename),
                    now,
                ));
            }
        };

        if let Some(tab_id) = capture.tab_id {
            self.session_mut(tab_id, now).last_capture_at = Some(now);
        }

        let Capture {
            capture_id,
            source,
            filename,
            url,
            captured_at,
            raw_bytes,
            tab_id,
            ..
        } = capture;
        let fingerprint = fingerprint(&raw_bytes);
        let payload: Arc<[u8]> = Arc::from(raw_bytes);
        let new = NewItem {
            fingerprint: fingerprint.clone(),
            account: account.clone(),
            kind,
            filename: filename.clone(),
            payload: payload.clone(),
            metadata: ItemMetadata {
                captured_at,
                source_url: url,
                extension_version: self.config.extension_version.clone(),
                source,
                tab_id,
            },
        };

        let outcome = self.queue.enqueue(new, now).map_err(|err| {
            crate::metrics::enqueue_outcome(ErrorKind::QueueFull.as_str());
            warn!(
                target = "ingest.coordinator",
                %capture_id,
                error_kind = %ErrorKind::QueueFull,
                reason = %err,
                "capture_rejected"
            );
            IngestError::new(ErrorKind::QueueFull, err.to_string())
        })?;
        self.dirty = true;

        match outcome {
            EnqueueOutcome::Queued { item_id, evicted } => {
                crate::metrics::enqueue_outcome("queued");
                if let Err(err) = self.store.write_payload(item_id, &payload).await {
                    warn!(target = "ingest.coordinator", %item_id, error = %err, "payload_write_failed");
                }
                if let Some(evicted) = evicted {
                    self.queue.record_terminal(
                        evicted.fingerprint.clone(),
                        evicted.item_id,
                        ItemState::Abandoned,
                        now,
                    );
                    let mut entry = history_entry(&evicted, HistoryOutcome::Abandoned, now);
                    entry.error_kind = Some(ErrorKind::Abandoned);
                    entry.reason = Some("evicted: queue full".to_string());
                    self.finish(entry).await;
                    self.notify(
                        NotifyLevel::Warning,
                        format!("Dropped {} for {}: queue full", evicted.filename, evicted.account),
                        now,
                    );
                }
                info!(
                    target = "ingest.coordinator",
                    %item_id,
                    %capture_id,
                    %account,
                    %kind,
                    fingerprint = %fingerprint.short(),
                    source = source.as_str(),
                    "capture_queued"
                );
                Ok(SubmitReceipt {
                    item_id,
                    deduplicated: false,
                    disposition: Disposition::Queued,
                })
            }
            EnqueueOutcome::AlreadyQueued {
                item_id,
                metadata_updated,
            } => {
                crate::metrics::enqueue_outcome("already-queued");
                info!(
                    target = "ingest.coordinator",
                    %item_id,
                    %capture_id,
                    metadata_updated,
                    "capture_deduplicated"
                );
                Ok(SubmitReceipt {
                    item_id,
                    deduplicated: true,
                    disposition: Disposition::AlreadyQueued,
                })
            }
            EnqueueOutcome::RecentlySucceeded {
                item_id,
                succeeded_at,
            } => {
                crate::metrics::enqueue_outcome(ErrorKind::DedupSkipped.as_str());
                info!(
                    target = "ingest.coordinator",
                    %item_id,
                    %capture_id,
                    error_kind = %ErrorKind::DedupSkipped,
                    %succeeded_at,
                    "capture_dedup_skipped"
                );
                self.history.push(HistoryEntry {
                    item_id,
                    fingerprint,
                    account,
                    kind,
                    filename,
                    outcome: HistoryOutcome::DedupSkipped,
                    error_kind: Some(ErrorKind::DedupSkipped),
                    reason: Some(format!("identical report uploaded at {succeeded_at}")),
                    rows_processed: None,
                    rows_skipped: None,
                    import_id: None,
                    attempts: 0,
                    recorded_at: now,
                });
                Ok(SubmitReceipt {
                    item_id,
                    deduplicated: true,
                    disposition: Disposition::DedupSkipped,
                })
            }
        }
    }

    /// Logs and surfaces a capture that never reaches the queue.
    fn refuse(
        &mut self,
        capture: &Capture,
        kind: ErrorKind,
        message: String,
        now: DateTime<Utc>,
    ) -> IngestError {
        crate::metrics::enqueue_outcome(kind.as_str());
        warn!(
            target = "ingest.coordinator",
            capture_id = %capture.capture_id,
            filename = %capture.filename,
            source = capture.source.as_str(),
            error_kind = %kind,
            reason = %message,
            "capture_rejected"
        );
        self.notify(NotifyLevel::Warning, message.clone(), now);
        IngestError::new(kind, message)
    }

    /// In-band account, then the tab's cached identity. Manual test captures
    /// and deployments that allow it fall back to the placeholder account.
    fn attribute(&mut self, capture: &Capture, now: DateTime<Utc>) -> Option<AccountId> {
        if let Some(account) = capture.account.clone() {
            if let Some(tab_id) = capture.tab_id {
                self.accounts.put(tab_id, account.clone(), now);
                self.session_mut(tab_id, now).account = Some(account.clone());
            }
            self.last_account = Some(account.clone());
            return Some(account);
        }
        if let Some(account) = capture
            .tab_id
            .and_then(|tab_id| self.accounts.get(tab_id, now))
            .cloned()
        {
            return Some(account);
        }
        if self.config.allow_unattributed || capture.source == CaptureSource::ManualTest {
            return Some(AccountId::unattributed());
        }
        None
    }

    async fn simulate(&mut self, request: SimulateRequest) -> Result<SubmitReceipt, IngestError> {
        let (filename, content) = simulated_report(request.kind);
        let mut capture = Capture::new(CaptureSource::ManualTest, filename, content.as_bytes().to_vec());
        if let Some(account) = request.account.or_else(|| self.last_account.clone()) {
            capture = capture.with_account(account);
        }
        if let Some(tab_id) = request.tab_id {
            capture = capture.with_tab(tab_id);
        }
        info!(target = "ingest.coordinator", kind = %request.kind, "simulated_capture");
        self.submit(capture).await
    }

    fn status(&self) -> StatusView {
        StatusView {
            connection: self.connection,
            queue: self.queue.counts(),
            account: self.last_account.clone(),
            recent: self.history.recent(RECENT_LIMIT),
        }
    }

    fn session_mut(&mut self, tab_id: i64, now: DateTime<Utc>) -> &mut AccountSession {
        self.sessions
            .entry(tab_id)
            .or_insert_with(|| AccountSession::new(tab_id, now))
    }

    fn page_ready(&mut self, ready: PageReady) -> AccountSession {
        let now = self.clock.now();
        if let Some(account) = ready.account.clone() {
            self.accounts.put(ready.tab_id, account.clone(), now);
            self.last_account = Some(account);
            self.dirty = true;
        }
        let session = self.session_mut(ready.tab_id, now);
        session.page_kind = ready.page_kind;
        session.download_button = ready.download_button;
        if ready.account.is_some() {
            session.account = ready.account;
        }
        session.updated_at = now;
        debug!(
            target = "ingest.coordinator",
            tab_id = ready.tab_id,
            url = %ready.url,
            page_kind = ?session.page_kind,
            "page_ready"
        );
        session.clone()
    }

    fn download_initiated(&mut self, initiated: DownloadInitiated) -> Option<AccountSession> {
        info!(
            target = "ingest.coordinator",
            tab_id = initiated.tab_id,
            button = %initiated.button_text,
            url = initiated.url.as_deref(),
            at = %initiated.at,
            "download_initiated"
        );
        let tab_id = initiated.tab_id?;
        let now = self.clock.now();
        let session = self.session_mut(tab_id, now);
        session.download_button = ButtonStatus::Found {
            label: initiated.button_text,
        };
        session.updated_at = now;
        Some(session.clone())
    }

    fn redetect(&mut self, request: RedetectRequest) -> RedetectView {
        let now = self.clock.now();
        let tab_id = request.tab_id;
        let Some(mut page) = request.page else {
            self.accounts.invalidate(tab_id);
            self.dirty = true;
            let account = self
                .sessions
                .get(&tab_id)
                .and_then(|session| session.account.clone());
            info!(target = "ingest.coordinator", tab_id, "account_cache_invalidated");
            return RedetectView {
                tab_id,
                resolved_from: account.as_ref().map(|_| "session".to_string()),
                account,
            };
        };

        page.tab_id.get_or_insert(tab_id);
        let resolved = account::resolve(&page, Some(&self.accounts), now);
        if let Some((account, from)) = &resolved {
            if *from != ResolvedFrom::Cache {
                self.accounts.put(tab_id, account.clone(), now);
                self.dirty = true;
            }
            self.session_mut(tab_id, now).account = Some(account.clone());
            self.last_account = Some(account.clone());
        }
        info!(
            target = "ingest.coordinator",
            tab_id,
            account = resolved.as_ref().map(|(account, _)| account.as_str()),
            "account_redetected"
        );
        RedetectView {
            tab_id,
            resolved_from: resolved.as_ref().map(|(_, from)| resolved_label(*from).to_string()),
            account: resolved.map(|(account, _)| account),
        }
    }

    fn export(&self) -> LogExport {
        let with_trail = self.settings.debug_mode;
        LogExport {
            exported_at: self.clock.now(),
            history: self.history.entries(),
            queue: self
                .queue
                .items()
                .iter()
                .map(|item| ExportedItem {
                    item: PersistedItem::from(item),
                    last_error: item.last_error.clone(),
                    trail: with_trail.then(|| item.trail.clone()),
                })
                .collect(),
        }
    }

    /// Promotes due retries and starts uploads up to the effective
    /// concurrency. Automatic passes are skipped while `auto_process` is off.
    fn schedule(&mut self, manual: bool) -> usize {
        let now = self.clock.now();
        for item_id in self.queue.promote_due(now) {
            self.dirty = true;
            self.trace_transition(item_id, ItemState::RetryWait, ItemState::Pending);
        }
        if !manual && !self.settings.auto_process {
            return 0;
        }

        let limit = health::effective_concurrency(self.connection, self.config.upload_concurrency);
        let mut started = 0;
        while self.inflight.len() < limit {
            let Some(item_id) = self.queue.next_ready(now) else {
                break;
            };
            let job = match self.queue.mark_inflight(item_id) {
                Ok(item) => UploadJob::from(item),
                Err(err) => {
                    warn!(target = "ingest.coordinator", %item_id, error = %err, "pick_failed");
                    break;
                }
            };
            self.trace_transition(item_id, ItemState::Pending, ItemState::Inflight);
            let uploader = self.uploader.clone();
            let handle = self.inflight.spawn(async move { uploader.attempt(job).await });
            self.inflight_items.insert(handle.id(), item_id);
            self.dirty = true;
            started += 1;
        }
        if started > 0 {
            crate::metrics::queue_depth(self.queue.counts());
        }
        started
    }

    async fn on_joined(&mut self, joined: Result<(TaskId, AttemptReport), JoinError>) {
        match joined {
            Ok((task_id, report)) => {
                self.inflight_items.remove(&task_id);
                self.apply_attempt(report).await;
            }
            Err(err) => {
                let Some(item_id) = self.inflight_items.remove(&err.id()) else {
                    return;
                };
                if err.is_cancelled() {
                    if let Err(err) = self.queue.cancel_inflight(item_id) {
                        warn!(target = "ingest.coordinator", %item_id, error = %err, "cancel_failed");
                    } else {
                        self.trace_transition(item_id, ItemState::Inflight, ItemState::Pending);
                    }
                    self.dirty = true;
                    return;
                }
                let report = AttemptReport {
                    item_id,
                    outcome: AttemptOutcome::Retryable {
                        reason: format!("upload task failed: {err}"),
                        retry_after: None,
                    },
                    elapsed: Duration::ZERO,
                };
                self.apply_attempt(report).await;
            }
        }
    }

    async fn apply_attempt(&mut self, report: AttemptReport) {
        let now = self.clock.now();
        let item_id = report.item_id;
        self.dirty = true;
        match report.outcome {
            AttemptOutcome::Succeeded {
                rows_processed,
                rows_skipped,
                import_id,
            } => match self.queue.succeed(item_id, now) {
                Ok(item) => {
                    self.trace_transition(item_id, ItemState::Inflight, ItemState::Succeeded);
                    let mut entry = history_entry(&item, HistoryOutcome::Succeeded, now);
                    entry.rows_processed = Some(rows_processed);
                    entry.rows_skipped = Some(rows_skipped);
                    entry.import_id = import_id;
                    self.finish(entry).await;
                    self.notify(
                        NotifyLevel::Success,
                        format!(
                            "Uploaded {} for {}: {rows_processed} rows imported, {rows_skipped} skipped",
                            item.kind, item.account
                        ),
                        now,
                    );
                }
                Err(err) => warn!(target = "ingest.coordinator", %item_id, error = %err, "complete_failed"),
            },
            AttemptOutcome::Rejected { kind, reason } => {
                match self
                    .queue
                    .reject(item_id, ItemError::new(kind, reason.clone(), now), now)
                {
                    Ok(item) => {
                        self.trace_transition(item_id, ItemState::Inflight, ItemState::Rejected);
                        let entry = history_entry(&item, HistoryOutcome::Rejected, now);
                        self.finish(entry).await;
                        self.notify(
                            NotifyLevel::Error,
                            format!("Upload of {} rejected: {reason}", item.filename),
                            now,
                        );
                    }
                    Err(err) => warn!(target = "ingest.coordinator", %item_id, error = %err, "reject_failed"),
                }
            }
            AttemptOutcome::Retryable {
                reason,
                retry_after,
            } => {
                let failures = self
                    .queue
                    .get(item_id)
                    .map(|item| item.attempts + 1)
                    .unwrap_or(1);
                let wait = match retry_after {
                    Some(wait) => wait.min(self.retry.cap),
                    None => self.retry.next_delay(failures),
                };
                let delay = chrono::Duration::from_std(wait).unwrap_or_else(|_| chrono::Duration::zero());
                let error = ItemError::new(ErrorKind::TransientNetwork, reason.clone(), now);
                match self.queue.fail_retryable(item_id, error, delay, now) {
                    Ok(RetryDecision::Scheduled {
                        attempts,
                        next_attempt_at,
                    }) => {
                        self.trace_transition(item_id, ItemState::Inflight, ItemState::RetryWait);
                        info!(
                            target = "ingest.coordinator",
                            %item_id,
                            attempts,
                            %next_attempt_at,
                            wait_ms = wait.as_millis() as u64,
                            "retry_scheduled"
                        );
                    }
                    Ok(RetryDecision::Abandoned(item)) => {
                        self.trace_transition(item_id, ItemState::RetryWait, ItemState::Abandoned);
                        let mut entry = history_entry(&item, HistoryOutcome::Abandoned, now);
                        entry.error_kind = Some(ErrorKind::Abandoned);
                        self.finish(entry).await;
                        self.notify(
                            NotifyLevel::Error,
                            format!(
                                "Gave up on {} after {} attempts: {reason}",
                                item.filename, item.attempts
                            ),
                            now,
                        );
                    }
                    Err(err) => warn!(target = "ingest.coordinator", %item_id, error = %err, "retry_failed"),
                }
            }
            AttemptOutcome::Deferred { reason } => match self.queue.cancel_inflight(item_id) {
                Ok(()) => {
                    self.trace_transition(item_id, ItemState::Inflight, ItemState::Pending);
                    debug!(target = "ingest.coordinator", %item_id, reason = %reason, "attempt_deferred");
                }
                Err(err) => warn!(target = "ingest.coordinator", %item_id, error = %err, "defer_failed"),
            },
        }
    }

    /// Terminal bookkeeping: history, payload removal, metrics.
    async fn finish(&mut self, entry: HistoryEntry) {
        crate::metrics::terminal_outcome(entry.outcome.as_str());
        info!(
            target = "ingest.coordinator",
            item_id = %entry.item_id,
            outcome = entry.outcome.as_str(),
            error_kind = entry.error_kind.map(|kind| kind.as_str()),
            reason = entry.reason.as_deref(),
            attempts = entry.attempts,
            "item_terminal"
        );
        if let Err(err) = self.store.remove_payload(entry.item_id).await {
            warn!(target = "ingest.coordinator", item_id = %entry.item_id, error = %err, "payload_remove_failed");
        }
        self.history.push(entry);
        self.dirty = true;
    }

    fn on_probe(&mut self, report: ProbeReport) {
        let previous = self.connection;
        let first = !self.probed;
        self.probed = true;
        self.connection = report.status;
        self.connection_tx.send_replace(report.status);
        crate::metrics::connection_status(report.status);
        if previous == report.status {
            return;
        }
        info!(
            target = "ingest.coordinator",
            from = previous.as_str(),
            to = report.status.as_str(),
            http_status = report.http_status,
            error = report.error.as_deref(),
            "connection_changed"
        );
        if first {
            return;
        }
        let now = self.clock.now();
        match (previous, report.status) {
            (_, ConnectionStatus::Down) => {
                self.notify(NotifyLevel::Warning, "Backend unreachable; uploads paused", now)
            }
            (ConnectionStatus::Down, _) => {
                self.notify(NotifyLevel::Info, "Backend reachable; uploads resumed", now)
            }
            _ => {}
        }
    }

    async fn on_tick(&mut self) {
        let now = self.clock.now();
        let pruned = self.queue.prune_dedup(now);
        let expired = self.accounts.purge_expired(now);
        if pruned + expired > 0 {
            debug!(target = "ingest.coordinator", pruned, expired, "housekeeping");
            self.dirty = true;
        }
        crate::metrics::queue_depth(self.queue.counts());
        self.flush().await;
    }

    fn notify(&mut self, level: NotifyLevel, message: impl Into<String>, now: DateTime<Utc>) {
        self.notifier.emit(level, message, now);
    }

    fn trace_transition(&self, item_id: Uuid, from: ItemState, to: ItemState) {
        if self.settings.debug_mode {
            info!(target = "ingest.coordinator", %item_id, %from, %to, "item_transition");
        } else {
            debug!(target = "ingest.coordinator", %item_id, %from, %to, "item_transition");
        }
    }

    async fn flush(&mut self) {
        if !self.dirty {
            return;
        }
        let (items, dedup_index) = self.queue.snapshot();
        let state = PersistedState {
            version: SCHEMA_VERSION,
            queue: PersistedQueue { items, dedup_index },
            history: self.history.entries(),
            account: PersistedAccounts {
                by_tab: self.accounts.to_persisted(),
            },
            settings: self.settings,
        };
        match save_state(self.store.as_ref(), &state).await {
            Ok(()) => self.dirty = false,
            Err(err) => warn!(target = "ingest.coordinator", error = %err, "state_flush_failed"),
        }
    }

    /// Loads the persisted document. A document that cannot be read or
    /// upgraded is logged and left untouched; the worker starts empty.
    async fn restore(&mut self) {
        let state = match load_state(self.store.as_ref()).await {
            Ok(Some(state)) => state,
            Ok(None) => return,
            Err(err) => {
                warn!(target = "ingest.coordinator", error = %err, "state_restore_failed");
                return;
            }
        };
        let now = self.clock.now();

        let mut payloads = HashMap::new();
        for item in state.queue.items.iter().filter(|item| !item.state.is_terminal()) {
            match self.store.read_payload(item.item_id).await {
                Ok(Some(bytes)) => {
                    payloads.insert(item.item_id, bytes);
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(target = "ingest.coordinator", item_id = %item.item_id, error = %err, "payload_read_failed")
                }
            }
        }

        self.settings = state.settings;
        self.notifier.set_enabled(self.settings.notifications);
        self.history.load(state.history);
        self.accounts.load_persisted(state.account.by_tab);
        self.accounts.purge_expired(now);

        let report = self
            .queue
            .restore(state.queue.items, state.queue.dedup_index, payloads);
        for lost in &report.lost {
            self.queue
                .record_terminal(lost.fingerprint.clone(), lost.item_id, ItemState::Rejected, now);
            warn!(
                target = "ingest.coordinator",
                item_id = %lost.item_id,
                filename = %lost.filename,
                error_kind = %ErrorKind::PayloadLost,
                "payload_lost"
            );
            crate::metrics::terminal_outcome(HistoryOutcome::Rejected.as_str());
            self.history.push(HistoryEntry {
                item_id: lost.item_id,
                fingerprint: lost.fingerprint.clone(),
                account: lost.account.clone(),
                kind: lost.kind,
                filename: lost.filename.clone(),
                outcome: HistoryOutcome::Rejected,
                error_kind: Some(ErrorKind::PayloadLost),
                reason: Some("report content missing after restart".to_string()),
                rows_processed: None,
                rows_skipped: None,
                import_id: None,
                attempts: lost.attempts,
                recorded_at: now,
            });
            self.notify(
                NotifyLevel::Error,
                format!("{} was lost across a restart; download it again", lost.filename),
                now,
            );
        }
        if report.requeued_inflight > 0 || !report.lost.is_empty() {
            self.dirty = true;
        }
        info!(
            target = "ingest.coordinator",
            restored = report.restored,
            requeued_inflight = report.requeued_inflight,
            lost = report.lost.len(),
            history = self.history.len(),
            "state_restored"
        );
    }

    async fn stop(&mut self) {
        self.inflight.abort_all();
        while let Some(joined) = self.inflight.join_next_with_id().await {
            self.on_joined(joined).await;
        }
        for item_id in self.queue.inflight_ids() {
            if self.queue.cancel_inflight(item_id).is_ok() {
                self.trace_transition(item_id, ItemState::Inflight, ItemState::Pending);
            }
        }
        self.inflight_items.clear();
        self.dirty = true;
        self.flush().await;
        info!(target = "ingest.coordinator", pending = self.queue.len(), "coordinator_stopped");
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn into_reply<T: Serialize>(result: Result<T, IngestError>) -> Reply {
    match result {
        Ok(value) => Reply::ok(value),
        Err(err) => err.into(),
    }
}

fn history_entry(item: &QueueItem, outcome: HistoryOutcome, now: DateTime<Utc>) -> HistoryEntry {
    HistoryEntry {
        item_id: item.item_id,
        fingerprint: item.fingerprint.clone(),
        account: item.account.clone(),
        kind: item.kind,
        filename: item.filename.clone(),
        outcome,
        error_kind: item.last_error.as_ref().map(|err| err.kind),
        reason: item.last_error.as_ref().map(|err| err.message.clone()),
        rows_processed: None,
        rows_skipped: None,
        import_id: None,
        attempts: item.attempts,
        recorded_at: now,
    }
}

fn resolved_label(from: ResolvedFrom) -> &'static str {
    match from {
        ResolvedFrom::UserInfo => "user-info",
        ResolvedFrom::Switcher => "switcher",
        ResolvedFrom::Url => "url",
        ResolvedFrom::Cache => "cache",
    }
}

/// Canned report used by `test.simulate`. Content is fixed per kind, so
/// repeated simulations exercise deduplication.
fn simulated_report(kind: ReportKind) -> (&'static str, &'static str) {
    match kind {
        ReportKind::Orders => (
            "eBay-awaiting-shipment-report-simulated.csv",
            "Sales Record Number,Order Number,Item Number,Item Title,Buyer Username,Quantity,Sold For\n\
             1001,12-34567-89012,123456789012,Simulated vintage lamp,buyer_one,1,24.99\n\
             1002,12-34567-89013,123456789013,Simulated brass hook,buyer_two,2,8.50\n",
        ),
        ReportKind::Listings => (
            "eBay-all-active-listings-report-simulated.csv",
            "Item number,Title,Custom label (SKU),Available quantity,Current price\n\
             123456789012,Simulated vintage lamp,LAMP-01,3,24.99\n\
             123456789013,Simulated brass hook,HOOK-07,12,4.25\n",
        ),
        ReportKind::SoldListings => (
            "eBay-sold-listings-report-simulated.csv",
            "Item number,Title,Sold for,Sold date,Quantity sold\n\
             123456789014,Simulated enamel pin,6.00,2025-01-05,1\n",
        ),
        ReportKind::Unknown => ("simulated-report.csv", "foo,bar\n1,2\n"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::PageSnapshot;
    use crate::backend::{
        ApiEnvelope, BackendError, BackendReply, UploadData, UploadRequest, ValidateData,
        ValidateRequest,
    };
    use crate::control::ControlError;
    use crate::models::SettingsPatch;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct AcceptingBackend {
        uploads: AtomicUsize,
    }

    #[async_trait]
    impl Backend for AcceptingBackend {
        async fn health(&self) -> Result<u16, BackendError> {
            Ok(200)
        }

        async fn validate(
            &self,
            _request: &ValidateRequest,
        ) -> Result<BackendReply<ValidateData>, BackendError> {
            Ok(BackendReply::new(
                200,
                ApiEnvelope::ok(ValidateData {
                    valid: true,
                    rows: 2,
                    errors: Vec::new(),
                }),
            ))
        }

        async fn upload(
            &self,
            _request: &UploadRequest,
        ) -> Result<BackendReply<UploadData>, BackendError> {
            self.uploads.fetch_add(1, Ordering::SeqCst);
            Ok(BackendReply::new(
                200,
                ApiEnvelope::ok(UploadData {
                    rows_processed: 2,
                    rows_skipped: 0,
                    import_id: Some("imp-1".into()),
                }),
            ))
        }
    }

    async fn start(config: IngestConfig) -> (CoordinatorHandle, Arc<AcceptingBackend>, Arc<MemoryStore>) {
        let backend = Arc::new(AcceptingBackend::default());
        let store = Arc::new(MemoryStore::new());
        let handle = spawn(CoordinatorDeps {
            config,
            backend: backend.clone(),
            store: store.clone(),
        })
        .await;
        (handle, backend, store)
    }

    async fn settle(control: &ControlHandle, done: impl Fn(&StatusView) -> bool) -> StatusView {
        for _ in 0..200 {
            let status = control.status().await.unwrap();
            if done(&status) {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
        panic!("coordinator did not settle");
    }

    #[tokio::test(start_paused = true)]
    async fn simulate_uploads_canned_report_once() {
        let (handle, backend, _) = start(IngestConfig::default()).await;
        let control = handle.control();

        let first = control.simulate(ReportKind::Listings).await.unwrap();
        assert_eq!(first.disposition, Disposition::Queued);
        let status = settle(&control, |status| !status.recent.is_empty()).await;
        assert_eq!(status.recent[0].outcome, HistoryOutcome::Succeeded);
        assert_eq!(status.recent[0].account, AccountId::unattributed());
        assert_eq!(status.recent[0].import_id.as_deref(), Some("imp-1"));

        let again = control.simulate(ReportKind::Listings).await.unwrap();
        assert_eq!(again.item_id, first.item_id);
        assert_eq!(again.disposition, Disposition::DedupSkipped);
        assert_eq!(backend.uploads.load(Ordering::SeqCst), 1);
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_simulation_is_classify_failed() {
        let (handle, _, _) = start(IngestConfig::default()).await;
        let err = handle.control().simulate(ReportKind::Unknown).await.unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::ClassifyFailed));
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn paused_auto_process_waits_for_queue_process() {
        let (handle, backend, _) = start(IngestConfig::default()).await;
        let control = handle.control();
        control
            .update_settings(SettingsPatch {
                auto_process: Some(false),
                ..SettingsPatch::default()
            })
            .await
            .unwrap();
        control.simulate(ReportKind::Orders).await.unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(backend.uploads.load(Ordering::SeqCst), 0);
        assert_eq!(control.status().await.unwrap().queue.pending, 1);

        let summary = control.process_queue().await.unwrap();
        assert_eq!(summary.started, 1);
        settle(&control, |status| !status.recent.is_empty()).await;
        assert_eq!(backend.uploads.load(Ordering::SeqCst), 1);
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn observer_captures_use_the_tabs_cached_account() {
        let (handle, _, _) = start(IngestConfig::default()).await;
        let control = handle.control();
        let bytes = b"Item number,Title,Current price\n1,Lamp,9.99\n".to_vec();

        let orphan = Capture::new(
            CaptureSource::DownloadObserver,
            "eBay-all-active-listings-report-9.csv",
            bytes.clone(),
        )
        .with_tab(4);
        let err = control.submit(orphan.clone()).await.unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::AccountUnresolved));

        let page = PageSnapshot::new(
            Some(4),
            "https://www.ebay.com/sh/lst/active",
            r#"<header><span id="gh-un">seller123</span></header>"#,
        );
        let view = control.redetect(4, Some(page)).await.unwrap();
        assert_eq!(view.account.as_ref().map(AccountId::as_str), Some("seller123"));
        assert_eq!(view.resolved_from.as_deref(), Some("user-info"));

        control.submit(orphan).await.unwrap();
        let status = settle(&control, |status| !status.recent.is_empty()).await;
        assert_eq!(status.recent[0].account.as_str(), "seller123");
        assert_eq!(status.account.as_ref().map(AccountId::as_str), Some("seller123"));

        let cleared = control.redetect(4, None).await.unwrap();
        assert_eq!(cleared.account.as_ref().map(AccountId::as_str), Some("seller123"));
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn export_includes_trails_only_in_debug_mode() {
        let (handle, _, _) = start(IngestConfig::default()).await;
        let control = handle.control();
        control
            .update_settings(SettingsPatch {
                auto_process: Some(false),
                ..SettingsPatch::default()
            })
            .await
            .unwrap();
        control.simulate(ReportKind::SoldListings).await.unwrap();

        let export = control.export_logs().await.unwrap();
        assert_eq!(export.queue.len(), 1);
        assert!(export.queue[0].trail.is_none());

        control
            .update_settings(SettingsPatch {
                debug_mode: Some(true),
                ..SettingsPatch::default()
            })
            .await
            .unwrap();
        let export = control.export_logs().await.unwrap();
        assert_eq!(export.queue[0].trail.as_deref(), Some(&[ItemState::Pending][..]));
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn clear_logs_and_settings_survive_restart() {
        let (handle, _, store) = start(IngestConfig::default()).await;
        let control = handle.control();
        control.simulate(ReportKind::Orders).await.unwrap();
        settle(&control, |status| !status.recent.is_empty()).await;
        control
            .update_settings(SettingsPatch {
                notifications: Some(false),
                ..SettingsPatch::default()
            })
            .await
            .unwrap();
        assert_eq!(control.clear_logs().await.unwrap(), 1);
        handle.shutdown().await;

        let handle = spawn(CoordinatorDeps {
            config: IngestConfig::default(),
            backend: Arc::new(AcceptingBackend::default()),
            store,
        })
        .await;
        let control = handle.control();
        assert!(!control.settings().await.unwrap().notifications);
        assert!(control.status().await.unwrap().recent.is_empty());
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_coordinator_answers_gone() {
        let (handle, _, _) = start(IngestConfig::default()).await;
        let control = handle.control();
        handle.shutdown().await;
        assert!(matches!(control.status().await, Err(ControlError::CoordinatorGone)));
    }

    #[tokio::test(start_paused = true)]
    async fn page_reports_update_session_state() {
        let (handle, _, _) = start(IngestConfig::default()).await;
        let control = handle.control();
        let reply = control
            .dispatch(json!({
                "kind": "page.ready",
                "payload": {
                    "tab_id": 9,
                    "url": "https://www.ebay.com/sh/ord",
                    "page_kind": "orders",
                    "account": "seller9",
                    "download_button": {"status": "missing"}
                }
            }))
            .await;
        assert!(reply.ok);
        let reply = control
            .dispatch(json!({
                "kind": "download.initiated",
                "payload": {"tab_id": 9, "button_text": "Download report"}
            }))
            .await;
        let session: AccountSession = reply.into_result().unwrap();
        assert_eq!(
            session.download_button,
            ButtonStatus::Found {
                label: "Download report".into()
            }
        );
        assert_eq!(session.account.as_ref().map(AccountId::as_str), Some("seller9"));
        handle.shutdown().await;
    }
}
