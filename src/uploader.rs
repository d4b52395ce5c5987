//! One upload attempt against the backend and the policy that maps its
//! result onto the item state machine.

use crate::backend::{Backend, BackendError, UploadMetadata, UploadRequest, ValidateRequest};
use crate::models::{
    AccountId, ConnectionStatus, ErrorKind, Fingerprint, ItemMetadata, QueueItem, ReportKind,
};
use rand::Rng;
use std::{sync::Arc, time::Duration};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub factor: u32,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(2),
            factor: 2,
            cap: Duration::from_secs(300),
            max_attempts: 6,
        }
    }
}

impl RetryPolicy {
    /// Wait after the `failures`-th failed attempt. `jitter` is a fraction
    /// in `[0, 0.25]` added on top of the exponential step; the result never
    /// drops below `base` nor exceeds `cap`.
    pub fn delay_for(&self, failures: u32, jitter: f64) -> Duration {
        let step = failures.saturating_sub(1).min(30) as i32;
        let exponential = self.base.as_secs_f64() * f64::from(self.factor.max(1)).powi(step);
        let jittered = exponential * (1.0 + jitter.clamp(0.0, 0.25));
        let bounded = jittered
            .min(self.cap.as_secs_f64())
            .max(self.base.as_secs_f64());
        Duration::from_secs_f64(bounded)
    }

    pub fn next_delay(&self, failures: u32) -> Duration {
        let jitter = rand::rng().random_range(0.0..=0.25);
        self.delay_for(failures, jitter)
    }
}

/// Everything an attempt needs, detached from the queue.
#[derive(Debug, Clone)]
pub struct UploadJob {
    pub item_id: Uuid,
    pub fingerprint: Fingerprint,
    pub account: AccountId,
    pub kind: ReportKind,
    pub filename: String,
    pub payload: Arc<[u8]>,
    pub metadata: ItemMetadata,
}

impl From<&QueueItem> for UploadJob {
    fn from(item: &QueueItem) -> Self {
        Self {
            item_id: item.item_id,
            fingerprint: item.fingerprint.clone(),
            account: item.account.clone(),
            kind: item.kind,
            filename: item.filename.clone(),
            payload: item.payload.clone(),
            metadata: item.metadata.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    Succeeded {
        rows_processed: u64,
        rows_skipped: u64,
        import_id: Option<String>,
    },
    Rejected {
        kind: ErrorKind,
        reason: String,
    },
    Retryable {
        reason: String,
        retry_after: Option<Duration>,
    },
    /// The backend went down between validate and upload; nothing was
    /// uploaded and the attempt does not count.
    Deferred {
        reason: String,
    },
}

impl AttemptOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            AttemptOutcome::Succeeded { .. } => "succeeded",
            AttemptOutcome::Rejected { .. } => "rejected",
            AttemptOutcome::Retryable { .. } => "retryable",
            AttemptOutcome::Deferred { .. } => "deferred",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AttemptReport {
    pub item_id: Uuid,
    pub outcome: AttemptOutcome,
    pub elapsed: Duration,
}

#[derive(Clone)]
pub struct Uploader {
    backend: Arc<dyn Backend>,
    timeout: Duration,
    connection: Option<watch::Receiver<ConnectionStatus>>,
}

impl Uploader {
    pub fn new(backend: Arc<dyn Backend>, timeout: Duration) -> Self {
        Self {
            backend,
            timeout,
            connection: None,
        }
    }

    /// Follows the coordinator's connection status so an attempt can stop
    /// short of the upload call once the backend is marked down.
    pub fn with_connection(mut self, connection: watch::Receiver<ConnectionStatus>) -> Self {
        self.connection = Some(connection);
        self
    }

    fn backend_down(&self) -> bool {
        self.connection
            .as_ref()
            .is_some_and(|rx| *rx.borrow() == ConnectionStatus::Down)
    }

    /// Validate then upload, bounded by the attempt timeout. Dropping the
    /// returned future aborts the request.
    pub async fn attempt(&self, job: UploadJob) -> AttemptReport {
        let started = Instant::now();
        let outcome = match tokio::time::timeout(self.timeout, self.exchange(&job)).await {
            Ok(outcome) => outcome,
            Err(_) => AttemptOutcome::Retryable {
                reason: format!("upload timed out after {}s", self.timeout.as_secs()),
                retry_after: None,
            },
        };
        let elapsed = started.elapsed();
        crate::metrics::upload_attempt(outcome.label(), elapsed.as_millis());
        match &outcome {
            AttemptOutcome::Succeeded { rows_processed, .. } => info!(
                target = "ingest.uploader",
                item_id = %job.item_id,
                account = %job.account,
                kind = %job.kind,
                rows_processed,
                elapsed_ms = elapsed.as_millis() as u64,
                "upload_succeeded"
            ),
            AttemptOutcome::Rejected { kind, reason } => warn!(
                target = "ingest.uploader",
                item_id = %job.item_id,
                error_kind = %kind,
                reason = %reason,
                "upload_rejected"
            ),
            AttemptOutcome::Retryable { reason, .. } => warn!(
                target = "ingest.uploader",
                item_id = %job.item_id,
                error_kind = %ErrorKind::TransientNetwork,
                reason = %reason,
                "upload_failed_retryable"
            ),
            AttemptOutcome::Deferred { reason } => info!(
                target = "ingest.uploader",
                item_id = %job.item_id,
                reason = %reason,
                "upload_deferred"
            ),
        }
        AttemptReport {
            item_id: job.item_id,
            outcome,
            elapsed,
        }
    }

    async fn exchange(&self, job: &UploadJob) -> AttemptOutcome {
        let content = String::from_utf8_lossy(&job.payload).into_owned();

        let validation = ValidateRequest {
            account: job.account.clone(),
            kind: job.kind,
            content: content.clone(),
        };
        let reply = match self.backend.validate(&validation).await {
            Ok(reply) => reply,
            Err(err) => return network_failure(err),
        };
        if !reply.is_success() {
            return interpret_failure(reply.status, reply.body.message, reply.retry_after);
        }
        if !reply.body.success {
            return AttemptOutcome::Rejected {
                kind: ErrorKind::SchemaInvalid,
                reason: reply
                    .body
                    .message
                    .unwrap_or_else(|| "validation failed".to_string()),
            };
        }
        if let Some(data) = reply.body.data {
            if !data.valid {
                let reason = if data.errors.is_empty() {
                    "content failed backend validation".to_string()
                } else {
                    data.errors.join("; ")
                };
                return AttemptOutcome::Rejected {
                    kind: ErrorKind::SchemaInvalid,
                    reason,
                };
            }
            debug!(target = "ingest.uploader", item_id = %job.item_id, rows = data.rows, "validated");
        }
        if self.backend_down() {
            return AttemptOutcome::Deferred {
                reason: "backend marked down after validation".to_string(),
            };
        }

        let upload = UploadRequest {
            account: job.account.clone(),
            kind: job.kind,
            content,
            metadata: UploadMetadata {
                filename: job.filename.clone(),
                url: job.metadata.source_url.clone(),
                timestamp: job.metadata.captured_at,
                extension_version: job.metadata.extension_version.clone(),
            },
        };
        let reply = match self.backend.upload(&upload).await {
            Ok(reply) => reply,
            Err(err) => return network_failure(err),
        };
        if !reply.is_success() {
            return interpret_failure(reply.status, reply.body.message, reply.retry_after);
        }
        if !reply.body.success {
            return AttemptOutcome::Rejected {
                kind: ErrorKind::PermanentHttp,
                reason: reply
                    .body
                    .message
                    .unwrap_or_else(|| "backend reported failure".to_string()),
            };
        }
        let data = reply.body.data.unwrap_or_default();
        AttemptOutcome::Succeeded {
            rows_processed: data.rows_processed,
            rows_skipped: data.rows_skipped,
            import_id: data.import_id,
        }
    }
}

fn network_failure(err: BackendError) -> AttemptOutcome {
    AttemptOutcome::Retryable {
        reason: err.to_string(),
        retry_after: None,
    }
}

/// 408, 429 and 5xx retry; every other non-2xx status is permanent.
/// `Retry-After` is only honoured on 429.
pub fn interpret_failure(
    status: u16,
    message: Option<String>,
    retry_after: Option<Duration>,
) -> AttemptOutcome {
    let retryable = status == 408 || status == 429 || status >= 500;
    if retryable {
        let reason = match message {
            Some(message) => format!("HTTP {status}: {message}"),
            None => format!("HTTP {status}"),
        };
        AttemptOutcome::Retryable {
            reason,
            retry_after: retry_after.filter(|_| status == 429),
        }
    } else {
        AttemptOutcome::Rejected {
            kind: ErrorKind::PermanentHttp,
            reason: message.unwrap_or_else(|| format!("HTTP {status}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ApiEnvelope, BackendReply, UploadData, ValidateData};
    use crate::models::CaptureSource;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    type Scripted<T> = Result<BackendReply<T>, BackendError>;

    #[derive(Default)]
    struct ScriptedBackend {
        validations: Mutex<VecDeque<Scripted<ValidateData>>>,
        uploads: Mutex<VecDeque<Scripted<UploadData>>>,
        upload_calls: Mutex<Vec<UploadRequest>>,
        stall: Option<Duration>,
    }

    impl ScriptedBackend {
        fn validating(valid: bool) -> Self {
            let backend = Self::default();
            backend.validations.lock().unwrap().push_back(Ok(BackendReply::new(
                200,
                ApiEnvelope::ok(ValidateData {
                    valid,
                    rows: 12,
                    errors: if valid { vec![] } else { vec!["missing Order Number".into()] },
                }),
            )));
            backend
        }

        fn then_upload(self, reply: Scripted<UploadData>) -> Self {
            self.uploads.lock().unwrap().push_back(reply);
            self
        }
    }

    #[async_trait]
    impl Backend for ScriptedBackend {
        async fn health(&self) -> Result<u16, BackendError> {
            Ok(200)
        }

        async fn validate(
            &self,
            _request: &ValidateRequest,
        ) -> Result<BackendReply<ValidateData>, BackendError> {
            let next = self.validations.lock().unwrap().pop_front();
            next.unwrap_or_else(|| {
                Ok(BackendReply::new(
                    200,
                    ApiEnvelope::ok(ValidateData {
                        valid: true,
                        rows: 0,
                        errors: vec![],
                    }),
                ))
            })
        }

        async fn upload(
            &self,
            request: &UploadRequest,
        ) -> Result<BackendReply<UploadData>, BackendError> {
            self.upload_calls.lock().unwrap().push(request.clone());
            if let Some(stall) = self.stall {
                tokio::time::sleep(stall).await;
            }
            let next = self.uploads.lock().unwrap().pop_front();
            next.unwrap_or_else(|| Err(BackendError::Request("no scripted reply".into())))
        }
    }

    fn job() -> UploadJob {
        let payload = b"Sales Record Number,Order Number,Item Number\r\n1,2,3\r\n".to_vec();
        UploadJob {
            item_id: Uuid::new_v4(),
            fingerprint: crate::fingerprint::fingerprint(&payload),
            account: AccountId::new("seller123").unwrap(),
            kind: ReportKind::Orders,
            filename: "eBay-awaiting-shipment-report-2025-01-07.csv".into(),
            payload: Arc::from(payload),
            metadata: ItemMetadata {
                captured_at: Utc::now(),
                source_url: Some("https://www.ebay.com/sh/ord".into()),
                extension_version: "1.4.0".into(),
                source: CaptureSource::PageIntercept,
                tab_id: Some(4),
            },
        }
    }

    fn uploader(backend: Arc<ScriptedBackend>) -> Uploader {
        Uploader::new(backend, Duration::from_secs(30))
    }

    #[test]
    fn backoff_doubles_from_base_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1, 0.0), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2, 0.0), Duration::from_secs(4));
        assert_eq!(policy.delay_for(5, 0.0), Duration::from_secs(32));
        assert_eq!(policy.delay_for(12, 0.25), Duration::from_secs(300));
        assert_eq!(policy.delay_for(1, 0.25), Duration::from_secs_f64(2.5));
        for failures in 1..=6 {
            let delay = policy.next_delay(failures);
            assert!(delay >= policy.base && delay <= policy.cap);
        }
    }

    #[test]
    fn status_policy_splits_retryable_from_permanent() {
        for status in [408, 429, 500, 503] {
            assert!(matches!(
                interpret_failure(status, None, None),
                AttemptOutcome::Retryable { .. }
            ));
        }
        assert_eq!(
            interpret_failure(400, Some("account unknown".into()), None),
            AttemptOutcome::Rejected {
                kind: ErrorKind::PermanentHttp,
                reason: "account unknown".into()
            }
        );
        assert!(matches!(
            interpret_failure(503, None, Some(Duration::from_secs(9))),
            AttemptOutcome::Retryable { retry_after: None, .. }
        ));
        assert!(matches!(
            interpret_failure(429, None, Some(Duration::from_secs(9))),
            AttemptOutcome::Retryable { retry_after: Some(_), .. }
        ));
    }

    #[tokio::test]
    async fn success_records_backend_counters() {
        let backend = Arc::new(ScriptedBackend::validating(true).then_upload(Ok(
            BackendReply::new(
                200,
                ApiEnvelope::ok(UploadData {
                    rows_processed: 12,
                    rows_skipped: 0,
                    import_id: Some("imp-1".into()),
                }),
            ),
        )));
        let report = uploader(backend.clone()).attempt(job()).await;
        assert_eq!(
            report.outcome,
            AttemptOutcome::Succeeded {
                rows_processed: 12,
                rows_skipped: 0,
                import_id: Some("imp-1".into())
            }
        );
        let calls = backend.upload_calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].metadata.extension_version, "1.4.0");
        assert!(calls[0].content.contains("Sales Record Number"));
    }

    #[tokio::test]
    async fn invalid_content_never_reaches_upload() {
        let backend = Arc::new(ScriptedBackend::validating(false));
        let report = uploader(backend.clone()).attempt(job()).await;
        assert_eq!(
            report.outcome,
            AttemptOutcome::Rejected {
                kind: ErrorKind::SchemaInvalid,
                reason: "missing Order Number".into()
            }
        );
        assert!(backend.upload_calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn network_errors_are_retryable() {
        let backend = Arc::new(
            ScriptedBackend::validating(true)
                .then_upload(Err(BackendError::Request("connection reset".into()))),
        );
        let report = uploader(backend).attempt(job()).await;
        assert!(matches!(report.outcome, AttemptOutcome::Retryable { .. }));
    }

    #[tokio::test]
    async fn rate_limited_upload_carries_retry_after() {
        let backend = Arc::new(ScriptedBackend::validating(true).then_upload(Ok(
            BackendReply::new(429, ApiEnvelope::failed("slow down"))
                .with_retry_after(Duration::from_secs(40)),
        )));
        let report = uploader(backend).attempt(job()).await;
        assert_eq!(
            report.outcome,
            AttemptOutcome::Retryable {
                reason: "HTTP 429: slow down".into(),
                retry_after: Some(Duration::from_secs(40))
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn slow_backend_times_out_as_retryable() {
        let backend = Arc::new(ScriptedBackend {
            stall: Some(Duration::from_secs(120)),
            ..ScriptedBackend::validating(true)
        });
        let report = uploader(backend).attempt(job()).await;
        match report.outcome {
            AttemptOutcome::Retryable { reason, .. } => assert!(reason.contains("timed out")),
            other => panic!("unexpected {other:?}"),
        }
        assert!(report.elapsed >= Duration::from_secs(30));
    }

    #[tokio::test]
    async fn backend_marked_down_stops_before_upload() {
        let backend = Arc::new(ScriptedBackend::validating(true));
        let (tx, rx) = watch::channel(ConnectionStatus::Healthy);
        let uploader = uploader(backend.clone()).with_connection(rx);
        tx.send(ConnectionStatus::Down).unwrap();

        let report = uploader.attempt(job()).await;
        assert!(matches!(report.outcome, AttemptOutcome::Deferred { .. }));
        assert_eq!(report.outcome.label(), "deferred");
        assert!(backend.upload_calls.lock().unwrap().is_empty());
        assert!(backend.validations.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn degraded_connection_still_uploads() {
        let backend = Arc::new(ScriptedBackend::validating(true).then_upload(Ok(
            BackendReply::new(
                200,
                ApiEnvelope::ok(UploadData {
                    rows_processed: 1,
                    rows_skipped: 0,
                    import_id: None,
                }),
            ),
        )));
        let (_tx, rx) = watch::channel(ConnectionStatus::Degraded);
        let report = uploader(backend.clone()).with_connection(rx).attempt(job()).await;
        assert!(matches!(report.outcome, AttemptOutcome::Succeeded { .. }));
        assert_eq!(backend.upload_calls.lock().unwrap().len(), 1);
    }
}
