//! Backend connection probe.

use crate::backend::Backend;
use crate::models::ConnectionStatus;
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::Instant,
};
use tracing::debug;

pub const HEALTHY_WITHIN: Duration = Duration::from_secs(2);
pub const DEGRADED_WITHIN: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq)]
pub struct ProbeReport {
    pub status: ConnectionStatus,
    pub http_status: Option<u16>,
    pub elapsed: Duration,
    pub error: Option<String>,
}

/// 2xx within 2 s is healthy, 2xx within 10 s degraded, anything else down.
pub fn classify_probe(http_status: Option<u16>, elapsed: Duration) -> ConnectionStatus {
    match http_status {
        Some(code) if (200..300).contains(&code) && elapsed <= HEALTHY_WITHIN => {
            ConnectionStatus::Healthy
        }
        Some(code) if (200..300).contains(&code) && elapsed <= DEGRADED_WITHIN => {
            ConnectionStatus::Degraded
        }
        _ => ConnectionStatus::Down,
    }
}

/// Upload slots available under a connection status: all of them when
/// healthy, half (at least one) when degraded, none when down.
pub fn effective_concurrency(status: ConnectionStatus, configured: usize) -> usize {
    match status {
        ConnectionStatus::Healthy => configured,
        ConnectionStatus::Degraded => (configured / 2).max(1),
        ConnectionStatus::Down => 0,
    }
}

pub async fn probe(backend: &dyn Backend) -> ProbeReport {
    let started = Instant::now();
    let result = tokio::time::timeout(DEGRADED_WITHIN, backend.health()).await;
    let elapsed = started.elapsed();
    let (http_status, error) = match result {
        Ok(Ok(code)) => (Some(code), None),
        Ok(Err(err)) => (None, Some(err.to_string())),
        Err(_) => (None, Some("health check timed out".to_string())),
    };
    let status = classify_probe(http_status, elapsed);
    debug!(
        target = "ingest.health",
        status = status.as_str(),
        http_status,
        elapsed_ms = elapsed.as_millis() as u64,
        "probe_completed"
    );
    ProbeReport {
        status,
        http_status,
        elapsed,
        error,
    }
}

/// Probes immediately, then every `interval` (every `down_interval` while
/// down). Stops when the receiver goes away or shutdown is signalled.
pub fn spawn_probe_loop(
    backend: Arc<dyn Backend>,
    interval: Duration,
    down_interval: Duration,
    reports: mpsc::Sender<ProbeReport>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let report = tokio::select! {
                report = probe(backend.as_ref()) => report,
                _ = shutdown.changed() => break,
            };
            let wait = if report.status == ConnectionStatus::Down {
                down_interval
            } else {
                interval
            };
            if reports.send(report).await.is_err() {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown.changed() => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{
        BackendError, BackendReply, UploadData, UploadRequest, ValidateData, ValidateRequest,
    };
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct SlowHealth {
        delays: Mutex<Vec<Duration>>,
    }

    #[async_trait]
    impl Backend for SlowHealth {
        async fn health(&self) -> Result<u16, BackendError> {
            let delay = self.delays.lock().unwrap().pop().unwrap_or_default();
            tokio::time::sleep(delay).await;
            Ok(200)
        }

        async fn validate(
            &self,
            _request: &ValidateRequest,
        ) -> Result<BackendReply<ValidateData>, BackendError> {
            Err(BackendError::Request("unused".into()))
        }

        async fn upload(
            &self,
            _request: &UploadRequest,
        ) -> Result<BackendReply<UploadData>, BackendError> {
            Err(BackendError::Request("unused".into()))
        }
    }

    #[test]
    fn thresholds_map_to_statuses() {
        assert_eq!(classify_probe(Some(200), Duration::from_millis(300)), ConnectionStatus::Healthy);
        assert_eq!(classify_probe(Some(204), Duration::from_secs(5)), ConnectionStatus::Degraded);
        assert_eq!(classify_probe(Some(200), Duration::from_secs(11)), ConnectionStatus::Down);
        assert_eq!(classify_probe(Some(503), Duration::from_millis(10)), ConnectionStatus::Down);
        assert_eq!(classify_probe(None, Duration::ZERO), ConnectionStatus::Down);
    }

    #[test]
    fn degraded_halves_concurrency() {
        assert_eq!(effective_concurrency(ConnectionStatus::Healthy, 2), 2);
        assert_eq!(effective_concurrency(ConnectionStatus::Degraded, 2), 1);
        assert_eq!(effective_concurrency(ConnectionStatus::Degraded, 1), 1);
        assert_eq!(effective_concurrency(ConnectionStatus::Down, 4), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_probe_is_degraded_and_stalled_probe_is_down() {
        let backend = SlowHealth {
            delays: Mutex::new(vec![Duration::from_secs(60), Duration::from_secs(4)]),
        };
        assert_eq!(probe(&backend).await.status, ConnectionStatus::Degraded);
        let stalled = probe(&backend).await;
        assert_eq!(stalled.status, ConnectionStatus::Down);
        assert!(stalled.error.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn loop_reports_until_shutdown() {
        let backend: Arc<dyn Backend> = Arc::new(SlowHealth {
            delays: Mutex::new(vec![]),
        });
        let (tx, mut rx) = mpsc::channel(4);
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = spawn_probe_loop(
            backend,
            Duration::from_secs(30),
            Duration::from_secs(15),
            tx,
            stop_rx,
        );
        let first = rx.recv().await.unwrap();
        assert_eq!(first.status, ConnectionStatus::Healthy);
        let started = Instant::now();
        rx.recv().await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(30));
        stop_tx.send(true).unwrap();
        task.await.unwrap();
    }
}
