//! Bounded ingestion queue keyed by fingerprint.
//!
//! At most one non-terminal item exists per fingerprint. Terminal items leave
//! the queue immediately (dropping their payload) and are remembered only in
//! the dedup index.

use crate::models::{
    AccountId, Fingerprint, ItemError, ItemMetadata, ItemState, PersistedItem, QueueCounts,
    QueueItem, ReportKind,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, sync::Arc};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy)]
pub struct QueueConfig {
    pub capacity: usize,
    pub dedup_window: Duration,
    pub max_attempts: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 256,
            dedup_window: Duration::days(7),
            max_attempts: 6,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewItem {
    pub fingerprint: Fingerprint,
    pub account: AccountId,
    pub kind: ReportKind,
    pub filename: String,
    pub payload: Arc<[u8]>,
    pub metadata: ItemMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DedupRecord {
    pub item_id: Uuid,
    pub state: ItemState,
    pub last_terminal_at: DateTime<Utc>,
}

#[derive(Debug)]
pub enum EnqueueOutcome {
    Queued {
        item_id: Uuid,
        evicted: Option<QueueItem>,
    },
    AlreadyQueued {
        item_id: Uuid,
        metadata_updated: bool,
    },
    RecentlySucceeded {
        item_id: Uuid,
        succeeded_at: DateTime<Utc>,
    },
}

#[derive(Debug)]
pub enum RetryDecision {
    Scheduled {
        attempts: u32,
        next_attempt_at: DateTime<Utc>,
    },
    Abandoned(QueueItem),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue item {0} not found")]
    NotFound(Uuid),
    #[error("illegal transition {from} -> {to} for item {item_id}")]
    IllegalTransition {
        item_id: Uuid,
        from: ItemState,
        to: ItemState,
    },
    #[error("queue is full ({capacity} items) and nothing is evictable")]
    Full { capacity: usize },
}

#[derive(Debug, Default)]
pub struct RestoreReport {
    pub restored: usize,
    pub requeued_inflight: usize,
    pub lost: Vec<PersistedItem>,
}

#[derive(Debug)]
pub struct IngestionQueue {
    config: QueueConfig,
    /// Non-terminal items in enqueue order.
    items: Vec<QueueItem>,
    dedup_index: HashMap<Fingerprint, DedupRecord>,
}

impl IngestionQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            items: Vec::new(),
            dedup_index: HashMap::new(),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn enqueue(
        &mut self,
        new: NewItem,
        now: DateTime<Utc>,
    ) -> Result<EnqueueOutcome, QueueError> {
        if let Some(existing) = self
            .items
            .iter_mut()
            .find(|item| item.fingerprint == new.fingerprint)
        {
            let metadata_updated = new.metadata.is_newer_than(&existing.metadata);
            if metadata_updated {
                existing.metadata = new.metadata;
            }
            debug!(
                target = "ingest.queue",
                item_id = %existing.item_id,
                fingerprint = %existing.fingerprint.short(),
                metadata_updated,
                "enqueue_deduplicated"
            );
            return Ok(EnqueueOutcome::AlreadyQueued {
                item_id: existing.item_id,
                metadata_updated,
            });
        }

        if let Some(record) = self.dedup_index.get(&new.fingerprint)
            && record.state == ItemState::Succeeded
            && now - record.last_terminal_at < self.config.dedup_window
        {
            return Ok(EnqueueOutcome::RecentlySucceeded {
                item_id: record.item_id,
                succeeded_at: record.last_terminal_at,
            });
        }

        let evicted = if self.items.len() >= self.config.capacity {
            Some(self.evict_one()?)
        } else {
            None
        };

        let item_id = Uuid::new_v4();
        self.items.push(QueueItem {
            item_id,
            fingerprint: new.fingerprint,
            account: new.account,
            kind: new.kind,
            filename: new.filename,
            payload: new.payload,
            metadata: new.metadata,
            state: ItemState::Pending,
            attempts: 0,
            next_attempt_at: now,
            enqueued_at: now,
            last_error: None,
            trail: vec![ItemState::Pending],
        });
        Ok(EnqueueOutcome::Queued { item_id, evicted })
    }

    /// Oldest retry-wait first, then oldest pending. Inflight is never evicted.
    fn evict_one(&mut self) -> Result<QueueItem, QueueError> {
        let position = self
            .items
            .iter()
            .position(|item| item.state == ItemState::RetryWait)
            .or_else(|| {
                self.items
                    .iter()
                    .position(|item| item.state == ItemState::Pending)
            })
            .ok_or(QueueError::Full {
                capacity: self.config.capacity,
            })?;
        let evicted = self.items.remove(position);
        warn!(
            target = "ingest.queue",
            item_id = %evicted.item_id,
            state = %evicted.state,
            filename = %evicted.filename,
            "queue_full_evicted"
        );
        Ok(evicted)
    }

    /// Pending item due at `now` with the earliest `next_attempt_at`; ties go
    /// to the earlier enqueue.
    pub fn next_ready(&self, now: DateTime<Utc>) -> Option<Uuid> {
        self.items
            .iter()
            .enumerate()
            .filter(|(_, item)| item.state == ItemState::Pending && item.next_attempt_at <= now)
            .min_by_key(|(pos, item)| (item.next_attempt_at, item.enqueued_at, *pos))
            .map(|(_, item)| item.item_id)
    }

    pub fn mark_inflight(&mut self, item_id: Uuid) -> Result<&QueueItem, QueueError> {
        let item = self.item_mut(item_id)?;
        transition(item, ItemState::Inflight)?;
        Ok(item)
    }

    pub fn succeed(&mut self, item_id: Uuid, now: DateTime<Utc>) -> Result<QueueItem, QueueError> {
        let item = self.item_mut(item_id)?;
        transition(item, ItemState::Succeeded)?;
        item.attempts += 1;
        self.retire(item_id, now)
    }

    pub fn reject(
        &mut self,
        item_id: Uuid,
        error: ItemError,
        now: DateTime<Utc>,
    ) -> Result<QueueItem, QueueError> {
        let item = self.item_mut(item_id)?;
        transition(item, ItemState::Rejected)?;
        item.attempts += 1;
        item.last_error = Some(error);
        self.retire(item_id, now)
    }

    /// Counts the failed attempt and parks the item in retry-wait, or
    /// abandons it once the attempt budget is spent.
    pub fn fail_retryable(
        &mut self,
        item_id: Uuid,
        error: ItemError,
        delay: Duration,
        now: DateTime<Utc>,
    ) -> Result<RetryDecision, QueueError> {
        let max_attempts = self.config.max_attempts;
        let item = self.item_mut(item_id)?;
        transition(item, ItemState::RetryWait)?;
        item.attempts += 1;
        item.last_error = Some(error);

        if item.attempts >= max_attempts {
            transition(item, ItemState::Abandoned)?;
            return self.retire(item_id, now).map(RetryDecision::Abandoned);
        }

        item.next_attempt_at = now + delay;
        Ok(RetryDecision::Scheduled {
            attempts: item.attempts,
            next_attempt_at: item.next_attempt_at,
        })
    }

    /// Returns an inflight item to pending without counting the attempt.
    pub fn cancel_inflight(&mut self, item_id: Uuid) -> Result<(), QueueError> {
        let item = self.item_mut(item_id)?;
        transition(item, ItemState::Pending)
    }

    /// Moves retry-wait items whose timer has fired back to pending.
    pub fn promote_due(&mut self, now: DateTime<Utc>) -> Vec<Uuid> {
        let mut promoted = Vec::new();
        for item in self
            .items
            .iter_mut()
            .filter(|item| item.state == ItemState::RetryWait && item.next_attempt_at <= now)
        {
            if transition(item, ItemState::Pending).is_ok() {
                promoted.push(item.item_id);
            }
        }
        promoted
    }

    pub fn inflight_ids(&self) -> Vec<Uuid> {
        self.items
            .iter()
            .filter(|item| item.state == ItemState::Inflight)
            .map(|item| item.item_id)
            .collect()
    }

    pub fn counts(&self) -> QueueCounts {
        let mut counts = QueueCounts::default();
        for item in &self.items {
            match item.state {
                ItemState::Pending => counts.pending += 1,
                ItemState::Inflight => counts.inflight += 1,
                ItemState::RetryWait => counts.retry_wait += 1,
                _ => {}
            }
        }
        counts
    }

    pub fn get(&self, item_id: Uuid) -> Option<&QueueItem> {
        self.items.iter().find(|item| item.item_id == item_id)
    }

    pub fn items(&self) -> &[QueueItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn dedup_record(&self, fingerprint: &Fingerprint) -> Option<&DedupRecord> {
        self.dedup_index.get(fingerprint)
    }

    /// Records a terminal outcome for a fingerprint that never made it into
    /// the queue proper (for instance a payload lost across a restart).
    pub fn record_terminal(
        &mut self,
        fingerprint: Fingerprint,
        item_id: Uuid,
        state: ItemState,
        now: DateTime<Utc>,
    ) {
        self.dedup_index.insert(
            fingerprint,
            DedupRecord {
                item_id,
                state,
                last_terminal_at: now,
            },
        );
    }

    pub fn prune_dedup(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.dedup_index.len();
        let window = self.config.dedup_window;
        self.dedup_index
            .retain(|_, record| now - record.last_terminal_at < window);
        before - self.dedup_index.len()
    }

    pub fn snapshot(&self) -> (Vec<PersistedItem>, HashMap<Fingerprint, DedupRecord>) {
        (
            self.items.iter().map(PersistedItem::from).collect(),
            self.dedup_index.clone(),
        )
    }

    /// Rebuilds the queue after a restart. Inflight items re-enter pending
    /// with their attempt count unchanged; items whose payload is gone are
    /// returned as lost and not restored.
    pub fn restore(
        &mut self,
        items: Vec<PersistedItem>,
        dedup_index: HashMap<Fingerprint, DedupRecord>,
        mut payloads: HashMap<Uuid, Vec<u8>>,
    ) -> RestoreReport {
        let mut report = RestoreReport::default();
        self.dedup_index.extend(dedup_index);

        for persisted in items {
            if persisted.state.is_terminal()
                || self
                    .items
                    .iter()
                    .any(|item| item.fingerprint == persisted.fingerprint)
            {
                continue;
            }
            let Some(payload) = payloads.remove(&persisted.item_id) else {
                report.lost.push(persisted);
                continue;
            };
            let state = if persisted.state == ItemState::Inflight {
                report.requeued_inflight += 1;
                ItemState::Pending
            } else {
                persisted.state
            };
            self.items.push(QueueItem {
                item_id: persisted.item_id,
                fingerprint: persisted.fingerprint,
                account: persisted.account,
                kind: persisted.kind,
                filename: persisted.filename,
                payload: Arc::from(payload),
                metadata: persisted.metadata,
                state,
                attempts: persisted.attempts,
                next_attempt_at: persisted.next_attempt_at,
                enqueued_at: persisted.enqueued_at,
                last_error: None,
                trail: vec![state],
            });
            report.restored += 1;
        }
        self.items
            .sort_by_key(|item| (item.enqueued_at, item.next_attempt_at));
        report
    }

    fn item_mut(&mut self, item_id: Uuid) -> Result<&mut QueueItem, QueueError> {
        self.items
            .iter_mut()
            .find(|item| item.item_id == item_id)
            .ok_or(QueueError::NotFound(item_id))
    }

    fn retire(&mut self, item_id: Uuid, now: DateTime<Utc>) -> Result<QueueItem, QueueError> {
        let position = self
            .items
            .iter()
            .position(|item| item.item_id == item_id)
            .ok_or(QueueError::NotFound(item_id))?;
        let item = self.items.remove(position);
        self.record_terminal(item.fingerprint.clone(), item.item_id, item.state, now);
        Ok(item)
    }
}

fn transition(item: &mut QueueItem, to: ItemState) -> Result<(), QueueError> {
    if !item.state.can_transition_to(to) {
        return Err(QueueError::IllegalTransition {
            item_id: item.item_id,
            from: item.state,
            to,
        });
    }
    item.state = to;
    item.trail.push(to);
    Ok(())
}
