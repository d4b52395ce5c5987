use crate::models::{HistoryEntry, HistoryOutcome};
use std::collections::VecDeque;

/// Bounded record of terminal outcomes, appended in transition order. The
/// oldest entry is evicted once capacity is reached.
#[derive(Debug, Clone)]
pub struct History {
    capacity: usize,
    entries: VecDeque<HistoryEntry>,
}

impl History {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: VecDeque::with_capacity(capacity.max(1)),
        }
    }

    pub fn push(&mut self, entry: HistoryEntry) {
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    /// Newest first.
    pub fn recent(&self, limit: usize) -> Vec<HistoryEntry> {
        self.entries.iter().rev().take(limit).cloned().collect()
    }

    /// Oldest first, as persisted.
    pub fn entries(&self) -> Vec<HistoryEntry> {
        self.entries.iter().cloned().collect()
    }

    pub fn load(&mut self, entries: Vec<HistoryEntry>) {
        for entry in entries {
            self.push(entry);
        }
    }

    pub fn clear(&mut self) -> usize {
        let cleared = self.entries.len();
        self.entries.clear();
        cleared
    }

    pub fn count(&self, outcome: HistoryOutcome) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.outcome == outcome)
            .count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::fingerprint;
    use crate::models::{AccountId, ReportKind};
    use chrono::Utc;
    use uuid::Uuid;

    fn entry(n: usize, outcome: HistoryOutcome) -> HistoryEntry {
        HistoryEntry {
            item_id: Uuid::new_v4(),
            fingerprint: fingerprint(n.to_string().as_bytes()),
            account: AccountId::new("seller123").unwrap(),
            kind: ReportKind::Orders,
            filename: format!("report-{n}.csv"),
            outcome,
            error_kind: None,
            reason: None,
            rows_processed: Some(n as u64),
            rows_skipped: Some(0),
            import_id: None,
            attempts: 1,
            recorded_at: Utc::now(),
        }
    }

    #[test]
    fn evicts_oldest_when_full() {
        let mut history = History::new(100);
        for n in 0..105 {
            history.push(entry(n, HistoryOutcome::Succeeded));
        }
        assert_eq!(history.len(), 100);
        assert_eq!(history.entries()[0].filename, "report-5.csv");
        assert_eq!(history.recent(1)[0].filename, "report-104.csv");
    }

    #[test]
    fn counts_and_clear() {
        let mut history = History::new(10);
        history.push(entry(1, HistoryOutcome::Succeeded));
        history.push(entry(2, HistoryOutcome::DedupSkipped));
        history.push(entry(3, HistoryOutcome::Succeeded));
        assert_eq!(history.count(HistoryOutcome::Succeeded), 2);
        assert_eq!(history.recent(2).len(), 2);
        assert_eq!(history.clear(), 3);
        assert!(history.is_empty());
    }
}
