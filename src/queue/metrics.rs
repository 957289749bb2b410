use dashmap::DashMap;
use serde::Serialize;
use std::time::Duration;

use crate::storage::models::OperationStatus;

/// Counters for one operation type since the queue started.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OperationTypeMetrics {
    pub op_type: String,
    pub started: u64,
    pub completed: u64,
    pub failed: u64,
    pub canceled: u64,
    pub total_duration_ms: u64,
    pub max_duration_ms: u64,
}

impl OperationTypeMetrics {
    pub fn finished(&self) -> u64 {
        self.completed + self.failed + self.canceled
    }

    pub fn mean_duration(&self) -> Option<Duration> {
        self.total_duration_ms
            .checked_div(self.finished())
            .map(Duration::from_millis)
    }
}

/// Per-type counters of dispatched operations and how long they ran.
#[derive(Default)]
pub struct QueueMetrics {
    by_type: DashMap<String, OperationTypeMetrics>,
}

impl QueueMetrics {
    pub(crate) fn record_started(&self, op_type: &str) {
        self.entry(op_type, |m| m.started += 1);
    }

    pub(crate) fn record_finished(&self, op_type: &str, status: OperationStatus, elapsed: Duration) {
        let ms = elapsed.as_millis() as u64;
        self.entry(op_type, |m| {
            match status {
                OperationStatus::Completed => m.completed += 1,
                OperationStatus::Failed => m.failed += 1,
                OperationStatus::Canceled => m.canceled += 1,
                OperationStatus::Queued | OperationStatus::Running => return,
            }
            m.total_duration_ms += ms;
            m.max_duration_ms = m.max_duration_ms.max(ms);
        });
    }

    fn entry(&self, op_type: &str, update: impl FnOnce(&mut OperationTypeMetrics)) {
        let mut metrics = self
            .by_type
            .entry(op_type.to_string())
            .or_insert_with(|| OperationTypeMetrics {
                op_type: op_type.to_string(),
                ..OperationTypeMetrics::default()
            });
        update(metrics.value_mut());
    }

    /// One entry per operation type seen, ordered by type.
    pub fn snapshot(&self) -> Vec<OperationTypeMetrics> {
        let mut all: Vec<_> = self.by_type.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.op_type.cmp(&b.op_type));
        all
    }
}
