//! Fan-out of operation state changes to external observers.
//!
//! Every subscriber owns a bounded ring buffer. A subscriber that falls behind
//! loses its oldest events; the publisher never waits on anyone. Delivery is
//! best-effort, so observers should treat each event as "latest known state"
//! of one operation rather than as a complete log.

use serde::Serialize;
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::broadcast::{self, error::TryRecvError};
use tracing::{debug, warn};

use crate::storage::models::{Operation, OperationStatus};

/// Poll interval for [`Subscription::next_timeout`].
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Minimal payload observers receive on every status or progress change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperationEvent {
    pub operation_id: String,
    pub op_type: String,
    pub status: OperationStatus,
    pub progress: u64,
    pub total: u64,
    pub message: String,
}

impl From<&Operation> for OperationEvent {
    fn from(op: &Operation) -> Self {
        Self {
            operation_id: op.id.clone(),
            op_type: op.op_type.clone(),
            status: op.status,
            progress: op.progress,
            total: op.total,
            message: op.message.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProgressNotifier {
    sender: broadcast::Sender<OperationEvent>,
}

impl ProgressNotifier {
    /// `capacity` is the per-subscriber buffer size.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> Subscription {
        Subscription {
            receiver: self.sender.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Never blocks. Events published with no subscribers are dropped.
    pub fn publish(&self, event: OperationEvent) {
        if self.sender.send(event).is_err() {
            debug!("No subscribers for operation event");
        }
    }
}

/// One observer's view of the event stream.
pub struct Subscription {
    receiver: broadcast::Receiver<OperationEvent>,
}

impl Subscription {
    /// Next buffered event, if any. `None` also once the notifier is gone
    /// and the buffer is drained.
    pub fn try_next(&mut self) -> Option<OperationEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!("Subscriber lagged, skipped {} events", skipped);
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }

    /// Wait up to `timeout` for the next event.
    pub fn next_timeout(&mut self, timeout: Duration) -> Option<OperationEvent> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!("Subscriber lagged, skipped {} events", skipped);
                }
                Err(TryRecvError::Closed) => return None,
                Err(TryRecvError::Empty) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    thread::sleep(POLL_INTERVAL.min(deadline - now));
                }
            }
        }
    }
}
