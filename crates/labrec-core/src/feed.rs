use crate::index::RecordIndex;
use crate::value::ValueMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_FEED_CAPACITY: usize = 1024;

/// Notification for one newly appended data row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveSample {
    pub index: RecordIndex,
    pub values: ValueMap,
    pub emitted_at: DateTime<Utc>,
}

/// Read side of the live data feed. Dropping it unsubscribes.
pub struct LiveFeed {
    rx: Receiver<LiveSample>,
}

impl LiveFeed {
    pub fn try_next(&self) -> Option<LiveSample> {
        self.rx.try_recv().ok()
    }

    pub fn next_timeout(&self, timeout: Duration) -> Option<LiveSample> {
        match self.rx.recv_timeout(timeout) {
            Ok(sample) => Some(sample),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn drain(&self) -> Vec<LiveSample> {
        self.rx.try_iter().collect()
    }
}

/// Fan-out to live subscribers that never blocks the archival path: a full
/// subscriber misses the sample, a disconnected one is pruned.
#[derive(Default)]
pub struct FeedPublisher {
    subscribers: Vec<SyncSender<LiveSample>>,
    dropped: u64,
}

impl FeedPublisher {
    pub fn subscribe(&mut self, capacity: usize) -> LiveFeed {
        let (tx, rx) = mpsc::sync_channel(capacity.max(1));
        self.subscribers.push(tx);
        LiveFeed { rx }
    }

    pub fn has_subscribers(&self) -> bool {
        !self.subscribers.is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn publish(&mut self, index: RecordIndex, values: &ValueMap) {
        if self.subscribers.is_empty() {
            return;
        }
        let sample = LiveSample {
            index,
            values: values.clone(),
            emitted_at: Utc::now(),
        };
        let mut dropped = 0_u64;
        self.subscribers
            .retain(|tx| match tx.try_send(sample.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    dropped += 1;
                    true
                }
                Err(TrySendError::Disconnected(_)) => false,
            });
        if dropped > 0 {
            self.dropped = self.dropped.saturating_add(dropped);
            debug!(
                event = "live_feed_sample_dropped",
                index = %index,
                subscribers_full = dropped,
                total_dropped = self.dropped
            );
        }
    }
}
