//! # Work Queue
//!
//! Bounded single-producer / multi-consumer queue of work keys over a std
//! `sync_channel`. Consumers share the receiver behind a mutex and dequeue with a
//! timeout so they can observe shutdown between items. A unit is handed to exactly one
//! consumer.

use std::sync::mpsc::{Receiver, RecvTimeoutError, SyncSender, TrySendError, sync_channel};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::domain::work_unit::WorkKey;
use crate::utils::lock_or_recover;

/// Back-off between `try_send` attempts while the queue is full
const FULL_QUEUE_POLL: Duration = Duration::from_millis(10);

/// Queue configuration parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum number of keys buffered in the queue
    pub max_capacity: usize,

    /// How long a consumer blocks before re-checking for shutdown
    pub dequeue_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_capacity: 64,
            dequeue_timeout: Duration::from_millis(500),
        }
    }
}

/// Queue operation errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("Queue operation timed out")]
    Timeout,

    #[error("Queue is closed")]
    Closed,
}

/// Creates a bounded queue
#[must_use]
pub fn bounded(config: &QueueConfig) -> (WorkProducer, WorkConsumer) {
    let (sender, receiver) = sync_channel(config.max_capacity.max(1));
    (
        WorkProducer { sender },
        WorkConsumer {
            receiver: Arc::new(Mutex::new(receiver)),
            dequeue_timeout: config.dequeue_timeout,
        },
    )
}

/// Why the producer stopped feeding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedStop {
    /// Every key was enqueued
    Exhausted,
    /// Shutdown was requested
    Cancelled,
    /// All consumers are gone
    Disconnected,
}

/// Sending half; dropping it closes the queue once drained
#[derive(Debug)]
pub struct WorkProducer {
    sender: SyncSender<WorkKey>,
}

impl WorkProducer {
    /// Feed `keys` in order, blocking while the queue is full. Stops early when
    /// `cancel` fires or every consumer has been dropped.
    pub fn feed(
        self,
        keys: impl IntoIterator<Item = WorkKey>,
        cancel: &CancellationToken,
    ) -> (usize, FeedStop) {
        let mut enqueued = 0;
        for key in keys {
            let mut pending = key;
            loop {
                if cancel.is_cancelled() {
                    debug!(enqueued, "Producer stopping: shutdown requested");
                    return (enqueued, FeedStop::Cancelled);
                }
                match self.sender.try_send(pending) {
                    Ok(()) => {
                        enqueued += 1;
                        break;
                    }
                    Err(TrySendError::Full(key)) => {
                        pending = key;
                        std::thread::sleep(FULL_QUEUE_POLL);
                    }
                    Err(TrySendError::Disconnected(_)) => {
                        debug!(enqueued, "Producer stopping: no consumers left");
                        return (enqueued, FeedStop::Disconnected);
                    }
                }
            }
        }
        (enqueued, FeedStop::Exhausted)
    }
}

/// Receiving half, cloned into every worker
#[derive(Debug, Clone)]
pub struct WorkConsumer {
    receiver: Arc<Mutex<Receiver<WorkKey>>>,
    dequeue_timeout: Duration,
}

impl WorkConsumer {
    /// Dequeues a key, waiting at most the configured timeout
    ///
    /// # Errors
    /// `Timeout` when nothing arrived in time, `Closed` once the producer is gone and
    /// the queue is drained
    pub fn dequeue(&self) -> Result<WorkKey, QueueError> {
        let receiver = lock_or_recover(&self.receiver);
        match receiver.recv_timeout(self.dequeue_timeout) {
            Ok(key) => Ok(key),
            Err(RecvTimeoutError::Timeout) => Err(QueueError::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(QueueError::Closed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn config(capacity: usize) -> QueueConfig {
        QueueConfig {
            max_capacity: capacity,
            dequeue_timeout: Duration::from_millis(20),
        }
    }

    fn keys(n: usize) -> Vec<WorkKey> {
        (0..n).map(|i| WorkKey::new(format!("k{i}"))).collect()
    }

    #[test]
    fn enqueue_dequeue_then_closed() {
        let (producer, consumer) = bounded(&config(8));
        let token = CancellationToken::new();
        assert_eq!(producer.feed(keys(3), &token), (3, FeedStop::Exhausted));

        for i in 0..3 {
            assert_eq!(consumer.dequeue().unwrap().as_str(), format!("k{i}"));
        }
        assert_eq!(consumer.dequeue(), Err(QueueError::Closed));
    }

    #[test]
    fn empty_open_queue_times_out() {
        let (_producer, consumer) = bounded(&config(1));
        assert_eq!(consumer.dequeue(), Err(QueueError::Timeout));
    }

    #[test]
    fn each_key_goes_to_exactly_one_consumer() {
        let (producer, consumer) = bounded(&config(4));
        let handles: Vec<_> = (0..3)
            .map(|_| {
                let consumer = consumer.clone();
                std::thread::spawn(move || {
                    let mut got = Vec::new();
                    loop {
                        match consumer.dequeue() {
                            Ok(key) => got.push(key),
                            Err(QueueError::Timeout) => {}
                            Err(QueueError::Closed) => return got,
                        }
                    }
                })
            })
            .collect();
        drop(consumer);

        let token = CancellationToken::new();
        assert_eq!(producer.feed(keys(50), &token).0, 50);

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.join().unwrap());
        }
        let distinct: HashSet<_> = all.iter().collect();
        assert_eq!(all.len(), 50);
        assert_eq!(distinct.len(), 50);
    }

    #[test]
    fn producer_stops_when_cancelled() {
        let (producer, _consumer) = bounded(&config(2));
        let token = CancellationToken::new();
        let canceller = token.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            canceller.cancel();
        });
        let (enqueued, stop) = producer.feed(keys(10), &token);
        assert_eq!(enqueued, 2);
        assert_eq!(stop, FeedStop::Cancelled);
    }

    #[test]
    fn producer_stops_when_consumers_are_gone() {
        let (producer, consumer) = bounded(&config(2));
        drop(consumer);
        let token = CancellationToken::new();
        assert_eq!(producer.feed(keys(10), &token), (0, FeedStop::Disconnected));
    }
}
