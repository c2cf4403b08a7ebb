//! Forwards emitted changes to the broker and aggregates delivery counts.
//!
//! Two modes: dry-run (logs only, never touches the broker) and live (wraps
//! the broker's async producer and drains its error/success channels on
//! dedicated background tasks). A sync is only reported successful once
//! `finish` returns with no errors observed — sends themselves are
//! fire-and-forget, so at-least-once is the best this pipeline promises.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use crate::broker::{AsyncProducerHandle, ProducerMessage};
use crate::error::CResult;

/// Counters for one sync session. `error_count`/`success_count` are set to
/// `-1` when the corresponding producer callback was not enabled, the
/// sentinel for "this count was never tracked".
#[derive(Debug, Default)]
pub struct ProducerStats {
    pub send_count: AtomicI64,
    pub error_count: AtomicI64,
    pub success_count: AtomicI64,
}

impl ProducerStats {
    pub fn new() -> Self {
        Self::default()
    }
}

/// `send` enqueues one change's resulting key/value; `finish` closes the
/// producer and waits for its callback drains (a no-op pair in dry-run
/// mode).
pub struct Producer {
    inner: ProducerInner,
}

enum ProducerInner {
    DryRun,
    Live {
        topic: String,
        partition: i32,
        handle: Box<dyn AsyncProducerHandle>,
        error_task: Option<tokio::task::JoinHandle<()>>,
        success_task: Option<tokio::task::JoinHandle<()>>,
    },
}

impl Producer {
    /// `send` only logs the record; `finish` is a no-op. Used when no
    /// broker is configured, or for a session explicitly run without
    /// producing (e.g. a dry-run diagnostic tool built on this pipeline).
    pub fn dry_run() -> (Self, Arc<ProducerStats>) {
        (Self { inner: ProducerInner::DryRun }, Arc::new(ProducerStats::new()))
    }

    /// Wraps `handle`'s async producer: spawns background drains for
    /// whichever of the error/success channels are enabled, and marks the
    /// other as unavailable (`-1`) up front.
    pub fn live(topic: String, partition: i32, mut handle: Box<dyn AsyncProducerHandle>) -> (Self, Arc<ProducerStats>) {
        let stats = Arc::new(ProducerStats::new());

        let error_task = match handle.errors() {
            Some(mut errors) => {
                let stats = stats.clone();
                Some(tokio::spawn(async move {
                    while let Some(err) = errors.recv().await {
                        log::warn!("produce failed for topic {}: {}", err.message.topic, err.reason);
                        stats.error_count.fetch_add(1, Ordering::SeqCst);
                    }
                }))
            }
            None => {
                stats.error_count.store(-1, Ordering::SeqCst);
                None
            }
        };

        let success_task = match handle.successes() {
            Some(mut successes) => {
                let stats = stats.clone();
                Some(tokio::spawn(async move {
                    while successes.recv().await.is_some() {
                        stats.success_count.fetch_add(1, Ordering::SeqCst);
                    }
                }))
            }
            None => {
                stats.success_count.store(-1, Ordering::SeqCst);
                None
            }
        };

        (
            Self {
                inner: ProducerInner::Live { topic, partition, handle, error_task, success_task },
            },
            stats,
        )
    }

    /// Enqueues `(key, value)` for production. `stats.send_count` is
    /// bumped by the caller (see `gate_core::sync`), since dry-run mode
    /// still wants the count even though nothing is sent.
    pub fn send(&self, key: Vec<u8>, value: Vec<u8>) -> CResult<()> {
        match &self.inner {
            ProducerInner::DryRun => {
                log::info!("dry-run send key={:?} value_len={}", String::from_utf8_lossy(&key), value.len());
                Ok(())
            }
            ProducerInner::Live { topic, partition, handle, .. } => handle.send(ProducerMessage {
                topic: topic.clone(),
                partition: *partition,
                key,
                value,
            }),
        }
    }

    /// Initiates an async close and waits for both callback drain tasks to
    /// finish observing the close, so stats are final before returning.
    pub async fn finish(self) -> CResult<()> {
        match self.inner {
            ProducerInner::DryRun => Ok(()),
            ProducerInner::Live { handle, error_task, success_task, .. } => {
                handle.close()?;
                if let Some(task) = error_task {
                    let _ = task.await;
                }
                if let Some(task) = success_task {
                    let _ = task.await;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::MemoryBroker;
    use crate::broker::BrokerClient;

    #[tokio::test]
    async fn dry_run_never_touches_the_broker() {
        let (producer, stats) = Producer::dry_run();
        producer.send(b"a".to_vec(), b"1".to_vec()).unwrap();
        producer.finish().await.unwrap();
        assert_eq!(stats.error_count.load(Ordering::SeqCst), 0);
        assert_eq!(stats.success_count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn live_mode_counts_successes() {
        let broker = MemoryBroker::new();
        let handle = broker.producer().unwrap();
        let (producer, stats) = Producer::live("orders".into(), 0, handle);

        producer.send(b"a".to_vec(), b"1".to_vec()).unwrap();
        producer.finish().await.unwrap();

        assert_eq!(broker.sent_messages().len(), 1);
        assert_eq!(stats.success_count.load(Ordering::SeqCst), 1);
        assert_eq!(stats.error_count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn disabled_callbacks_sentinel_to_minus_one() {
        let broker = MemoryBroker::with_callbacks(false, false);
        let handle = broker.producer().unwrap();
        let (producer, stats) = Producer::live("orders".into(), 0, handle);
        producer.send(b"a".to_vec(), b"1".to_vec()).unwrap();
        producer.finish().await.unwrap();

        assert_eq!(stats.error_count.load(Ordering::SeqCst), -1);
        assert_eq!(stats.success_count.load(Ordering::SeqCst), -1);
    }
}
