//! Two independent mutual-exclusion structures, both guarding topics by
//! name but with different acquire semantics:
//!
//! - [`IndexerScheduler`] bounds the re-indexing pool: at most one active
//!   indexer per topic, and at most `max_indexers` across all topics.
//!   Acquire blocks (via a condition variable) while either constraint is
//!   violated.
//! - [`SessionLocks`] serializes client sessions per topic. Acquire never
//!   blocks: a session that finds its topic already locked is rejected
//!   outright, not queued.
//!
//! Both release unconditionally through `Drop` on their guard types, so a
//! panicking task (or one cancelled mid-await) can never leak a slot.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};

const DEFAULT_MAX_INDEXERS: usize = 4;

struct IndexerState {
    active_topics: HashSet<String>,
    active_count: usize,
}

/// Process-wide gate bounding how many `index_topic` calls may run
/// concurrently, and ensuring no topic has more than one.
pub struct IndexerScheduler {
    state: Mutex<IndexerState>,
    notify: Notify,
    max_indexers: usize,
}

impl IndexerScheduler {
    pub fn new(max_indexers: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(IndexerState { active_topics: HashSet::new(), active_count: 0 }),
            notify: Notify::new(),
            max_indexers: max_indexers.max(1),
        })
    }

    /// Blocks until `topic` has no active indexer and the global cap has
    /// headroom, then reserves a slot. The returned guard releases both on
    /// drop.
    pub async fn acquire(self: &Arc<Self>, topic: &str) -> IndexerPermit {
        loop {
            {
                let mut state = self.state.lock().await;
                if !state.active_topics.contains(topic) && state.active_count < self.max_indexers {
                    state.active_topics.insert(topic.to_string());
                    state.active_count += 1;
                    return IndexerPermit { scheduler: self.clone(), topic: topic.to_string() };
                }
            }
            self.notify.notified().await;
        }
    }
}

impl Default for IndexerScheduler {
    fn default() -> Self {
        Self {
            state: Mutex::new(IndexerState { active_topics: HashSet::new(), active_count: 0 }),
            notify: Notify::new(),
            max_indexers: DEFAULT_MAX_INDEXERS,
        }
    }
}

/// Held for the duration of one `index_topic` call. Dropping it (normal
/// return, error, or task cancellation) frees the topic and the slot and
/// wakes any waiters.
pub struct IndexerPermit {
    scheduler: Arc<IndexerScheduler>,
    topic: String,
}

impl Drop for IndexerPermit {
    fn drop(&mut self) {
        let scheduler = self.scheduler.clone();
        let topic = std::mem::take(&mut self.topic);
        // `state` is a plain tokio Mutex with no held-across-await guard
        // here, so a blocking-style lock via try_lock is safe; if it's
        // momentarily contended we fall back to a detached task rather
        // than block a drop.
        match scheduler.state.try_lock() {
            Ok(mut state) => {
                state.active_topics.remove(&topic);
                state.active_count = state.active_count.saturating_sub(1);
                drop(state);
                scheduler.notify.notify_waiters();
            }
            Err(_) => {
                tokio::spawn(async move {
                    let mut state = scheduler.state.lock().await;
                    state.active_topics.remove(&topic);
                    state.active_count = state.active_count.saturating_sub(1);
                    drop(state);
                    scheduler.notify.notify_waiters();
                });
            }
        }
    }
}

/// Per-topic exclusion for client sessions, independent of the indexer
/// pool above. A topic already locked by another session is rejected
/// rather than queued.
pub struct SessionLocks {
    locked: Mutex<HashSet<String>>,
}

impl SessionLocks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { locked: Mutex::new(HashSet::new()) })
    }

    /// Tries to lock `topic` for the calling session. Returns `None` if it
    /// is already locked; the caller must reject and close the connection.
    pub async fn try_acquire(self: &Arc<Self>, topic: &str) -> Option<SessionLockGuard> {
        let mut locked = self.locked.lock().await;
        if locked.contains(topic) {
            return None;
        }
        locked.insert(topic.to_string());
        Some(SessionLockGuard { locks: self.clone(), topic: topic.to_string() })
    }
}

pub struct SessionLockGuard {
    locks: Arc<SessionLocks>,
    topic: String,
}

impl Drop for SessionLockGuard {
    fn drop(&mut self) {
        let locks = self.locks.clone();
        let topic = std::mem::take(&mut self.topic);
        match locks.locked.try_lock() {
            Ok(mut locked) => {
                locked.remove(&topic);
            }
            Err(_) => {
                tokio::spawn(async move {
                    locks.locked.lock().await.remove(&topic);
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn indexer_permit_blocks_same_topic_until_released() {
        let scheduler = IndexerScheduler::new(4);
        let first = scheduler.acquire("orders").await;

        let scheduler2 = scheduler.clone();
        let waiter = tokio::spawn(async move {
            let _permit = scheduler2.acquire("orders").await;
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(first);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn indexer_permit_allows_different_topics_concurrently() {
        let scheduler = IndexerScheduler::new(4);
        let _a = scheduler.acquire("orders").await;
        let _b = scheduler.acquire("users").await;
    }

    #[tokio::test]
    async fn global_cap_blocks_once_exhausted() {
        let scheduler = IndexerScheduler::new(1);
        let _a = scheduler.acquire("orders").await;

        let scheduler2 = scheduler.clone();
        let waiter = tokio::spawn(async move {
            let _permit = scheduler2.acquire("users").await;
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
    }

    #[tokio::test]
    async fn session_lock_rejects_contention_instead_of_blocking() {
        let locks = SessionLocks::new();
        let guard = locks.try_acquire("orders").await;
        assert!(guard.is_some());
        assert!(locks.try_acquire("orders").await.is_none());

        drop(guard);
        assert!(locks.try_acquire("orders").await.is_some());
    }

    #[tokio::test]
    async fn session_lock_permits_distinct_topics() {
        let locks = SessionLocks::new();
        let _a = locks.try_acquire("orders").await.unwrap();
        let _b = locks.try_acquire("users").await.unwrap();
    }
}
