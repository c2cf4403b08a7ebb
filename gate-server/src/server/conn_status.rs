//! Process-resident record of every connection's progress (`ConnStatus`),
//! surfaced over the admin HTTP surface (out of scope here; this module
//! only maintains the registry). Entries are swept a minute
//! after crossing the 9-minute-since-`endTime` mark so a long-running
//! server doesn't accumulate one record per connection forever.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use gate_core::sync::SyncStats;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const SWEEP_AGE: Duration = Duration::from_secs(9 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Initializing,
    Reading,
    Syncing,
    Finished,
    Failed,
}

pub struct ConnStatus {
    pub remote: String,
    pub state: ConnState,
    pub target_topic: String,
    pub items_read: u64,
    pub stats: Option<Arc<SyncStats>>,
    pub start_time: Instant,
    pub end_time: Option<Instant>,
}

impl ConnStatus {
    fn new(remote: String, target_topic: String) -> Self {
        Self {
            remote,
            state: ConnState::Initializing,
            target_topic,
            items_read: 0,
            stats: None,
            start_time: Instant::now(),
            end_time: None,
        }
    }
}

/// A handle to one connection's entry in the registry. Updating through
/// this handle is how `server::session` reports phase transitions without
/// threading the registry through every call.
pub struct ConnHandle {
    registry: Arc<ConnStatusRegistry>,
    id: u64,
}

impl ConnHandle {
    pub async fn set_state(&self, state: ConnState) {
        self.registry.with_entry(self.id, |entry| entry.state = state).await;
    }

    pub async fn set_items_read(&self, items_read: u64) {
        self.registry.with_entry(self.id, |entry| entry.items_read = items_read).await;
    }

    pub async fn set_target_topic(&self, topic: String) {
        self.registry.with_entry(self.id, |entry| entry.target_topic = topic).await;
    }

    pub async fn finish(&self, state: ConnState, stats: Option<Arc<SyncStats>>) {
        self.registry
            .with_entry(self.id, |entry| {
                entry.state = state;
                entry.stats = stats;
                entry.end_time = Some(Instant::now());
            })
            .await;
    }
}

pub struct ConnStatusRegistry {
    entries: Mutex<HashMap<u64, ConnStatus>>,
    next_id: AtomicU64,
}

impl ConnStatusRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { entries: Mutex::new(HashMap::new()), next_id: AtomicU64::new(0) })
    }

    /// Registers a new connection in `Initializing` state and returns a
    /// handle the session task uses for the rest of its lifetime.
    pub async fn register(self: &Arc<Self>, remote: String, target_topic: String) -> ConnHandle {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.entries.lock().await.insert(id, ConnStatus::new(remote, target_topic));
        ConnHandle { registry: self.clone(), id }
    }

    async fn with_entry(&self, id: u64, f: impl FnOnce(&mut ConnStatus)) {
        if let Some(entry) = self.entries.lock().await.get_mut(&id) {
            f(entry);
        }
    }

    /// Snapshot of all live entries, for the admin surface.
    pub async fn snapshot(&self) -> Vec<(u64, ConnState, String, u64)> {
        self.entries.lock().await.iter().map(|(id, e)| (*id, e.state, e.target_topic.clone(), e.items_read)).collect()
    }

    async fn sweep(&self) {
        let now = Instant::now();
        self.entries.lock().await.retain(|_, entry| match entry.end_time {
            Some(end) => now.duration_since(end) < SWEEP_AGE,
            None => true,
        });
    }

    /// Spawns the background sweeper. Runs for the life of the process;
    /// there is no cancellation handle since the registry itself is never
    /// torn down before process exit.
    pub fn spawn_sweeper(self: &Arc<Self>) {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                ticker.tick().await;
                registry.sweep().await;
            }
        });
    }
}
