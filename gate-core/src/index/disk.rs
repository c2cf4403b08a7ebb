//! Disk-backed index: one physical store file per topic, holding three
//! logical namespaces multiplexed by a tag-prefixed key -- the primary
//! dataset, the meta entry (the sync resume offset), and however many
//! `seen:<ULID>` namespaces are still live -- the same way a single
//! embedded database file holds several logical buckets inside it.
//!
//! A store is a single append-only file plus an in-memory keydir, the
//! same log-structured layout `crate::storage::log::Log` uses underneath.
//! The primary namespace is keyed by the raw client key (not its digest);
//! the seen namespace is keyed by `(ULID, H(key))`, matching the upstream
//! bolt-backed store this is modeled on.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::{mpsc, oneshot};
use tokio_stream::StreamExt;
use ulid::Ulid;

use crate::error::{CResult, Error};
use crate::hash::{hash128, Digest128};
use crate::index::{Compare, Index, KeyValue, KvStream, ResumeKeyFuture};
use crate::storage::log::Log;

/// Seen digests are batched before being flushed to disk, amortising the
/// per-probe write cost (roughly 100-1000 per flush).
const SEEN_BATCH_SIZE: usize = 256;

const RESUME_KEY_ENTRY: &[u8] = b"resumeKey";

/// Orphaned `seen:<ULID>` entries older than this are reclaimed the next
/// time the topic's store is opened, in case their owning session crashed
/// before reaching its own `cleanup()`.
const SEEN_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

const TAG_PRIMARY: u8 = 0;
const TAG_META: u8 = 1;
const TAG_SEEN: u8 = 2;

fn primary_key(key: &[u8]) -> Vec<u8> {
    let mut k = Vec::with_capacity(1 + key.len());
    k.push(TAG_PRIMARY);
    k.extend_from_slice(key);
    k
}

fn meta_key(entry: &[u8]) -> Vec<u8> {
    let mut k = Vec::with_capacity(1 + entry.len());
    k.push(TAG_META);
    k.extend_from_slice(entry);
    k
}

fn seen_key(ulid: &Ulid, digest: &Digest128) -> Vec<u8> {
    let mut k = Vec::with_capacity(1 + 16 + 16);
    k.push(TAG_SEEN);
    k.extend_from_slice(&ulid.to_bytes());
    k.extend_from_slice(digest);
    k
}

/// Recovers the ULID a `seen` key was tagged with, if the key is long
/// enough to carry one (it always is, barring a corrupt write).
fn seen_key_ulid(key: &[u8]) -> Option<Ulid> {
    let bytes: [u8; 16] = key.get(1..17)?.try_into().ok()?;
    Some(Ulid::from_bytes(bytes))
}

/// The single append-only file backing one topic, holding every logical
/// namespace as tag-prefixed keys over one shared keydir.
struct Store {
    log: Log,
    keydir: BTreeMap<Vec<u8>, (u64, u32)>,
}

impl Store {
    fn open(path: PathBuf) -> CResult<Self> {
        let mut log = Log::new(path)?;
        let keydir = log.build_keydir()?;
        Ok(Self { log, keydir })
    }

    fn get(&mut self, key: &[u8]) -> CResult<Option<Vec<u8>>> {
        match self.keydir.get(key) {
            Some((pos, len)) => Ok(Some(self.log.read_value(*pos, *len)?)),
            None => Ok(None),
        }
    }

    fn set(&mut self, key: &[u8], value: &[u8]) -> CResult<()> {
        let (pos, len) = self.log.write_entry(key, Some(value))?;
        let value_len = value.len() as u32;
        self.keydir.insert(key.to_vec(), (pos + len as u64 - value_len as u64, value_len));
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> CResult<()> {
        self.log.write_entry(key, None)?;
        self.keydir.remove(key);
        Ok(())
    }

    fn contains(&self, key: &[u8]) -> bool {
        self.keydir.contains_key(key)
    }

    /// Every stored key tagged with `tag`, in keydir order.
    fn keys_tagged(&self, tag: u8) -> impl Iterator<Item = &Vec<u8>> {
        self.keydir.keys().filter(move |k| k.first() == Some(&tag))
    }

    fn flush(&mut self) -> CResult<()> {
        Ok(self.log.file.sync_all()?)
    }
}

/// Drops every `seen` entry whose embedded ULID is older than
/// [`SEEN_MAX_AGE`], reclaiming namespaces orphaned by a session that
/// crashed or was killed before reaching its own `cleanup()`. The
/// log-structured store has no bulk bucket-delete, so reclamation is one
/// tombstone per stale entry.
fn sweep_orphaned_seen_entries(store: &mut Store) -> CResult<()> {
    let now_ms = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64;

    let stale: Vec<Vec<u8>> = store
        .keys_tagged(TAG_SEEN)
        .filter(|key| match seen_key_ulid(key) {
            Some(ulid) => now_ms.saturating_sub(ulid.timestamp_ms()) > SEEN_MAX_AGE.as_millis() as u64,
            None => false,
        })
        .cloned()
        .collect();

    if stale.is_empty() {
        return Ok(());
    }
    log::info!("reclaiming {} orphaned seen entries", stale.len());
    for key in &stale {
        store.delete(key)?;
    }
    store.flush()
}

/// Background task that drains probed digests off a bounded queue and
/// batches them into the store's `seen:<ULID>` namespace, so `Compare`
/// never pays a write cost directly.
struct SeenWriter {
    tx: tokio::sync::Mutex<Option<mpsc::Sender<Digest128>>>,
    done: tokio::sync::Mutex<Option<oneshot::Receiver<CResult<()>>>>,
    drained: std::sync::atomic::AtomicBool,
    store: Arc<tokio::sync::Mutex<Store>>,
    ulid: Ulid,
}

impl SeenWriter {
    fn spawn(store: Arc<tokio::sync::Mutex<Store>>, ulid: Ulid) -> Self {
        let (tx, mut rx) = mpsc::channel::<Digest128>(1024);
        let (done_tx, done_rx) = oneshot::channel();
        let bg_store = store.clone();

        tokio::spawn(async move {
            let mut pending = 0usize;
            let mut result = Ok(());
            while let Some(digest) = rx.recv().await {
                let mut guard = bg_store.lock().await;
                if let Err(e) = guard.set(&seen_key(&ulid, &digest), &[]) {
                    result = Err(e);
                    break;
                }
                pending += 1;
                if pending >= SEEN_BATCH_SIZE {
                    if let Err(e) = guard.flush() {
                        result = Err(e);
                        break;
                    }
                    pending = 0;
                }
                drop(guard);
            }
            if result.is_ok() {
                result = bg_store.lock().await.flush();
            }
            let _ = done_tx.send(result);
        });

        Self {
            tx: tokio::sync::Mutex::new(Some(tx)),
            done: tokio::sync::Mutex::new(Some(done_rx)),
            drained: std::sync::atomic::AtomicBool::new(false),
            store,
            ulid,
        }
    }

    async fn mark_seen(&self, digest: Digest128) {
        let guard = self.tx.lock().await;
        if let Some(tx) = guard.as_ref() {
            let _ = tx.send(digest).await;
        }
    }

    /// Closes the queue and waits for the background task's final flush.
    /// Idempotent.
    async fn drain(&self) -> CResult<()> {
        if self.drained.load(std::sync::atomic::Ordering::Acquire) {
            return Ok(());
        }
        self.tx.lock().await.take(); // drop the sender, closing the channel
        let done_rx = self.done.lock().await.take();
        if let Some(done_rx) = done_rx {
            done_rx.await.map_err(|_| Error::IndexIO("seen-writer task was dropped".into()))??;
        }
        self.drained.store(true, std::sync::atomic::Ordering::Release);
        Ok(())
    }

    async fn contains(&self, digest: &Digest128) -> bool {
        self.store.lock().await.contains(&seen_key(&self.ulid, digest))
    }

    /// Drops every entry this session's seen namespace wrote, mirroring
    /// the upstream bolt-backed store's `DeleteBucket` on session cleanup.
    async fn cleanup(&self) {
        self.drain().await.ok();
        let mut store = self.store.lock().await;
        let own: Vec<Vec<u8>> = store
            .keys_tagged(TAG_SEEN)
            .filter(|k| seen_key_ulid(k) == Some(self.ulid))
            .cloned()
            .collect();
        for key in own {
            let _ = store.delete(&key);
        }
        let _ = store.flush();
    }
}

/// Disk-backed index for one topic: a single store file under `base_dir`
/// named after the topic, holding the primary dataset, the resume offset,
/// and (when `record_seen` is set) a `seen:<ULID>` namespace scoped to one
/// diff session.
pub struct DiskIndex {
    store: Arc<tokio::sync::Mutex<Store>>,
    seen: Option<SeenWriter>,
    // Mirrors the meta entry so the sync `resume_key()` getter never needs
    // to lock the async mutex guarding the store.
    resume_key_cache: std::sync::Mutex<Option<Vec<u8>>>,
}

impl DiskIndex {
    /// Opens (or creates) the store file for `topic` under `base_dir`,
    /// reclaims any seen entries orphaned by a session that never reached
    /// its own `cleanup()`, and, if `record_seen`, starts a fresh
    /// `seen:<ULID>` namespace scoped to this session.
    pub fn open(base_dir: &Path, topic: &str, record_seen: bool) -> CResult<Self> {
        let mut raw = Store::open(base_dir.join(topic))?;
        sweep_orphaned_seen_entries(&mut raw)?;
        let resume_key_cache = raw.get(&meta_key(RESUME_KEY_ENTRY))?;
        let store = Arc::new(tokio::sync::Mutex::new(raw));

        let seen = record_seen.then(|| SeenWriter::spawn(store.clone(), Ulid::new()));

        Ok(Self { store, seen, resume_key_cache: std::sync::Mutex::new(resume_key_cache) })
    }
}

#[async_trait::async_trait]
impl Index for DiskIndex {
    async fn index(&self, mut kv_stream: KvStream, resume_key: Option<ResumeKeyFuture>) -> CResult<()> {
        let mut store = self.store.lock().await;
        while let Some(kv) = kv_stream.next().await {
            match kv.value {
                None => store.delete(&primary_key(&kv.key))?,
                Some(value) => store.set(&primary_key(&kv.key), &hash128(&value))?,
            }
        }
        store.flush()?;
        drop(store);

        if let Some(resume_key) = resume_key {
            if let Ok(key) = resume_key.await {
                let mut store = self.store.lock().await;
                store.set(&meta_key(RESUME_KEY_ENTRY), &key)?;
                store.flush()?;
                drop(store);
                *self.resume_key_cache.lock().unwrap() = Some(key);
            }
        }
        Ok(())
    }

    async fn compare(&self, kv: &KeyValue) -> CResult<Compare> {
        let value = kv.value.as_deref().unwrap_or_default();
        let digest = hash128(value);

        if let Some(seen) = &self.seen {
            seen.mark_seen(hash128(&kv.key)).await;
        }

        let stored = self.store.lock().await.get(&primary_key(&kv.key))?;
        Ok(match stored {
            None => Compare::Missing,
            Some(stored) if stored.as_slice() == digest.as_slice() => Compare::Unchanged,
            Some(_) => Compare::Modified,
        })
    }

    async fn keys_not_seen(&self) -> CResult<Option<Vec<Vec<u8>>>> {
        let Some(seen) = &self.seen else { return Ok(None) };
        seen.drain().await?;

        let primary_keys: Vec<Vec<u8>> = {
            let store = self.store.lock().await;
            store.keys_tagged(TAG_PRIMARY).map(|k| k[1..].to_vec()).collect()
        };

        let mut unseen = Vec::new();
        for key in primary_keys {
            if !seen.contains(&hash128(&key)).await {
                unseen.push(key);
            }
        }
        Ok(Some(unseen))
    }

    fn resume_key(&self) -> CResult<Option<Vec<u8>>> {
        Ok(self.resume_key_cache.lock().unwrap().clone())
    }

    async fn cleanup(&self) -> CResult<()> {
        if let Some(seen) = &self.seen {
            seen.cleanup().await;
        }
        Ok(())
    }
}
