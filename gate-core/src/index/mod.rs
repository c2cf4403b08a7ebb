//! The index abstraction a topic is synchronized against: a writer that
//! replays a topic's log into digests, and a prober the differ calls once
//! per client-supplied key.

pub mod disk;
pub mod memory;

use std::pin::Pin;
use tokio::sync::oneshot;
use tokio_stream::Stream;

use crate::error::CResult;

/// One key/value pair, either read off a topic's log or supplied by a
/// client. `value == None` denotes a deletion.
#[derive(Debug, Clone)]
pub struct KeyValue {
    pub key: Vec<u8>,
    pub value: Option<Vec<u8>>,
}

/// Result of probing the index for a single key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compare {
    Missing,
    Modified,
    Unchanged,
}

pub type KvStream = Pin<Box<dyn Stream<Item = KeyValue> + Send>>;

/// Carries the last-consumed offset from the indexer to the writer so it
/// commits atomically with the batch of updates it closes out.
pub type ResumeKeyFuture = oneshot::Receiver<Vec<u8>>;

/// Capability set satisfied identically by the disk-backed and in-memory
/// variants. See `disk::DiskIndex` and `memory::MemoryIndex`.
#[async_trait::async_trait]
pub trait Index: Send + Sync {
    /// Consumes `kv_stream` in a single writer scope, storing `H(value)` for
    /// each key and deleting keys whose value is `None`. If `resume_key` is
    /// given, awaits it after the stream ends and commits it to the meta
    /// bucket atomically with the last batch.
    async fn index(&self, kv_stream: KvStream, resume_key: Option<ResumeKeyFuture>) -> CResult<()>;

    /// Looks up the stored digest for `kv.key`. `kv.value` must be `Some`;
    /// deletions are never probed. When seen-recording is enabled, this has
    /// the side effect of marking the key as seen.
    async fn compare(&self, kv: &KeyValue) -> CResult<Compare>;

    /// If this index records seen keys, closes the seen-writer, waits for
    /// it to drain, and returns every primary-bucket key that was not
    /// probed during the session. Returns `None` if seen-recording is off.
    async fn keys_not_seen(&self) -> CResult<Option<Vec<Vec<u8>>>>;

    /// The meta bucket's `resumeKey` entry, verbatim, or `None`.
    fn resume_key(&self) -> CResult<Option<Vec<u8>>>;

    /// Drops the seen bucket, if any. Idempotent.
    async fn cleanup(&self) -> CResult<()>;

    /// Whether this index additionally retains full values (a memory-index
    /// only capability the core pipeline never requires).
    fn does_record_values(&self) -> bool {
        false
    }
}
