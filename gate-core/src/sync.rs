//! Glues the indexer, differ, and producer into one client session:
//! bring the index current, diff the client's stream against it, forward
//! the resulting changes to the broker, then schedule a background
//! re-index so the next session doesn't re-read what this one just wrote.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::broker::BrokerClient;
use crate::diff::{diff_stream_index, ChangeKind};
use crate::error::{CResult, Error};
use crate::index::{Index, KvStream};
use crate::indexer::index_topic;
use crate::producer::Producer;
use crate::scheduler::IndexerScheduler;

/// Aggregated counters for one session, mirroring the original's
/// `stats.go` field names (renamed to Rust conventions). `error_count`/
/// `success_count` carry over the producer's `-1` "unavailable" sentinel
/// verbatim once `finish` has run.
#[derive(Debug, Default)]
pub struct SyncStats {
    pub count: AtomicI64,
    pub created: AtomicI64,
    pub modified: AtomicI64,
    pub deleted: AtomicI64,
    pub unchanged: AtomicI64,
    pub send_count: AtomicI64,
    pub error_count: AtomicI64,
    pub success_count: AtomicI64,
    pub index_duration: std::sync::Mutex<Duration>,
    pub diff_duration: std::sync::Mutex<Duration>,
}

impl SyncStats {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Everything `run_sync` needs to re-index `topic` in the background after
/// a successful session. Built by the caller (the session layer) because
/// only it knows whether a persistent store is configured at all.
/// `run_sync` schedules this unconditionally when present, after a
/// successful sync and whenever a persistent store is configured.
pub struct ReindexAfter {
    pub topic: String,
    pub partition: i32,
    pub index: Arc<dyn Index>,
    pub removal_sentinel: Vec<u8>,
}

/// Static parameters for one sync session.
pub struct SyncSpec {
    pub topic: String,
    pub partition: i32,
    pub removal_sentinel: Vec<u8>,
    pub tombstone: Vec<u8>,
    pub dry_run: bool,
    pub reindex_after: Option<ReindexAfter>,
}

/// Runs one full sync session: bring `index` current against `topic`, diff
/// `client_stream` against it, and forward the resulting changes to
/// `broker` (or just log them, in dry-run mode). `index.cleanup()` always
/// runs before returning, success or not. On success, if `spec.reindex_after`
/// is set, a background re-index is scheduled and this call does not wait
/// for it.
pub async fn run_sync(
    broker: Arc<dyn BrokerClient>,
    index: Arc<dyn Index>,
    indexer_scheduler: Arc<IndexerScheduler>,
    spec: SyncSpec,
    client_stream: KvStream,
    cancel: CancellationToken,
) -> CResult<Arc<SyncStats>> {
    let stats = Arc::new(SyncStats::new());

    let result = run_inner(&broker, &index, &indexer_scheduler, &spec, client_stream, cancel, &stats).await;

    if let Err(e) = index.cleanup().await {
        log::warn!("index cleanup for topic {} failed: {e}", spec.topic);
    }

    result?;

    if let Some(reindex) = spec.reindex_after {
        tokio::spawn(background_reindex(broker, indexer_scheduler, reindex));
    }

    Ok(stats)
}

async fn run_inner(
    broker: &Arc<dyn BrokerClient>,
    index: &Arc<dyn Index>,
    indexer_scheduler: &Arc<IndexerScheduler>,
    spec: &SyncSpec,
    client_stream: KvStream,
    cancel: CancellationToken,
    stats: &Arc<SyncStats>,
) -> CResult<()> {
    let index_started = Instant::now();
    {
        let _permit = indexer_scheduler.acquire(&spec.topic).await;
        index_topic(broker.as_ref(), &spec.topic, spec.partition, index.as_ref(), &spec.removal_sentinel).await?;
    }
    *stats.index_duration.lock().unwrap() = index_started.elapsed();

    let (producer, producer_stats) = if spec.dry_run {
        Producer::dry_run()
    } else {
        Producer::live(spec.topic.clone(), spec.partition, broker.producer()?)
    };

    let (tx, mut rx) = mpsc::channel(1000);
    let diff_index = index.clone();
    let diff_cancel = cancel.clone();
    let diff_task = tokio::spawn(async move { diff_stream_index(client_stream, diff_index.as_ref(), tx, diff_cancel).await });

    let diff_started = Instant::now();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            next = rx.recv() => {
                let Some(change) = next else { break };
                stats.count.fetch_add(1, Ordering::SeqCst);
                match change.kind {
                    ChangeKind::Unchanged => {
                        stats.unchanged.fetch_add(1, Ordering::SeqCst);
                    }
                    ChangeKind::Created => {
                        stats.created.fetch_add(1, Ordering::SeqCst);
                        producer.send(change.key, change.value.unwrap_or_default())?;
                        stats.send_count.fetch_add(1, Ordering::SeqCst);
                    }
                    ChangeKind::Modified => {
                        stats.modified.fetch_add(1, Ordering::SeqCst);
                        producer.send(change.key, change.value.unwrap_or_default())?;
                        stats.send_count.fetch_add(1, Ordering::SeqCst);
                    }
                    ChangeKind::Deleted => {
                        stats.deleted.fetch_add(1, Ordering::SeqCst);
                        producer.send(change.key, spec.tombstone.clone())?;
                        stats.send_count.fetch_add(1, Ordering::SeqCst);
                    }
                }
            }
        }
    }
    *stats.diff_duration.lock().unwrap() = diff_started.elapsed();

    match diff_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return Err(e),
        Err(e) => return Err(Error::Internal(format!("diff task panicked: {e}"))),
    }

    producer.finish().await?;
    stats.error_count.store(producer_stats.error_count.load(Ordering::SeqCst), Ordering::SeqCst);
    stats.success_count.store(producer_stats.success_count.load(Ordering::SeqCst), Ordering::SeqCst);

    Ok(())
}

async fn background_reindex(broker: Arc<dyn BrokerClient>, scheduler: Arc<IndexerScheduler>, reindex: ReindexAfter) {
    let _permit = scheduler.acquire(&reindex.topic).await;
    if let Err(e) = index_topic(broker.as_ref(), &reindex.topic, reindex.partition, reindex.index.as_ref(), &reindex.removal_sentinel).await
    {
        log::warn!("background re-index of topic {} failed: {e}", reindex.topic);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::MemoryBroker;
    use crate::index::memory::MemoryIndex;
    use crate::index::KeyValue;

    fn kv(key: &[u8], value: &[u8]) -> KeyValue {
        KeyValue { key: key.to_vec(), value: Some(value.to_vec()) }
    }

    fn stream_of(items: Vec<KeyValue>) -> KvStream {
        Box::pin(tokio_stream::iter(items))
    }

    fn spec(topic: &str, dry_run: bool) -> SyncSpec {
        SyncSpec {
            topic: topic.to_string(),
            partition: 0,
            removal_sentinel: Vec::new(),
            tombstone: Vec::new(),
            dry_run,
            reindex_after: None,
        }
    }

    #[tokio::test]
    async fn empty_topic_and_empty_stream_emits_nothing() {
        let broker: Arc<dyn BrokerClient> = Arc::new(MemoryBroker::new());
        let index: Arc<dyn Index> = Arc::new(MemoryIndex::new(false, false));
        let scheduler = IndexerScheduler::new(4);

        let stats = run_sync(broker, index, scheduler, spec("orders", true), stream_of(vec![]), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(stats.count.load(Ordering::SeqCst), 0);
        assert_eq!(stats.created.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn new_keys_against_empty_topic_are_all_created() {
        let broker: Arc<dyn BrokerClient> = Arc::new(MemoryBroker::new());
        let index: Arc<dyn Index> = Arc::new(MemoryIndex::new(false, false));
        let scheduler = IndexerScheduler::new(4);

        let stats = run_sync(
            broker.clone(),
            index,
            scheduler,
            spec("orders", false),
            stream_of(vec![kv(b"a", b"1"), kv(b"b", b"2")]),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(stats.created.load(Ordering::SeqCst), 2);
        assert_eq!(stats.send_count.load(Ordering::SeqCst), 2);
        assert_eq!(broker.sent_messages().len(), 2);
    }

    #[tokio::test]
    async fn s2_one_modified_one_unchanged_no_delete_without_recording() {
        let broker: Arc<dyn BrokerClient> = Arc::new(MemoryBroker::new());
        let index: Arc<dyn Index> = Arc::new(MemoryIndex::new(false, false));
        let scheduler = IndexerScheduler::new(4);

        index.index(stream_of(vec![kv(b"a", b"1"), kv(b"b", b"2")]), None).await.unwrap();

        let stats = run_sync(
            broker.clone(),
            index,
            scheduler,
            spec("orders", false),
            stream_of(vec![kv(b"a", b"1"), kv(b"b", b"3")]),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(stats.unchanged.load(Ordering::SeqCst), 1);
        assert_eq!(stats.modified.load(Ordering::SeqCst), 1);
        assert_eq!(stats.deleted.load(Ordering::SeqCst), 0);
        assert_eq!(broker.sent_messages().len(), 1);
    }

    #[tokio::test]
    async fn s3_omitted_keys_become_tombstoned_deletes_when_do_delete_is_set() {
        let broker: Arc<dyn BrokerClient> = Arc::new(MemoryBroker::new());
        let index: Arc<dyn Index> = Arc::new(MemoryIndex::new(true, false));
        let scheduler = IndexerScheduler::new(4);

        index
            .index(stream_of(vec![kv(b"a", b"1"), kv(b"b", b"2"), kv(b"c", b"3")]), None)
            .await
            .unwrap();

        let mut s = spec("orders", false);
        s.tombstone = b"TOMBSTONE".to_vec();
        let stats = run_sync(broker.clone(), index, scheduler, s, stream_of(vec![kv(b"a", b"1")]), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(stats.unchanged.load(Ordering::SeqCst), 1);
        assert_eq!(stats.deleted.load(Ordering::SeqCst), 2);
        let sent = broker.sent_messages();
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|m| m.value == b"TOMBSTONE"));
    }

    #[tokio::test]
    async fn index_is_cleaned_up_even_on_cancellation() {
        let broker: Arc<dyn BrokerClient> = Arc::new(MemoryBroker::new());
        let index = Arc::new(MemoryIndex::new(true, false));
        let scheduler = IndexerScheduler::new(4);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let _ = run_sync(broker, index.clone(), scheduler, spec("orders", true), stream_of(vec![kv(b"a", b"1")]), cancel).await;

        // cleanup clears the seen set; a fresh compare would start unseen again
        assert_eq!(index.keys_not_seen().await.unwrap(), Some(vec![]));
    }

    #[tokio::test]
    async fn idempotent_resync_sends_nothing_the_second_time() {
        let broker: Arc<dyn BrokerClient> = Arc::new(MemoryBroker::new());
        let index: Arc<dyn Index> = Arc::new(MemoryIndex::new(false, false));
        let scheduler = IndexerScheduler::new(4);

        run_sync(
            broker.clone(),
            index.clone(),
            scheduler.clone(),
            spec("orders", false),
            stream_of(vec![kv(b"a", b"1"), kv(b"b", b"2")]),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        let stats = run_sync(
            broker.clone(),
            index,
            scheduler,
            spec("orders", false),
            stream_of(vec![kv(b"a", b"1"), kv(b"b", b"2")]),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(stats.unchanged.load(Ordering::SeqCst), 2);
        assert_eq!(stats.send_count.load(Ordering::SeqCst), 0);
        assert_eq!(broker.sent_messages().len(), 0);
    }
}
