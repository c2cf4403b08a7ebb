//! Replays a topic's log into an index, checkpointing the resume offset in
//! batches so a crash mid-replay only has to redo at most one batch.

use tokio::sync::oneshot;

use crate::broker::BrokerClient;
use crate::error::{CResult, Error};
use crate::index::{Index, KeyValue, KvStream};

/// Messages processed per writer transaction before the resume offset is
/// checkpointed. The original single-transaction design traded this off
/// for simplicity; batching bounds memory and replay cost on restart.
pub const INDEX_BATCH_SIZE: usize = 500;

/// Brings `index` current with `topic`'s partition `partition`, starting
/// from the index's stored resume key (or the oldest offset if absent).
/// Returns the number of messages read.
pub async fn index_topic(
    broker: &dyn BrokerClient,
    topic: &str,
    partition: i32,
    index: &dyn Index,
    removal_sentinel: &[u8],
) -> CResult<u64> {
    let (low_water, high_water) = broker.partition_offsets(topic, partition)?;
    if high_water == 0 || low_water == high_water {
        return Ok(0);
    }

    let start_offset = match index.resume_key()? {
        None => low_water,
        Some(resume_key) => parse_resume_offset(&resume_key)? + 1,
    };
    if start_offset >= high_water {
        return Ok(0);
    }

    let mut consumer = broker.consume_partition(topic, partition, start_offset)?;

    let mut total = 0u64;
    let mut last_offset = start_offset - 1;
    let mut batch = Vec::with_capacity(INDEX_BATCH_SIZE);

    loop {
        let Some(record) = consumer.next()? else { break };
        last_offset = record.offset;
        let value = if record.value == removal_sentinel { None } else { Some(record.value) };
        batch.push(KeyValue { key: record.key, value });
        total += 1;

        let reached_high_water = last_offset + 1 >= high_water;
        if batch.len() >= INDEX_BATCH_SIZE || reached_high_water {
            commit_batch(index, std::mem::take(&mut batch), last_offset).await?;
        }
        if reached_high_water {
            break;
        }
    }

    if !batch.is_empty() {
        commit_batch(index, batch, last_offset).await?;
    }

    Ok(total)
}

async fn commit_batch(index: &dyn Index, batch: Vec<KeyValue>, last_offset: i64) -> CResult<()> {
    let stream: KvStream = Box::pin(tokio_stream::iter(batch));
    let (tx, rx) = oneshot::channel();
    let _ = tx.send(format!("{last_offset:016x}").into_bytes());
    index.index(stream, Some(rx)).await
}

fn parse_resume_offset(resume_key: &[u8]) -> CResult<i64> {
    let text = std::str::from_utf8(resume_key)
        .map_err(|e| Error::IndexIO(format!("resume key is not valid hex text: {e}")))?;
    i64::from_str_radix(text, 16)
        .map_err(|e| Error::IndexIO(format!("resume key {text:?} is not valid hex: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::MemoryBroker;
    use crate::index::memory::MemoryIndex;
    use crate::index::Compare;

    #[tokio::test]
    async fn empty_topic_returns_zero() {
        let broker = MemoryBroker::new();
        let index = MemoryIndex::new(false, false);
        let count = index_topic(&broker, "orders", 0, &index, b"").await.unwrap();
        assert_eq!(count, 0);
        assert_eq!(index.resume_key().unwrap(), None);
    }

    #[tokio::test]
    async fn reads_every_message_and_checkpoints_resume_key() {
        let broker = MemoryBroker::new();
        for i in 0..(INDEX_BATCH_SIZE + 10) {
            broker.append("orders", 0, format!("k{i}").into_bytes(), b"v".to_vec());
        }
        let index = MemoryIndex::new(false, false);
        let count = index_topic(&broker, "orders", 0, &index, b"").await.unwrap();
        assert_eq!(count, (INDEX_BATCH_SIZE + 10) as u64);

        let resume = index.resume_key().unwrap().unwrap();
        assert_eq!(parse_resume_offset(&resume).unwrap(), INDEX_BATCH_SIZE as i64 + 9);
        assert_eq!(
            index.compare(&KeyValue { key: b"k0".to_vec(), value: Some(b"v".to_vec()) }).await.unwrap(),
            Compare::Unchanged
        );
    }

    #[tokio::test]
    async fn removal_sentinel_is_mapped_to_a_deletion() {
        let broker = MemoryBroker::new();
        broker.append("orders", 0, b"a".to_vec(), b"1".to_vec());
        broker.append("orders", 0, b"a".to_vec(), b"".to_vec());

        let index = MemoryIndex::new(false, false);
        index_topic(&broker, "orders", 0, &index, b"").await.unwrap();

        let probe = KeyValue { key: b"a".to_vec(), value: Some(b"1".to_vec()) };
        assert_eq!(index.compare(&probe).await.unwrap(), Compare::Missing);
    }

    #[tokio::test]
    async fn resuming_skips_already_indexed_offsets() {
        let broker = MemoryBroker::new();
        broker.append("orders", 0, b"a".to_vec(), b"1".to_vec());
        broker.append("orders", 0, b"b".to_vec(), b"2".to_vec());

        let index = MemoryIndex::new(false, false);
        index_topic(&broker, "orders", 0, &index, b"").await.unwrap();

        broker.append("orders", 0, b"c".to_vec(), b"3".to_vec());
        let count = index_topic(&broker, "orders", 0, &index, b"").await.unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn high_water_equal_to_resume_plus_one_opens_no_consumer() {
        let broker = MemoryBroker::new();
        broker.append("orders", 0, b"a".to_vec(), b"1".to_vec());

        let index = MemoryIndex::new(false, false);
        index_topic(&broker, "orders", 0, &index, b"").await.unwrap();

        let count = index_topic(&broker, "orders", 0, &index, b"").await.unwrap();
        assert_eq!(count, 0);
    }
}
