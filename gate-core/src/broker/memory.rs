//! In-process fake broker: a partition is just a growable `Vec`, and the
//! producer records everything it was asked to send so tests can assert on
//! it directly instead of standing up a real cluster.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::broker::{AsyncProducerHandle, BrokerClient, BrokerRecord, PartitionConsumer, ProducerMessage, ProducerSendError};
use crate::error::CResult;

/// An in-memory stand-in for a Kafka-like broker, keyed by `(topic, partition)`.
pub struct MemoryBroker {
    logs: Mutex<HashMap<(String, i32), Vec<BrokerRecord>>>,
    sent: Arc<Mutex<Vec<ProducerMessage>>>,
    emit_errors: bool,
    emit_successes: bool,
}

impl MemoryBroker {
    /// A broker whose producer reports both successes and errors, matching
    /// the common case where both callbacks are wired up.
    pub fn new() -> Self {
        Self::with_callbacks(true, true)
    }

    /// A broker whose producer callbacks can be selectively disabled, to
    /// exercise the `-1` sentinel counters in `gate_core::producer`.
    pub fn with_callbacks(emit_errors: bool, emit_successes: bool) -> Self {
        Self { logs: Mutex::new(HashMap::new()), sent: Arc::new(Mutex::new(Vec::new())), emit_errors, emit_successes }
    }

    /// Seeds a partition with an existing record, as if some prior producer
    /// had already written it.
    pub fn append(&self, topic: &str, partition: i32, key: Vec<u8>, value: Vec<u8>) {
        let mut logs = self.logs.lock().unwrap();
        let records = logs.entry((topic.to_string(), partition)).or_default();
        let offset = records.len() as i64;
        records.push(BrokerRecord { key, value, offset });
    }

    /// Everything any producer obtained from this broker has sent so far.
    pub fn sent_messages(&self) -> Vec<ProducerMessage> {
        self.sent.lock().unwrap().clone()
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl BrokerClient for MemoryBroker {
    fn partition_offsets(&self, topic: &str, partition: i32) -> CResult<(i64, i64)> {
        let logs = self.logs.lock().unwrap();
        let high = logs.get(&(topic.to_string(), partition)).map_or(0, Vec::len) as i64;
        Ok((0, high))
    }

    fn consume_partition(
        &self,
        topic: &str,
        partition: i32,
        from_offset: i64,
    ) -> CResult<Box<dyn PartitionConsumer>> {
        let logs = self.logs.lock().unwrap();
        let records = logs.get(&(topic.to_string(), partition)).cloned().unwrap_or_default();
        let high_water_mark = records.len() as i64;
        let remaining: VecDeque<BrokerRecord> =
            records.into_iter().filter(|r| r.offset >= from_offset).collect();
        Ok(Box::new(MemoryConsumer { remaining, high_water_mark }))
    }

    fn producer(&self) -> CResult<Box<dyn AsyncProducerHandle>> {
        let (error_tx, error_rx) = mpsc::unbounded_channel();
        let (success_tx, success_rx) = mpsc::unbounded_channel();
        Ok(Box::new(MemoryProducer {
            sent: self.sent.clone(),
            emit_errors: self.emit_errors,
            emit_successes: self.emit_successes,
            error_tx,
            success_tx,
            error_rx: Some(error_rx),
            success_rx: Some(success_rx),
        }))
    }
}

struct MemoryConsumer {
    remaining: VecDeque<BrokerRecord>,
    high_water_mark: i64,
}

impl PartitionConsumer for MemoryConsumer {
    fn next(&mut self) -> CResult<Option<BrokerRecord>> {
        Ok(self.remaining.pop_front())
    }

    fn high_water_mark(&self) -> i64 {
        self.high_water_mark
    }
}

struct MemoryProducer {
    sent: Arc<Mutex<Vec<ProducerMessage>>>,
    emit_errors: bool,
    emit_successes: bool,
    error_tx: mpsc::UnboundedSender<ProducerSendError>,
    success_tx: mpsc::UnboundedSender<()>,
    error_rx: Option<mpsc::UnboundedReceiver<ProducerSendError>>,
    success_rx: Option<mpsc::UnboundedReceiver<()>>,
}

impl AsyncProducerHandle for MemoryProducer {
    fn send(&self, record: ProducerMessage) -> CResult<()> {
        self.sent.lock().unwrap().push(record);
        if self.emit_successes {
            let _ = self.success_tx.send(());
        }
        Ok(())
    }

    fn errors(&mut self) -> Option<mpsc::UnboundedReceiver<ProducerSendError>> {
        self.emit_errors.then(|| self.error_rx.take()).flatten()
    }

    fn successes(&mut self) -> Option<mpsc::UnboundedReceiver<()>> {
        self.emit_successes.then(|| self.success_rx.take()).flatten()
    }

    fn close(self: Box<Self>) -> CResult<()> {
        Ok(())
    }
}
