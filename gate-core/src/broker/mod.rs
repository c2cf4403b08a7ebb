//! The boundary the indexer and producer pipeline call through to reach a
//! log broker. A real Kafka client is out of scope; this module only fixes
//! the trait shape, plus an in-memory fake (`memory`) good enough to drive
//! the rest of the pipeline in tests.

pub mod memory;

use tokio::sync::mpsc;

use crate::error::CResult;

/// One record read back from a partition.
#[derive(Debug, Clone)]
pub struct BrokerRecord {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub offset: i64,
}

/// A message queued for production.
#[derive(Debug, Clone)]
pub struct ProducerMessage {
    pub topic: String,
    pub partition: i32,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// Reported by the broker's async producer when a send fails.
#[derive(Debug, Clone)]
pub struct ProducerSendError {
    pub message: ProducerMessage,
    pub reason: String,
}

/// A handle to a configured broker cluster, shared across sessions.
pub trait BrokerClient: Send + Sync {
    /// Returns `(low_water, high_water)` offsets for a partition.
    fn partition_offsets(&self, topic: &str, partition: i32) -> CResult<(i64, i64)>;

    /// Opens a consumer positioned at `from_offset`.
    fn consume_partition(
        &self,
        topic: &str,
        partition: i32,
        from_offset: i64,
    ) -> CResult<Box<dyn PartitionConsumer>>;

    /// Opens a new async producer handle.
    fn producer(&self) -> CResult<Box<dyn AsyncProducerHandle>>;
}

/// Reads records from a single partition, starting at the offset it was
/// opened with.
pub trait PartitionConsumer: Send {
    /// Returns the next record, or `None` once the high watermark observed
    /// at open time has been reached.
    fn next(&mut self) -> CResult<Option<BrokerRecord>>;

    /// The high watermark this consumer was opened against.
    fn high_water_mark(&self) -> i64;
}

/// A producer handle whose sends are fire-and-forget; callers drain the
/// error/success channels (when enabled) to track delivery.
pub trait AsyncProducerHandle: Send {
    fn send(&self, record: ProducerMessage) -> CResult<()>;

    /// Returns the error channel exactly once; later calls return `None`.
    fn errors(&mut self) -> Option<mpsc::UnboundedReceiver<ProducerSendError>>;

    /// Returns the success channel exactly once; later calls return `None`.
    fn successes(&mut self) -> Option<mpsc::UnboundedReceiver<()>>;

    /// Initiates a close; implementations should flush inflight sends
    /// before the callback channels are dropped.
    fn close(self: Box<Self>) -> CResult<()>;
}
