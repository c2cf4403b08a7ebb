//! Per-connection session handling: decode the session header,
//! authenticate, resolve and police the target topic, acquire its
//! exclusion lock, then spawn the sync orchestrator and pump KV frames
//! into it until `EndOfTransfer`.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use gate_core::broker::BrokerClient;
use gate_core::index::disk::DiskIndex;
use gate_core::index::memory::MemoryIndex;
use gate_core::index::{Index, KeyValue, KvStream};
use gate_core::scheduler::{IndexerScheduler, SessionLocks};
use gate_core::sync::{run_sync, ReindexAfter, SyncSpec};

use crate::config::ServerConfig;
use crate::server::conn_status::{ConnState, ConnStatusRegistry};
use crate::wire::{self, DecodedFrame, WireFormat};

const CHANGE_CHANNEL_CAPACITY: usize = 1000;
const DEFAULT_PARTITION: i32 = 0;

/// Shared, process-wide state every session needs. Cheap to clone (it's a
/// bundle of `Arc`s); one instance is built in `main` and handed to every
/// accepted connection.
#[derive(Clone)]
pub struct Server {
    pub config: Arc<ServerConfig>,
    pub broker: Arc<dyn BrokerClient>,
    pub indexer_scheduler: Arc<IndexerScheduler>,
    pub session_locks: Arc<SessionLocks>,
    pub conn_status: Arc<ConnStatusRegistry>,
}

/// Drives one client connection end to end. `remote` is only used for
/// logging and the `ConnStatus` record; the transport itself (plain TCP or
/// a TLS-upgraded stream) is generic so `main.rs` doesn't need two copies
/// of this function.
pub async fn handle_connection<S>(server: Server, stream: S, remote: String)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut framed = Framed::new(stream, wire::frame_codec());
    let conn = server.conn_status.register(remote.clone(), String::new()).await;

    let header_bytes = match framed.next().await {
        Some(Ok(bytes)) => bytes,
        Some(Err(e)) => {
            log::warn!(target: "server_warnings", "{remote}: failed to read session header: {e}");
            conn.finish(ConnState::Failed, None).await;
            return;
        }
        None => {
            conn.finish(ConnState::Failed, None).await;
            return;
        }
    };

    let header = match wire::decode_session_header(&header_bytes) {
        Ok(h) => h,
        Err(e) => {
            log::warn!(target: "server_warnings", "{remote}: malformed session header: {e}");
            conn.finish(ConnState::Failed, None).await;
            return;
        }
    };

    if let Some(expected) = &server.config.token {
        if &header.token != expected {
            log::warn!(target: "server_warnings", "{remote}: auth failure (topic {:?})", header.topic);
            conn.finish(ConnState::Failed, None).await;
            return;
        }
    }

    let target_topic = crate::topics::resolve_topic(&server.config, &header.topic).to_string();
    conn.set_target_topic(target_topic.clone()).await;

    if !crate::topics::is_topic_allowed(&server.config, &target_topic) {
        log::warn!(target: "server_warnings", "{remote}: topic {target_topic:?} denied by policy");
        conn.finish(ConnState::Failed, None).await;
        return;
    }

    let Some(format) = WireFormat::parse(&header.format) else {
        log::warn!(target: "server_warnings", "{remote}: unknown wire format {:?}", header.format);
        conn.finish(ConnState::Failed, None).await;
        return;
    };

    let Some(_lock) = server.session_locks.try_acquire(&target_topic).await else {
        log::warn!(target: "server_warnings", "{remote}: topic {target_topic:?} already locked, rejecting");
        conn.finish(ConnState::Failed, None).await;
        return;
    };

    conn.set_state(ConnState::Reading).await;

    let index: Arc<dyn Index> = match &server.config.store {
        Some(base_dir) => match DiskIndex::open(base_dir, &target_topic, header.do_delete) {
            Ok(index) => Arc::new(index),
            Err(e) => {
                // The session aborts but still owes the client a reply,
                // unlike auth/policy/protocol failures which close silently.
                log::warn!("{remote}: failed to open disk index for {target_topic:?}: {e}");
                conn.finish(ConnState::Failed, None).await;
                let _ = write_frame(framed.get_mut(), &wire::encode_result_frame(false)).await;
                return;
            }
        },
        None => Arc::new(MemoryIndex::new(header.do_delete, false)),
    };

    let spec = SyncSpec {
        topic: target_topic.clone(),
        partition: DEFAULT_PARTITION,
        removal_sentinel: Vec::new(),
        tombstone: Vec::new(),
        dry_run: server.config.brokers.is_empty(),
        reindex_after: server.config.store.as_ref().map(|_| ReindexAfter {
            topic: target_topic.clone(),
            partition: DEFAULT_PARTITION,
            index: index.clone(),
            removal_sentinel: Vec::new(),
        }),
    };

    let (tx, rx) = mpsc::channel::<KeyValue>(CHANGE_CHANNEL_CAPACITY);
    let client_stream: KvStream = Box::pin(ReceiverStream::new(rx));
    let cancel = CancellationToken::new();

    conn.set_state(ConnState::Syncing).await;

    let orchestrator = tokio::spawn(run_sync(server.broker.clone(), index, server.indexer_scheduler.clone(), spec, client_stream, cancel.clone()));

    let mut items_read = 0u64;
    let mut clean_eot = false;
    loop {
        match framed.next().await {
            Some(Ok(bytes)) => match wire::decode_kv_frame(&bytes, format) {
                Ok(DecodedFrame { eot: true, .. }) => {
                    clean_eot = true;
                    break;
                }
                Ok(DecodedFrame { eot: false, kv: Some(kv) }) => {
                    items_read += 1;
                    conn.set_items_read(items_read).await;
                    if tx.send(kv).await.is_err() {
                        // orchestrator already gave up; nothing left to feed.
                        break;
                    }
                }
                Ok(DecodedFrame { kv: None, .. }) => unreachable!("non-EOT frame always carries a kv"),
                Err(e) => {
                    log::warn!(target: "server_warnings", "{remote}: bad kv frame: {e}");
                    break;
                }
            },
            Some(Err(e)) => {
                log::warn!("{remote}: connection read error: {e}");
                break;
            }
            None => {
                // peer disconnected before EOT.
                break;
            }
        }
    }
    if clean_eot {
        // Closing the channel is the differ's normal end-of-stream signal.
        drop(tx);
    } else {
        // Cancellation must be the only signal the differ can observe here;
        // `tx` stays alive (and the channel open) until this function
        // returns, so a dropped or errored connection can never race the
        // cancel branch of `diff_stream_index`'s `select!` against a
        // spurious "reference stream ended" reading.
        cancel.cancel();
    }

    let result = orchestrator.await;

    if !clean_eot {
        conn.finish(ConnState::Failed, None).await;
        log::info!("{remote}: session for {target_topic:?} ended without EOT; no reply sent");
        return;
    }

    match result {
        Ok(Ok(stats)) => {
            conn.finish(ConnState::Finished, Some(stats)).await;
            let _ = write_frame(framed.get_mut(), &wire::encode_result_frame(true)).await;
        }
        Ok(Err(e)) => {
            log::warn!("{remote}: sync of {target_topic:?} failed: {e}");
            conn.finish(ConnState::Failed, None).await;
            let _ = write_frame(framed.get_mut(), &wire::encode_result_frame(false)).await;
        }
        Err(join_err) => {
            log::warn!("{remote}: orchestrator task for {target_topic:?} panicked: {join_err}");
            conn.finish(ConnState::Failed, None).await;
            let _ = write_frame(framed.get_mut(), &wire::encode_result_frame(false)).await;
        }
    }
}

/// Writes one length-delimited frame directly to the connection's
/// underlying writer half, matching `wire::frame_codec`'s 4-byte
/// big-endian length prefix. Used only for the single reply frame, so a
/// full `Sink` impl over `Framed` isn't worth pulling in.
async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> std::io::Result<()> {
    writer.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await
}
