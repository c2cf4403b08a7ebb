//! Streams a client-supplied reference against an index, producing one
//! `Change` per reference key plus a trailing batch of deletions for
//! whatever the index still holds that the reference never mentioned.

use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::error::CResult;
use crate::index::{Compare, Index, KeyValue, KvStream};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Unchanged,
    Created,
    Modified,
    Deleted,
}

/// One emitted decision. `value` is populated for `Created`/`Modified`
/// only; `Deleted` carries no value; the producer substitutes the
/// configured tombstone.
#[derive(Debug, Clone)]
pub struct Change {
    pub kind: ChangeKind,
    pub key: Vec<u8>,
    pub value: Option<Vec<u8>>,
}

/// Drains `reference` against `index`, sending one `Change` per key into
/// `changes`, then (if the index records seen keys) one `Deleted` change
/// per key `KeysNotSeen()` yields. Exits silently, without error, if
/// `cancel` fires or the receiving end of `changes` goes away — both are
/// treated as the session having already ended.
pub async fn diff_stream_index(
    mut reference: KvStream,
    index: &dyn Index,
    changes: mpsc::Sender<Change>,
    cancel: CancellationToken,
) -> CResult<()> {
    loop {
        let kv = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            next = reference.next() => match next {
                Some(kv) => kv,
                None => break,
            },
        };

        let change = match index.compare(&kv).await? {
            Compare::Missing => Change { kind: ChangeKind::Created, key: kv.key, value: kv.value },
            Compare::Modified => Change { kind: ChangeKind::Modified, key: kv.key, value: kv.value },
            Compare::Unchanged => Change { kind: ChangeKind::Unchanged, key: kv.key, value: None },
        };
        if changes.send(change).await.is_err() {
            return Ok(());
        }
    }

    let Some(keys) = index.keys_not_seen().await? else { return Ok(()) };
    for key in keys {
        if changes.send(Change { kind: ChangeKind::Deleted, key, value: None }).await.is_err() {
            return Ok(());
        }
    }
    Ok(())
}
