//! In-process index backend. Grounded on the disk variant's bucket
//! semantics but with no file I/O: a plain map guarded by an async mutex
//! stands in for the primary/meta/seen buckets.

use std::collections::{HashMap, HashSet};

use tokio_stream::StreamExt;

use crate::error::CResult;
use crate::hash::{hash256, Digest256};
use crate::index::{Compare, Index, KeyValue, KvStream, ResumeKeyFuture};

struct State {
    primary: HashMap<Vec<u8>, Digest256>,
    values: Option<HashMap<Vec<u8>, Vec<u8>>>,
    seen: Option<HashSet<Vec<u8>>>,
}

/// An index that never touches disk. Used for client sessions when no
/// persistent store is configured; `record_values` additionally retains the
/// full value bytes, a capability the core sync pipeline never needs but
/// some diff modes want.
pub struct MemoryIndex {
    record_seen: bool,
    record_values: bool,
    state: tokio::sync::Mutex<State>,
    // Kept outside `state` so the sync `resume_key()` getter never needs to
    // block on the async mutex guarding the bigger maps.
    resume_key: std::sync::Mutex<Option<Vec<u8>>>,
}

impl MemoryIndex {
    pub fn new(record_seen: bool, record_values: bool) -> Self {
        Self {
            record_seen,
            record_values,
            state: tokio::sync::Mutex::new(State {
                primary: HashMap::new(),
                values: record_values.then(HashMap::new),
                seen: record_seen.then(HashSet::new),
            }),
            resume_key: std::sync::Mutex::new(None),
        }
    }
}

#[async_trait::async_trait]
impl Index for MemoryIndex {
    async fn index(&self, mut kv_stream: KvStream, resume_key: Option<ResumeKeyFuture>) -> CResult<()> {
        let mut state = self.state.lock().await;
        while let Some(kv) = kv_stream.next().await {
            match kv.value {
                None => {
                    state.primary.remove(&kv.key);
                    if let Some(values) = state.values.as_mut() {
                        values.remove(&kv.key);
                    }
                }
                Some(value) => {
                    state.primary.insert(kv.key.clone(), hash256(&value));
                    if let Some(values) = state.values.as_mut() {
                        values.insert(kv.key, value);
                    }
                }
            }
        }
        drop(state);
        if let Some(resume_key) = resume_key {
            if let Ok(key) = resume_key.await {
                *self.resume_key.lock().unwrap() = Some(key);
            }
        }
        Ok(())
    }

    async fn compare(&self, kv: &KeyValue) -> CResult<Compare> {
        let value = kv.value.as_deref().unwrap_or_default();
        let digest = hash256(value);
        let mut state = self.state.lock().await;
        if let Some(seen) = state.seen.as_mut() {
            seen.insert(kv.key.clone());
        }
        Ok(match state.primary.get(&kv.key) {
            None => Compare::Missing,
            Some(stored) if *stored == digest => Compare::Unchanged,
            Some(_) => Compare::Modified,
        })
    }

    async fn keys_not_seen(&self) -> CResult<Option<Vec<Vec<u8>>>> {
        if !self.record_seen {
            return Ok(None);
        }
        let state = self.state.lock().await;
        let seen = state.seen.as_ref().expect("record_seen implies seen set is present");
        Ok(Some(
            state
                .primary
                .keys()
                .filter(|k| !seen.contains(*k))
                .cloned()
                .collect(),
        ))
    }

    fn resume_key(&self) -> CResult<Option<Vec<u8>>> {
        Ok(self.resume_key.lock().unwrap().clone())
    }

    async fn cleanup(&self) -> CResult<()> {
        if let Some(seen) = self.state.lock().await.seen.as_mut() {
            seen.clear();
        }
        Ok(())
    }

    fn does_record_values(&self) -> bool {
        self.record_values
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kv(key: &[u8], value: &[u8]) -> KeyValue {
        KeyValue { key: key.to_vec(), value: Some(value.to_vec()) }
    }

    fn stream_of(items: Vec<KeyValue>) -> KvStream {
        Box::pin(tokio_stream::iter(items))
    }

    #[tokio::test]
    async fn missing_then_unchanged_after_index() {
        let idx = MemoryIndex::new(false, false);
        let probe = kv(b"a", b"1");
        assert_eq!(idx.compare(&probe).await.unwrap(), Compare::Missing);

        idx.index(stream_of(vec![kv(b"a", b"1")]), None).await.unwrap();
        assert_eq!(idx.compare(&probe).await.unwrap(), Compare::Unchanged);
    }

    #[tokio::test]
    async fn modified_when_value_digest_differs() {
        let idx = MemoryIndex::new(false, false);
        idx.index(stream_of(vec![kv(b"a", b"1")]), None).await.unwrap();
        assert_eq!(idx.compare(&kv(b"a", b"2")).await.unwrap(), Compare::Modified);
    }

    #[tokio::test]
    async fn delete_removes_key_from_primary() {
        let idx = MemoryIndex::new(false, false);
        idx.index(stream_of(vec![kv(b"a", b"1")]), None).await.unwrap();
        idx.index(stream_of(vec![KeyValue { key: b"a".to_vec(), value: None }]), None)
            .await
            .unwrap();
        assert_eq!(idx.compare(&kv(b"a", b"1")).await.unwrap(), Compare::Missing);
    }

    #[tokio::test]
    async fn keys_not_seen_is_none_without_recording() {
        let idx = MemoryIndex::new(false, false);
        idx.index(stream_of(vec![kv(b"a", b"1")]), None).await.unwrap();
        assert_eq!(idx.keys_not_seen().await.unwrap(), None);
    }

    #[tokio::test]
    async fn keys_not_seen_lists_unprobed_keys() {
        let idx = MemoryIndex::new(true, false);
        idx.index(stream_of(vec![kv(b"a", b"1"), kv(b"b", b"2")]), None).await.unwrap();
        idx.compare(&kv(b"a", b"1")).await.unwrap();

        let mut unseen = idx.keys_not_seen().await.unwrap().unwrap();
        unseen.sort();
        assert_eq!(unseen, vec![b"b".to_vec()]);
    }

    #[tokio::test]
    async fn resume_key_commits_with_the_batch() {
        let idx = MemoryIndex::new(false, false);
        let (tx, rx) = tokio::sync::oneshot::channel();
        tx.send(b"000000000000002a".to_vec()).unwrap();
        idx.index(stream_of(vec![kv(b"a", b"1")]), Some(rx)).await.unwrap();
        assert_eq!(idx.resume_key().unwrap(), Some(b"000000000000002a".to_vec()));
    }

    #[tokio::test]
    async fn record_values_retains_full_bytes() {
        let idx = MemoryIndex::new(false, true);
        assert!(idx.does_record_values());
        idx.index(stream_of(vec![kv(b"a", b"hello")]), None).await.unwrap();
        let state = idx.state.lock().await;
        assert_eq!(state.values.as_ref().unwrap().get(b"a".as_slice()), Some(&b"hello".to_vec()));
    }
}
