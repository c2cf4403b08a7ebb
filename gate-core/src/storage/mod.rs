//! The on-disk layout `DiskIndex`'s store file is built on: an append-only
//! log file plus an in-memory keydir pointing at the latest version of
//! each key. See `crate::index::disk` for how one store file multiplexes
//! the primary/meta/seen namespaces over that keydir via tag-prefixed keys.

pub mod log;

/// Maps a key to the `(value_offset, value_len)` of its latest entry in
/// the log. Rebuilt by replaying the log on open; a `BTreeMap` so the
/// store can be scanned in key order if that's ever needed (the index
/// itself only does point lookups and tag-prefix scans today).
pub type KeyDir = std::collections::BTreeMap<Vec<u8>, (u64, u32)>;
