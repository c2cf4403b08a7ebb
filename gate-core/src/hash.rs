//! Deterministic fixed-width digests used by the index to compare values and
//! to shorten disk keys, without ever re-reading the original bytes.
//!
//! Two widths are exposed, matching the two index backends (see
//! `crate::index`): the disk-backed index only needs equality, so it uses a
//! fast 128-bit non-cryptographic digest; the in-memory index reuses a
//! 256-bit cryptographic digest already common in this codebase's sibling
//! projects. Both satisfy the same observable contract: `H(v) == H(v)` for
//! any `v`, and collisions are (for our purposes) not a concern either way.

use sha2::{Digest, Sha256};
use xxhash_rust::xxh3::xxh3_128;

/// A 128-bit digest, used by the disk-backed index.
pub type Digest128 = [u8; 16];

/// A 256-bit digest, used by the in-memory index.
pub type Digest256 = [u8; 32];

/// Hashes `data` into a 128-bit digest.
pub fn hash128(data: &[u8]) -> Digest128 {
    xxh3_128(data).to_be_bytes()
}

/// Hashes `data` into a 256-bit digest.
pub fn hash256(data: &[u8]) -> Digest256 {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}
