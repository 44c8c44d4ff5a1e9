//! 64-bit keyed hashing and bucket assignment.
//!
//! `hash64` and `entry_hash` are built on xxHash64 so that values are
//! deterministic across platforms and processes — required for the
//! byte-exact sealed-file test vectors in the crate's integration tests.

use xxhash_rust::xxh64::{xxh64, Xxh64};

/// 64-bit keyed hash over an arbitrary byte string. Used for bucket
/// assignment; collisions are acceptable here (the mining pass in
/// [`crate::builder`] is what guarantees per-bucket uniqueness).
#[inline]
pub fn hash64(key: &[u8]) -> u64 {
    xxh64(key, 0)
}

/// Size of the zero-padded prefix block hashed ahead of the key in
/// [`entry_hash`].
const PREFIX_BLOCK_SIZE: usize = 32;

/// Hash a key under a mined `nonce` ("domain"). The nonce occupies the
/// first four little-endian bytes of a 32-byte zero-padded block; the key
/// bytes follow as a hash continuation. Callers mask the low bits of the
/// result to obtain the in-bucket entry hash.
#[inline]
pub fn entry_hash(nonce: u32, key: &[u8]) -> u64 {
    let mut prefix = [0u8; PREFIX_BLOCK_SIZE];
    prefix[..4].copy_from_slice(&nonce.to_le_bytes());

    let mut hasher = Xxh64::new(0);
    hasher.update(&prefix);
    hasher.update(key);
    hasher.digest()
}

/// Reversible 64-bit finalizer (the public-domain Murmur3 mixer). Used by
/// [`bucket_for_key`] to flatten modulo bias when reducing a hash into
/// `[0, n)`.
#[inline]
pub fn mix64(mut x: u64) -> u64 {
    x ^= x >> 33;
    x = x.wrapping_mul(0xff51afd7ed558ccd);
    x ^= x >> 33;
    x = x.wrapping_mul(0xc4ceb9fe1a85ec53);
    x ^= x >> 33;
    x
}

/// Assign `key` to a bucket in `[0, n)` with a (close to) uniform discrete
/// distribution: compute `u = hash64(key)`, retry through the reversible
/// mixer while `u` falls in the biased low range, then reduce modulo `n`.
///
/// `n` must be nonzero; callers are expected to have validated
/// `num_buckets >= 1` already.
pub fn bucket_for_key(key: &[u8], n: u64) -> u64 {
    debug_assert!(n > 0);
    let mut u = hash64(key);
    let r = n.wrapping_neg() % n;
    while u < r {
        u = mix64(u);
    }
    u % n
}
