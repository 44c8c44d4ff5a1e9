//! In-bucket entry encoding and the branchless Eytzinger search over a
//! strided, packed entry array.
//!
//! Entries are `u24 LE hash ∥ value[N]`, stride `3 + N`, stored back to
//! back starting at a bucket's `file_offset`. Search reads the hash
//! in-place out of the strided buffer rather than materializing a
//! separate key array, so a lookup touching an already-resident buffer
//! performs zero heap allocations.

/// Read the little-endian 24-bit hash stored at the start of entry
/// `index` within a strided, packed entry buffer.
#[inline]
fn hash_at(data: &[u8], stride: usize, index: usize) -> u32 {
    let base = index * stride;
    u32::from(data[base]) | (u32::from(data[base + 1]) << 8) | (u32::from(data[base + 2]) << 16)
}

/// Value bytes of entry `index`.
#[inline]
pub fn value_at(data: &[u8], stride: usize, index: usize) -> &[u8] {
    let base = index * stride + 3;
    &data[base..base + (stride - 3)]
}

/// Eytzinger descent over `count` entries packed at `stride` bytes apart
/// in `data`'s `search` algorithm. Returns the
/// matching entry's index.
pub fn search(data: &[u8], stride: usize, count: usize, target: u32) -> Option<usize> {
    let mut index = 0usize;
    while index < count {
        let k = hash_at(data, stride, index);
        if k == target {
            return Some(index);
        }
        index = (index << 1) | 1;
        if k < target {
            index += 1;
        }
    }
    None
}

/// Encode one entry (`hash24 ∥ value`) into `out`, appending.
pub fn encode_entry(out: &mut Vec<u8>, hash24: u32, value: &[u8]) {
    debug_assert!(hash24 <= 0x00FF_FFFF);
    out.push((hash24 & 0xFF) as u8);
    out.push(((hash24 >> 8) & 0xFF) as u8);
    out.push(((hash24 >> 16) & 0xFF) as u8);
    out.extend_from_slice(value);
}
