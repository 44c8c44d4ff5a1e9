//! Process-wide in-memory map from public key to the head of its chain,
//! sealed on close into a [`compactindex`] file.

use std::collections::BTreeMap;
use std::fs::File;

use compactindex::CompactIndexBuilder;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{GsfaError, Result};
use crate::PublicKey;

/// Head-of-chain pointer for one public key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Head {
    pub offset: u64,
    pub size: u32,
}

/// Packed `(u48 LE offset, u48 LE size)`, the value stored in the sealed
/// offset index .
pub const OFFSET_TABLE_VALUE_SIZE: u64 = 12;

/// The logical `kind` tag recorded in the sealed index's metadata.
pub const OFFSET_TABLE_KIND: &[u8] = b"PubkeyToOffsetAndSize";

fn encode_head(head: Head) -> [u8; 12] {
    let mut out = [0u8; 12];
    out[0..6].copy_from_slice(&head.offset.to_le_bytes()[..6]);
    out[6..12].copy_from_slice(&(head.size as u64).to_le_bytes()[..6]);
    out
}

/// Decode a sealed offset-index value (`u48 LE offset, u48 LE size`) back
/// into a [`Head`] .
pub fn decode_head(bytes: &[u8]) -> Result<Head> {
    if bytes.len() != OFFSET_TABLE_VALUE_SIZE as usize {
        return Err(GsfaError::MalformedHeader(format!(
            "offset table value is {} bytes, expected {OFFSET_TABLE_VALUE_SIZE}",
            bytes.len()
        )));
    }
    let mut offset_bytes = [0u8; 8];
    offset_bytes[..6].copy_from_slice(&bytes[0..6]);
    let mut size_bytes = [0u8; 8];
    size_bytes[..6].copy_from_slice(&bytes[6..12]);
    let size_u64 = u64::from_le_bytes(size_bytes);
    let size = u32::try_from(size_u64)
        .map_err(|_| GsfaError::MalformedHeader("chain node size exceeds u32".into()))?;
    Ok(Head {
        offset: u64::from_le_bytes(offset_bytes),
        size,
    })
}

/// An ordered in-memory map kept sorted by public key so sealing can stream
/// entries without an extra sort pass.
#[derive(Default)]
pub struct OffsetTable {
    entries: BTreeMap<PublicKey, Head>,
}

impl OffsetTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &PublicKey) -> Option<Head> {
        self.entries.get(key).copied()
    }

    pub fn set(&mut self, key: PublicKey, head: Head) {
        debug_assert!(
            self.entries.get(&key).map(|h| h.offset).unwrap_or(0) <= head.offset,
            "offset table entries must be monotonically non-decreasing in offset"
        );
        self.entries.insert(key, head);
    }

    pub fn keys(&self) -> impl Iterator<Item = &PublicKey> {
        self.entries.keys()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Stream all entries in sorted-key order into a [`CompactIndex`],
    /// tagged with the `PubkeyToOffsetAndSize` kind.
    pub fn seal(&self, tmp_dir: &std::path::Path, output: File, cancel: &CancellationToken) -> Result<()> {
        debug!(entries = self.entries.len(), "sealing offset table");
        if self.entries.is_empty() {
            // CompactIndexBuilder requires num_items >= 1; an empty writer
            // still produces a structurally valid (zero-bucket-content)
            // index by reserving a single bucket.
            let mut builder = CompactIndexBuilder::new(tmp_dir, 1, OFFSET_TABLE_VALUE_SIZE)?;
            builder.set_kind(OFFSET_TABLE_KIND)?;
            builder.seal_and_close(output, cancel)?;
            return Ok(());
        }

        let mut builder = CompactIndexBuilder::new(tmp_dir, self.entries.len() as u64, OFFSET_TABLE_VALUE_SIZE)?;
        builder.set_kind(OFFSET_TABLE_KIND)?;

        for (key, head) in &self.entries {
            builder.insert(key, &encode_head(*head))?;
        }
        builder.seal_and_close(output, cancel)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_set_and_keys_roundtrip() {
        let mut table = OffsetTable::new();
        let k1 = [1u8; 32];
        let k2 = [2u8; 32];
        table.set(k1, Head { offset: 0, size: 10 });
        table.set(k1, Head { offset: 10, size: 20 });
        table.set(k2, Head { offset: 5, size: 4 });

        assert_eq!(table.get(&k1), Some(Head { offset: 10, size: 20 }));
        assert_eq!(table.get(&k2), Some(Head { offset: 5, size: 4 }));
        assert_eq!(table.len(), 2);
        let mut keys: Vec<PublicKey> = table.keys().copied().collect();
        keys.sort();
        assert_eq!(keys, vec![k1, k2]);
    }

    #[test]
    fn seal_produces_lookupable_compact_index() {
        let tmp = tempfile::tempdir().unwrap();
        let mut table = OffsetTable::new();
        for i in 0..50u8 {
            let mut key = [0u8; 32];
            key[0] = i;
            table.set(key, Head { offset: i as u64 * 100, size: i as u32 });
        }

        let out_path = tmp.path().join("offsets.idx");
        let out = File::create(&out_path).unwrap();
        table.seal(tmp.path(), out, &CancellationToken::new()).unwrap();

        let reader = compactindex::CompactIndexReader::open(&out_path).unwrap();
        for i in 0..50u8 {
            let mut key = [0u8; 32];
            key[0] = i;
            let v = reader.lookup(&key).unwrap();
            let mut offset_bytes = [0u8; 8];
            offset_bytes[..6].copy_from_slice(&v[0..6]);
            let mut size_bytes = [0u8; 8];
            size_bytes[..6].copy_from_slice(&v[6..12]);
            assert_eq!(u64::from_le_bytes(offset_bytes), i as u64 * 100);
            assert_eq!(u64::from_le_bytes(size_bytes), i as u32 as u64);
        }
    }
}
