//! Bounded ordered multimap used for an index's `MetadataBlock`:
//! `u8 count`, then `count` records of
//! `u8 key_len ∥ key_bytes ∥ u8 value_len ∥ value_bytes`.

use crate::error::{CompactIndexError, Result};

/// The canonical metadata key tagging an index's logical role (e.g.
/// `PubkeyToOffsetAndSize` for the GSFA offset index).
pub const KIND_KEY: &[u8] = b"kind";

/// Ordered multimap of short byte key to short byte value, preserving
/// insertion order and duplicates, bit-exact on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataBlock {
    records: Vec<(Vec<u8>, Vec<u8>)>,
}

impl MetadataBlock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a `(key, value)` record. Fails if the block would exceed 255
    /// records or either byte string exceeds 255 bytes.
    pub fn add(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Result<()> {
        let key = key.into();
        let value = value.into();
        if self.records.len() >= 255 {
            return Err(CompactIndexError::InvalidInput(
                "metadata block already holds 255 records".into(),
            ));
        }
        if key.len() > 255 || value.len() > 255 {
            return Err(CompactIndexError::InvalidInput(
                "metadata key/value must be at most 255 bytes".into(),
            ));
        }
        self.records.push((key, value));
        Ok(())
    }

    /// Set the `kind` tag, replacing any prior value for it.
    pub fn set_kind(&mut self, kind: impl Into<Vec<u8>>) -> Result<()> {
        self.remove(KIND_KEY);
        self.add(KIND_KEY, kind)
    }

    /// Remove every record with the given key. Returns the number removed.
    pub fn remove(&mut self, key: &[u8]) -> usize {
        let before = self.records.len();
        self.records.retain(|(k, _)| k != key);
        before - self.records.len()
    }

    /// The first value recorded for `key`, in insertion order.
    pub fn get_first(&self, key: &[u8]) -> Option<&[u8]> {
        self.records
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_slice())
    }

    /// All values recorded for `key`, in insertion order.
    pub fn get_all(&self, key: &[u8]) -> Vec<&[u8]> {
        self.records
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v.as_slice())
            .collect()
    }

    /// Number of records (across all keys).
    pub fn count(&self, key: &[u8]) -> usize {
        self.records.iter().filter(|(k, _)| k == key).count()
    }

    /// Whether `key` has more than one recorded value.
    pub fn has_duplicates(&self, key: &[u8]) -> bool {
        self.count(key) > 1
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(1 + self.records.len() * 4);
        buf.push(self.records.len() as u8);
        for (k, v) in &self.records {
            buf.push(k.len() as u8);
            buf.extend_from_slice(k);
            buf.push(v.len() as u8);
            buf.extend_from_slice(v);
        }
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        Self::decode_prefix(buf).map(|(block, _)| block)
    }

    /// Like [`decode`](Self::decode), but also returns the number of bytes
    /// consumed, so a caller embedding a metadata block inside a larger
    /// framed format (e.g. a file header) knows where it ends.
    pub fn decode_prefix(buf: &[u8]) -> Result<(Self, usize)> {
        if buf.is_empty() {
            return Ok((Self::default(), 0));
        }
        let count = buf[0] as usize;
        let mut records = Vec::with_capacity(count);
        let mut pos = 1usize;
        for _ in 0..count {
            let key_len = *buf
                .get(pos)
                .ok_or_else(|| CompactIndexError::MalformedHeader("truncated metadata key length".into()))?
                as usize;
            pos += 1;
            let key = buf
                .get(pos..pos + key_len)
                .ok_or_else(|| CompactIndexError::MalformedHeader("truncated metadata key".into()))?
                .to_vec();
            pos += key_len;

            let value_len = *buf
                .get(pos)
                .ok_or_else(|| CompactIndexError::MalformedHeader("truncated metadata value length".into()))?
                as usize;
            pos += 1;
            let value = buf
                .get(pos..pos + value_len)
                .ok_or_else(|| CompactIndexError::MalformedHeader("truncated metadata value".into()))?
                .to_vec();
            pos += value_len;

            records.push((key, value));
        }
        Ok((Self { records }, pos))
    }
}
