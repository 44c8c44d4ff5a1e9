//! Append-only file of per-key compressed record batches, each carrying a
//! back-pointer to the previous batch for the same key. No header; a
//! bare concatenation of chain nodes in flush order.
//!
//! The writer side follows the same append-under-mutex shape as
//! `FlatFileStore` in the archive layer: a single file handle guarded by a
//! mutex, offsets handed back to the caller so an external map (here, the
//! offset table) can be updated.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Mutex;

use crate::error::{GsfaError, Result};
use crate::varint::{decode_uvarint, OffsetSizeBlocktime, MAX_VARINT_LEN_64};
use crate::PublicKey;

/// `previous_offset == 0` terminates a chain: the oldest node for a key.
pub const CHAIN_ROOT: u64 = 0;

struct WriterState {
    file: File,
    position: u64,
}

/// Single append-only writer for the linked log file.
pub struct LinkedLogWriter {
    state: Mutex<WriterState>,
}

impl LinkedLogWriter {
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)?;
        let position = file.metadata()?.len();
        Ok(Self {
            state: Mutex::new(WriterState { file, position }),
        })
    }

    pub fn len(&self) -> u64 {
        self.state.lock().unwrap().position
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append one chain node for `key`, built from `records` (already
    /// accumulated in push order, oldest first). `prev_offset` is the
    /// current head offset for `key`, or [`CHAIN_ROOT`] if this is its
    /// first node.
    ///
    /// Returns `(start_offset, node_len)`, the new head for `key`.
    pub fn append_one(&self, records: &[OffsetSizeBlocktime], prev_offset: u64) -> Result<(u64, u32)> {
        debug_assert!(
            prev_offset == CHAIN_ROOT || prev_offset < self.state.lock().unwrap().position,
            "a chain node's previous_offset must be strictly less than its own offset"
        );

        // Most recent push goes first in the compressed payload, so a
        // forward scan of the decoded records during a read is already
        // newest-first.
        let mut reversed: Vec<OffsetSizeBlocktime> = records.to_vec();
        reversed.reverse();

        let mut plain = Vec::new();
        for record in &reversed {
            record.encode(&mut plain);
        }
        let compressed = zstd::stream::encode_all(plain.as_slice(), 0)
            .map_err(|e| GsfaError::Codec(e.to_string()))?;

        let payload_len = compressed.len() as u64 + 8;
        let mut node = Vec::with_capacity(10 + compressed.len() + 8);
        crate::varint::encode_uvarint(payload_len, &mut node);
        node.extend_from_slice(&compressed);
        node.extend_from_slice(&prev_offset.to_le_bytes());

        let mut state = self.state.lock().unwrap();
        let start = state.position;
        state.file.write_all(&node)?;
        state.position += node.len() as u64;
        Ok((start, node.len() as u32))
    }

    /// Batch form of [`append_one`]: appends one chain node per key in
    /// `batch`, in order, under a single mutex acquisition so offset
    /// assignment within the batch stays sequential . `prev_offset_for` and `on_written` let the
    /// caller thread an external offset table through the append without
    /// this type knowing about it.
    pub fn append<F, G>(
        &self,
        batch: &[(PublicKey, Vec<OffsetSizeBlocktime>)],
        mut prev_offset_for: F,
        mut on_written: G,
    ) -> Result<()>
    where
        F: FnMut(&PublicKey) -> u64,
        G: FnMut(&PublicKey, u64, u32),
    {
        for (key, records) in batch {
            if records.is_empty() {
                continue;
            }
            let prev = prev_offset_for(key);
            let (start, len) = self.append_one(records, prev)?;
            on_written(key, start, len);
        }
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        self.state.lock().unwrap().file.flush()?;
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        let state = self.state.lock().unwrap();
        state.file.sync_data()?;
        Ok(())
    }
}

/// Read-only handle onto a linked log file. Multiple readers may share one
/// log file concurrently; each read clones the file handle and seeks
/// independently.
pub struct LinkedLogReader {
    file: File,
}

impl LinkedLogReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            file: File::open(path)?,
        })
    }

    fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut file = self.file.try_clone()?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// `read(head_offset, head_size)`: the head's size is already known
    /// (from the offset table), so this performs a single positioned read
    /// of exactly `head_size` bytes .
    pub fn read(&self, head_offset: u64, head_size: u32) -> Result<(Vec<OffsetSizeBlocktime>, u64)> {
        let buf = self.read_at(head_offset, head_size as usize)?;
        let (payload_len, n) = decode_uvarint(&buf)?;
        if payload_len < 8 {
            return Err(GsfaError::MalformedHeader("chain node payload shorter than back-pointer".into()));
        }
        let compressed_len = (payload_len - 8) as usize;
        let body = buf
            .get(n..n + compressed_len + 8)
            .ok_or_else(|| GsfaError::MalformedHeader("chain node shorter than declared length".into()))?;
        let compressed = &body[..compressed_len];
        let prev_bytes: [u8; 8] = body[compressed_len..compressed_len + 8].try_into().unwrap();
        let prev = u64::from_le_bytes(prev_bytes);

        let plain = zstd::stream::decode_all(compressed).map_err(|e| GsfaError::Codec(e.to_string()))?;
        let records = OffsetSizeBlocktime::decode_all(&plain)?;
        Ok((records, prev))
    }

    /// Legacy fallback when only the head offset is known (size unknown),
    /// e.g. after following a `previous_offset` pointer .
    pub fn read_varuint_prefixed(&self, head_offset: u64) -> Result<(Vec<OffsetSizeBlocktime>, u64)> {
        let prefix = self.read_at(head_offset, MAX_VARINT_LEN_64)?;
        let (payload_len, n) = decode_uvarint(&prefix)?;
        if payload_len < 8 {
            return Err(GsfaError::MalformedHeader("chain node payload shorter than back-pointer".into()));
        }
        let body = self.read_at(head_offset + n as u64, payload_len as usize)?;
        let compressed_len = body.len() - 8;
        let compressed = &body[..compressed_len];
        let prev_bytes: [u8; 8] = body[compressed_len..].try_into().unwrap();
        let prev = u64::from_le_bytes(prev_bytes);

        let plain = zstd::stream::decode_all(compressed).map_err(|e| GsfaError::Codec(e.to_string()))?;
        let records = OffsetSizeBlocktime::decode_all(&plain)?;
        Ok((records, prev))
    }
}
