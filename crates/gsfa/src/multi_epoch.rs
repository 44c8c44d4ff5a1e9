//! Fan-out across multiple GSFA indexes ordered newest epoch first, with
//! `before`/`until` filter state threaded across the epoch boundary.

use tokio_util::sync::CancellationToken;

use crate::reader::{GSFAReader, SignedRecord};
use crate::varint::OffsetSizeBlocktime;
use crate::PublicKey;
use crate::Result;

/// Holds an ordered list of [`GSFAReader`]s, newest epoch first.
pub struct MultiEpochReader {
    readers: Vec<GSFAReader>,
}

impl MultiEpochReader {
    /// `readers` must already be ordered newest epoch first; this type
    /// does not sort them.
    pub fn new(readers: Vec<GSFAReader>) -> Self {
        Self { readers }
    }

    pub fn epochs(&self) -> impl Iterator<Item = u64> + '_ {
        self.readers.iter().map(|r| r.epoch())
    }

    /// Iterate epochs newest-first, calling each epoch's reader with the
    /// remaining limit and concatenating results, preserving newest-first
    /// order across the whole fan-out.
    pub fn get<T>(
        &self,
        public_key: &PublicKey,
        limit: usize,
        cancel: &CancellationToken,
        mut fetcher: impl FnMut(u64, OffsetSizeBlocktime) -> T,
    ) -> Result<Vec<T>> {
        let mut out = Vec::new();
        for reader in &self.readers {
            if out.len() >= limit {
                break;
            }
            let remaining = limit - out.len();
            let mut chunk = reader.get(public_key, remaining, cancel, &mut fetcher)?;
            out.append(&mut chunk);
        }
        Ok(out)
    }

    /// Same as [`Self::get`], but threads the `before`/`until` match state
    /// across epochs: once `before` has been observed in a newer epoch,
    /// older epochs no longer skip; `until` stops the whole fan-out, not
    /// just the epoch it was found in.
    pub fn get_before_until<T: SignedRecord>(
        &self,
        public_key: &PublicKey,
        limit: usize,
        before: Option<&[u8]>,
        until: Option<&[u8]>,
        cancel: &CancellationToken,
        mut fetcher: impl FnMut(u64, OffsetSizeBlocktime) -> T,
    ) -> Result<Vec<T>> {
        let mut out = Vec::new();
        let mut skipping = before.is_some();
        for reader in &self.readers {
            if out.len() >= limit {
                break;
            }
            let remaining = limit - out.len();
            let (mut chunk, still_skipping, hit_until) =
                reader.walk_before_until(public_key, remaining, before, until, skipping, cancel, &mut fetcher)?;
            skipping = still_skipping;
            out.append(&mut chunk);
            if hit_until {
                break;
            }
        }
        Ok(out)
    }
}
