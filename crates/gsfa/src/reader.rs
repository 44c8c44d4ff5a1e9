//! Given a public key, walks its chain newest-first, resolving each
//! record via an external fetcher.

use std::path::Path;

use tokio_util::sync::CancellationToken;

use compactindex::CompactIndexReader;

use crate::error::{GsfaError, Result};
use crate::linked_log::{self, LinkedLogReader};
use crate::offset_table::{decode_head, Head};
use crate::varint::OffsetSizeBlocktime;
use crate::PublicKey;

const LINKED_LOG_FILENAME: &str = "linked-log.bin";
const OFFSETS_FILENAME: &str = "offsets.index";

/// A resolved record exposing its transaction signature, needed by
/// [`GSFAReader::get_before_until`] to locate the `before`/`until`
/// boundaries. The core treats the signature as an opaque byte string; the
/// concrete transaction type stays an external collaborator .
pub trait SignedRecord {
    fn signature(&self) -> &[u8];
}

/// Opens the sealed offset index, the linked log, and (read-only) the
/// manifest for one epoch's GSFA writer output.
pub struct GSFAReader {
    epoch: u64,
    offset_index: CompactIndexReader,
    linked_log: LinkedLogReader,
}

impl GSFAReader {
    pub fn open(dir: impl AsRef<Path>, epoch: u64) -> Result<Self> {
        let dir = dir.as_ref();
        let offset_index = CompactIndexReader::open(dir.join(OFFSETS_FILENAME))?;
        let linked_log = LinkedLogReader::open(dir.join(LINKED_LOG_FILENAME))?;
        Ok(Self {
            epoch,
            offset_index,
            linked_log,
        })
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    fn head_for(&self, public_key: &PublicKey) -> Result<Option<Head>> {
        match self.offset_index.lookup(public_key) {
            Ok(bytes) => Ok(Some(decode_head(&bytes)?)),
            Err(compactindex::CompactIndexError::NotFound) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Return up to `limit` records for `public_key`, newest-first. Each
    /// record is resolved through `fetcher(epoch, record)`, treated as a
    /// pure resolver . Returns fewer than `limit` only
    /// when the chain is exhausted.
    pub fn get<T>(
        &self,
        public_key: &PublicKey,
        limit: usize,
        cancel: &CancellationToken,
        mut fetcher: impl FnMut(u64, OffsetSizeBlocktime) -> T,
    ) -> Result<Vec<T>> {
        let mut out = Vec::new();
        let Some(head) = self.head_for(public_key)? else {
            return Ok(out);
        };

        let mut offset = head.offset;
        let mut size = Some(head.size);
        while offset != linked_log::CHAIN_ROOT && out.len() < limit {
            if cancel.is_cancelled() {
                return Err(GsfaError::Canceled);
            }
            let (records, prev) = match size.take() {
                Some(s) => self.linked_log.read(offset, s)?,
                None => self.linked_log.read_varuint_prefixed(offset)?,
            };
            for record in records {
                if out.len() >= limit {
                    break;
                }
                out.push(fetcher(self.epoch, record));
            }
            offset = prev;
        }
        Ok(out)
    }

    /// Same as [`Self::get`], but skips records up to and including the one
    /// whose signature equals `before` (if given), and stops (inclusive) at
    /// the one whose signature equals `until` (if given).
    pub fn get_before_until<T: SignedRecord>(
        &self,
        public_key: &PublicKey,
        limit: usize,
        before: Option<&[u8]>,
        until: Option<&[u8]>,
        cancel: &CancellationToken,
        mut fetcher: impl FnMut(u64, OffsetSizeBlocktime) -> T,
    ) -> Result<Vec<T>> {
        let (out, _still_skipping, _hit_until) =
            self.walk_before_until(public_key, limit, before, until, before.is_some(), cancel, &mut fetcher)?;
        Ok(out)
    }

    /// Shared walk used by [`Self::get_before_until`] and
    /// [`crate::multi_epoch::MultiEpochReader`], which must thread the
    /// `before`-seen state across epoch boundaries. Returns the resolved
    /// records plus whether the walk is still in "skip until `before`"
    /// mode and whether `until` was reached.
    pub(crate) fn walk_before_until<T: SignedRecord>(
        &self,
        public_key: &PublicKey,
        limit: usize,
        before: Option<&[u8]>,
        until: Option<&[u8]>,
        mut skipping: bool,
        cancel: &CancellationToken,
        fetcher: &mut impl FnMut(u64, OffsetSizeBlocktime) -> T,
    ) -> Result<(Vec<T>, bool, bool)> {
        let mut out = Vec::new();
        let mut hit_until = false;

        let Some(head) = self.head_for(public_key)? else {
            return Ok((out, skipping, hit_until));
        };

        let mut offset = head.offset;
        let mut size = Some(head.size);
        'walk: while offset != linked_log::CHAIN_ROOT && out.len() < limit {
            if cancel.is_cancelled() {
                return Err(GsfaError::Canceled);
            }
            let (records, prev) = match size.take() {
                Some(s) => self.linked_log.read(offset, s)?,
                None => self.linked_log.read_varuint_prefixed(offset)?,
            };
            for record in records {
                if out.len() >= limit {
                    break 'walk;
                }
                let resolved = fetcher(self.epoch, record);
                if skipping {
                    if before.map(|b| resolved.signature() == b).unwrap_or(false) {
                        skipping = false;
                    }
                    continue;
                }
                let is_until = until.map(|u| resolved.signature() == u).unwrap_or(false);
                out.push(resolved);
                if is_until {
                    hit_until = true;
                    break 'walk;
                }
            }
            offset = prev;
        }
        Ok((out, skipping, hit_until))
    }
}
