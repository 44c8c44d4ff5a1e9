//! Two-pass perfect-hash index builder.
//!
//! Pass one (`insert`) partitions keys into buckets by [`hash::bucket_for_key`].
//! Pass two (`seal_and_close`) mines a per-bucket nonce that renders the
//! bucket's 24-bit entry hashes collision-free (FKS two-level hashing),
//! Eytzinger-orders the entries, and appends them to the output file.

use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use rayon::prelude::*;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bucket;
use crate::error::{CompactIndexError, Result};
use crate::eytzinger;
use crate::hash::{bucket_for_key, entry_hash};
use crate::header::{BucketHeader, FileHeader};
use crate::metadata::MetadataBlock;
use crate::scratch::{BucketScratch, FileBucketScratch, MemoryBucketScratch};

/// Keys are partitioned into buckets averaging this many entries apiece.
pub const TARGET_ENTRIES_PER_BUCKET: u64 = 10_000;

/// Mining gives up on a bucket after this many candidate domains collide.
pub const MAX_MINING_ATTEMPTS: u32 = 1000;

/// Builds with at most this many total items keep their scratch buffers
/// resident in memory instead of spilling each bucket to a temp file.
pub const MEMORY_SCRATCH_MAX_ITEMS: u64 = TARGET_ENTRIES_PER_BUCKET;

/// Fixed entry hash width, in bytes, for all buckets in a sealed file.
const HASH_LEN: u8 = 3;

/// 2^24 possible 24-bit hash values, tracked as a bitmap (2^21 bytes).
const BITMAP_BYTES: usize = 1 << 21;

pub struct CompactIndexBuilder {
    scratch_dir: Option<PathBuf>,
    value_size: u64,
    num_buckets: u32,
    scratches: Vec<Box<dyn BucketScratch + Send>>,
    metadata: MetadataBlock,
}

impl CompactIndexBuilder {
    /// Allocate `ceil(num_items / TARGET_ENTRIES_PER_BUCKET)` per-bucket
    /// scratch buffers. Picks the scratch backend once, at construction
    /// time: builds with at most [`MEMORY_SCRATCH_MAX_ITEMS`] total items
    /// keep every bucket's scratch in memory; larger builds spill each
    /// bucket to its own file under a fresh subdirectory of `tmp_dir`.
    pub fn new(tmp_dir: impl AsRef<Path>, num_items: u64, value_size: u64) -> Result<Self> {
        if value_size == 0 || value_size > 255 {
            return Err(CompactIndexError::InvalidInput(
                "value_size must be in 1..=255".into(),
            ));
        }
        if num_items == 0 {
            return Err(CompactIndexError::InvalidInput(
                "num_items must be at least 1".into(),
            ));
        }

        let num_buckets = num_items.div_ceil(TARGET_ENTRIES_PER_BUCKET) as u32;

        let (scratch_dir, scratches): (Option<PathBuf>, Vec<Box<dyn BucketScratch + Send>>) =
            if num_items <= MEMORY_SCRATCH_MAX_ITEMS {
                let scratches = (0..num_buckets)
                    .map(|_| Box::new(MemoryBucketScratch::new(value_size as usize)) as Box<dyn BucketScratch + Send>)
                    .collect();
                (None, scratches)
            } else {
                let dir = tmp_dir.as_ref().join(format!("compactindex-build-{}", std::process::id()));
                std::fs::create_dir_all(&dir)?;
                let mut scratches: Vec<Box<dyn BucketScratch + Send>> = Vec::with_capacity(num_buckets as usize);
                for i in 0..num_buckets {
                    let path = dir.join(format!("bucket-{i:08}"));
                    scratches.push(Box::new(FileBucketScratch::create(path, value_size as usize)?));
                }
                (Some(dir), scratches)
            };

        info!(num_buckets, value_size, disk_backed = scratch_dir.is_some(), "created compactindex builder");

        Ok(Self {
            scratch_dir,
            value_size,
            num_buckets,
            scratches,
            metadata: MetadataBlock::new(),
        })
    }

    /// Record the index's logical role under the `kind` metadata key,
    /// replacing any prior value.
    pub fn set_kind(&mut self, kind: impl Into<Vec<u8>>) -> Result<()> {
        self.metadata.set_kind(kind)
    }

    /// Assign `key` to a bucket and append `(key, value)` to its scratch.
    pub fn insert(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        if value.len() as u64 != self.value_size {
            return Err(CompactIndexError::InvalidInput(format!(
                "value is {} bytes, expected {}",
                value.len(),
                self.value_size
            )));
        }
        let bucket_index = bucket_for_key(key, self.num_buckets as u64) as usize;
        self.scratches[bucket_index].write_tuple(key, value)?;
        Ok(())
    }

    /// Seal the index into `output_file`, which must be a writable, empty
    /// regular file. CPU-bound; mining is parallelized across buckets up
    /// to available cores, and results are assembled in bucket-index
    /// order.
    pub fn seal_and_close(self, mut output_file: File, cancel: &CancellationToken) -> Result<()> {
        if output_file.metadata()?.len() != 0 {
            return Err(CompactIndexError::InvalidInput(
                "output file must be empty".into(),
            ));
        }

        info!(num_buckets = self.num_buckets, "sealing compactindex");

        let header = FileHeader {
            value_size: self.value_size,
            num_buckets: self.num_buckets,
            metadata: self.metadata,
        };
        let header_bytes = header.encode();
        let header_size = header_bytes.len();
        output_file.write_all(&header_bytes)?;

        // Reserve the bucket-header table with a zero-write rather than a
        // fallocate/hole-punch syscall: the table is fully overwritten by
        // the bucket-header pass below regardless of how the space was
        // reserved, so the two approaches produce identical output bytes.
        let table_len = self.num_buckets as usize * BucketHeader::SIZE;
        output_file.write_all(&vec![0u8; table_len])?;

        let stride = header.stride();
        let value_size = self.value_size as usize;

        let mined: Vec<(BucketHeader, Vec<u8>)> = self
            .scratches
            .into_par_iter()
            .enumerate()
            .map(|(i, mut scratch)| -> Result<(BucketHeader, Vec<u8>)> {
                mine_bucket(i as u32, &mut *scratch, value_size, cancel)
            })
            .collect::<Result<Vec<_>>>()?;

        let mut offset = (header_size + table_len) as u64;
        let mut bucket_headers = Vec::with_capacity(mined.len());
        for (mut bh, entries) in mined {
            if bh.num_entries == 0 {
                bh.file_offset = 0;
            } else {
                bh.file_offset = offset;
                output_file.write_all(&entries)?;
                offset += entries.len() as u64;
            }
            bucket_headers.push(bh);
        }
        debug_assert_eq!(stride, stride); // stride is derived, not stored per-bucket

        output_file.seek(SeekFrom::Start(header_size as u64))?;
        for bh in &bucket_headers {
            output_file.write_all(&bh.encode())?;
        }

        output_file.flush()?;
        output_file.sync_all()?;
        drop(output_file);

        if let Some(dir) = &self.scratch_dir {
            std::fs::remove_dir_all(dir)?;
        }
        info!("compactindex sealed");
        Ok(())
    }
}

/// Mine a collision-free nonce for one bucket and Eytzinger-order its
/// entries. Returns the bucket header (with `file_offset` left at 0 — the
/// caller assigns it once buckets are assembled in order) and the encoded
/// entry bytes.
fn mine_bucket(
    bucket_index: u32,
    scratch: &mut dyn BucketScratch,
    value_size: usize,
    cancel: &CancellationToken,
) -> Result<(BucketHeader, Vec<u8>)> {
    let tuples = scratch.read_all()?;

    // Deduplicate by key, keeping the most recently inserted value: walk
    // the tuples newest-first and keep only the first (i.e. most recent)
    // occurrence of each key. Duplicate keys need not be adjacent in
    // insertion order, so a seen-set is used rather than assuming
    // pre-clustered duplicates.
    let mut seen = std::collections::HashSet::with_capacity(tuples.len());
    let mut deduped = Vec::with_capacity(tuples.len());
    for tuple in tuples.into_iter().rev() {
        if seen.insert(tuple.key.clone()) {
            deduped.push(tuple);
        }
    }

    if deduped.is_empty() {
        return Ok((
            BucketHeader {
                hash_domain: 0,
                num_entries: 0,
                hash_len: HASH_LEN,
                file_offset: 0,
            },
            Vec::new(),
        ));
    }

    let mut bitmap = vec![0u8; BITMAP_BYTES];
    let mut hashes = vec![0u32; deduped.len()];
    let mut domain = 0u32;
    let mask: u32 = 0x00FF_FFFF;

    let winning_domain = loop {
        if cancel.is_cancelled() {
            return Err(CompactIndexError::Canceled);
        }
        if domain >= MAX_MINING_ATTEMPTS {
            warn!(bucket_index, "mining exhausted its attempt budget");
            return Err(CompactIndexError::Collision { bucket: bucket_index });
        }

        bitmap.iter_mut().for_each(|b| *b = 0);
        let mut collided = false;
        for (slot, tuple) in deduped.iter().enumerate() {
            let h = (entry_hash(domain, &tuple.key) as u32) & mask;
            hashes[slot] = h;
            let byte = (h >> 3) as usize;
            let bit = 1u8 << (h & 0b111);
            if bitmap[byte] & bit != 0 {
                collided = true;
                break;
            }
            bitmap[byte] |= bit;
        }

        if !collided {
            break domain;
        }
        debug!(bucket_index, domain, "bucket mining collision, retrying");
        domain += 1;
    };

    let mut paired: Vec<(u32, &[u8])> = hashes
        .iter()
        .copied()
        .zip(deduped.iter().map(|t| t.value.as_slice()))
        .collect();
    paired.sort_unstable_by_key(|(h, _)| *h);

    let sorted_hashes: Vec<u32> = paired.iter().map(|(h, _)| *h).collect();
    let ordered_hashes = eytzinger::reorder(&sorted_hashes);

    // Re-derive the value for each (now Eytzinger-ordered) hash. Hashes
    // within a bucket are guaranteed distinct by mining, so a hash also
    // uniquely identifies its paired value.
    let by_hash: std::collections::HashMap<u32, &[u8]> = paired.into_iter().collect();

    let mut entries = Vec::with_capacity(ordered_hashes.len() * (3 + value_size));
    for h in &ordered_hashes {
        bucket::encode_entry(&mut entries, *h, by_hash[h]);
    }

    Ok((
        BucketHeader {
            hash_domain: winning_domain,
            num_entries: ordered_hashes.len() as u32,
            hash_len: HASH_LEN,
            file_offset: 0,
        },
        entries,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::CompactIndexReader;

    #[test]
    fn single_value_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let mut builder = CompactIndexBuilder::new(tmp.path(), 1, 8).unwrap();
        builder.insert(b"only-key", &[7u8; 8]).unwrap();

        let out_path = tmp.path().join("out.idx");
        let out = File::create(&out_path).unwrap();
        builder.seal_and_close(out, &CancellationToken::new()).unwrap();

        let reader = CompactIndexReader::open(&out_path).unwrap();
        assert_eq!(reader.lookup(b"only-key").unwrap(), vec![7u8; 8]);
        assert!(matches!(reader.lookup(b"missing"), Err(CompactIndexError::NotFound)));
    }

    #[test]
    fn bulk_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let n = 5_000u64;
        let mut builder = CompactIndexBuilder::new(tmp.path(), n, 4).unwrap();
        for i in 0..n {
            let key = format!("key-{i}");
            builder.insert(key.as_bytes(), &(i as u32).to_le_bytes()).unwrap();
        }
        let out_path = tmp.path().join("bulk.idx");
        let out = File::create(&out_path).unwrap();
        builder.seal_and_close(out, &CancellationToken::new()).unwrap();

        let reader = CompactIndexReader::open(&out_path).unwrap();
        for i in 0..n {
            let key = format!("key-{i}");
            let v = reader.lookup(key.as_bytes()).unwrap();
            assert_eq!(u32::from_le_bytes(v.try_into().unwrap()), i as u32);
        }
        assert!(matches!(
            reader.lookup(b"definitely-not-present"),
            Err(CompactIndexError::NotFound)
        ));
    }

    #[test]
    fn dedup_keeps_last_inserted_value() {
        let tmp = tempfile::tempdir().unwrap();
        let mut builder = CompactIndexBuilder::new(tmp.path(), 1, 4).unwrap();
        builder.insert(b"dup", &1u32.to_le_bytes()).unwrap();
        builder.insert(b"dup", &2u32.to_le_bytes()).unwrap();
        builder.insert(b"dup", &3u32.to_le_bytes()).unwrap();

        let out_path = tmp.path().join("dedup.idx");
        let out = File::create(&out_path).unwrap();
        builder.seal_and_close(out, &CancellationToken::new()).unwrap();

        let reader = CompactIndexReader::open(&out_path).unwrap();
        let v = reader.lookup(b"dup").unwrap();
        assert_eq!(u32::from_le_bytes(v.try_into().unwrap()), 3);
    }

    #[test]
    fn rejects_zero_value_size() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(CompactIndexBuilder::new(tmp.path(), 1, 0).is_err());
    }

    #[test]
    fn rejects_wrong_value_length() {
        let tmp = tempfile::tempdir().unwrap();
        let mut builder = CompactIndexBuilder::new(tmp.path(), 1, 8).unwrap();
        assert!(builder.insert(b"key", &[0u8; 4]).is_err());
    }

    #[test]
    fn single_item_yields_single_bucket() {
        let tmp = tempfile::tempdir().unwrap();
        let builder = CompactIndexBuilder::new(tmp.path(), 1, 1).unwrap();
        assert_eq!(builder.num_buckets, 1);
    }

    #[test]
    fn small_build_keeps_scratch_in_memory() {
        let tmp = tempfile::tempdir().unwrap();
        let builder = CompactIndexBuilder::new(tmp.path(), MEMORY_SCRATCH_MAX_ITEMS, 4).unwrap();
        assert!(builder.scratch_dir.is_none());
    }

    #[test]
    fn large_build_spills_scratch_to_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let builder = CompactIndexBuilder::new(tmp.path(), MEMORY_SCRATCH_MAX_ITEMS + 1, 4).unwrap();
        let dir = builder.scratch_dir.clone().expect("large build should spill to disk");
        assert!(dir.exists());
    }

    #[test]
    fn memory_backed_build_roundtrips() {
        let tmp = tempfile::tempdir().unwrap();
        let mut builder = CompactIndexBuilder::new(tmp.path(), 10, 4).unwrap();
        for i in 0..10u32 {
            let key = format!("mem-key-{i}");
            builder.insert(key.as_bytes(), &i.to_le_bytes()).unwrap();
        }
        let out_path = tmp.path().join("mem.idx");
        let out = File::create(&out_path).unwrap();
        builder.seal_and_close(out, &CancellationToken::new()).unwrap();

        let reader = CompactIndexReader::open(&out_path).unwrap();
        for i in 0..10u32 {
            let key = format!("mem-key-{i}");
            let v = reader.lookup(key.as_bytes()).unwrap();
            assert_eq!(u32::from_le_bytes(v.try_into().unwrap()), i);
        }
    }
}
