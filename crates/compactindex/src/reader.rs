//! Opens a sealed compactindex file and performs O(1)-expected-I/O lookups.
//!
//! Two read strategies are exposed: [`lookup`]
//! memory-maps the whole file once and searches in place (low latency,
//! rewards random-access storage with large reads); [`lookup_read_at`]
//! issues one small positioned read per comparison (low memory, higher
//! latency, no `mmap` dependency on the hot path).

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use memmap2::Mmap;
use tracing::trace;

use crate::bucket;
use crate::error::{CompactIndexError, Result};
use crate::hash::{bucket_for_key, entry_hash};
use crate::header::{bucket_header_offset, BucketHeader, FileHeader};

/// An index file may not exceed 2^48 bytes: bucket `file_offset` is a
/// 48-bit field .
pub const MAX_FILE_SIZE: u64 = 1 << 48;

pub struct CompactIndexReader {
    file: File,
    mmap: Mmap,
    header: FileHeader,
    header_size: usize,
    prefetch_entries: Option<usize>,
}

impl CompactIndexReader {
    /// Open a sealed index file, validating magic, version and header
    /// shape.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        if len > MAX_FILE_SIZE {
            return Err(CompactIndexError::OutOfBounds { what: "file size" });
        }
        // SAFETY: the file is treated as immutable for the lifetime of
        // this mapping; an index is written once and never mutated after
        // sealing.
        let mmap = unsafe { Mmap::map(&file)? };
        let (header, header_size) = FileHeader::decode(&mmap)?;
        Ok(Self {
            file,
            mmap,
            header,
            header_size,
            prefetch_entries: None,
        })
    }

    /// Warm the storage layer by touching the first `k` entries of a
    /// bucket whenever it is first read. Optional; off by default.
    pub fn with_prefetch(mut self, k: usize) -> Self {
        self.prefetch_entries = Some(k);
        self
    }

    pub fn value_size(&self) -> u64 {
        self.header.value_size
    }

    pub fn num_buckets(&self) -> u32 {
        self.header.num_buckets
    }

    pub fn metadata(&self) -> &crate::metadata::MetadataBlock {
        &self.header.metadata
    }

    fn bucket_header(&self, index: u32) -> Result<BucketHeader> {
        if index >= self.header.num_buckets {
            return Err(CompactIndexError::OutOfBounds { what: "bucket index" });
        }
        let offset = bucket_header_offset(self.header_size, index) as usize;
        let slice = self
            .mmap
            .get(offset..offset + BucketHeader::SIZE)
            .ok_or(CompactIndexError::OutOfBounds { what: "bucket header" })?;
        let arr: [u8; BucketHeader::SIZE] = slice.try_into().unwrap();
        Ok(BucketHeader::decode(&arr))
    }

    fn bucket_index_for(&self, key: &[u8]) -> Result<u32> {
        let i = bucket_for_key(key, self.header.num_buckets as u64) as u32;
        if i >= self.header.num_buckets {
            return Err(CompactIndexError::OutOfBounds { what: "bucket index" });
        }
        Ok(i)
    }

    /// O(1) expected I/O: mmap the sealed file once (done at `open` time)
    /// and perform a branchless in-place Eytzinger search.
    pub fn lookup(&self, key: &[u8]) -> Result<Vec<u8>> {
        let bucket_index = self.bucket_index_for(key)?;
        let bh = self.bucket_header(bucket_index)?;
        if bh.num_entries == 0 {
            return Err(CompactIndexError::NotFound);
        }

        let stride = self.header.stride();
        let data_start = bh.file_offset as usize;
        let data_end = data_start + bh.num_entries as usize * stride;
        let data = self
            .mmap
            .get(data_start..data_end)
            .ok_or(CompactIndexError::OutOfBounds { what: "bucket entries" })?;

        if let Some(k) = self.prefetch_entries {
            let warm = k.min(bh.num_entries as usize) * stride;
            let _ = &data[..warm.min(data.len())];
        }

        let target = (entry_hash(bh.hash_domain, key) & bh.mask()) as u32;
        match bucket::search(data, stride, bh.num_entries as usize, target) {
            Some(i) => Ok(bucket::value_at(data, stride, i).to_vec()),
            None => Err(CompactIndexError::NotFound),
        }
    }

    /// Low-memory strategy: issue one positioned read per entry visited
    /// during the descent, rather than mapping the whole bucket.
    pub fn lookup_read_at(&self, key: &[u8]) -> Result<Vec<u8>> {
        let bucket_index = self.bucket_index_for(key)?;
        let bh = self.bucket_header(bucket_index)?;
        if bh.num_entries == 0 {
            return Err(CompactIndexError::NotFound);
        }

        let stride = self.header.stride();
        let value_size = self.header.value_size as usize;
        let target = (entry_hash(bh.hash_domain, key) & bh.mask()) as u32;
        let count = bh.num_entries as usize;

        let mut file = self.file.try_clone()?;
        let mut index = 0usize;
        let mut entry_buf = vec![0u8; stride];
        while index < count {
            let offset = bh.file_offset + (index * stride) as u64;
            file.seek(SeekFrom::Start(offset))?;
            file.read_exact(&mut entry_buf)?;
            let k = u32::from(entry_buf[0]) | (u32::from(entry_buf[1]) << 8) | (u32::from(entry_buf[2]) << 16);
            if k == target {
                return Ok(entry_buf[3..3 + value_size].to_vec());
            }
            index = (index << 1) | 1;
            if k < target {
                index += 1;
            }
        }
        Err(CompactIndexError::NotFound)
    }

    /// `read_full` strategy: read the whole bucket into an owned buffer
    /// with a single positioned read, then search in memory. Useful when
    /// the reader should not keep the file memory-mapped.
    pub fn lookup_read_full(&self, key: &[u8]) -> Result<Vec<u8>> {
        let bucket_index = self.bucket_index_for(key)?;
        let bh = self.bucket_header(bucket_index)?;
        if bh.num_entries == 0 {
            return Err(CompactIndexError::NotFound);
        }

        let stride = self.header.stride();
        let mut buf = vec![0u8; bh.num_entries as usize * stride];
        let mut file = self.file.try_clone()?;
        file.seek(SeekFrom::Start(bh.file_offset))?;
        file.read_exact(&mut buf)?;

        let target = (entry_hash(bh.hash_domain, key) & bh.mask()) as u32;
        match bucket::search(&buf, stride, bh.num_entries as usize, target) {
            Some(i) => Ok(bucket::value_at(&buf, stride, i).to_vec()),
            None => Err(CompactIndexError::NotFound),
        }
    }
}

impl Drop for CompactIndexReader {
    fn drop(&mut self) {
        trace!("closing compactindex reader");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::CompactIndexBuilder;
    use tokio_util::sync::CancellationToken;

    fn build_small_index(dir: &Path) -> std::path::PathBuf {
        let mut builder = CompactIndexBuilder::new(dir, 3, 8).unwrap();
        builder.insert(b"hello", &1u64.to_le_bytes()).unwrap();
        builder.insert(b"world", &2u64.to_le_bytes()).unwrap();
        builder.insert(b"blub", &3u64.to_le_bytes()).unwrap();
        let path = dir.join("t1.idx");
        let out = File::create(&path).unwrap();
        builder.seal_and_close(out, &CancellationToken::new()).unwrap();
        path
    }

    #[test]
    fn all_three_read_strategies_agree() {
        let tmp = tempfile::tempdir().unwrap();
        let path = build_small_index(tmp.path());
        let reader = CompactIndexReader::open(&path).unwrap();

        for (key, expected) in [(b"hello".as_slice(), 1u64), (b"world", 2), (b"blub", 3)] {
            let v1 = reader.lookup(key).unwrap();
            let v2 = reader.lookup_read_at(key).unwrap();
            let v3 = reader.lookup_read_full(key).unwrap();
            assert_eq!(v1, v2);
            assert_eq!(v2, v3);
            assert_eq!(u64::from_le_bytes(v1.try_into().unwrap()), expected);
        }
    }

    #[test]
    fn missing_key_is_not_found_on_every_strategy() {
        let tmp = tempfile::tempdir().unwrap();
        let path = build_small_index(tmp.path());
        let reader = CompactIndexReader::open(&path).unwrap();

        assert!(matches!(reader.lookup(b"nope"), Err(CompactIndexError::NotFound)));
        assert!(matches!(reader.lookup_read_at(b"nope"), Err(CompactIndexError::NotFound)));
        assert!(matches!(reader.lookup_read_full(b"nope"), Err(CompactIndexError::NotFound)));
    }

    #[test]
    fn prefetch_does_not_change_results() {
        let tmp = tempfile::tempdir().unwrap();
        let path = build_small_index(tmp.path());
        let reader = CompactIndexReader::open(&path).unwrap().with_prefetch(3000);
        assert_eq!(
            u64::from_le_bytes(reader.lookup(b"world").unwrap().try_into().unwrap()),
            2
        );
    }
}
