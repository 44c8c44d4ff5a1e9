//! Buffers per-key records, schedules flushes by threshold or memory
//! pressure, and orchestrates the linked log and offset table.
//!
//! `GSFAWriter` is `&mut self`-exclusive, not shared across threads, so the
//! foreground accumulator is a plain `HashMap` rather than a guarded one;
//! the linked log and offset table it hands off to are the shared state,
//! each behind its own `Mutex`/internal locking so the background flusher
//! can reach them concurrently. The flusher runs as a
//! `tokio::task::spawn_blocking` job reached over a bounded
//! `tokio::sync::mpsc` channel, with a `tokio::sync::oneshot` completion
//! signal awaited during `close`. Every per-key detach — whether from
//! hitting the threshold in `push` or from the pressure valve — goes
//! through that same channel, so the flusher always resolves a key's
//! batches in the order they were detached.

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use compactindex::MetadataBlock;

use crate::error::{GsfaError, Result};
use crate::linked_log::{self, LinkedLogWriter};
use crate::manifest::Manifest;
use crate::offset_table::{Head, OffsetTable};
use crate::varint::OffsetSizeBlocktime;
use crate::PublicKey;

/// A key's accumulator is detached and handed to the background flusher
/// once it reaches this many records.
pub const ITEMS_PER_BATCH: usize = 1000;

/// The background flusher writes at most this many staged per-key buffers
/// into a single `LinkedLog::append` call.
pub const FLUSH_BATCH_SIZE: usize = 256;

/// The accumulator-size threshold that arms the pressure valve, checked on
/// slot boundaries.
pub const PRESSURE_VALVE_THRESHOLD: usize = 130_000;

/// Under pressure, a key's buffer is flushed synchronously only if it is
/// still smaller than this.
pub const PRESSURE_VALVE_SMALL_BUFFER: usize = 100;

/// Depth of the channel between `push` callers and the background
/// flusher. Bounded so a slow flusher applies backpressure to the
/// foreground accumulator rather than letting it grow without limit.
const FLUSH_CHANNEL_CAPACITY: usize = 64;

const LINKED_LOG_FILENAME: &str = "linked-log.bin";
const MANIFEST_FILENAME: &str = "manifest.bin";
const OFFSETS_FILENAME: &str = "offsets.index";

enum FlushMsg {
    Buffer(PublicKey, Vec<OffsetSizeBlocktime>),
}

pub struct GSFAWriter {
    dir: PathBuf,
    tmp_dir: PathBuf,
    linked_log: Arc<LinkedLogWriter>,
    offset_table: Arc<Mutex<OffsetTable>>,
    accum: HashMap<PublicKey, Vec<OffsetSizeBlocktime>>,
    tx: Option<mpsc::Sender<FlushMsg>>,
    done_rx: Option<oneshot::Receiver<Result<()>>>,
    flusher: Option<JoinHandle<()>>,
    last_slot_seen: u64,
    closed: bool,
}

impl GSFAWriter {
    /// Create or open a writer directory. `metadata` carries any
    /// caller-supplied tags; `epoch`, `root_cid` and `network` are recorded
    /// in the manifest alongside it. Must be called from within a Tokio
    /// runtime: the background flusher is spawned via
    /// `tokio::task::spawn_blocking`.
    pub fn new(
        dir: impl AsRef<Path>,
        mut metadata: MetadataBlock,
        epoch: u64,
        root_cid: impl AsRef<str>,
        network: impl AsRef<str>,
        tmp_dir: impl AsRef<Path>,
    ) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        metadata.add("epoch", epoch.to_le_bytes().to_vec())?;
        metadata.add("rootCid", root_cid.as_ref().as_bytes().to_vec())?;
        metadata.add("network", network.as_ref().as_bytes().to_vec())?;
        let manifest = Manifest::new(metadata);
        manifest.write_to(dir.join(MANIFEST_FILENAME))?;

        let linked_log = Arc::new(LinkedLogWriter::create(dir.join(LINKED_LOG_FILENAME))?);
        let offset_table = Arc::new(Mutex::new(OffsetTable::new()));

        let (tx, rx) = mpsc::channel(FLUSH_CHANNEL_CAPACITY);
        let (done_tx, done_rx) = oneshot::channel();
        let flusher = spawn_flusher(linked_log.clone(), offset_table.clone(), rx, done_tx);

        info!(epoch, "opened gsfa writer");

        Ok(Self {
            dir,
            tmp_dir: tmp_dir.as_ref().to_path_buf(),
            linked_log,
            offset_table,
            accum: HashMap::new(),
            tx: Some(tx),
            done_rx: Some(done_rx),
            flusher: Some(flusher),
            last_slot_seen: 0,
            closed: false,
        })
    }

    /// Record that a transaction at `(offset, size)` in `slot` referenced
    /// each of `public_keys`. `slot` must be non-decreasing across calls
    /// (checked in debug builds only; trusted internal callers are not
    /// charged a runtime check in release builds).
    ///
    /// Must not be called from within an actively polled async task: the
    /// per-key threshold path sends to the flusher channel with a blocking
    /// send, which panics inside an async execution context. Call it from
    /// a plain thread, or wrap it in `spawn_blocking` if driving it from
    /// async code.
    pub fn push(
        &mut self,
        offset: u64,
        size: u64,
        slot: u64,
        blocktime: u64,
        public_keys: &[PublicKey],
    ) -> Result<()> {
        debug_assert!(
            slot >= self.last_slot_seen,
            "push requires non-decreasing slot"
        );
        self.last_slot_seen = self.last_slot_seen.max(slot);

        let mut keys: Vec<PublicKey> = public_keys.to_vec();
        keys.sort_unstable();
        keys.dedup();

        let record = OffsetSizeBlocktime {
            offset,
            size,
            blocktime,
        };
        for key in keys {
            let buf = self.accum.entry(key).or_default();
            buf.push(record);
            if buf.len() >= ITEMS_PER_BATCH {
                let detached = self.accum.remove(&key).unwrap();
                self.send_batch(key, detached)?;
            }
        }

        if slot % 1000 == 0 {
            self.apply_pressure_valve()?;
        }
        Ok(())
    }

    /// Global pressure valve: when the accumulator holds more keys than
    /// `PRESSURE_VALVE_THRESHOLD`, every key with a small buffer is
    /// detached early and handed to the background flusher the same way a
    /// threshold-sized batch is, bounding the foreground accumulator's
    /// memory from many low-volume keys.
    ///
    /// This must go through the same channel as [`Self::push`]'s
    /// threshold detach rather than writing `linked_log`/`offset_table`
    /// directly: a key can already have an earlier batch in flight in the
    /// channel or staged in the background flusher, and writing synchronously
    /// here would race that in-flight batch for the right to read
    /// `offset_table`'s previous head, potentially chaining the older batch
    /// after the newer one. Routing through `tx` preserves the channel's
    /// FIFO order, so the background flusher always resolves a key's
    /// batches in the order they were detached.
    fn apply_pressure_valve(&mut self) -> Result<()> {
        if self.accum.len() <= PRESSURE_VALVE_THRESHOLD {
            return Ok(());
        }
        warn!(accum_len = self.accum.len(), "gsfa accumulator pressure valve triggered");

        let mut keys: Vec<PublicKey> = self.accum.keys().copied().collect();
        keys.sort_unstable();
        for key in keys {
            let small = self
                .accum
                .get(&key)
                .map(|v| v.len() < PRESSURE_VALVE_SMALL_BUFFER)
                .unwrap_or(false);
            if small {
                if let Some(records) = self.accum.remove(&key) {
                    self.send_batch(key, records)?;
                }
            }
        }
        Ok(())
    }

    fn send_batch(&self, key: PublicKey, records: Vec<OffsetSizeBlocktime>) -> Result<()> {
        self.tx
            .as_ref()
            .expect("flush channel already closed")
            .blocking_send(FlushMsg::Buffer(key, records))
            .map_err(|_| GsfaError::InvalidInput("gsfa flush channel closed unexpectedly".into()))
    }

    /// Drain all buffers, seal the offset index, and close child files.
    /// Idempotent: a second call on an already-closed writer is a no-op.
    pub async fn close(&mut self, cancel: &CancellationToken) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        info!("closing gsfa writer, draining accumulator");

        let mut keys: Vec<PublicKey> = self.accum.keys().copied().collect();
        keys.sort_unstable();
        for key in keys {
            if let Some(records) = self.accum.remove(&key) {
                self.send_batch(key, records)?;
            }
        }

        // Closing the channel's send side lets the flusher's blocking_recv
        // observe "drained and closed" and exit its loop.
        self.tx.take();
        if let Some(done_rx) = self.done_rx.take() {
            done_rx.await.map_err(|_| GsfaError::Canceled)??;
        }
        if let Some(handle) = self.flusher.take() {
            let _ = handle.await;
        }

        self.linked_log.flush()?;
        self.linked_log.sync()?;

        let offsets_path = self.dir.join(OFFSETS_FILENAME);
        let output = File::create(&offsets_path)?;
        self.offset_table.lock().unwrap().seal(&self.tmp_dir, output, cancel)?;

        self.closed = true;
        info!("gsfa writer closed");
        Ok(())
    }

    /// Path to the sealed offset index, valid once [`Self::close`] has run.
    pub fn offsets_path(&self) -> PathBuf {
        self.dir.join(OFFSETS_FILENAME)
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.dir.join(MANIFEST_FILENAME)
    }

    pub fn linked_log_path(&self) -> PathBuf {
        self.dir.join(LINKED_LOG_FILENAME)
    }
}

fn spawn_flusher(
    linked_log: Arc<LinkedLogWriter>,
    offset_table: Arc<Mutex<OffsetTable>>,
    mut rx: mpsc::Receiver<FlushMsg>,
    done_tx: oneshot::Sender<Result<()>>,
) -> JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        let mut staging: Vec<(PublicKey, Vec<OffsetSizeBlocktime>)> = Vec::with_capacity(FLUSH_BATCH_SIZE);
        let result = (|| -> Result<()> {
            loop {
                match rx.blocking_recv() {
                    Some(FlushMsg::Buffer(key, records)) => {
                        let collides = staging.iter().any(|(k, _)| *k == key);
                        if collides || staging.len() >= FLUSH_BATCH_SIZE {
                            flush_staging(&linked_log, &offset_table, &mut staging)?;
                        }
                        staging.push((key, records));
                    }
                    None => break,
                }
            }
            flush_staging(&linked_log, &offset_table, &mut staging)?;
            Ok(())
        })();
        debug!(ok = result.is_ok(), "gsfa background flusher drained");
        let _ = done_tx.send(result);
    })
}

fn flush_staging(
    linked_log: &LinkedLogWriter,
    offset_table: &Mutex<OffsetTable>,
    staging: &mut Vec<(PublicKey, Vec<OffsetSizeBlocktime>)>,
) -> Result<()> {
    if staging.is_empty() {
        return Ok(());
    }
    linked_log.append(
        staging,
        |key| {
            offset_table
                .lock()
                .unwrap()
                .get(key)
                .map(|h| h.offset)
                .unwrap_or(linked_log::CHAIN_ROOT)
        },
        |key, offset, size| {
            offset_table.lock().unwrap().set(*key, Head { offset, size });
        },
    )?;
    staging.clear();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::GSFAReader;

    fn key(b: u8) -> PublicKey {
        [b; 32]
    }

    #[tokio::test]
    async fn push_then_close_produces_lookupable_chain() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("writer");
        let mut writer = GSFAWriter::new(
            &dir,
            MetadataBlock::new(),
            42,
            "bafytestcid",
            "mainnet",
            tmp.path(),
        )
        .unwrap();

        writer.push(100, 10, 1, 1_700_000_000, &[key(1), key(2)]).unwrap();
        writer.push(200, 20, 2, 1_700_000_100, &[key(1)]).unwrap();

        writer.close(&CancellationToken::new()).await.unwrap();

        let reader = GSFAReader::open(&dir, 42).unwrap();
        let records = reader
            .get(&key(1), 10, &CancellationToken::new(), |_epoch, r| r)
            .unwrap();
        // newest-first: the slot-2 push comes before the slot-1 push.
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].offset, 200);
        assert_eq!(records[1].offset, 100);

        let records2 = reader
            .get(&key(2), 10, &CancellationToken::new(), |_epoch, r| r)
            .unwrap();
        assert_eq!(records2.len(), 1);
        assert_eq!(records2[0].offset, 100);
    }

    #[tokio::test]
    async fn per_key_threshold_detaches_to_background_flusher() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("writer");
        let mut writer = GSFAWriter::new(
            &dir,
            MetadataBlock::new(),
            1,
            "cid",
            "testnet",
            tmp.path(),
        )
        .unwrap();

        let k = key(9);
        for i in 0..(ITEMS_PER_BATCH as u64 + 5) {
            writer.push(i, 1, i, i, std::slice::from_ref(&k)).unwrap();
        }
        writer.close(&CancellationToken::new()).await.unwrap();

        let reader = GSFAReader::open(&dir, 1).unwrap();
        let records = reader
            .get(&k, ITEMS_PER_BATCH + 10, &CancellationToken::new(), |_e, r| r)
            .unwrap();
        assert_eq!(records.len(), ITEMS_PER_BATCH + 5);
    }

    #[tokio::test]
    async fn double_close_is_a_no_op() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("writer");
        let mut writer = GSFAWriter::new(&dir, MetadataBlock::new(), 1, "cid", "net", tmp.path()).unwrap();
        writer.push(1, 1, 1, 1, &[key(1)]).unwrap();
        writer.close(&CancellationToken::new()).await.unwrap();
        writer.close(&CancellationToken::new()).await.unwrap();
    }

    fn many_key(i: u32) -> PublicKey {
        let mut k = [0u8; 32];
        k[0..4].copy_from_slice(&i.to_le_bytes());
        k
    }

    /// A key whose first batch was already detached to the background
    /// flusher via the per-key threshold must not have its small trailing
    /// buffer raced past that batch when the pressure valve later detaches
    /// it too: the valve has to preserve the same before-after ordering the
    /// threshold path would have given it.
    #[tokio::test]
    async fn pressure_valve_after_threshold_detach_preserves_chain_order() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("writer");
        let mut writer = GSFAWriter::new(&dir, MetadataBlock::new(), 1, "cid", "net", tmp.path()).unwrap();

        let target = key(9);
        let mut slot = 0u64;

        // First batch: detached to the background flusher by the per-key
        // threshold, its node not yet written when the valve runs below.
        for i in 0..ITEMS_PER_BATCH as u64 {
            writer.push(i, 1, slot, slot, std::slice::from_ref(&target)).unwrap();
            slot += 1;
        }

        // A handful more records for the same key: a small trailing buffer
        // sitting in the foreground accumulator alongside the first batch
        // still in flight.
        for i in 0..5u64 {
            let offset = ITEMS_PER_BATCH as u64 + i;
            writer.push(offset, 1, slot, slot, std::slice::from_ref(&target)).unwrap();
            slot += 1;
        }

        // Push enough distinct single-record keys to cross
        // PRESSURE_VALVE_THRESHOLD distinct keys in the accumulator; the
        // next slot%1000==0 boundary then arms the valve and detaches
        // `target`'s small trailing buffer through the same channel.
        for i in 0..=(PRESSURE_VALVE_THRESHOLD as u32) {
            writer.push(1_000_000 + i as u64, 1, slot, slot, &[many_key(i)]).unwrap();
            slot += 1;
        }

        writer.close(&CancellationToken::new()).await.unwrap();

        let reader = GSFAReader::open(&dir, 1).unwrap();
        let records = reader
            .get(&target, ITEMS_PER_BATCH + 10, &CancellationToken::new(), |_e, r| r)
            .unwrap();
        assert_eq!(records.len(), ITEMS_PER_BATCH + 5);

        // Newest-first: offsets strictly decrease across the whole chain.
        // If the valve had raced the in-flight first batch, the two
        // batches would chain in the wrong order and this would fail.
        for pair in records.windows(2) {
            assert!(pair[0].offset > pair[1].offset, "chain is out of order: {records:?}");
        }
        assert_eq!(records[0].offset, ITEMS_PER_BATCH as u64 + 4);
        assert_eq!(records[ITEMS_PER_BATCH + 4].offset, 0);
    }
}
