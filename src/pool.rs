//! Persist pool: single owner of a shared device.
//!
//! One pool instance owns the I/O queue, the free-segment bitmap, the
//! root region, and the in-memory slot table for every log on the
//! device. Log facades hold an `Arc` handle and route all reads, writes,
//! and metadata commits through it.
//!
//! A durable append completes in a fixed order: payload data blocks,
//! then the entry slot block, then the alternate root copy carrying a
//! bumped generation. A crash between any two steps leaves the previous
//! root authoritative, so partially written entries are unreachable
//! after restart.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::constants::{BITMAP_LBA, BLOCK_SIZE, INVALID_VERSION, MAX_LOGS, SEGMENT_POOL_LBA};
use crate::device::{alloc_io_buffer, BlockDevice, FileBlockDevice, IoQueue};
use crate::error::{LogError, Result};
use crate::log::entry::slot_offset;
use crate::log::LogEntry;
use crate::meta::{root_copy_lba, select_root, LogRoot, MAX_NAME_LEN};
use crate::segment::{
    block_lba, offset_in_block, segment_of, SegmentBitmap, SegmentTable, BLOCKS_PER_SEGMENT,
    DATA_SPAN, DATA_TABLE_LEN, ENTRY_TABLE_LEN, MAX_SEGMENTS, SEGMENT_SIZE,
};

/// Process-assigned identifier of a log: its slot index on the device.
pub type LogId = u32;

/// Tunables for opening a pool.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Depth of the I/O submission queue.
    pub queue_depth: usize,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self { queue_depth: 64 }
    }
}

/// State of a log as returned by [`PersistPool::load`].
#[derive(Debug, Clone, Copy)]
pub struct LoadedLog {
    /// Slot index assigned to the log.
    pub id: LogId,
    /// Index of the earliest live entry.
    pub head: i64,
    /// Index one past the last live entry.
    pub tail: i64,
    /// Latest committed version.
    pub ver: i64,
}

#[derive(Clone, Copy)]
enum Space {
    Entry,
    Data,
}

struct LogSlot {
    name: String,
    generation: u64,
    inuse: bool,
    head: i64,
    tail: i64,
    ver: i64,
    entry_table: SegmentTable,
    data_table: SegmentTable,
}

impl LogSlot {
    fn fresh(name: &str) -> Self {
        Self {
            name: name.to_string(),
            generation: 0,
            inuse: true,
            head: 0,
            tail: 0,
            ver: INVALID_VERSION,
            entry_table: SegmentTable::new(ENTRY_TABLE_LEN),
            data_table: SegmentTable::new(DATA_TABLE_LEN),
        }
    }

    fn from_root(root: LogRoot) -> Self {
        Self {
            name: root.name,
            generation: root.generation,
            inuse: root.inuse,
            head: root.head,
            tail: root.tail,
            ver: root.ver,
            entry_table: root.entry_table,
            data_table: root.data_table,
        }
    }
}

struct PoolState {
    slots: Vec<Option<LogSlot>>,
    by_name: HashMap<String, LogId>,
    bitmap: SegmentBitmap,
}

/// Shared owner of one block device and every log stored on it.
pub struct PersistPool {
    queue: IoQueue,
    // Guards the slot table, name registry, and free-segment bitmap; also
    // serializes metadata commits.
    state: Mutex<PoolState>,
    last_written_ver: Vec<AtomicI64>,
}

impl PersistPool {
    /// Open a pool over `device`, replaying every committed root.
    pub fn open(device: Arc<dyn BlockDevice>, options: PoolOptions) -> Result<Arc<Self>> {
        let blocks = device.block_count();
        if blocks < SEGMENT_POOL_LBA + BLOCKS_PER_SEGMENT {
            return Err(LogError::InvalidArgument(format!(
                "device of {blocks} blocks is too small for the metadata region"
            )));
        }
        let segment_count =
            ((blocks - SEGMENT_POOL_LBA) / BLOCKS_PER_SEGMENT).min(MAX_SEGMENTS as u64) as u32;

        let queue = IoQueue::start(device, options.queue_depth);

        let mut slots: Vec<Option<LogSlot>> = (0..MAX_LOGS).map(|_| None).collect();
        let mut by_name = HashMap::new();
        let mut bitmap = SegmentBitmap::new(segment_count);
        let mut last_written_ver = Vec::with_capacity(MAX_LOGS);

        for id in 0..MAX_LOGS as LogId {
            let primary = Self::read_root_copy(&queue, id as u64 * 2)?;
            let alternate = Self::read_root_copy(&queue, id as u64 * 2 + 1)?;
            let root = match select_root(primary, alternate) {
                Some(root) if root.id != id => {
                    warn!(slot = id, found = root.id, "ignoring root with mismatched id");
                    None
                }
                root => root,
            };

            match root {
                Some(root) => {
                    // Roots are the authoritative allocation record.
                    for segment in root.entry_table.assigned().chain(root.data_table.assigned()) {
                        bitmap.mark(segment);
                    }
                    debug!(
                        name = %root.name,
                        id,
                        head = root.head,
                        tail = root.tail,
                        ver = root.ver,
                        "loaded log root"
                    );
                    by_name.insert(root.name.clone(), id);
                    last_written_ver.push(AtomicI64::new(root.ver));
                    slots[id as usize] = Some(LogSlot::from_root(root));
                }
                None => last_written_ver.push(AtomicI64::new(INVALID_VERSION)),
            }
        }

        Ok(Arc::new(Self {
            queue,
            state: Mutex::new(PoolState {
                slots,
                by_name,
                bitmap,
            }),
            last_written_ver,
        }))
    }

    /// Open a pool from configuration: the backing file is created at the
    /// configured size when missing, otherwise reopened as-is.
    pub fn open_with_config(config: &EngineConfig) -> Result<Arc<Self>> {
        let path = config
            .device_path()
            .ok_or_else(|| LogError::InvalidArgument("device path not configured".into()))?;
        let device: Arc<dyn BlockDevice> = match config.device_blocks() {
            Some(blocks) if !path.exists() => Arc::new(FileBlockDevice::create(path, blocks)?),
            _ => Arc::new(FileBlockDevice::open(path)?),
        };
        Self::open(
            device,
            PoolOptions {
                queue_depth: config.queue_depth(),
            },
        )
    }

    /// Look up a log by name, claiming a fresh slot when the name is new.
    /// The same name maps to the same id for the life of the pool.
    pub fn load(&self, name: &str) -> Result<LoadedLog> {
        if name.is_empty() || name.len() > MAX_NAME_LEN {
            return Err(LogError::InvalidArgument(format!(
                "log name must be 1..={MAX_NAME_LEN} bytes"
            )));
        }

        let mut state = self.state.lock();
        if let Some(&id) = state.by_name.get(name) {
            let slot = Self::slot(&state, id)?;
            return Ok(LoadedLog {
                id,
                head: slot.head,
                tail: slot.tail,
                ver: slot.ver,
            });
        }

        let id = state
            .slots
            .iter()
            .position(|slot| slot.is_none())
            .ok_or_else(|| {
                LogError::MetadataLoadFailed(format!("no free log slot for \"{name}\""))
            })? as LogId;

        state.slots[id as usize] = Some(LogSlot::fresh(name));
        if let Err(err) = self.commit_root(&mut state, id, 0, 0, INVALID_VERSION, true) {
            state.slots[id as usize] = None;
            return Err(err);
        }
        state.by_name.insert(name.to_string(), id);
        debug!(name, id, "created log");

        Ok(LoadedLog {
            id,
            head: 0,
            tail: 0,
            ver: INVALID_VERSION,
        })
    }

    /// Read the entry record at `index`.
    pub fn read_entry(&self, id: LogId, index: i64) -> Result<LogEntry> {
        if index < 0 {
            return Err(LogError::InvalidArgument(format!(
                "entry index {index} is negative"
            )));
        }
        let entry_table = {
            let state = self.state.lock();
            Self::slot(&state, id)?.entry_table.clone()
        };

        let span_offset = slot_offset(index);
        let physical = entry_table
            .get(segment_of(span_offset))
            .ok_or(LogError::NotFound)?;
        let buf = self.queue.read(block_lba(physical, span_offset), 1)?;
        let at = offset_in_block(span_offset);
        LogEntry::decode(&buf.as_slice()[at..at + LogEntry::SIZE])
    }

    /// Read the payload of the entry at `index`.
    pub fn read_data(&self, id: LogId, index: i64) -> Result<Vec<u8>> {
        let entry = self.read_entry(id, index)?;
        if entry.dlen > DATA_SPAN {
            return Err(LogError::Corruption(format!(
                "entry payload length {} exceeds the data space",
                entry.dlen
            )));
        }
        let data_table = {
            let state = self.state.lock();
            Self::slot(&state, id)?.data_table.clone()
        };

        let mut out = vec![0u8; entry.dlen as usize];
        let mut copied = 0usize;
        while copied < out.len() {
            let span_offset = (entry.ofst + copied as u64) % DATA_SPAN;
            let physical = data_table
                .get(segment_of(span_offset))
                .ok_or(LogError::NotFound)?;
            let lba = block_lba(physical, span_offset);
            let at = offset_in_block(span_offset);
            let chunk = (out.len() - copied).min(BLOCK_SIZE - at);
            let buf = self.queue.read(lba, 1)?;
            out[copied..copied + chunk].copy_from_slice(&buf.as_slice()[at..at + chunk]);
            copied += chunk;
        }
        Ok(out)
    }

    /// Read a raw block; diagnostics escape hatch.
    pub fn read_block(&self, lba: u64) -> Result<Vec<u8>> {
        Ok(self.queue.read(lba, 1)?.as_slice().to_vec())
    }

    /// Durably append one entry: payload, then entry slot, then root.
    /// `head` is the caller's current head; the committed root carries
    /// `tail = index + 1` and `ver = entry.ver`.
    pub fn append(
        &self,
        id: LogId,
        index: i64,
        entry: &LogEntry,
        payload: &[u8],
        head: i64,
    ) -> Result<()> {
        if payload.len() as u64 != entry.dlen {
            return Err(LogError::InvalidArgument(
                "payload length does not match the entry record".into(),
            ));
        }

        let mut state = self.state.lock();
        self.ensure_data_segments(&mut state, id, entry.ofst, entry.dlen)?;
        self.ensure_segment(&mut state, id, Space::Entry, segment_of(slot_offset(index)))?;
        let (entry_table, data_table) = {
            let slot = Self::slot(&state, id)?;
            (slot.entry_table.clone(), slot.data_table.clone())
        };

        self.write_data_span(&data_table, entry.ofst, payload)?;
        self.write_entry_slot(&entry_table, index, entry)?;
        // Data and entry must be stable before the root references them.
        self.queue.flush()?;
        self.commit_root(&mut state, id, head, index + 1, entry.ver, true)?;
        self.note_written(id, entry.ver);
        Ok(())
    }

    /// Commit head/tail/ver/inuse atomically via the alternate root copy.
    pub fn commit_metadata(
        &self,
        id: LogId,
        head: i64,
        tail: i64,
        ver: i64,
        inuse: bool,
    ) -> Result<()> {
        let mut state = self.state.lock();
        self.commit_root(&mut state, id, head, tail, ver, inuse)?;
        self.note_written(id, ver);
        Ok(())
    }

    /// Latest version known durable for `id`. Non-blocking.
    pub fn last_persisted(&self, id: LogId) -> i64 {
        self.last_written_ver
            .get(id as usize)
            .map(|ver| ver.load(Ordering::Acquire))
            .unwrap_or(INVALID_VERSION)
    }

    // Tracks the version named by the latest durable root, so it never
    // runs ahead of committed metadata and retracts with truncate and
    // zeroout.
    fn note_written(&self, id: LogId, ver: i64) {
        if let Some(last) = self.last_written_ver.get(id as usize) {
            last.store(ver, Ordering::Release);
        }
    }

    fn read_root_copy(queue: &IoQueue, lba: u64) -> Result<Option<LogRoot>> {
        let buf = queue.read(lba, 1)?;
        Ok(LogRoot::decode(buf.as_slice()).ok())
    }

    fn slot<'a>(state: &'a PoolState, id: LogId) -> Result<&'a LogSlot> {
        state
            .slots
            .get(id as usize)
            .and_then(|slot| slot.as_ref())
            .ok_or(LogError::NotFound)
    }

    fn slot_mut<'a>(state: &'a mut PoolState, id: LogId) -> Result<&'a mut LogSlot> {
        state
            .slots
            .get_mut(id as usize)
            .and_then(|slot| slot.as_mut())
            .ok_or(LogError::NotFound)
    }

    fn ensure_data_segments(
        &self,
        state: &mut PoolState,
        id: LogId,
        ofst: u64,
        dlen: u64,
    ) -> Result<()> {
        if dlen == 0 {
            return Ok(());
        }
        let mut offset = ofst;
        let last = ofst + dlen - 1;
        loop {
            self.ensure_segment(state, id, Space::Data, segment_of(offset % DATA_SPAN))?;
            let next = (offset | (SEGMENT_SIZE - 1)) + 1;
            if next > last {
                return Ok(());
            }
            offset = next;
        }
    }

    fn ensure_segment(
        &self,
        state: &mut PoolState,
        id: LogId,
        space: Space,
        logical: usize,
    ) -> Result<()> {
        let assigned = {
            let slot = Self::slot(state, id)?;
            match space {
                Space::Entry => slot.entry_table.get(logical).is_some(),
                Space::Data => slot.data_table.get(logical).is_some(),
            }
        };
        if assigned {
            return Ok(());
        }

        let physical = state.bitmap.allocate().ok_or(LogError::LogFull)?;
        // Record the allocation before any write depends on it.
        self.persist_bitmap(state)?;
        let slot = Self::slot_mut(state, id)?;
        match space {
            Space::Entry => slot.entry_table.set(logical, physical),
            Space::Data => slot.data_table.set(logical, physical),
        }
        Ok(())
    }

    fn persist_bitmap(&self, state: &PoolState) -> Result<()> {
        let mut buf = alloc_io_buffer(1)?;
        state.bitmap.encode(buf.as_mut_slice());
        self.queue.write(BITMAP_LBA, buf)?;
        Ok(())
    }

    fn write_data_span(&self, table: &SegmentTable, ofst: u64, payload: &[u8]) -> Result<()> {
        let mut written = 0usize;
        while written < payload.len() {
            let span_offset = (ofst + written as u64) % DATA_SPAN;
            let physical = table.get(segment_of(span_offset)).ok_or(LogError::NotFound)?;
            let lba = block_lba(physical, span_offset);
            let at = offset_in_block(span_offset);
            let chunk = (payload.len() - written).min(BLOCK_SIZE - at);

            let mut buf = if chunk == BLOCK_SIZE {
                alloc_io_buffer(1)?
            } else {
                self.queue.read(lba, 1)?
            };
            buf.as_mut_slice()[at..at + chunk].copy_from_slice(&payload[written..written + chunk]);
            self.queue.write(lba, buf)?;
            written += chunk;
        }
        Ok(())
    }

    fn write_entry_slot(&self, table: &SegmentTable, index: i64, entry: &LogEntry) -> Result<()> {
        let span_offset = slot_offset(index);
        let physical = table.get(segment_of(span_offset)).ok_or(LogError::NotFound)?;
        let lba = block_lba(physical, span_offset);
        let at = offset_in_block(span_offset);

        let mut buf = self.queue.read(lba, 1)?;
        entry.encode(&mut buf.as_mut_slice()[at..at + LogEntry::SIZE])?;
        self.queue.write(lba, buf)?;
        Ok(())
    }

    fn commit_root(
        &self,
        state: &mut PoolState,
        id: LogId,
        head: i64,
        tail: i64,
        ver: i64,
        inuse: bool,
    ) -> Result<()> {
        let slot = Self::slot_mut(state, id)?;
        let generation = slot.generation + 1;
        let root = LogRoot {
            id,
            generation,
            inuse,
            head,
            tail,
            ver,
            name: slot.name.clone(),
            entry_table: slot.entry_table.clone(),
            data_table: slot.data_table.clone(),
        };

        let mut buf = alloc_io_buffer(1)?;
        root.encode(buf.as_mut_slice())?;
        self.queue.write(root_copy_lba(id, generation), buf)?;
        self.queue.flush()?;

        slot.generation = generation;
        slot.head = head;
        slot.tail = tail;
        slot.ver = ver;
        slot.inuse = inuse;
        Ok(())
    }
}
