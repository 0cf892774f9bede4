//! Per-log facade.
//!
//! One `PersistLog` instance fronts each named log on a shared device.
//! Two reader-writer locks guard the live window: `head` protects the
//! earliest live index, `tail` protects the append end and the latest
//! version. Every operation acquires head before tail and releases in
//! reverse order; holding to that order everywhere is what makes the
//! two locks deadlock-free.
//!
//! Entry and payload reads return owned copies; nothing handed out
//! aliases device buffers.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::constants::{INVALID_INDEX, INVALID_VERSION};
use crate::error::{LogError, Result};
use crate::hlc::Hlc;
use crate::log::{LogEntry, ENTRY_CAPACITY};
use crate::pool::{LogId, PersistPool};
use crate::segment::DATA_SPAN;

/// Bytes of the serialized-tail header: latest version plus entry count.
const TAIL_HEADER_SIZE: usize = 16;

struct TailState {
    tail: i64,
    ver: i64,
}

/// A named, versioned, append-only log.
pub struct PersistLog {
    name: String,
    id: LogId,
    pool: Arc<PersistPool>,
    head: RwLock<i64>,
    tail: RwLock<TailState>,
}

impl PersistLog {
    /// Open the log named `name`, creating it on first use. Reopening an
    /// existing name rehydrates head, tail, and version from the device.
    pub fn open(pool: Arc<PersistPool>, name: &str) -> Result<Self> {
        let loaded = pool.load(name)?;
        Ok(Self {
            name: name.to_string(),
            id: loaded.id,
            pool,
            head: RwLock::new(loaded.head),
            tail: RwLock::new(TailState {
                tail: loaded.tail,
                ver: loaded.ver,
            }),
        })
    }

    /// The log's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The log's slot id on the device.
    pub fn id(&self) -> LogId {
        self.id
    }

    /// Append a payload at the tail.
    ///
    /// `ver` must move the log forward; the entry's clock is taken from
    /// `hlc`. The call returns once the payload, the entry record, and
    /// the new root are durable. On error the log is unchanged.
    pub fn append(&self, payload: &[u8], ver: i64, hlc: Hlc) -> Result<()> {
        let head = self.head.read();
        let mut tail = self.tail.write();

        if ver <= tail.ver {
            return Err(LogError::VersionRegression {
                ver,
                current: tail.ver,
            });
        }
        if tail.tail - *head >= ENTRY_CAPACITY {
            return Err(LogError::LogFull);
        }

        let (ofst, live_base) = if tail.tail == *head {
            (0, 0)
        } else {
            let prev = self.pool.read_entry(self.id, tail.tail - 1)?;
            let first = self.pool.read_entry(self.id, *head)?;
            (prev.ofst + prev.dlen, first.ofst)
        };
        if ofst + payload.len() as u64 - live_base > DATA_SPAN {
            return Err(LogError::LogFull);
        }

        let entry = LogEntry {
            ver,
            hlc_r: hlc.rtc_us,
            hlc_l: hlc.logic,
            dlen: payload.len() as u64,
            ofst,
        };
        self.pool.append(self.id, tail.tail, &entry, payload, *head)?;
        tail.tail += 1;
        tail.ver = ver;
        Ok(())
    }

    /// Record a new latest version without appending an entry.
    pub fn advance_version(&self, ver: i64) -> Result<()> {
        let head = self.head.read();
        let mut tail = self.tail.write();

        if ver <= tail.ver {
            return Err(LogError::VersionRegression {
                ver,
                current: tail.ver,
            });
        }
        self.pool
            .commit_metadata(self.id, *head, tail.tail, ver, true)?;
        tail.ver = ver;
        Ok(())
    }

    /// Number of live entries.
    pub fn length(&self) -> i64 {
        let head = self.head.read();
        let tail = self.tail.read();
        tail.tail - *head
    }

    /// Index of the earliest live entry.
    pub fn earliest_index(&self) -> i64 {
        *self.head.read()
    }

    /// Index of the latest live entry; negative when the log is empty.
    pub fn latest_index(&self) -> i64 {
        self.tail.read().tail - 1
    }

    /// Version of the earliest live entry, read from the device.
    pub fn earliest_version(&self) -> Result<i64> {
        let head = self.head.read();
        let tail = self.tail.read();
        if tail.tail == *head {
            return Err(LogError::NotFound);
        }
        Ok(self.pool.read_entry(self.id, *head)?.ver)
    }

    /// Latest version recorded by the log.
    pub fn latest_version(&self) -> i64 {
        self.tail.read().ver
    }

    /// Index of the entry with exactly version `ver`.
    pub fn version_index(&self, ver: i64) -> Result<i64> {
        let head = self.head.read();
        let tail = self.tail.read();
        if tail.tail == *head {
            return Err(LogError::NotFound);
        }
        let index = self.version_ceiling(*head, tail.tail, ver)?;
        if index == INVALID_INDEX || self.pool.read_entry(self.id, index)?.ver != ver {
            return Err(LogError::NotFound);
        }
        Ok(index)
    }

    /// Index of the first entry stamped exactly `hlc`.
    pub fn hlc_index(&self, hlc: Hlc) -> Result<i64> {
        let head = self.head.read();
        let tail = self.tail.read();
        if tail.tail == *head {
            return Err(LogError::NotFound);
        }
        let index = self.hlc_ceiling(*head, tail.tail, hlc)?;
        if index == INVALID_INDEX || self.pool.read_entry(self.id, index)?.hlc() != hlc {
            return Err(LogError::NotFound);
        }
        Ok(index)
    }

    /// Index of the first entry at or after version `ver`, or
    /// [`INVALID_INDEX`] when every live entry is older.
    pub fn lower_bound(&self, ver: i64) -> Result<i64> {
        let head = self.head.read();
        let tail = self.tail.read();
        if tail.tail == *head {
            return Ok(INVALID_INDEX);
        }
        self.version_ceiling(*head, tail.tail, ver)
    }

    /// Index of the first entry strictly after version `ver`; the tail
    /// index when no entry is newer, [`INVALID_INDEX`] on an empty log.
    pub fn upper_bound(&self, ver: i64) -> Result<i64> {
        let head = self.head.read();
        let tail = self.tail.read();
        if tail.tail == *head {
            return Ok(INVALID_INDEX);
        }
        self.version_successor(*head, tail.tail, ver)
    }

    /// Index of the first entry stamped at or after `hlc`, or
    /// [`INVALID_INDEX`] when every live entry is older.
    pub fn lower_bound_hlc(&self, hlc: Hlc) -> Result<i64> {
        let head = self.head.read();
        let tail = self.tail.read();
        if tail.tail == *head {
            return Ok(INVALID_INDEX);
        }
        self.hlc_ceiling(*head, tail.tail, hlc)
    }

    /// Index of the first entry stamped strictly after `hlc`; the tail
    /// index when no entry is newer, [`INVALID_INDEX`] on an empty log.
    pub fn upper_bound_hlc(&self, hlc: Hlc) -> Result<i64> {
        let head = self.head.read();
        let tail = self.tail.read();
        if tail.tail == *head {
            return Ok(INVALID_INDEX);
        }
        self.hlc_successor(*head, tail.tail, hlc)
    }

    /// Payload of the first entry at or after version `ver`.
    pub fn entry(&self, ver: i64) -> Result<Vec<u8>> {
        let head = self.head.read();
        let tail = self.tail.read();
        if tail.tail == *head {
            return Err(LogError::NotFound);
        }
        let index = self.version_ceiling(*head, tail.tail, ver)?;
        if index == INVALID_INDEX {
            return Err(LogError::NotFound);
        }
        self.pool.read_data(self.id, index)
    }

    /// Payload of the first entry stamped at or after `hlc`.
    pub fn entry_by_hlc(&self, hlc: Hlc) -> Result<Vec<u8>> {
        let head = self.head.read();
        let tail = self.tail.read();
        if tail.tail == *head {
            return Err(LogError::NotFound);
        }
        let index = self.hlc_ceiling(*head, tail.tail, hlc)?;
        if index == INVALID_INDEX {
            return Err(LogError::NotFound);
        }
        self.pool.read_data(self.id, index)
    }

    /// Payload at an absolute index inside the live window.
    pub fn entry_by_index(&self, index: i64) -> Result<Vec<u8>> {
        let head = self.head.read();
        let tail = self.tail.read();
        if index < *head || index >= tail.tail {
            return Err(LogError::InvalidArgument(format!(
                "index {index} outside the live range [{}, {})",
                *head, tail.tail
            )));
        }
        self.pool.read_data(self.id, index)
    }

    /// Entry record at an absolute index inside the live window.
    pub fn log_entry(&self, index: i64) -> Result<LogEntry> {
        let head = self.head.read();
        let tail = self.tail.read();
        if index < *head || index >= tail.tail {
            return Err(LogError::InvalidArgument(format!(
                "index {index} outside the live range [{}, {})",
                *head, tail.tail
            )));
        }
        self.pool.read_entry(self.id, index)
    }

    /// Discard entries up to and including `index`. Out-of-range indices
    /// are a no-op. Discarded segments are not reclaimed.
    pub fn trim_by_index(&self, index: i64) -> Result<()> {
        let mut head = self.head.write();
        let tail = self.tail.read();
        if index < *head || index >= tail.tail {
            return Ok(());
        }
        self.pool
            .commit_metadata(self.id, index + 1, tail.tail, tail.ver, true)?;
        *head = index + 1;
        Ok(())
    }

    /// Discard entries with version at or below `ver`.
    pub fn trim(&self, ver: i64) -> Result<()> {
        let index = {
            let head = self.head.read();
            let tail = self.tail.read();
            if tail.tail == *head {
                return Ok(());
            }
            self.version_floor(*head, tail.tail, ver)?
        };
        if index == INVALID_INDEX {
            return Ok(());
        }
        self.trim_by_index(index)
    }

    /// Discard entries stamped at or below `hlc`.
    pub fn trim_by_hlc(&self, hlc: Hlc) -> Result<()> {
        let index = {
            let head = self.head.read();
            let tail = self.tail.read();
            if tail.tail == *head {
                return Ok(());
            }
            self.hlc_floor(*head, tail.tail, hlc)?
        };
        if index == INVALID_INDEX {
            return Ok(());
        }
        self.trim_by_index(index)
    }

    /// Retract the tail past every entry newer than `ver`, discarding a
    /// divergent suffix during state transfer. The latest version falls
    /// back to the last surviving entry's version.
    pub fn truncate(&self, ver: i64) -> Result<()> {
        let head = self.head.read();
        let mut tail = self.tail.write();
        if tail.tail == *head {
            return Ok(());
        }

        let new_tail = self.version_successor(*head, tail.tail, ver)?;
        if new_tail == tail.tail {
            return Ok(());
        }
        let new_ver = if new_tail == *head {
            INVALID_VERSION
        } else {
            self.pool.read_entry(self.id, new_tail - 1)?.ver
        };
        self.pool
            .commit_metadata(self.id, *head, new_tail, new_ver, true)?;
        tail.tail = new_tail;
        tail.ver = new_ver;
        Ok(())
    }

    /// Reset the log to empty and mark it not in use. A later append
    /// reinitializes it.
    pub fn zeroout(&self) -> Result<()> {
        let mut head = self.head.write();
        let mut tail = self.tail.write();
        self.pool
            .commit_metadata(self.id, 0, 0, INVALID_VERSION, false)?;
        *head = 0;
        tail.tail = 0;
        tail.ver = INVALID_VERSION;
        Ok(())
    }

    /// Size in bytes of the serialized tail holding entries strictly
    /// newer than `ver`.
    pub fn bytes_size(&self, ver: i64) -> Result<usize> {
        let head = self.head.read();
        let tail = self.tail.read();

        let mut size = TAIL_HEADER_SIZE;
        let start = self.tail_start(*head, tail.tail, ver)?;
        if start != INVALID_INDEX {
            for index in start..tail.tail {
                size += LogEntry::SIZE + self.pool.read_entry(self.id, index)?.dlen as usize;
            }
        }
        Ok(size)
    }

    /// Serialize into `buf` the entries strictly newer than `ver`,
    /// preceded by the latest version and the entry count. Returns the
    /// number of bytes written. When `ver` is at or past the latest
    /// version only the header is written.
    pub fn to_bytes(&self, buf: &mut [u8], ver: i64) -> Result<usize> {
        let head = self.head.read();
        let tail = self.tail.read();

        let start = self.tail_start(*head, tail.tail, ver)?;
        let count = if start == INVALID_INDEX {
            0
        } else {
            tail.tail - start
        };

        let mut offset = 0usize;
        write_i64(buf, &mut offset, tail.ver)?;
        write_i64(buf, &mut offset, count)?;
        if start != INVALID_INDEX {
            for index in start..tail.tail {
                let entry = self.pool.read_entry(self.id, index)?;
                ensure_capacity(buf, offset, LogEntry::SIZE)?;
                entry.encode(&mut buf[offset..offset + LogEntry::SIZE])?;
                offset += LogEntry::SIZE;

                let data = self.pool.read_data(self.id, index)?;
                ensure_capacity(buf, offset, data.len())?;
                buf[offset..offset + data.len()].copy_from_slice(&data);
                offset += data.len();
            }
        }
        Ok(offset)
    }

    /// Stream the serialized tail through `post` instead of a buffer;
    /// same framing as [`PersistLog::to_bytes`].
    pub fn post_object<F: FnMut(&[u8])>(&self, mut post: F, ver: i64) -> Result<()> {
        let head = self.head.read();
        let tail = self.tail.read();

        let start = self.tail_start(*head, tail.tail, ver)?;
        let count = if start == INVALID_INDEX {
            0
        } else {
            tail.tail - start
        };

        post(&tail.ver.to_le_bytes());
        post(&count.to_le_bytes());
        if start != INVALID_INDEX {
            for index in start..tail.tail {
                let entry = self.pool.read_entry(self.id, index)?;
                let mut slot = [0u8; LogEntry::SIZE];
                entry.encode(&mut slot)?;
                post(&slot);
                post(&self.pool.read_data(self.id, index)?);
            }
        }
        Ok(())
    }

    /// Apply a serialized tail produced by a peer: entries at or below
    /// the current version are skipped, the rest are appended preserving
    /// their version, clock, and payload. Applying the same tail twice
    /// adds nothing.
    pub fn apply_log_tail(&self, bytes: &[u8]) -> Result<()> {
        let head = self.head.read();
        let mut tail = self.tail.write();

        let mut offset = 0usize;
        let latest_version = read_i64(bytes, &mut offset)?;
        let count = read_i64(bytes, &mut offset)?;
        if count < 0 {
            return Err(LogError::Corruption(
                "negative entry count in log tail".into(),
            ));
        }

        let live_base = if tail.tail == *head {
            0
        } else {
            self.pool.read_entry(self.id, *head)?.ofst
        };
        let mut next_ofst: Option<u64> = None;

        for _ in 0..count {
            if bytes.len() < offset + LogEntry::SIZE {
                return Err(LogError::Corruption("truncated log tail".into()));
            }
            let mut entry = LogEntry::decode(&bytes[offset..offset + LogEntry::SIZE])?;
            offset += LogEntry::SIZE;

            if entry.dlen > DATA_SPAN {
                return Err(LogError::Corruption(
                    "log tail entry larger than the data space".into(),
                ));
            }
            let dlen = entry.dlen as usize;
            if bytes.len() < offset + dlen {
                return Err(LogError::Corruption("truncated log tail payload".into()));
            }
            let payload = &bytes[offset..offset + dlen];
            offset += dlen;

            if entry.ver <= tail.ver {
                continue;
            }
            if tail.tail - *head >= ENTRY_CAPACITY {
                return Err(LogError::LogFull);
            }

            entry.ofst = match next_ofst {
                Some(ofst) => ofst,
                None if tail.tail == *head => 0,
                None => {
                    let prev = self.pool.read_entry(self.id, tail.tail - 1)?;
                    prev.ofst + prev.dlen
                }
            };
            if entry.ofst + entry.dlen - live_base > DATA_SPAN {
                return Err(LogError::LogFull);
            }

            self.pool
                .append(self.id, tail.tail, &entry, payload, *head)?;
            next_ofst = Some(entry.ofst + entry.dlen);
            tail.tail += 1;
            tail.ver = entry.ver;
        }

        // The sender's latest version may run ahead of its last entry.
        if latest_version > tail.ver {
            self.pool
                .commit_metadata(self.id, *head, tail.tail, latest_version, true)?;
            tail.ver = latest_version;
        }
        Ok(())
    }

    /// Wait until every previously accepted append is durable and return
    /// the latest durable version. Appends commit synchronously, so this
    /// reduces to an observation.
    pub fn persist(&self) -> Result<i64> {
        Ok(self.pool.last_persisted(self.id))
    }

    /// Latest version known durable. Non-blocking.
    pub fn last_persisted(&self) -> i64 {
        self.pool.last_persisted(self.id)
    }

    /// Read a raw device block; diagnostics escape hatch.
    pub fn block(&self, lba: u64) -> Result<Vec<u8>> {
        self.pool.read_block(lba)
    }

    /// First index of the serialized tail for `ver`: the first entry
    /// strictly newer, the tail index when none is, [`INVALID_INDEX`] on
    /// an empty log.
    fn tail_start(&self, head: i64, tail: i64, ver: i64) -> Result<i64> {
        if tail == head {
            return Ok(INVALID_INDEX);
        }
        self.version_successor(head, tail, ver)
    }

    /// Smallest live index whose version is >= `ver`.
    fn version_ceiling(&self, head: i64, tail: i64, ver: i64) -> Result<i64> {
        let mut lo = head;
        let mut hi = tail - 1;
        let mut found = INVALID_INDEX;
        while lo <= hi {
            let mid = lo + (hi - lo) / 2;
            if self.pool.read_entry(self.id, mid)?.ver >= ver {
                found = mid;
                hi = mid - 1;
            } else {
                lo = mid + 1;
            }
        }
        Ok(found)
    }

    /// Largest live index whose version is <= `ver`.
    fn version_floor(&self, head: i64, tail: i64, ver: i64) -> Result<i64> {
        let mut lo = head;
        let mut hi = tail - 1;
        let mut found = INVALID_INDEX;
        while lo <= hi {
            let mid = lo + (hi - lo) / 2;
            if self.pool.read_entry(self.id, mid)?.ver <= ver {
                found = mid;
                lo = mid + 1;
            } else {
                hi = mid - 1;
            }
        }
        Ok(found)
    }

    /// Smallest live index whose version is > `ver`; `tail` when none.
    fn version_successor(&self, head: i64, tail: i64, ver: i64) -> Result<i64> {
        let mut lo = head;
        let mut hi = tail - 1;
        let mut found = tail;
        while lo <= hi {
            let mid = lo + (hi - lo) / 2;
            if self.pool.read_entry(self.id, mid)?.ver > ver {
                found = mid;
                hi = mid - 1;
            } else {
                lo = mid + 1;
            }
        }
        Ok(found)
    }

    /// Smallest live index stamped >= `hlc`. Equal clocks resolve to the
    /// lowest index, which also carries the lowest version.
    fn hlc_ceiling(&self, head: i64, tail: i64, hlc: Hlc) -> Result<i64> {
        let mut lo = head;
        let mut hi = tail - 1;
        let mut found = INVALID_INDEX;
        while lo <= hi {
            let mid = lo + (hi - lo) / 2;
            if self.pool.read_entry(self.id, mid)?.hlc() >= hlc {
                found = mid;
                hi = mid - 1;
            } else {
                lo = mid + 1;
            }
        }
        Ok(found)
    }

    /// Largest live index stamped <= `hlc`.
    fn hlc_floor(&self, head: i64, tail: i64, hlc: Hlc) -> Result<i64> {
        let mut lo = head;
        let mut hi = tail - 1;
        let mut found = INVALID_INDEX;
        while lo <= hi {
            let mid = lo + (hi - lo) / 2;
            if self.pool.read_entry(self.id, mid)?.hlc() <= hlc {
                found = mid;
                lo = mid + 1;
            } else {
                hi = mid - 1;
            }
        }
        Ok(found)
    }

    /// Smallest live index stamped > `hlc`; `tail` when none.
    fn hlc_successor(&self, head: i64, tail: i64, hlc: Hlc) -> Result<i64> {
        let mut lo = head;
        let mut hi = tail - 1;
        let mut found = tail;
        while lo <= hi {
            let mid = lo + (hi - lo) / 2;
            if self.pool.read_entry(self.id, mid)?.hlc() > hlc {
                found = mid;
                hi = mid - 1;
            } else {
                lo = mid + 1;
            }
        }
        Ok(found)
    }
}

fn ensure_capacity(buf: &[u8], offset: usize, need: usize) -> Result<()> {
    if buf.len() < offset + need {
        return Err(LogError::InvalidArgument(
            "destination buffer too small for the serialized tail".into(),
        ));
    }
    Ok(())
}

fn write_i64(buf: &mut [u8], offset: &mut usize, value: i64) -> Result<()> {
    ensure_capacity(buf, *offset, 8)?;
    buf[*offset..*offset + 8].copy_from_slice(&value.to_le_bytes());
    *offset += 8;
    Ok(())
}

fn read_i64(bytes: &[u8], offset: &mut usize) -> Result<i64> {
    if bytes.len() < *offset + 8 {
        return Err(LogError::Corruption("truncated log tail header".into()));
    }
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[*offset..*offset + 8]);
    *offset += 8;
    Ok(i64::from_le_bytes(raw))
}
