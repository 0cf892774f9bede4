//! Per-log root records.
//!
//! A root record is the durable commit point for one log: whatever the
//! highest-generation valid root names is the log's state after a
//! restart. Each log slot owns two alternating copies in the reserved
//! region at the start of the device; a commit writes the copy selected
//! by the new generation's parity, so a torn root write can only damage
//! the copy being replaced and the previous root survives.

use crate::constants::MAX_LOGS;
use crate::error::{LogError, Result};
use crate::segment::{SegmentTable, DATA_TABLE_LEN, ENTRY_TABLE_LEN};

/// Longest allowed log name, in bytes.
pub const MAX_NAME_LEN: usize = 62;

const NAME_FIELD_AT: usize = 48;
const ENTRY_TABLE_AT: usize = 112;
const DATA_TABLE_AT: usize = ENTRY_TABLE_AT + ENTRY_TABLE_LEN * 4;
const CHECKSUM_AT: usize = DATA_TABLE_AT + DATA_TABLE_LEN * 4;

/// Durable per-log metadata record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRoot {
    /// Slot index of the log on this device.
    pub id: u32,
    /// Commit counter; the highest valid generation wins on restart.
    pub generation: u64,
    /// False once the log has been zeroed out.
    pub inuse: bool,
    /// Index of the earliest live entry.
    pub head: i64,
    /// Index one past the last live entry.
    pub tail: i64,
    /// Latest version accepted by the log.
    pub ver: i64,
    /// Caller-assigned log name; unique per device.
    pub name: String,
    /// Logical-to-physical map for the entry space.
    pub entry_table: SegmentTable,
    /// Logical-to-physical map for the data space.
    pub data_table: SegmentTable,
}

impl LogRoot {
    /// Magic prefix of an initialized root block.
    pub const MAGIC: [u8; 8] = *b"VSLGROOT";

    /// Encoded record size in bytes.
    pub const ENCODED_SIZE: usize = CHECKSUM_AT + 8;

    /// Encode into the front of a root block.
    pub fn encode(&self, buf: &mut [u8]) -> Result<()> {
        if buf.len() < Self::ENCODED_SIZE {
            return Err(LogError::InvalidArgument(
                "root buffer shorter than a record".into(),
            ));
        }
        if self.name.len() > MAX_NAME_LEN {
            return Err(LogError::InvalidArgument(format!(
                "log name exceeds {MAX_NAME_LEN} bytes"
            )));
        }

        buf[..Self::ENCODED_SIZE].fill(0);
        buf[..8].copy_from_slice(&Self::MAGIC);
        buf[8..16].copy_from_slice(&self.generation.to_le_bytes());
        buf[16..20].copy_from_slice(&self.id.to_le_bytes());
        buf[20] = self.inuse as u8;
        buf[24..32].copy_from_slice(&self.head.to_le_bytes());
        buf[32..40].copy_from_slice(&self.tail.to_le_bytes());
        buf[40..48].copy_from_slice(&self.ver.to_le_bytes());

        let name = self.name.as_bytes();
        buf[NAME_FIELD_AT..NAME_FIELD_AT + 2].copy_from_slice(&(name.len() as u16).to_le_bytes());
        buf[NAME_FIELD_AT + 2..NAME_FIELD_AT + 2 + name.len()].copy_from_slice(name);

        encode_table(&mut buf[ENTRY_TABLE_AT..], self.entry_table.slots());
        encode_table(&mut buf[DATA_TABLE_AT..], self.data_table.slots());

        let checksum = xor_checksum(&buf[..CHECKSUM_AT]);
        buf[CHECKSUM_AT..Self::ENCODED_SIZE].copy_from_slice(&checksum.to_le_bytes());
        Ok(())
    }

    /// Decode and validate a root record.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::ENCODED_SIZE {
            return Err(LogError::Corruption("root record truncated".into()));
        }
        if buf[..8] != Self::MAGIC {
            return Err(LogError::Corruption("root magic mismatch".into()));
        }

        let stored = u64::from_le_bytes(fixed8(&buf[CHECKSUM_AT..Self::ENCODED_SIZE]));
        let computed = xor_checksum(&buf[..CHECKSUM_AT]);
        if stored != computed {
            return Err(LogError::Corruption("root checksum mismatch".into()));
        }

        let generation = u64::from_le_bytes(fixed8(&buf[8..16]));
        if generation == 0 {
            return Err(LogError::Corruption("root generation is zero".into()));
        }

        let id = u32::from_le_bytes(fixed4(&buf[16..20]));
        if id as usize >= MAX_LOGS {
            return Err(LogError::Corruption(format!("root id {id} out of range")));
        }

        let name_len = u16::from_le_bytes([buf[NAME_FIELD_AT], buf[NAME_FIELD_AT + 1]]) as usize;
        if name_len > MAX_NAME_LEN {
            return Err(LogError::Corruption("root name length out of range".into()));
        }
        let name = std::str::from_utf8(&buf[NAME_FIELD_AT + 2..NAME_FIELD_AT + 2 + name_len])
            .map_err(|_| LogError::Corruption("root name is not utf-8".into()))?
            .to_string();

        Ok(Self {
            id,
            generation,
            inuse: buf[20] != 0,
            head: i64::from_le_bytes(fixed8(&buf[24..32])),
            tail: i64::from_le_bytes(fixed8(&buf[32..40])),
            ver: i64::from_le_bytes(fixed8(&buf[40..48])),
            name,
            entry_table: decode_table(&buf[ENTRY_TABLE_AT..], ENTRY_TABLE_LEN),
            data_table: decode_table(&buf[DATA_TABLE_AT..], DATA_TABLE_LEN),
        })
    }
}

/// LBA of the root copy a commit with `generation` writes.
#[inline]
pub fn root_copy_lba(id: u32, generation: u64) -> u64 {
    id as u64 * 2 + generation % 2
}

/// Pick the authoritative root among the two decoded copies.
pub fn select_root(a: Option<LogRoot>, b: Option<LogRoot>) -> Option<LogRoot> {
    match (a, b) {
        (Some(a), Some(b)) => Some(if a.generation >= b.generation { a } else { b }),
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    }
}

fn encode_table(buf: &mut [u8], slots: &[u32]) {
    for (i, slot) in slots.iter().enumerate() {
        buf[i * 4..i * 4 + 4].copy_from_slice(&slot.to_le_bytes());
    }
}

fn decode_table(buf: &[u8], len: usize) -> SegmentTable {
    let slots = (0..len)
        .map(|i| u32::from_le_bytes(fixed4(&buf[i * 4..i * 4 + 4])))
        .collect();
    SegmentTable::from_slots(slots)
}

fn xor_checksum(data: &[u8]) -> u64 {
    let mut checksum: u64 = 0;

    let mut chunks = data.chunks_exact(8);
    for chunk in chunks.by_ref() {
        checksum ^= u64::from_le_bytes(fixed8(chunk));
    }

    let remainder = chunks.remainder();
    if !remainder.is_empty() {
        let mut last = [0u8; 8];
        last[..remainder.len()].copy_from_slice(remainder);
        checksum ^= u64::from_le_bytes(last);
    }

    checksum
}

fn fixed8(buf: &[u8]) -> [u8; 8] {
    let mut out = [0u8; 8];
    out.copy_from_slice(&buf[..8]);
    out
}

fn fixed4(buf: &[u8]) -> [u8; 4] {
    let mut out = [0u8; 4];
    out.copy_from_slice(&buf[..4]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_root() -> LogRoot {
        let mut entry_table = SegmentTable::new(ENTRY_TABLE_LEN);
        entry_table.set(0, 3);
        let mut data_table = SegmentTable::new(DATA_TABLE_LEN);
        data_table.set(0, 4);
        data_table.set(1, 9);

        LogRoot {
            id: 2,
            generation: 11,
            inuse: true,
            head: 5,
            tail: 12,
            ver: 40,
            name: "members".to_string(),
            entry_table,
            data_table,
        }
    }

    #[test]
    fn test_roundtrip() {
        let root = sample_root();
        let mut buf = vec![0u8; LogRoot::ENCODED_SIZE];
        root.encode(&mut buf).unwrap();
        assert_eq!(LogRoot::decode(&buf).unwrap(), root);
    }

    #[test]
    fn test_checksum_rejects_flipped_bit() {
        let root = sample_root();
        let mut buf = vec![0u8; LogRoot::ENCODED_SIZE];
        root.encode(&mut buf).unwrap();

        buf[33] ^= 0x10;
        assert!(matches!(
            LogRoot::decode(&buf),
            Err(LogError::Corruption(_))
        ));
    }

    #[test]
    fn test_zeroed_block_is_invalid() {
        let buf = vec![0u8; LogRoot::ENCODED_SIZE];
        assert!(LogRoot::decode(&buf).is_err());
    }

    #[test]
    fn test_copy_lba_alternates() {
        assert_eq!(root_copy_lba(0, 1), 1);
        assert_eq!(root_copy_lba(0, 2), 0);
        assert_eq!(root_copy_lba(3, 1), 7);
        assert_eq!(root_copy_lba(3, 2), 6);
    }

    #[test]
    fn test_select_root_prefers_higher_generation() {
        let mut old = sample_root();
        old.generation = 7;
        let new = sample_root();

        let picked = select_root(Some(old.clone()), Some(new.clone())).unwrap();
        assert_eq!(picked.generation, 11);
        let picked = select_root(Some(new), Some(old)).unwrap();
        assert_eq!(picked.generation, 11);
        assert!(select_root(None, None).is_none());
    }

    #[test]
    fn test_overlong_name_rejected_on_encode() {
        let mut root = sample_root();
        root.name = "x".repeat(MAX_NAME_LEN + 1);
        let mut buf = vec![0u8; LogRoot::ENCODED_SIZE];
        assert!(root.encode(&mut buf).is_err());
    }
}
