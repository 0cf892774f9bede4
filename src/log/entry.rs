//! Fixed-size log entry records.

use crate::error::{LogError, Result};
use crate::hlc::Hlc;
use crate::segment::ENTRY_SPAN;

/// Total number of entry slots a log's entry space can address.
pub const ENTRY_CAPACITY: i64 = (ENTRY_SPAN / LogEntry::SIZE as u64) as i64;

/// Header record describing one appended payload.
///
/// Entries are stored little-endian in 64-byte slots so they never
/// straddle a block boundary; the same packed form is used verbatim in
/// serialized log tails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LogEntry {
    /// Application-supplied version; strictly increasing within a log.
    pub ver: i64,
    /// Hybrid clock, physical microsecond component.
    pub hlc_r: u64,
    /// Hybrid clock, logical counter.
    pub hlc_l: u64,
    /// Payload length in bytes.
    pub dlen: u64,
    /// Byte offset of the payload in the log's data stream; a prefix sum
    /// of earlier payload lengths, preserved across trims.
    pub ofst: u64,
}

impl LogEntry {
    /// On-device slot size in bytes.
    pub const SIZE: usize = 64;

    /// The entry's hybrid clock reading.
    pub fn hlc(&self) -> Hlc {
        Hlc::new(self.hlc_r, self.hlc_l)
    }

    /// Encode into a 64-byte slot; trailing bytes are zeroed.
    pub fn encode(&self, buf: &mut [u8]) -> Result<()> {
        if buf.len() < Self::SIZE {
            return Err(LogError::InvalidArgument(
                "entry buffer shorter than a slot".into(),
            ));
        }
        buf[..Self::SIZE].fill(0);
        buf[..8].copy_from_slice(&self.ver.to_le_bytes());
        buf[8..16].copy_from_slice(&self.hlc_r.to_le_bytes());
        buf[16..24].copy_from_slice(&self.hlc_l.to_le_bytes());
        buf[24..32].copy_from_slice(&self.dlen.to_le_bytes());
        buf[32..40].copy_from_slice(&self.ofst.to_le_bytes());
        Ok(())
    }

    /// Decode from a 64-byte slot.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(LogError::Corruption("entry slot truncated".into()));
        }
        Ok(Self {
            ver: i64::from_le_bytes(read8(buf, 0)?),
            hlc_r: u64::from_le_bytes(read8(buf, 8)?),
            hlc_l: u64::from_le_bytes(read8(buf, 16)?),
            dlen: u64::from_le_bytes(read8(buf, 24)?),
            ofst: u64::from_le_bytes(read8(buf, 32)?),
        })
    }
}

/// Byte offset of an entry slot within the entry space; slots wrap
/// modulo the addressable span.
#[inline]
pub(crate) fn slot_offset(index: i64) -> u64 {
    debug_assert!(index >= 0);
    (index as u64 * LogEntry::SIZE as u64) % ENTRY_SPAN
}

fn read8(buf: &[u8], at: usize) -> Result<[u8; 8]> {
    buf[at..at + 8]
        .try_into()
        .map_err(|_| LogError::Corruption("entry slot truncated".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let entry = LogEntry {
            ver: 42,
            hlc_r: 1_000_000,
            hlc_l: 3,
            dlen: 17,
            ofst: 4096,
        };

        let mut buf = [0xffu8; LogEntry::SIZE];
        entry.encode(&mut buf).unwrap();
        assert_eq!(LogEntry::decode(&buf).unwrap(), entry);
        // Padding is cleared so slots compare bytewise.
        assert!(buf[40..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_short_buffers_rejected() {
        let entry = LogEntry::default();
        let mut short = [0u8; LogEntry::SIZE - 1];
        assert!(entry.encode(&mut short).is_err());
        assert!(LogEntry::decode(&short).is_err());
    }

    #[test]
    fn test_slot_offset_wraps() {
        assert_eq!(slot_offset(0), 0);
        assert_eq!(slot_offset(1), LogEntry::SIZE as u64);
        assert_eq!(slot_offset(ENTRY_CAPACITY), 0);
        assert_eq!(slot_offset(ENTRY_CAPACITY + 2), 2 * LogEntry::SIZE as u64);
    }
}
