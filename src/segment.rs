//! Segment tables, address translation, and the free-segment bitmap.
//!
//! The device past the metadata region is carved into fixed-size
//! segments. Each log owns two bounded logical spaces, one for entry
//! slots and one for payload bytes; a per-space table maps logical
//! segment numbers to physical segments allocated lazily from a
//! device-wide bitmap. Logical byte offsets wrap modulo the space's
//! addressable span, so a space behaves as a ring whose live window is
//! bounded by the head/tail invariant.

use crate::constants::{BLOCK_BITS, BLOCK_SIZE, SEGMENT_POOL_LBA};

/// log2 of the segment size.
pub const SEGMENT_BIT: u32 = 16;

/// Segment size in bytes.
pub const SEGMENT_SIZE: u64 = 1 << SEGMENT_BIT;

/// Blocks per segment.
pub const BLOCKS_PER_SEGMENT: u64 = SEGMENT_SIZE / BLOCK_SIZE as u64;

/// Slots in a log's entry segment table.
pub const ENTRY_TABLE_LEN: usize = 64;

/// Slots in a log's data segment table.
pub const DATA_TABLE_LEN: usize = 64;

/// Addressable bytes of a log's entry space.
pub const ENTRY_SPAN: u64 = (ENTRY_TABLE_LEN as u64) << SEGMENT_BIT;

/// Addressable bytes of a log's data space.
pub const DATA_SPAN: u64 = (DATA_TABLE_LEN as u64) << SEGMENT_BIT;

/// Most segments a single device can expose (one bitmap block).
pub const MAX_SEGMENTS: u32 = (BLOCK_SIZE * 8) as u32;

/// Table slot value for a logical segment with no physical backing yet.
pub const UNASSIGNED: u32 = u32::MAX;

/// First LBA of a physical segment.
#[inline]
pub fn segment_first_lba(physical: u32) -> u64 {
    SEGMENT_POOL_LBA + physical as u64 * BLOCKS_PER_SEGMENT
}

/// Logical segment containing a span offset.
#[inline]
pub fn segment_of(span_offset: u64) -> usize {
    (span_offset >> SEGMENT_BIT) as usize
}

/// LBA of the block containing `span_offset`, given its physical segment.
#[inline]
pub fn block_lba(physical: u32, span_offset: u64) -> u64 {
    segment_first_lba(physical) + ((span_offset & (SEGMENT_SIZE - 1)) >> BLOCK_BITS)
}

/// Byte offset of `span_offset` within its block.
#[inline]
pub fn offset_in_block(span_offset: u64) -> usize {
    (span_offset % BLOCK_SIZE as u64) as usize
}

/// Bounded map from logical to physical segment numbers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentTable {
    slots: Vec<u32>,
}

impl SegmentTable {
    /// Create a table of `len` unassigned slots.
    pub fn new(len: usize) -> Self {
        Self {
            slots: vec![UNASSIGNED; len],
        }
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the table has no slots.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Physical segment backing `logical`, if assigned.
    pub fn get(&self, logical: usize) -> Option<u32> {
        match self.slots.get(logical) {
            Some(&physical) if physical != UNASSIGNED => Some(physical),
            _ => None,
        }
    }

    /// Record that `logical` is backed by `physical`.
    pub fn set(&mut self, logical: usize, physical: u32) {
        self.slots[logical] = physical;
    }

    /// Iterate over assigned physical segments.
    pub fn assigned(&self) -> impl Iterator<Item = u32> + '_ {
        self.slots.iter().copied().filter(|&s| s != UNASSIGNED)
    }

    /// Raw slot values, for encoding into a root record.
    pub fn slots(&self) -> &[u32] {
        &self.slots
    }

    /// Rebuild a table from decoded slot values.
    pub fn from_slots(slots: Vec<u32>) -> Self {
        Self { slots }
    }
}

/// Device-wide allocation state for the segment pool.
///
/// The authoritative record of segment ownership is the set of segment
/// tables in committed roots. The bitmap is rebuilt from them on open
/// and written through to its reserved block on allocation.
#[derive(Debug)]
pub struct SegmentBitmap {
    bits: Vec<u64>,
    segment_count: u32,
}

impl SegmentBitmap {
    /// Create an all-free bitmap over `segment_count` segments.
    pub fn new(segment_count: u32) -> Self {
        Self {
            bits: vec![0u64; BLOCK_SIZE / 8],
            segment_count,
        }
    }

    /// Number of segments the pool exposes.
    pub fn segment_count(&self) -> u32 {
        self.segment_count
    }

    /// Whether `segment` is allocated.
    pub fn is_allocated(&self, segment: u32) -> bool {
        let word = (segment / 64) as usize;
        let bit = segment % 64;
        self.bits[word] & (1u64 << bit) != 0
    }

    /// Mark `segment` allocated (used when rebuilding from roots).
    pub fn mark(&mut self, segment: u32) {
        let word = (segment / 64) as usize;
        let bit = segment % 64;
        self.bits[word] |= 1u64 << bit;
    }

    /// Allocate the lowest free segment, if any.
    pub fn allocate(&mut self) -> Option<u32> {
        for segment in 0..self.segment_count {
            if !self.is_allocated(segment) {
                self.mark(segment);
                return Some(segment);
            }
        }
        None
    }

    /// Encode the bitmap into its reserved block.
    pub fn encode(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= BLOCK_SIZE);
        for (i, word) in self.bits.iter().enumerate() {
            buf[i * 8..i * 8 + 8].copy_from_slice(&word.to_le_bytes());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_translation_math() {
        assert_eq!(segment_of(0), 0);
        assert_eq!(segment_of(SEGMENT_SIZE - 1), 0);
        assert_eq!(segment_of(SEGMENT_SIZE), 1);

        assert_eq!(segment_first_lba(0), SEGMENT_POOL_LBA);
        assert_eq!(
            segment_first_lba(3),
            SEGMENT_POOL_LBA + 3 * BLOCKS_PER_SEGMENT
        );

        // Offset one block plus 17 bytes into segment 2.
        let span_offset = 2 * SEGMENT_SIZE + BLOCK_SIZE as u64 + 17;
        assert_eq!(block_lba(9, span_offset), segment_first_lba(9) + 1);
        assert_eq!(offset_in_block(span_offset), 17);
    }

    #[test]
    fn test_segment_table() {
        let mut table = SegmentTable::new(ENTRY_TABLE_LEN);
        assert_eq!(table.get(0), None);

        table.set(0, 5);
        table.set(7, 9);
        assert_eq!(table.get(0), Some(5));
        assert_eq!(table.get(7), Some(9));
        assert_eq!(table.assigned().collect::<Vec<_>>(), vec![5, 9]);
    }

    #[test]
    fn test_bitmap_allocates_lowest_free() {
        let mut bitmap = SegmentBitmap::new(4);
        assert_eq!(bitmap.allocate(), Some(0));
        assert_eq!(bitmap.allocate(), Some(1));

        bitmap.mark(2);
        assert_eq!(bitmap.allocate(), Some(3));
        assert_eq!(bitmap.allocate(), None);
    }

    #[test]
    fn test_bitmap_encode() {
        let mut bitmap = SegmentBitmap::new(128);
        bitmap.mark(0);
        bitmap.mark(65);

        let mut buf = vec![0u8; BLOCK_SIZE];
        bitmap.encode(&mut buf);
        assert_eq!(buf[0], 1);
        assert_eq!(buf[8], 2);
    }
}
