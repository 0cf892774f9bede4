//! In-memory block device for tests.

use std::io;
use std::sync::Mutex;

use crate::constants::BLOCK_SIZE;
use crate::device::traits::{check_range, BlockDevice};

/// Block device held entirely in memory.
///
/// Retains writes so tests can exercise the full read/write/recover
/// cycle without touching the filesystem.
pub struct MemBlockDevice {
    blocks: Mutex<Vec<u8>>,
    block_count: u64,
}

impl MemBlockDevice {
    /// Create a zeroed device of `block_count` blocks.
    pub fn new(block_count: u64) -> Self {
        Self {
            blocks: Mutex::new(vec![0u8; block_count as usize * BLOCK_SIZE]),
            block_count,
        }
    }
}

impl BlockDevice for MemBlockDevice {
    fn read_blocks(&self, lba: u64, buf: &mut [u8]) -> io::Result<()> {
        check_range(lba, buf.len(), self.block_count)?;
        let blocks = self
            .blocks
            .lock()
            .map_err(|_| io::Error::other("failed to lock device memory"))?;
        let start = lba as usize * BLOCK_SIZE;
        buf.copy_from_slice(&blocks[start..start + buf.len()]);
        Ok(())
    }

    fn write_blocks(&self, lba: u64, buf: &[u8]) -> io::Result<()> {
        check_range(lba, buf.len(), self.block_count)?;
        let mut blocks = self
            .blocks
            .lock()
            .map_err(|_| io::Error::other("failed to lock device memory"))?;
        let start = lba as usize * BLOCK_SIZE;
        blocks[start..start + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn flush(&self) -> io::Result<()> {
        Ok(())
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let device = MemBlockDevice::new(4);
        let data = vec![0x5au8; BLOCK_SIZE * 2];
        device.write_blocks(1, &data).unwrap();

        let mut out = vec![0u8; BLOCK_SIZE * 2];
        device.read_blocks(1, &mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn test_unwritten_blocks_read_zero() {
        let device = MemBlockDevice::new(2);
        let mut out = vec![1u8; BLOCK_SIZE];
        device.read_blocks(0, &mut out).unwrap();
        assert!(out.iter().all(|&b| b == 0));
    }
}
