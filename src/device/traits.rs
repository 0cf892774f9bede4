//! Block device trait.

use std::io;

use crate::constants::BLOCK_SIZE;

/// A raw block device addressed by LBA.
///
/// Transfers operate on whole blocks: `buf.len()` must be a non-zero
/// multiple of [`BLOCK_SIZE`] and the range must lie inside the device.
/// Implementations are shared between the submitting threads and the
/// I/O worker, so they must be internally synchronized.
pub trait BlockDevice: Send + Sync + 'static {
    /// Read `buf.len() / BLOCK_SIZE` blocks starting at `lba` into `buf`.
    fn read_blocks(&self, lba: u64, buf: &mut [u8]) -> io::Result<()>;

    /// Write `buf` to the blocks starting at `lba`.
    fn write_blocks(&self, lba: u64, buf: &[u8]) -> io::Result<()>;

    /// Push completed writes to stable storage.
    fn flush(&self) -> io::Result<()>;

    /// Total number of addressable blocks.
    fn block_count(&self) -> u64;
}

/// Validate a transfer against the device size; shared by implementations.
pub(crate) fn check_range(lba: u64, len: usize, block_count: u64) -> io::Result<()> {
    if len == 0 || len % BLOCK_SIZE != 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("transfer length {len} is not a multiple of the block size"),
        ));
    }
    let blocks = (len / BLOCK_SIZE) as u64;
    if lba.checked_add(blocks).map_or(true, |end| end > block_count) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("lba range {lba}+{blocks} exceeds device size {block_count}"),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_range() {
        assert!(check_range(0, BLOCK_SIZE, 4).is_ok());
        assert!(check_range(3, BLOCK_SIZE, 4).is_ok());
        assert!(check_range(4, BLOCK_SIZE, 4).is_err());
        assert!(check_range(0, BLOCK_SIZE - 1, 4).is_err());
        assert!(check_range(0, 0, 4).is_err());
        assert!(check_range(u64::MAX, BLOCK_SIZE, 4).is_err());
    }
}
