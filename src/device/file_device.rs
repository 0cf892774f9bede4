//! File-backed block device.
//!
//! Backs the engine with a regular file or a device node opened through
//! the filesystem. All access goes through a mutex-guarded file handle.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::constants::BLOCK_SIZE;
use crate::device::traits::{check_range, BlockDevice};

/// Block device backed by a file.
pub struct FileBlockDevice {
    path: PathBuf,
    file: Mutex<File>,
    block_count: u64,
}

impl FileBlockDevice {
    /// Open an existing backing file. The device size is derived from the
    /// file length, rounded down to whole blocks.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let len = file.metadata()?.len();

        Ok(Self {
            path,
            file: Mutex::new(file),
            block_count: len / BLOCK_SIZE as u64,
        })
    }

    /// Create (or truncate) a backing file sized to `block_count` blocks.
    pub fn create(path: impl AsRef<Path>, block_count: u64) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(block_count * BLOCK_SIZE as u64)?;

        Ok(Self {
            path,
            file: Mutex::new(file),
            block_count,
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn locked(&self) -> io::Result<std::sync::MutexGuard<'_, File>> {
        self.file
            .lock()
            .map_err(|_| io::Error::other("failed to lock device file"))
    }
}

impl BlockDevice for FileBlockDevice {
    fn read_blocks(&self, lba: u64, buf: &mut [u8]) -> io::Result<()> {
        check_range(lba, buf.len(), self.block_count)?;
        let mut file = self.locked()?;
        file.seek(SeekFrom::Start(lba * BLOCK_SIZE as u64))?;
        file.read_exact(buf)
    }

    fn write_blocks(&self, lba: u64, buf: &[u8]) -> io::Result<()> {
        check_range(lba, buf.len(), self.block_count)?;
        let mut file = self.locked()?;
        file.seek(SeekFrom::Start(lba * BLOCK_SIZE as u64))?;
        file.write_all(buf)
    }

    fn flush(&self) -> io::Result<()> {
        self.locked()?.sync_all()
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }
}
