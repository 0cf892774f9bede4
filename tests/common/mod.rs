//! Shared test utilities for crash consistency and fault injection tests.

#![allow(dead_code)]

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use verslog::constants::ROOT_REGION_BLOCKS;
use verslog::device::{BlockDevice, MemBlockDevice};
use verslog::{PersistPool, PoolOptions};

/// A fault-injection wrapper around any `BlockDevice`.
///
/// Allows deterministic injection of write errors, either at an absolute
/// operation count or at the Nth write landing in the root metadata
/// region. An injected failure stands in for the process dying at that
/// I/O boundary: the engine returns an error, the test reopens the
/// device, and recovery must land on the last committed root.
pub struct FaultInjectionDevice<D> {
    inner: D,
    /// Total number of write_blocks calls observed so far.
    write_count: AtomicU64,
    /// Writes observed inside the root region.
    root_write_count: AtomicU64,
    /// When non-zero, the Nth write (1-based) returns an I/O error.
    fail_write_at: AtomicU64,
    /// When non-zero, the Nth root-region write (1-based) returns an
    /// I/O error.
    fail_root_write_at: AtomicU64,
}

impl<D: BlockDevice> FaultInjectionDevice<D> {
    /// Wrap an existing device for fault injection.
    pub fn new(inner: D) -> Self {
        Self {
            inner,
            write_count: AtomicU64::new(0),
            root_write_count: AtomicU64::new(0),
            fail_write_at: AtomicU64::new(0),
            fail_root_write_at: AtomicU64::new(0),
        }
    }

    /// Make the Nth write (1-based) fail.
    pub fn inject_write_error_at(&self, operation_n: u64) {
        self.fail_write_at.store(operation_n, Ordering::SeqCst);
    }

    /// Make the Nth write into the root region (1-based) fail.
    pub fn inject_root_write_error_at(&self, operation_n: u64) {
        self.fail_root_write_at.store(operation_n, Ordering::SeqCst);
    }

    /// Total write_blocks calls observed.
    pub fn write_count(&self) -> u64 {
        self.write_count.load(Ordering::SeqCst)
    }

    /// Root-region write_blocks calls observed.
    pub fn root_write_count(&self) -> u64 {
        self.root_write_count.load(Ordering::SeqCst)
    }
}

impl<D: BlockDevice> BlockDevice for FaultInjectionDevice<D> {
    fn read_blocks(&self, lba: u64, buf: &mut [u8]) -> io::Result<()> {
        self.inner.read_blocks(lba, buf)
    }

    fn write_blocks(&self, lba: u64, buf: &[u8]) -> io::Result<()> {
        let n = self.write_count.fetch_add(1, Ordering::SeqCst) + 1;
        let target = self.fail_write_at.load(Ordering::SeqCst);
        if target != 0 && n == target {
            return Err(io::Error::other(format!(
                "injected write error at operation {n}"
            )));
        }

        if lba < ROOT_REGION_BLOCKS {
            let n = self.root_write_count.fetch_add(1, Ordering::SeqCst) + 1;
            let target = self.fail_root_write_at.load(Ordering::SeqCst);
            if target != 0 && n == target {
                return Err(io::Error::other(format!(
                    "injected root write error at operation {n}"
                )));
            }
        }

        self.inner.write_blocks(lba, buf)
    }

    fn flush(&self) -> io::Result<()> {
        self.inner.flush()
    }

    fn block_count(&self) -> u64 {
        self.inner.block_count()
    }
}

/// Blocks used by test devices: metadata region plus a comfortable
/// number of segments.
pub const TEST_DEVICE_BLOCKS: u64 = 2048;

/// Open a pool over a fresh in-memory device.
pub fn mem_pool() -> Arc<PersistPool> {
    let device = Arc::new(MemBlockDevice::new(TEST_DEVICE_BLOCKS));
    PersistPool::open(device, PoolOptions::default()).unwrap()
}

/// Open a pool over a shared in-memory device, so tests can drop the
/// pool and reopen the same device to exercise recovery.
pub fn pool_over(device: Arc<dyn BlockDevice>) -> Arc<PersistPool> {
    PersistPool::open(device, PoolOptions::default()).unwrap()
}
