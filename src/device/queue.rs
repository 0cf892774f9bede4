//! I/O queue pair.
//!
//! One worker thread owns the device and drains a bounded submission
//! queue; every submitted operation carries its own aligned buffer and a
//! completion channel the submitter blocks on. This keeps all device
//! access on a single thread, mirroring a user-space driver queue pair.

use std::io;
use std::sync::mpsc::{sync_channel, SyncSender};
use std::sync::Arc;
use std::thread;

use crossbeam::channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::warn;

use crate::constants::BLOCK_SIZE;
use crate::device::BlockDevice;
use crate::error::{LogError, Result};
use crate::utility::AlignedBuffer;

enum IoRequest {
    Read {
        lba: u64,
        buf: AlignedBuffer,
        done: SyncSender<io::Result<AlignedBuffer>>,
    },
    Write {
        lba: u64,
        buf: AlignedBuffer,
        done: SyncSender<io::Result<AlignedBuffer>>,
    },
    Flush {
        done: SyncSender<io::Result<()>>,
    },
    Shutdown,
}

/// Submission/completion queue pair over a block device.
pub struct IoQueue {
    tx: Sender<IoRequest>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl IoQueue {
    /// Start the worker thread. `depth` bounds the submission queue.
    pub fn start(device: Arc<dyn BlockDevice>, depth: usize) -> Self {
        let (tx, rx) = bounded(depth.max(1));
        let worker = thread::spawn(move || worker_loop(device, rx));

        Self {
            tx,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Read `blocks` blocks starting at `lba` into a fresh aligned buffer.
    pub fn read(&self, lba: u64, blocks: usize) -> Result<AlignedBuffer> {
        let buf = alloc_io_buffer(blocks)?;
        let (done, wait) = sync_channel(1);
        self.tx
            .send(IoRequest::Read { lba, buf, done })
            .map_err(|_| queue_stopped())?;
        wait.recv()
            .map_err(|_| queue_stopped())?
            .map_err(LogError::DeviceIo)
    }

    /// Write `buf` at `lba`; the buffer is handed back on completion so
    /// callers can reuse it.
    pub fn write(&self, lba: u64, buf: AlignedBuffer) -> Result<AlignedBuffer> {
        let (done, wait) = sync_channel(1);
        self.tx
            .send(IoRequest::Write { lba, buf, done })
            .map_err(|_| queue_stopped())?;
        wait.recv()
            .map_err(|_| queue_stopped())?
            .map_err(LogError::DeviceIo)
    }

    /// Barrier: all writes submitted before this call are stable when it
    /// returns.
    pub fn flush(&self) -> Result<()> {
        let (done, wait) = sync_channel(1);
        self.tx
            .send(IoRequest::Flush { done })
            .map_err(|_| queue_stopped())?;
        wait.recv()
            .map_err(|_| queue_stopped())?
            .map_err(LogError::DeviceIo)
    }

    /// Stop the worker and join it. Further submissions fail.
    pub fn stop(&self) {
        if let Some(worker) = self.worker.lock().take() {
            let _ = self.tx.send(IoRequest::Shutdown);
            if worker.join().is_err() {
                warn!("i/o queue worker panicked during shutdown");
            }
        }
    }
}

impl Drop for IoQueue {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Allocate a block-aligned transfer buffer.
pub(crate) fn alloc_io_buffer(blocks: usize) -> Result<AlignedBuffer> {
    AlignedBuffer::zeroed(BLOCK_SIZE, blocks.max(1) * BLOCK_SIZE)
        .ok_or_else(|| LogError::DeviceIo(io::Error::other("aligned buffer allocation failed")))
}

fn queue_stopped() -> LogError {
    LogError::DeviceIo(io::Error::other("i/o queue stopped"))
}

fn worker_loop(device: Arc<dyn BlockDevice>, rx: Receiver<IoRequest>) {
    while let Ok(request) = rx.recv() {
        match request {
            IoRequest::Read { lba, mut buf, done } => {
                let result = device.read_blocks(lba, buf.as_mut_slice()).map(|_| buf);
                let _ = done.send(result);
            }
            IoRequest::Write { lba, buf, done } => {
                let result = device.write_blocks(lba, buf.as_slice()).map(|_| buf);
                let _ = done.send(result);
            }
            IoRequest::Flush { done } => {
                let _ = done.send(device.flush());
            }
            IoRequest::Shutdown => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemBlockDevice;

    #[test]
    fn test_read_write_through_queue() {
        let device = Arc::new(MemBlockDevice::new(4));
        let queue = IoQueue::start(device, 8);

        let mut buf = alloc_io_buffer(1).unwrap();
        buf.as_mut_slice().fill(0x42);
        queue.write(2, buf).unwrap();
        queue.flush().unwrap();

        let out = queue.read(2, 1).unwrap();
        assert!(out.as_slice().iter().all(|&b| b == 0x42));
    }

    #[test]
    fn test_submission_after_stop_fails() {
        let device = Arc::new(MemBlockDevice::new(4));
        let queue = IoQueue::start(device, 8);
        queue.stop();
        assert!(queue.read(0, 1).is_err());
    }
}
