// Block Devices
// The block layer consumed by the journal: synchronous block transfers,
// completion-callback submission, cache flushes and optional write barriers

use crate::buffer::Buffer;
use crate::JournalError;
use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Direction of a submitted transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoDirection {
    Read,
    Write,
    /// Write that must not be reordered with earlier writes, and is durable on completion
    WriteBarrier,
}

/// Completion callback run once a submitted transfer finishes
pub type EndIo = Box<dyn FnOnce(&Buffer, Result<(), JournalError>) + Send>;

/// Completion that records the result on the buffer and unlocks it
pub fn end_buffer_io() -> EndIo {
    Box::new(|buffer: &Buffer, result: Result<(), JournalError>| buffer.end_io(result))
}

/// Block device trait
pub trait BlockDevice: Send + Sync {
    /// Size of one block in bytes
    fn block_size(&self) -> usize;

    /// Number of addressable blocks
    fn num_blocks(&self) -> u64;

    /// Read a block into `buf`
    fn read_block(&self, block: u64, buf: &mut [u8]) -> Result<(), JournalError>;

    /// Write a block from `buf`
    fn write_block(&self, block: u64, buf: &[u8]) -> Result<(), JournalError>;

    /// Write a block as an ordering barrier
    fn write_block_barrier(&self, _block: u64, _buf: &[u8]) -> Result<(), JournalError> {
        Err(JournalError::BarrierUnsupported)
    }

    /// Flush the device's volatile write cache
    fn flush(&self) -> Result<(), JournalError>;

    /// Submit a transfer for `buffer`, calling `on_complete` when it finishes.
    ///
    /// The caller owns the buffer lock for the duration of the transfer;
    /// the completion is expected to release it.
    fn submit(&self, direction: IoDirection, buffer: &Buffer, on_complete: EndIo) {
        let block = buffer.blocknr();
        let result = match direction {
            IoDirection::Read => {
                let mut data = buffer.data();
                self.read_block(block, &mut data[..])
            }
            IoDirection::Write => {
                let data = buffer.data();
                self.write_block(block, &data[..])
            }
            IoDirection::WriteBarrier => {
                let data = buffer.data();
                self.write_block_barrier(block, &data[..])
            }
        };
        log::trace!("{:?} of block {} completed: {}", direction, block, result.is_ok());
        on_complete(buffer, result);
    }
}

/// Flush a device's write cache
pub fn flush_device(device: &dyn BlockDevice) -> Result<(), JournalError> {
    device.flush()
}

fn check_transfer(block: u64, len: usize, block_size: usize, num_blocks: u64) -> Result<(), JournalError> {
    if block >= num_blocks {
        return Err(JournalError::device_io(
            block,
            format!("beyond end of device ({} blocks)", num_blocks),
        ));
    }
    if len != block_size {
        return Err(JournalError::device_io(
            block,
            format!("invalid transfer size: expected {}, got {}", block_size, len),
        ));
    }
    Ok(())
}

/// In-memory block device
///
/// Unwritten blocks read back as zeros. Writes can be made to fail per block
/// or globally, and barrier support can be switched off to exercise the
/// fallback path.
pub struct MemoryDevice {
    block_size: usize,
    num_blocks: u64,
    blocks: Mutex<HashMap<u64, Vec<u8>>>,
    barrier_supported: AtomicBool,
    fail_all_writes: AtomicBool,
    failing_blocks: Mutex<HashSet<u64>>,
    failing_reads: Mutex<HashSet<u64>>,
    write_history: Mutex<Vec<u64>>,
    flushes: AtomicU64,
    barrier_writes: AtomicU64,
}

impl MemoryDevice {
    pub fn new(block_size: usize, num_blocks: u64) -> Self {
        Self {
            block_size,
            num_blocks,
            blocks: Mutex::new(HashMap::new()),
            barrier_supported: AtomicBool::new(true),
            fail_all_writes: AtomicBool::new(false),
            failing_blocks: Mutex::new(HashSet::new()),
            failing_reads: Mutex::new(HashSet::new()),
            write_history: Mutex::new(Vec::new()),
            flushes: AtomicU64::new(0),
            barrier_writes: AtomicU64::new(0),
        }
    }

    pub fn set_barrier_supported(&self, supported: bool) {
        self.barrier_supported.store(supported, Ordering::SeqCst);
    }

    /// Make every later write to `block` fail
    pub fn fail_writes_to(&self, block: u64) {
        self.failing_blocks.lock().unwrap().insert(block);
    }

    /// Make every later read of `block` fail
    pub fn fail_reads_from(&self, block: u64) {
        self.failing_reads.lock().unwrap().insert(block);
    }

    pub fn fail_all_writes(&self, fail: bool) {
        self.fail_all_writes.store(fail, Ordering::SeqCst);
    }

    pub fn clear_failures(&self) {
        self.failing_blocks.lock().unwrap().clear();
        self.failing_reads.lock().unwrap().clear();
        self.fail_all_writes.store(false, Ordering::SeqCst);
    }

    /// Contents of a block (zeros if never written)
    pub fn block(&self, block: u64) -> Vec<u8> {
        self.blocks
            .lock()
            .unwrap()
            .get(&block)
            .cloned()
            .unwrap_or_else(|| vec![0u8; self.block_size])
    }

    /// Store a block directly, bypassing failure injection and history
    pub fn set_block(&self, block: u64, data: &[u8]) {
        let mut contents = vec![0u8; self.block_size];
        let len = data.len().min(self.block_size);
        contents[..len].copy_from_slice(&data[..len]);
        self.blocks.lock().unwrap().insert(block, contents);
    }

    /// Block numbers in the order they were written
    pub fn write_history(&self) -> Vec<u64> {
        self.write_history.lock().unwrap().clone()
    }

    pub fn clear_write_history(&self) {
        self.write_history.lock().unwrap().clear();
    }

    pub fn flush_count(&self) -> u64 {
        self.flushes.load(Ordering::SeqCst)
    }

    pub fn barrier_write_count(&self) -> u64 {
        self.barrier_writes.load(Ordering::SeqCst)
    }

    /// Copy of the persisted contents, as a device would look after power loss
    pub fn snapshot(&self) -> MemoryDevice {
        let copy = MemoryDevice::new(self.block_size, self.num_blocks);
        *copy.blocks.lock().unwrap() = self.blocks.lock().unwrap().clone();
        copy.set_barrier_supported(self.barrier_supported.load(Ordering::SeqCst));
        copy
    }

    fn write_allowed(&self, block: u64) -> Result<(), JournalError> {
        if self.fail_all_writes.load(Ordering::SeqCst) || self.failing_blocks.lock().unwrap().contains(&block) {
            return Err(JournalError::device_io(block, "injected write failure"));
        }
        Ok(())
    }
}

impl BlockDevice for MemoryDevice {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn num_blocks(&self) -> u64 {
        self.num_blocks
    }

    fn read_block(&self, block: u64, buf: &mut [u8]) -> Result<(), JournalError> {
        check_transfer(block, buf.len(), self.block_size, self.num_blocks)?;
        if self.failing_reads.lock().unwrap().contains(&block) {
            return Err(JournalError::device_io(block, "injected read failure"));
        }
        match self.blocks.lock().unwrap().get(&block) {
            Some(data) => buf.copy_from_slice(data),
            None => buf.fill(0),
        }
        Ok(())
    }

    fn write_block(&self, block: u64, buf: &[u8]) -> Result<(), JournalError> {
        check_transfer(block, buf.len(), self.block_size, self.num_blocks)?;
        self.write_allowed(block)?;
        self.blocks.lock().unwrap().insert(block, buf.to_vec());
        self.write_history.lock().unwrap().push(block);
        Ok(())
    }

    fn write_block_barrier(&self, block: u64, buf: &[u8]) -> Result<(), JournalError> {
        if !self.barrier_supported.load(Ordering::SeqCst) {
            return Err(JournalError::BarrierUnsupported);
        }
        self.write_block(block, buf)?;
        self.barrier_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn flush(&self) -> Result<(), JournalError> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Image-file backed block device
pub struct FileDevice {
    file: Mutex<File>,
    block_size: usize,
    num_blocks: u64,
}

impl FileDevice {
    /// Open an existing image
    pub fn open(path: impl AsRef<Path>, block_size: usize) -> Result<Self, JournalError> {
        let file = OpenOptions::new().read(true).write(true).open(path.as_ref())?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Mutex::new(file),
            block_size,
            num_blocks: len / block_size as u64,
        })
    }

    /// Create (or truncate) an image of `num_blocks` blocks
    pub fn create(path: impl AsRef<Path>, block_size: usize, num_blocks: u64) -> Result<Self, JournalError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        file.set_len(num_blocks * block_size as u64)?;
        Ok(Self {
            file: Mutex::new(file),
            block_size,
            num_blocks,
        })
    }
}

impl BlockDevice for FileDevice {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn num_blocks(&self) -> u64 {
        self.num_blocks
    }

    fn read_block(&self, block: u64, buf: &mut [u8]) -> Result<(), JournalError> {
        check_transfer(block, buf.len(), self.block_size, self.num_blocks)?;
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(block * self.block_size as u64))?;
        file.read_exact(buf)?;
        Ok(())
    }

    fn write_block(&self, block: u64, buf: &[u8]) -> Result<(), JournalError> {
        check_transfer(block, buf.len(), self.block_size, self.num_blocks)?;
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(block * self.block_size as u64))?;
        file.write_all(buf)?;
        Ok(())
    }

    fn write_block_barrier(&self, block: u64, buf: &[u8]) -> Result<(), JournalError> {
        self.write_block(block, buf)?;
        self.flush()
    }

    fn flush(&self) -> Result<(), JournalError> {
        self.file.lock().unwrap().sync_all()?;
        Ok(())
    }
}

/// A contiguous range of blocks on another device
///
/// Lets a journal live inside the filesystem's own device.
pub struct RegionDevice {
    inner: Arc<dyn BlockDevice>,
    start: u64,
    len: u64,
}

impl RegionDevice {
    pub fn new(inner: Arc<dyn BlockDevice>, start: u64, len: u64) -> Result<Self, JournalError> {
        if start.checked_add(len).map_or(true, |end| end > inner.num_blocks()) {
            return Err(JournalError::Config(format!(
                "region {}+{} exceeds device of {} blocks",
                start,
                len,
                inner.num_blocks()
            )));
        }
        Ok(Self { inner, start, len })
    }

    fn map(&self, block: u64) -> Result<u64, JournalError> {
        if block >= self.len {
            return Err(JournalError::device_io(block, format!("outside region of {} blocks", self.len)));
        }
        Ok(self.start + block)
    }
}

impl BlockDevice for RegionDevice {
    fn block_size(&self) -> usize {
        self.inner.block_size()
    }

    fn num_blocks(&self) -> u64 {
        self.len
    }

    fn read_block(&self, block: u64, buf: &mut [u8]) -> Result<(), JournalError> {
        self.inner.read_block(self.map(block)?, buf)
    }

    fn write_block(&self, block: u64, buf: &[u8]) -> Result<(), JournalError> {
        self.inner.write_block(self.map(block)?, buf)
    }

    fn write_block_barrier(&self, block: u64, buf: &[u8]) -> Result<(), JournalError> {
        self.inner.write_block_barrier(self.map(block)?, buf)
    }

    fn flush(&self) -> Result<(), JournalError> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_memory_device_roundtrip() {
        let device = MemoryDevice::new(512, 8);
        let mut buf = vec![0u8; 512];
        device.read_block(4, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));

        device.write_block(4, &[7u8; 512]).unwrap();
        device.read_block(4, &mut buf).unwrap();
        assert_eq!(buf[511], 7);
        assert_eq!(device.write_history(), vec![4]);
    }

    #[test]
    fn test_memory_device_bounds() {
        let device = MemoryDevice::new(512, 8);
        assert!(device.write_block(8, &[0u8; 512]).is_err());
        assert!(device.write_block(1, &[0u8; 100]).is_err());
    }

    #[test]
    fn test_barrier_unsupported() {
        let device = MemoryDevice::new(512, 8);
        device.set_barrier_supported(false);
        assert!(matches!(
            device.write_block_barrier(0, &[0u8; 512]),
            Err(JournalError::BarrierUnsupported)
        ));
        device.set_barrier_supported(true);
        device.write_block_barrier(0, &[0u8; 512]).unwrap();
        assert_eq!(device.barrier_write_count(), 1);
    }

    #[test]
    fn test_submit_runs_completion() {
        let device = MemoryDevice::new(512, 8);
        device.fail_writes_to(2);

        let ok = Buffer::with_data(1, vec![1u8; 512]);
        ok.lock();
        device.submit(IoDirection::Write, &ok, end_buffer_io());
        assert!(!ok.is_locked());
        assert!(!ok.has_io_error());

        let bad = Buffer::with_data(2, vec![2u8; 512]);
        bad.lock();
        device.submit(IoDirection::Write, &bad, end_buffer_io());
        assert!(bad.has_io_error());
    }

    #[test]
    fn test_snapshot_is_independent() {
        let device = MemoryDevice::new(512, 8);
        device.set_block(1, b"before");
        let snap = device.snapshot();
        device.set_block(1, b"after!");
        assert_eq!(&snap.block(1)[..6], b"before");
    }

    #[test]
    fn test_file_device() {
        let tmp = NamedTempFile::new().unwrap();
        let device = FileDevice::create(tmp.path(), 1024, 4).unwrap();
        device.write_block(3, &[0x5A; 1024]).unwrap();
        device.flush().unwrap();
        drop(device);

        let device = FileDevice::open(tmp.path(), 1024).unwrap();
        assert_eq!(device.num_blocks(), 4);
        let mut buf = vec![0u8; 1024];
        device.read_block(3, &mut buf).unwrap();
        assert_eq!(buf[0], 0x5A);
    }

    #[test]
    fn test_region_device_maps_blocks() {
        let inner = Arc::new(MemoryDevice::new(512, 16));
        let region = RegionDevice::new(inner.clone(), 10, 4).unwrap();
        region.write_block(1, &[9u8; 512]).unwrap();
        assert_eq!(inner.block(11)[0], 9);
        assert!(region.write_block(4, &[0u8; 512]).is_err());
        assert!(RegionDevice::new(inner, 14, 4).is_err());
    }
}
