// Block Buffers
// In-memory block images shared between the buffer cache and the journal

use crate::device::{end_buffer_io, BlockDevice, IoDirection};
use crate::JournalError;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

/// Buffer state bits
#[derive(Debug, Default, Clone, Copy)]
struct BufferFlags {
    /// Contents match (or supersede) the on-disk block
    uptodate: bool,
    /// Contents must eventually be written to the block's home location
    dirty: bool,
    /// I/O in flight; owned by whoever set it
    locked: bool,
    /// Last I/O on this buffer failed
    io_error: bool,
}

/// A cached disk block
pub struct Buffer {
    blocknr: u64,
    data: Mutex<Vec<u8>>,
    flags: Mutex<BufferFlags>,
    unlocked: Condvar,
}

impl Buffer {
    /// Create a zero-filled buffer that is not yet uptodate
    pub fn new(blocknr: u64, size: usize) -> Self {
        Self {
            blocknr,
            data: Mutex::new(vec![0u8; size]),
            flags: Mutex::new(BufferFlags::default()),
            unlocked: Condvar::new(),
        }
    }

    /// Create an uptodate buffer holding `data`
    pub fn with_data(blocknr: u64, data: Vec<u8>) -> Self {
        let buffer = Self::new(blocknr, 0);
        *buffer.data.lock().unwrap() = data;
        buffer.set_uptodate();
        buffer
    }

    pub fn blocknr(&self) -> u64 {
        self.blocknr
    }

    pub fn size(&self) -> usize {
        self.data.lock().unwrap().len()
    }

    /// Borrow the block contents
    pub fn data(&self) -> MutexGuard<'_, Vec<u8>> {
        self.data.lock().unwrap()
    }

    /// Copy of the current contents
    pub fn snapshot(&self) -> Vec<u8> {
        self.data.lock().unwrap().clone()
    }

    /// Overwrite the leading bytes of the block with `src`
    pub fn copy_from(&self, src: &[u8]) {
        let mut data = self.data.lock().unwrap();
        let len = src.len().min(data.len());
        data[..len].copy_from_slice(&src[..len]);
    }

    pub fn is_uptodate(&self) -> bool {
        self.flags.lock().unwrap().uptodate
    }

    pub fn set_uptodate(&self) {
        self.flags.lock().unwrap().uptodate = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.flags.lock().unwrap().dirty
    }

    pub fn mark_dirty(&self) {
        self.flags.lock().unwrap().dirty = true;
    }

    pub fn clear_dirty(&self) {
        self.flags.lock().unwrap().dirty = false;
    }

    /// Clear the dirty bit, returning whether it was set
    pub fn test_clear_dirty(&self) -> bool {
        let mut flags = self.flags.lock().unwrap();
        std::mem::replace(&mut flags.dirty, false)
    }

    pub fn is_locked(&self) -> bool {
        self.flags.lock().unwrap().locked
    }

    /// Take the buffer lock without blocking
    pub fn try_lock(&self) -> bool {
        let mut flags = self.flags.lock().unwrap();
        if flags.locked {
            return false;
        }
        flags.locked = true;
        true
    }

    /// Take the buffer lock, sleeping while another owner holds it
    pub fn lock(&self) {
        let mut flags = self.flags.lock().unwrap();
        while flags.locked {
            flags = self.unlocked.wait(flags).unwrap();
        }
        flags.locked = true;
    }

    pub fn unlock(&self) {
        let mut flags = self.flags.lock().unwrap();
        flags.locked = false;
        self.unlocked.notify_all();
    }

    /// Sleep until no I/O is in flight on this buffer
    pub fn wait_unlocked(&self) {
        let mut flags = self.flags.lock().unwrap();
        while flags.locked {
            flags = self.unlocked.wait(flags).unwrap();
        }
    }

    pub fn has_io_error(&self) -> bool {
        self.flags.lock().unwrap().io_error
    }

    pub fn clear_io_error(&self) {
        self.flags.lock().unwrap().io_error = false;
    }

    /// Standard I/O completion: record the outcome and release the buffer lock
    pub fn end_io(&self, result: Result<(), JournalError>) {
        let mut flags = self.flags.lock().unwrap();
        match result {
            Ok(()) => {
                flags.uptodate = true;
                flags.io_error = false;
            }
            Err(e) => {
                log::warn!("I/O error on block {}: {}", self.blocknr, e);
                flags.io_error = true;
            }
        }
        flags.locked = false;
        self.unlocked.notify_all();
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flags = *self.flags.lock().unwrap();
        f.debug_struct("Buffer")
            .field("blocknr", &self.blocknr)
            .field("uptodate", &flags.uptodate)
            .field("dirty", &flags.dirty)
            .field("locked", &flags.locked)
            .field("io_error", &flags.io_error)
            .finish()
    }
}

/// Block cache over a single device
///
/// At most one `Buffer` exists per block number, so every component that
/// looks a block up shares the same in-memory image.
pub struct BufferCache {
    device: Arc<dyn BlockDevice>,
    buffers: Mutex<HashMap<u64, Arc<Buffer>>>,
}

impl BufferCache {
    pub fn new(device: Arc<dyn BlockDevice>) -> Self {
        Self {
            device,
            buffers: Mutex::new(HashMap::new()),
        }
    }

    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.device
    }

    pub fn block_size(&self) -> usize {
        self.device.block_size()
    }

    /// Look up a block without reading it from disk
    pub fn getblk(&self, blocknr: u64) -> Arc<Buffer> {
        let block_size = self.device.block_size();
        let mut buffers = self.buffers.lock().unwrap();
        buffers
            .entry(blocknr)
            .or_insert_with(|| Arc::new(Buffer::new(blocknr, block_size)))
            .clone()
    }

    /// Look up a block, reading it from disk if it is not uptodate
    pub fn bread(&self, blocknr: u64) -> Result<Arc<Buffer>, JournalError> {
        let buffer = self.getblk(blocknr);
        if buffer.is_uptodate() {
            return Ok(buffer);
        }

        buffer.lock();
        if !buffer.is_uptodate() {
            let result = {
                let mut data = buffer.data();
                self.device.read_block(blocknr, &mut data[..])
            };
            if let Err(e) = result {
                buffer.unlock();
                return Err(e);
            }
            buffer.set_uptodate();
        }
        buffer.unlock();
        Ok(buffer)
    }

    /// Cached buffer for `blocknr`, if any
    pub fn find(&self, blocknr: u64) -> Option<Arc<Buffer>> {
        self.buffers.lock().unwrap().get(&blocknr).cloned()
    }

    /// Write one dirty buffer to its home location and wait for it
    pub fn write_buffer(&self, buffer: &Arc<Buffer>) -> Result<(), JournalError> {
        buffer.lock();
        if !buffer.test_clear_dirty() {
            buffer.unlock();
            return Ok(());
        }
        self.device.submit(IoDirection::Write, buffer, end_buffer_io());
        buffer.wait_unlocked();
        if buffer.has_io_error() {
            buffer.mark_dirty();
            return Err(JournalError::device_io(buffer.blocknr(), "write-back failed"));
        }
        Ok(())
    }

    /// Write back every dirty buffer (filesystem write-back)
    pub fn sync_dirty(&self) -> Result<usize, JournalError> {
        let dirty: Vec<Arc<Buffer>> = {
            let buffers = self.buffers.lock().unwrap();
            let mut dirty: Vec<_> = buffers.values().filter(|b| b.is_dirty()).cloned().collect();
            dirty.sort_by_key(|b| b.blocknr());
            dirty
        };

        for buffer in &dirty {
            self.write_buffer(buffer)?;
        }
        Ok(dirty.len())
    }

    /// Write back dirty buffers and flush the device cache
    pub fn sync(&self) -> Result<(), JournalError> {
        let written = self.sync_dirty()?;
        log::debug!("Synced {} dirty buffers", written);
        self.device.flush()
    }

    /// Drop every clean, unlocked buffer nobody else references
    pub fn shrink(&self) {
        let mut buffers = self.buffers.lock().unwrap();
        buffers.retain(|_, b| Arc::strong_count(b) > 1 || b.is_dirty() || b.is_locked());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryDevice;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_buffer_lock_handoff() {
        let buffer = Arc::new(Buffer::new(9, 512));
        assert!(buffer.try_lock());
        assert!(!buffer.try_lock());

        let waiter = {
            let buffer = Arc::clone(&buffer);
            thread::spawn(move || {
                buffer.lock();
                buffer.unlock();
            })
        };

        thread::sleep(Duration::from_millis(20));
        buffer.end_io(Ok(()));
        waiter.join().unwrap();

        assert!(!buffer.is_locked());
        assert!(buffer.is_uptodate());
    }

    #[test]
    fn test_end_io_error() {
        let buffer = Buffer::new(1, 512);
        buffer.lock();
        buffer.end_io(Err(JournalError::device_io(1, "injected")));
        assert!(buffer.has_io_error());
        assert!(!buffer.is_locked());
    }

    #[test]
    fn test_cache_shares_buffers() {
        let device = Arc::new(MemoryDevice::new(1024, 16));
        device.set_block(3, &[0xAB; 1024]);
        let cache = BufferCache::new(device);

        let a = cache.bread(3).unwrap();
        let b = cache.getblk(3);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(b.data()[0], 0xAB);
    }

    #[test]
    fn test_sync_dirty_writes_home() {
        let device = Arc::new(MemoryDevice::new(1024, 16));
        let cache = BufferCache::new(device.clone());

        let buffer = cache.getblk(5);
        buffer.copy_from(b"home");
        buffer.mark_dirty();
        assert_eq!(cache.sync_dirty().unwrap(), 1);

        assert!(!buffer.is_dirty());
        assert_eq!(&device.block(5)[..4], b"home");
    }

    #[test]
    fn test_failed_write_stays_dirty() {
        let device = Arc::new(MemoryDevice::new(1024, 16));
        device.fail_writes_to(2);
        let cache = BufferCache::new(device);

        let buffer = cache.getblk(2);
        buffer.mark_dirty();
        assert!(cache.write_buffer(&buffer).is_err());
        assert!(buffer.is_dirty());
    }
}
