// Checkpointing
// Writes committed buffers back to their home locations so log space can be reused

use crate::journal::Journal;
use crate::transaction::Tid;
use jbd_core::error::ENOSPC;
use jbd_core::{end_buffer_io, flush_device, Buffer, IoDirection, JournalError};
use std::sync::Arc;

enum Pass {
    /// Queue fully inspected
    Done,
    /// Something was written or waited on; inspect the queue again
    Again,
}

impl Journal {
    /// Write back checkpointed buffers and advance the log tail
    pub fn checkpoint(&self) -> Result<(), JournalError> {
        let _slot = self.checkpoint_mutex.lock().unwrap();
        self.run_checkpoint()
    }

    /// One checkpoint run over every transaction on the checkpoint list,
    /// oldest first. Caller holds the checkpoint slot.
    pub(crate) fn run_checkpoint(&self) -> Result<(), JournalError> {
        let pending: Vec<Tid> = self
            .state
            .lock()
            .unwrap()
            .checkpoint_transactions
            .iter()
            .copied()
            .collect();
        log::debug!("Checkpointing {} transactions", pending.len());

        for tid in pending {
            while let Pass::Again = self.checkpoint_pass(tid)? {}
        }
        self.stats.write().unwrap().checkpoint_passes += 1;
        self.finish_checkpoint()
    }

    /// Inspect the checkpoint queue of `tid` once
    fn checkpoint_pass(&self, tid: Tid) -> Result<Pass, JournalError> {
        let mut batch: Vec<Arc<Buffer>> = Vec::new();
        let mut guard = self.state.lock().unwrap();
        let queue = match guard.transactions.get(&tid) {
            Some(txn) => txn.checkpoint.to_vec(),
            None => return Ok(Pass::Done),
        };

        for blocknr in queue {
            let Some(record) = guard.records.get(&blocknr) else {
                if let Some(txn) = guard.transactions.get_mut(&tid) {
                    txn.remove_checkpoint(blocknr);
                }
                continue;
            };
            let buffer = Arc::clone(&record.buffer);

            // a newer transaction holds the buffer; its commit moves the record on
            if let Some(owner) = record.transaction {
                drop(guard);
                self.write_checkpoint_batch(&batch)?;
                log::trace!("Checkpoint of block {} waits for transaction {}", blocknr, owner);
                self.wait_for_commit(owner)?;
                return Ok(Pass::Again);
            }

            if buffer.has_io_error() {
                drop(guard);
                self.write_checkpoint_batch(&batch)?;
                let e = JournalError::device_io(blocknr, "checkpoint write-back failed");
                self.abort_with(&e);
                return Err(e);
            }

            if !buffer.try_lock() {
                drop(guard);
                self.write_checkpoint_batch(&batch)?;
                buffer.wait_unlocked();
                return Ok(Pass::Again);
            }

            if !buffer.is_dirty() {
                buffer.unlock();
                guard.remove_checkpoint(blocknr);
                continue;
            }

            batch.push(buffer);
            if batch.len() >= self.config.checkpoint_batch {
                drop(guard);
                self.write_checkpoint_batch(&batch)?;
                return Ok(Pass::Again);
            }
        }
        drop(guard);

        if batch.is_empty() {
            return Ok(Pass::Done);
        }
        self.write_checkpoint_batch(&batch)?;
        Ok(Pass::Again)
    }

    /// Write a batch of locked buffers home and wait for them
    fn write_checkpoint_batch(&self, batch: &[Arc<Buffer>]) -> Result<(), JournalError> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut written = 0u64;
        for buffer in batch {
            if buffer.test_clear_dirty() {
                self.home.device().submit(IoDirection::Write, buffer, end_buffer_io());
                written += 1;
            } else {
                buffer.unlock();
            }
        }
        self.stats.write().unwrap().buffers_checkpointed += written;

        for buffer in batch {
            buffer.wait_unlocked();
            if buffer.has_io_error() {
                buffer.mark_dirty();
                let e = JournalError::device_io(buffer.blocknr(), "checkpoint write-back failed");
                self.abort_with(&e);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Move the log tail past fully checkpointed transactions
    pub(crate) fn finish_checkpoint(&self) -> Result<(), JournalError> {
        self.cleanup_tail().map(|_| ())
    }

    /// Recompute the log tail from the oldest live transaction and persist
    /// it. Returns the number of log blocks freed. Caller holds the
    /// checkpoint slot.
    pub(crate) fn cleanup_tail(&self) -> Result<u64, JournalError> {
        let (first_tid, blocknr, freed, aborted) = {
            let mut state = self.state.lock().unwrap();
            let (first_tid, blocknr) = if let Some(&tid) = state.checkpoint_transactions.front() {
                (tid, state.txn(tid).start_block)
            } else if let Some(tid) = state.committing {
                (tid, state.txn(tid).start_block)
            } else if let Some(tid) = state.running {
                (tid, state.head)
            } else {
                (state.transaction_sequence, state.head)
            };

            if state.tail_sequence == first_tid && state.tail == blocknr {
                return Ok(0);
            }
            let mut freed = blocknr.wrapping_sub(state.tail);
            if blocknr < state.tail {
                freed = blocknr + (state.last - state.first) - state.tail;
            }
            state.free += freed;
            state.tail_sequence = first_tid;
            state.tail = blocknr;
            (first_tid, blocknr, freed, state.aborted)
        };

        log::debug!(
            "Cleaning journal tail to block {} (transaction {}), freed {} blocks",
            blocknr,
            first_tid,
            freed
        );
        if !aborted {
            // home copies are durable before the log forgets them
            flush_device(self.home.device().as_ref())?;
            self.update_superblock(first_tid, blocknr)?;
        }
        Ok(freed)
    }

    /// Block until the log has room for `needed` more blocks, checkpointing
    /// and committing as required. Runs behind the checkpoint slot so only
    /// one thread reclaims space at a time.
    pub fn wait_for_space(&self, needed: u64) -> Result<(), JournalError> {
        let capacity = self.max_space();
        if needed > capacity {
            return Err(JournalError::NoSpace {
                needed,
                available: capacity,
            });
        }

        let _slot = self.checkpoint_mutex.lock().unwrap();
        loop {
            let (space, has_checkpoint, busy) = {
                let state = self.state.lock().unwrap();
                if state.aborted {
                    return Err(JournalError::Aborted(state.errno));
                }
                (
                    state.space_left(),
                    !state.checkpoint_transactions.is_empty(),
                    state.committing.or(state.running),
                )
            };
            if space >= needed {
                return Ok(());
            }

            if has_checkpoint {
                self.run_checkpoint()?;
                continue;
            }
            if self.cleanup_tail()? > 0 {
                continue;
            }
            if let Some(tid) = busy {
                self.wait_for_commit(tid)?;
                continue;
            }

            log::error!("Journal needs {} blocks but only {} are available", needed, space);
            let e = JournalError::NoSpace { needed, available: space };
            self.abort(ENOSPC);
            return Err(e);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{Journal, JournalConfig};
    use jbd_core::{BufferCache, MemoryDevice};
    use std::sync::Arc;

    fn journal() -> (Arc<MemoryDevice>, Arc<Journal>) {
        let config = JournalConfig {
            block_size: 1024,
            ..JournalConfig::default()
        };
        let log = Arc::new(MemoryDevice::new(1024, 64));
        Journal::create(log.as_ref(), &config).unwrap();
        let home = Arc::new(MemoryDevice::new(1024, 64));
        let journal = Journal::load(log, Arc::new(BufferCache::new(home.clone())), config).unwrap();
        (home, journal)
    }

    fn write_block(journal: &Arc<Journal>, blocknr: u64, fill: u8) {
        let buffer = journal.home().getblk(blocknr);
        let mut handle = journal.start_transaction(1).unwrap();
        handle.attach_for_write(&buffer).unwrap();
        buffer.copy_from(&vec![fill; 1024]);
        handle.mark_dirty(&buffer).unwrap();
        handle.stop().unwrap();
    }

    #[test]
    fn test_checkpoint_writes_home_and_frees_log() {
        let (home, journal) = journal();
        write_block(&journal, 10, 0xAB);
        journal.force_commit().unwrap();
        let free = journal.free_blocks();
        assert_eq!(home.block(10), vec![0u8; 1024]);

        journal.checkpoint().unwrap();
        assert_eq!(home.block(10), vec![0xAB; 1024]);
        assert!(journal.checkpoint_transactions().is_empty());
        assert_eq!(journal.free_blocks(), free + 3);
        assert_eq!(journal.superblock().start as u64, journal.tail());
    }

    #[test]
    fn test_checkpoint_forces_newer_owner() {
        let (home, journal) = journal();
        write_block(&journal, 10, 1);
        journal.force_commit().unwrap();

        // block 10 is now owned by a running transaction again
        let buffer = journal.home().getblk(10);
        let mut handle = journal.start_transaction(1).unwrap();
        handle.attach_for_write(&buffer).unwrap();
        buffer.copy_from(&[2u8; 1024]);
        handle.mark_dirty(&buffer).unwrap();
        handle.stop().unwrap();

        journal.checkpoint().unwrap();
        journal.checkpoint().unwrap();
        assert_eq!(home.block(10), vec![2u8; 1024]);
        assert!(journal.checkpoint_transactions().is_empty());
    }

    #[test]
    fn test_space_is_reclaimed_under_pressure() {
        let (_home, journal) = journal();
        for round in 0..40u64 {
            write_block(&journal, round % 8, round as u8);
            journal.force_commit().unwrap();
        }
        assert!(!journal.is_aborted());
        assert!(journal.stats().checkpoint_passes > 0);
    }

    #[test]
    fn test_impossible_space_request() {
        let (_home, journal) = journal();
        assert!(journal.wait_for_space(10_000).is_err());
        assert!(!journal.is_aborted());
    }
}
