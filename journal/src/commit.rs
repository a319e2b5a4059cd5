// Commit Pipeline
// Drives a transaction from PREPARE_COMMIT to FINISHED: quiesce, ordered data,
// revoke records, logged metadata and finally the commit record

use crate::format::{
    build_commit_block, build_revoke_block, escape, needs_escape, revoke_capacity, DescriptorBuilder,
};
use crate::journal::Journal;
use crate::record::{BlockRecord, BlockRecordState, LogSide};
use crate::transaction::{tid_geq, tid_gt, Tid, TransactionState};
use jbd_core::{end_buffer_io, flush_device, Buffer, IoDirection, JournalError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Descriptor block being filled plus the log copies it describes
struct PendingDescriptor {
    builder: DescriptorBuilder,
    buffer: Arc<Buffer>,
    copies: Vec<Arc<Buffer>>,
}

impl Journal {
    /// Commit the running transaction if a commit has been requested for it
    pub(crate) fn commit_requested(&self) -> Result<(), JournalError> {
        let _committer = self.commit_mutex.lock().unwrap();
        let tid = {
            let state = self.state.lock().unwrap();
            match state.running {
                Some(tid) if tid_geq(state.commit_request, tid) => tid,
                _ => return Ok(()),
            }
        };
        self.commit_transaction(tid)
    }

    /// Commit whatever is running and wait for it to become durable
    pub fn force_commit(&self) -> Result<Option<Tid>, JournalError> {
        let tid = {
            let mut state = self.state.lock().unwrap();
            match (state.running, state.committing) {
                (Some(tid), _) => {
                    self.request_commit(&mut state, tid);
                    Some(tid)
                }
                (None, committing) => committing,
            }
        };
        match tid {
            Some(tid) => {
                self.wait_for_commit(tid)?;
                Ok(Some(tid))
            }
            None => Ok(None),
        }
    }

    /// Block until transaction `tid` has committed
    pub fn wait_for_commit(&self, tid: Tid) -> Result<(), JournalError> {
        loop {
            let mut state = self.state.lock().unwrap();
            if tid_geq(state.commit_sequence, tid) {
                return if state.aborted {
                    Err(JournalError::Aborted(state.errno))
                } else {
                    Ok(())
                };
            }
            if tid_geq(tid, state.transaction_sequence) {
                return Err(JournalError::Other(format!("transaction {} has not started", tid)));
            }

            if state.running == Some(tid) {
                self.request_commit(&mut state, tid);
                if !self.has_commit_thread() {
                    drop(state);
                    self.commit_requested()?;
                    continue;
                }
            }
            let _state = self.wait_done_commit.wait(state).unwrap();
        }
    }

    /// Run the full pipeline for `tid`. Caller holds the commit mutex.
    ///
    /// I/O failures abort the journal; the pipeline still runs to FINISHED
    /// without writing anything further to the log.
    pub(crate) fn commit_transaction(&self, tid: Tid) -> Result<(), JournalError> {
        log::debug!("Committing transaction {}", tid);

        self.commit_quiesce(tid);

        if let Err(e) = self.commit_sync_data(tid) {
            log::error!("Ordered data write for transaction {} failed: {}", tid, e);
            self.abort_with(&e);
        }

        if let Err(e) = self.commit_write_revokes(tid) {
            log::error!("Revoke write for transaction {} failed: {}", tid, e);
            self.abort_with(&e);
        }

        self.commit_write_metadata(tid);

        if let Err(e) = self.commit_write_commit_record(tid) {
            log::error!("Commit record for transaction {} failed: {}", tid, e);
            self.abort_with(&e);
        }

        self.commit_finish(tid);
        self.check_aborted()
    }

    /// Phase 1: close the transaction to new handles and wait for the
    /// attached ones to stop
    fn commit_quiesce(&self, tid: Tid) {
        let mut state = self.state.lock().unwrap();
        self.advance(&mut state, tid, TransactionState::PrepareCommit);
        while state.txn(tid).users > 0 {
            state = self.wait_updates.wait(state).unwrap();
        }

        // write access taken but nothing dirtied
        let reserved = state.txn(tid).reserved.to_vec();
        for blocknr in reserved {
            state.refile_record(blocknr);
        }

        self.revoke.lock().unwrap().swap();

        let head = state.head;
        state.txn_mut(tid).start_block = head;
        state.committing = Some(tid);
        state.running = None;
        self.wait_transaction_locked.notify_all();
    }

    /// Phase 2: write ordered data home and wait for it
    fn commit_sync_data(&self, tid: Tid) -> Result<(), JournalError> {
        {
            let mut state = self.state.lock().unwrap();
            self.advance(&mut state, tid, TransactionState::SyncData);
        }

        let mut flushed = 0u64;
        loop {
            let mut state = self.state.lock().unwrap();
            let Some(blocknr) = state.txn(tid).dirty_data.first() else {
                break;
            };
            let buffer = match state.records.get(&blocknr) {
                Some(record) => Arc::clone(&record.buffer),
                None => panic!("data block {} queued without a record", blocknr),
            };
            // buffer lock ranks above the list lock: back off and sleep on the buffer
            if !buffer.try_lock() {
                drop(state);
                buffer.wait_unlocked();
                continue;
            }
            if buffer.test_clear_dirty() {
                state.file_record(blocknr, tid, BlockRecordState::LockedData);
                drop(state);
                self.home.device().submit(IoDirection::Write, &buffer, end_buffer_io());
                flushed += 1;
            } else {
                buffer.unlock();
                state.refile_record(blocknr);
            }
        }

        let mut failed = None;
        loop {
            let mut state = self.state.lock().unwrap();
            let Some(blocknr) = state.txn(tid).locked_data.first() else {
                break;
            };
            let buffer = match state.records.get(&blocknr) {
                Some(record) => Arc::clone(&record.buffer),
                None => panic!("data block {} queued without a record", blocknr),
            };
            if buffer.is_locked() {
                drop(state);
                buffer.wait_unlocked();
                continue;
            }
            if buffer.has_io_error() {
                buffer.clear_io_error();
                buffer.mark_dirty();
                failed.get_or_insert(blocknr);
            }
            state.refile_record(blocknr);
        }

        self.stats.write().unwrap().data_blocks_flushed += flushed;
        match failed {
            Some(blocknr) => Err(JournalError::device_io(blocknr, "ordered data write failed")),
            None => Ok(()),
        }
    }

    /// Phase 3: write the committing transaction's revoke records
    fn commit_write_revokes(&self, tid: Tid) -> Result<(), JournalError> {
        let blocks = {
            let mut tables = self.revoke.lock().unwrap();
            let blocks = tables.building().blocks();
            tables.building_mut().clear();
            blocks
        };
        if blocks.is_empty() || self.is_aborted() {
            return Ok(());
        }

        let mut written = Vec::new();
        for chunk in blocks.chunks(revoke_capacity(self.block_size)) {
            let log_block = self.state.lock().unwrap().next_log_block()?;
            let buffer = Arc::new(Buffer::with_data(log_block, build_revoke_block(self.block_size, tid, chunk)));
            self.state.lock().unwrap().txn_mut(tid).control.push(BlockRecord::log_block(
                Arc::clone(&buffer),
                tid,
                BlockRecordState::Control,
                false,
            ));
            buffer.lock();
            self.log_device.submit(IoDirection::Write, &buffer, end_buffer_io());
            written.push(buffer);
        }
        log::debug!("Transaction {} wrote {} revokes in {} blocks", tid, blocks.len(), written.len());
        self.stats.write().unwrap().revoke_blocks += written.len() as u64;

        for buffer in &written {
            buffer.wait_unlocked();
            if buffer.has_io_error() {
                return Err(JournalError::device_io(buffer.blocknr(), "revoke block write failed"));
            }
        }
        Ok(())
    }

    /// Phase 4: copy every dirty metadata buffer into the log behind
    /// descriptor blocks, then wait for the log writes
    fn commit_write_metadata(&self, tid: Tid) {
        {
            let mut state = self.state.lock().unwrap();
            self.advance(&mut state, tid, TransactionState::CommitMetadata);
        }

        let mut pending: Option<PendingDescriptor> = None;
        loop {
            let mut guard = self.state.lock().unwrap();
            let state = &mut *guard;
            let Some(blocknr) = state.txn(tid).metadata.first() else {
                break;
            };

            if state.aborted {
                if let Some(record) = state.records.get_mut(&blocknr) {
                    record.journal_dirty = false;
                    record.frozen_data = None;
                }
                state.file_record(blocknr, tid, BlockRecordState::Forget);
                continue;
            }

            if pending.is_none() {
                let log_block = match state.next_log_block() {
                    Ok(block) => block,
                    Err(e) => {
                        drop(guard);
                        self.abort_with(&e);
                        continue;
                    }
                };
                let buffer = Arc::new(Buffer::new(log_block, self.block_size));
                state.txn_mut(tid).control.push(BlockRecord::log_block(
                    Arc::clone(&buffer),
                    tid,
                    BlockRecordState::Control,
                    false,
                ));
                pending = Some(PendingDescriptor {
                    builder: DescriptorBuilder::new(self.block_size, tid, self.uuid),
                    buffer,
                    copies: Vec::new(),
                });
            }

            let log_block = match state.next_log_block() {
                Ok(block) => block,
                Err(e) => {
                    drop(guard);
                    self.abort_with(&e);
                    continue;
                }
            };

            let Some(record) = state.records.get_mut(&blocknr) else {
                panic!("metadata block {} queued without a record", blocknr);
            };
            let mut image = match record.frozen_data.take() {
                Some(frozen) => frozen,
                None => record.buffer.snapshot(),
            };
            let escaped = needs_escape(&image);
            if escaped {
                escape(&mut image);
            }
            record.escaped = escaped;
            state.file_record(blocknr, tid, BlockRecordState::LogMetadata(LogSide::Original));

            let copy = Arc::new(Buffer::with_data(log_block, image));
            state.txn_mut(tid).log_copies.push(BlockRecord::log_block(
                Arc::clone(&copy),
                tid,
                BlockRecordState::LogMetadata(LogSide::Copy),
                escaped,
            ));
            let last = state.txn(tid).metadata.is_empty();
            drop(guard);

            let Some(descriptor) = pending.as_mut() else {
                continue;
            };
            descriptor.builder.add_tag(blocknr as u32, escaped);
            descriptor.copies.push(copy);
            if last || descriptor.copies.len() >= self.descriptor_tags || !descriptor.builder.has_room() {
                self.submit_descriptor(pending.take());
            }
        }
        self.submit_descriptor(pending.take());

        // wait for every log write this transaction issued
        let buffers: Vec<Arc<Buffer>> = {
            let state = self.state.lock().unwrap();
            let txn = state.txn(tid);
            txn.control
                .iter()
                .chain(txn.log_copies.iter())
                .map(|record| Arc::clone(&record.buffer))
                .collect()
        };
        let mut failed = None;
        for buffer in &buffers {
            buffer.wait_unlocked();
            if buffer.has_io_error() {
                failed.get_or_insert(buffer.blocknr());
            }
        }

        {
            let mut state = self.state.lock().unwrap();
            let shadowed = state.txn(tid).log_metadata.to_vec();
            for blocknr in shadowed {
                state.file_record(blocknr, tid, BlockRecordState::Forget);
            }
            state.txn_mut(tid).log_copies.clear();
        }
        self.wait_unshadow.notify_all();

        if let Some(blocknr) = failed {
            let e = JournalError::device_io(blocknr, "log write failed");
            log::error!("Transaction {}: {}", tid, e);
            self.abort_with(&e);
        }
    }

    /// Write a filled descriptor followed by the copies it describes
    fn submit_descriptor(&self, pending: Option<PendingDescriptor>) {
        let Some(PendingDescriptor { builder, buffer, copies }) = pending else {
            return;
        };
        if self.is_aborted() {
            return;
        }
        buffer.copy_from(&builder.finish());
        buffer.lock();
        self.log_device.submit(IoDirection::Write, &buffer, end_buffer_io());
        for copy in &copies {
            copy.lock();
            self.log_device.submit(IoDirection::Write, copy, end_buffer_io());
        }

        let mut stats = self.stats.write().unwrap();
        stats.descriptor_blocks += 1;
        stats.blocks_logged += copies.len() as u64;
    }

    /// Phase 5: make the log durable and write the commit record
    fn commit_write_commit_record(&self, tid: Tid) -> Result<(), JournalError> {
        if self.is_aborted() {
            return Ok(());
        }

        // ordered data reaches its home location before the commit record
        flush_device(self.home.device().as_ref())?;

        let barrier = self.barrier.load(Ordering::SeqCst);
        if !barrier {
            self.log_device.flush()?;
        }

        let log_block = self.state.lock().unwrap().next_log_block()?;
        let buffer = Arc::new(Buffer::with_data(log_block, build_commit_block(self.block_size, tid)));
        self.state.lock().unwrap().txn_mut(tid).control.push(BlockRecord::log_block(
            Arc::clone(&buffer),
            tid,
            BlockRecordState::Control,
            false,
        ));

        let mut used_barrier = false;
        if barrier {
            let refused = Arc::new(AtomicBool::new(false));
            let flag = Arc::clone(&refused);
            buffer.lock();
            self.log_device.submit(
                IoDirection::WriteBarrier,
                &buffer,
                Box::new(move |buffer: &Buffer, result: Result<(), JournalError>| {
                    if matches!(result, Err(JournalError::BarrierUnsupported)) {
                        flag.store(true, Ordering::SeqCst);
                        buffer.unlock();
                    } else {
                        buffer.end_io(result);
                    }
                }),
            );
            buffer.wait_unlocked();

            if refused.load(Ordering::SeqCst) {
                log::warn!("Barrier-based sync failed on log device, disabling barriers");
                self.barrier.store(false, Ordering::SeqCst);
                self.log_device.flush()?;
            } else {
                used_barrier = true;
            }
        }

        if !used_barrier {
            buffer.lock();
            self.log_device.submit(IoDirection::Write, &buffer, end_buffer_io());
            buffer.wait_unlocked();
        }
        if buffer.has_io_error() {
            return Err(JournalError::device_io(log_block, "commit record write failed"));
        }
        if !used_barrier {
            self.log_device.flush()?;
        }
        Ok(())
    }

    /// Settle every logged buffer onto the checkpoint queue and hand
    /// buffers over to the running transaction
    fn commit_finish(&self, tid: Tid) {
        let mut state = self.state.lock().unwrap();
        let aborted = state.aborted;

        while let Some(blocknr) = state.txn(tid).forget.first() {
            let Some(record) = state.records.get_mut(&blocknr) else {
                panic!("forgotten block {} queued without a record", blocknr);
            };
            record.committed_data = None;
            record.frozen_data = None;
            let old_cp = record.cp_transaction;
            let journal_dirty = record.journal_dirty;

            if old_cp.is_some() && old_cp != Some(tid) {
                state.remove_checkpoint(blocknr);
            }
            if journal_dirty && !aborted {
                state.insert_checkpoint(blocknr, tid);
            } else if let Some(record) = state.records.get_mut(&blocknr) {
                record.journal_dirty = false;
            }
            state.refile_record(blocknr);
        }

        let control = std::mem::take(&mut state.txn_mut(tid).control);
        state.commit_sequence = tid;
        self.advance(&mut state, tid, TransactionState::Finished);
        state.committing = None;

        let logged = state.txn(tid).checkpoint.len();
        if logged == 0 {
            state.transactions.remove(&tid);
        } else {
            state.checkpoint_transactions.push_back(tid);
        }
        if tid_gt(tid, state.commit_request) {
            state.commit_request = tid;
        }
        drop(state);

        self.stats.write().unwrap().transactions_committed += 1;
        log::debug!(
            "Transaction {} committed: {} log control blocks, {} buffers to checkpoint",
            tid,
            control.len(),
            logged
        );
        self.wait_done_commit.notify_all();
        self.wait_transaction_locked.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use crate::record::BlockRecordState;
    use crate::{Journal, JournalConfig, TransactionState};
    use jbd_core::{BufferCache, MemoryDevice};
    use std::sync::{Arc, Mutex};

    fn journal(config: JournalConfig) -> (Arc<MemoryDevice>, Arc<Journal>) {
        let log = Arc::new(MemoryDevice::new(1024, 256));
        Journal::create(log.as_ref(), &config).unwrap();
        let home = Arc::new(BufferCache::new(Arc::new(MemoryDevice::new(1024, 64))));
        let journal = Journal::load(log.clone(), home, config).unwrap();
        (log, journal)
    }

    fn config() -> JournalConfig {
        JournalConfig {
            block_size: 1024,
            ..JournalConfig::default()
        }
    }

    #[test]
    fn test_commit_visits_every_state() {
        let (_log, journal) = journal(config());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        journal.set_transition_hook(Box::new(move |tid, state| sink.lock().unwrap().push((tid, state))));

        let buffer = journal.home().getblk(5);
        let mut handle = journal.start_transaction(1).unwrap();
        let tid = handle.tid();
        handle.attach_for_write(&buffer).unwrap();
        buffer.copy_from(&[7u8; 1024]);
        handle.mark_dirty(&buffer).unwrap();
        handle.stop().unwrap();
        assert_eq!(journal.force_commit().unwrap(), Some(tid));

        let states: Vec<TransactionState> = seen
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| *t == tid)
            .map(|(_, s)| *s)
            .collect();
        assert_eq!(
            states,
            vec![
                TransactionState::Running,
                TransactionState::PrepareCommit,
                TransactionState::SyncData,
                TransactionState::CommitMetadata,
                TransactionState::Finished,
            ]
        );
    }

    #[test]
    fn test_commit_layout() {
        let (log, journal) = journal(config());
        let buffer = journal.home().getblk(5);
        let mut handle = journal.start_transaction(1).unwrap();
        handle.attach_for_write(&buffer).unwrap();
        buffer.copy_from(&[7u8; 1024]);
        handle.mark_dirty(&buffer).unwrap();
        handle.stop().unwrap();
        journal.force_commit().unwrap();

        // descriptor, copy, commit record
        assert_eq!(log.block(2), vec![7u8; 1024]);
        assert_eq!(journal.head(), 4);
        assert_eq!(journal.checkpoint_transactions().len(), 1);
        assert!(buffer.is_dirty());
        assert_eq!(journal.record_state(5), Some(BlockRecordState::None));
    }

    #[test]
    fn test_empty_commit_writes_commit_record_only() {
        let (_log, journal) = journal(config());
        let handle = journal.start_transaction(1).unwrap();
        let tid = handle.tid();
        handle.stop().unwrap();
        journal.force_commit().unwrap();
        assert_eq!(journal.head(), 2);
        assert_eq!(journal.commit_sequence(), tid);
        assert!(journal.transaction_state(tid).is_none());
    }

    #[test]
    fn test_sync_handle_commits_on_stop() {
        let (_log, journal) = journal(config());
        let mut handle = journal.start_transaction(1).unwrap();
        let tid = handle.tid();
        handle.set_sync(true);
        handle.stop().unwrap();
        assert_eq!(journal.commit_sequence(), tid);
    }

    #[test]
    fn test_frozen_copy_and_revoked_handoff() {
        let (log, journal) = journal(config());
        let buffer = journal.home().getblk(5);
        let mut handle = journal.start_transaction(1).unwrap();
        let first = handle.tid();
        handle.attach_for_write(&buffer).unwrap();
        buffer.copy_from(&[7u8; 1024]);
        handle.mark_dirty(&buffer).unwrap();
        handle.stop().unwrap();

        // drive the first commit by hand so the next transaction overlaps it
        let _committer = journal.commit_mutex.lock().unwrap();
        journal.commit_quiesce(first);
        journal.commit_sync_data(first).unwrap();

        let mut next = journal.start_transaction(1).unwrap();
        assert_ne!(next.tid(), first);
        next.attach_for_write(&buffer).unwrap();
        {
            let state = journal.state.lock().unwrap();
            let record = &state.records[&5];
            assert_eq!(record.transaction, Some(first));
            assert_eq!(record.next_transaction, Some(next.tid()));
            assert_eq!(record.frozen_data.as_deref(), Some(&[7u8; 1024][..]));
        }
        buffer.copy_from(&[9u8; 1024]);
        next.mark_dirty(&buffer).unwrap();
        next.revoke(5).unwrap();
        assert_eq!(next.credits(), 1);
        assert_eq!(journal.state.lock().unwrap().records[&5].next_transaction, None);
        next.stop().unwrap();

        journal.commit_write_revokes(first).unwrap();
        journal.commit_write_metadata(first);
        journal.commit_write_commit_record(first).unwrap();
        journal.commit_finish(first);

        // the log holds the image frozen at hand-over, not the later change
        assert_eq!(log.block(2), vec![7u8; 1024]);
        assert_eq!(journal.record_state(5), Some(BlockRecordState::None));
    }

    #[test]
    fn test_barrier_refusal_downgrades() {
        let (log, journal) = journal(config());
        log.set_barrier_supported(false);
        assert!(journal.has_barrier());

        let handle = journal.start_transaction(1).unwrap();
        handle.stop().unwrap();
        journal.force_commit().unwrap();
        assert!(!journal.has_barrier());
        assert!(!journal.is_aborted());
    }
}
