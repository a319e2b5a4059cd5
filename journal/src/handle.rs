// Journal Handles
// The filesystem-facing API: one handle brackets one atomic filesystem operation

use crate::journal::{log_space, Journal, JournalState};
use crate::record::{BlockRecord, BlockRecordState, LogSide};
use crate::transaction::{tid_geq, Tid, TransactionState};
use jbd_core::error::EIO;
use jbd_core::{Buffer, JournalError};
use std::sync::Arc;
use std::time::Instant;

/// A filesystem operation's attachment to the running transaction
///
/// Dropping a handle without calling [`Handle::stop`] stops it anyway.
pub struct Handle {
    journal: Arc<Journal>,
    tid: Tid,
    /// Log blocks this handle may still dirty
    credits: u32,
    sync: bool,
    aborted: bool,
    stopped: bool,
}

impl Handle {
    pub fn tid(&self) -> Tid {
        self.tid
    }

    pub fn credits(&self) -> u32 {
        self.credits
    }

    pub fn journal(&self) -> &Arc<Journal> {
        &self.journal
    }

    /// Make `stop` wait for the transaction to commit
    pub fn set_sync(&mut self, sync: bool) {
        self.sync = sync;
    }

    pub fn is_sync(&self) -> bool {
        self.sync
    }

    /// Fail every later operation on this handle
    pub fn abort(&mut self) {
        self.aborted = true;
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    pub fn attach_for_write(&mut self, buffer: &Arc<Buffer>) -> Result<(), JournalError> {
        let journal = Arc::clone(&self.journal);
        journal.attach_for_write(self, buffer)
    }

    pub fn attach_for_undo_write(&mut self, buffer: &Arc<Buffer>) -> Result<(), JournalError> {
        let journal = Arc::clone(&self.journal);
        journal.attach_for_undo_write(self, buffer)
    }

    pub fn mark_dirty(&mut self, buffer: &Arc<Buffer>) -> Result<(), JournalError> {
        let journal = Arc::clone(&self.journal);
        journal.mark_dirty(self, buffer)
    }

    pub fn dirty_data(&mut self, buffer: &Arc<Buffer>) -> Result<(), JournalError> {
        let journal = Arc::clone(&self.journal);
        journal.dirty_data(self, buffer)
    }

    pub fn revoke(&mut self, blocknr: u64) -> Result<(), JournalError> {
        let journal = Arc::clone(&self.journal);
        journal.revoke(self, blocknr)
    }

    pub fn forget(&mut self, buffer: &Arc<Buffer>) -> Result<(), JournalError> {
        let journal = Arc::clone(&self.journal);
        journal.forget(self, buffer)
    }

    pub fn extend(&mut self, credits: u32) -> Result<bool, JournalError> {
        let journal = Arc::clone(&self.journal);
        journal.extend(self, credits)
    }

    pub fn stop(self) -> Result<(), JournalError> {
        let journal = Arc::clone(&self.journal);
        journal.stop(self)
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        if !self.stopped {
            let journal = Arc::clone(&self.journal);
            if let Err(e) = journal.stop_handle(self) {
                log::warn!("Stopping dropped handle for transaction {}: {}", self.tid, e);
            }
        }
    }
}

/// Journal blocks are addressed with 32-bit tags and revoke entries
fn check_blocknr(blocknr: u64) -> Result<(), JournalError> {
    if blocknr > u32::MAX as u64 {
        return Err(JournalError::Unsupported(format!(
            "block {} is beyond the journal's 32-bit block numbers",
            blocknr
        )));
    }
    Ok(())
}

enum Access {
    Granted,
    WaitShadow,
    WaitUnlocked(Arc<Buffer>),
}

impl Journal {
    /// Join the running transaction, creating one if needed, reserving
    /// `credits` log blocks for the caller
    pub fn start_transaction(self: &Arc<Self>, credits: u32) -> Result<Handle, JournalError> {
        if credits > self.max_transaction_buffers {
            return Err(JournalError::TooManyCredits {
                requested: credits,
                limit: self.max_transaction_buffers,
            });
        }

        loop {
            let mut guard = self.state.lock().unwrap();
            if guard.aborted {
                return Err(JournalError::Aborted(guard.errno));
            }

            let tid = match guard.running {
                Some(tid) => tid,
                None => self.new_transaction(&mut guard),
            };

            if guard.txn(tid).state != TransactionState::Running {
                let _guard = self.wait_transaction_locked.wait(guard).unwrap();
                continue;
            }

            // transaction full: close it and retry against the next one
            if guard.txn(tid).outstanding_credits + credits > self.max_transaction_buffers {
                log::debug!("Transaction {} full, requesting commit", tid);
                self.request_commit(&mut guard, tid);
                drop(guard);
                self.kick_commit(tid)?;
                let guard = self.state.lock().unwrap();
                if guard.running == Some(tid) && !guard.aborted {
                    let _guard = self.wait_transaction_locked.wait(guard).unwrap();
                }
                continue;
            }

            let needed = guard.space_needed(self.max_transaction_buffers);
            if guard.space_left() < needed {
                drop(guard);
                self.wait_for_space(needed)?;
                continue;
            }

            let txn = guard.txn_mut(tid);
            txn.outstanding_credits += credits;
            txn.users += 1;
            drop(guard);

            self.stats.write().unwrap().handles_started += 1;
            log::trace!("Handle on transaction {} with {} credits", tid, credits);
            return Ok(Handle {
                journal: Arc::clone(self),
                tid,
                credits,
                sync: false,
                aborted: false,
                stopped: false,
            });
        }
    }

    /// Add `credits` to a handle if the running transaction has room.
    ///
    /// Returns false when it does not; the caller should stop the handle
    /// and start a new one.
    pub fn extend(&self, handle: &mut Handle, credits: u32) -> Result<bool, JournalError> {
        let mut guard = self.state.lock().unwrap();
        self.check_handle(&guard, handle)?;
        let txn = guard.txn_mut(handle.tid);
        if txn.state != TransactionState::Running
            || txn.outstanding_credits + credits > self.max_transaction_buffers
        {
            return Ok(false);
        }
        txn.outstanding_credits += credits;
        handle.credits += credits;
        Ok(true)
    }

    fn check_handle(&self, state: &JournalState, handle: &Handle) -> Result<(), JournalError> {
        if handle.stopped {
            return Err(JournalError::Other("handle already stopped".to_string()));
        }
        if state.aborted {
            return Err(JournalError::Aborted(state.errno));
        }
        if handle.aborted {
            return Err(JournalError::Aborted(EIO));
        }
        Ok(())
    }

    /// Declare intent to modify `buffer` as metadata under `handle`
    pub fn attach_for_write(&self, handle: &mut Handle, buffer: &Arc<Buffer>) -> Result<(), JournalError> {
        self.get_write_access(handle, buffer, false)
    }

    /// Like `attach_for_write`, keeping a copy of the pre-modification
    /// contents readable through `committed_data` until commit
    pub fn attach_for_undo_write(&self, handle: &mut Handle, buffer: &Arc<Buffer>) -> Result<(), JournalError> {
        self.get_write_access(handle, buffer, true)
    }

    fn get_write_access(&self, handle: &Handle, buffer: &Arc<Buffer>, undo: bool) -> Result<(), JournalError> {
        let blocknr = buffer.blocknr();
        check_blocknr(blocknr)?;
        let tid = handle.tid;

        loop {
            let mut guard = self.state.lock().unwrap();
            self.check_handle(&guard, handle)?;
            let state = &mut *guard;
            let committing = state.committing;

            let record = state
                .records
                .entry(blocknr)
                .or_insert_with(|| BlockRecord::new(Arc::clone(buffer)));
            if !Arc::ptr_eq(&record.buffer, buffer) {
                return Err(JournalError::Other(format!(
                    "block {} is attached through a different buffer",
                    blocknr
                )));
            }

            let access = if record.transaction == Some(tid) || record.next_transaction == Some(tid) {
                Access::Granted
            } else if let Some(owner) = record.transaction {
                assert_eq!(
                    Some(owner),
                    committing,
                    "block {} held by transaction {} which is not committing",
                    blocknr,
                    owner
                );
                match record.state {
                    BlockRecordState::LogMetadata(LogSide::Original) => Access::WaitShadow,
                    BlockRecordState::LockedData => Access::WaitUnlocked(Arc::clone(&record.buffer)),
                    current => {
                        // freeze the image the committing transaction will log
                        if current == BlockRecordState::Metadata && record.frozen_data.is_none() {
                            record.frozen_data = Some(buffer.snapshot());
                        }
                        record.next_transaction = Some(tid);
                        record.modified = false;
                        Access::Granted
                    }
                }
            } else {
                record.modified = false;
                state.file_record(blocknr, tid, BlockRecordState::Reserved);
                Access::Granted
            };

            match access {
                Access::Granted => {
                    if undo {
                        if let Some(record) = state.records.get_mut(&blocknr) {
                            if record.committed_data.is_none() {
                                record.committed_data = Some(buffer.snapshot());
                            }
                        }
                    }
                    // reused after being revoked by this transaction: its new
                    // contents must replay
                    if self.revoke.lock().unwrap().active_mut().cancel(blocknr, tid) {
                        log::trace!("Revoke of block {} cancelled by transaction {}", blocknr, tid);
                    }
                    return Ok(());
                }
                Access::WaitShadow => {
                    log::trace!("Block {} is being logged, waiting", blocknr);
                    let _guard = self.wait_unshadow.wait(guard).unwrap();
                }
                Access::WaitUnlocked(buffer) => {
                    drop(guard);
                    buffer.wait_unlocked();
                }
            }
        }
    }

    /// Record that the handle modified `buffer`; consumes one credit the
    /// first time per transaction
    pub fn mark_dirty(&self, handle: &mut Handle, buffer: &Arc<Buffer>) -> Result<(), JournalError> {
        let blocknr = buffer.blocknr();
        let tid = handle.tid;
        let mut guard = self.state.lock().unwrap();
        self.check_handle(&guard, handle)?;
        let state = &mut *guard;

        let record = state.records.get_mut(&blocknr).ok_or(JournalError::NotAttached(blocknr))?;
        let owned = record.transaction == Some(tid);
        if !owned && record.next_transaction != Some(tid) {
            return Err(JournalError::NotAttached(blocknr));
        }
        if !record.modified {
            if handle.credits == 0 {
                return Err(JournalError::CreditsExhausted);
            }
            handle.credits -= 1;
            record.modified = true;
        }
        record.journal_dirty = true;
        if owned && record.state != BlockRecordState::Metadata {
            state.file_record(blocknr, tid, BlockRecordState::Metadata);
        }
        Ok(())
    }

    /// Queue `buffer` as ordered data: written home before this
    /// transaction's commit record
    pub fn dirty_data(&self, handle: &mut Handle, buffer: &Arc<Buffer>) -> Result<(), JournalError> {
        let blocknr = buffer.blocknr();
        let tid = handle.tid;

        loop {
            let mut guard = self.state.lock().unwrap();
            self.check_handle(&guard, handle)?;
            let state = &mut *guard;

            let record = state
                .records
                .entry(blocknr)
                .or_insert_with(|| BlockRecord::new(Arc::clone(buffer)));
            match (record.transaction, record.state) {
                (Some(owner), BlockRecordState::Reserved) if owner == tid => {
                    state.file_record(blocknr, tid, BlockRecordState::DirtyData);
                }
                (Some(owner), _) if owner == tid => {}
                // in flight for the committing transaction; our writes must not race it
                (Some(_), BlockRecordState::LockedData) => {
                    let buffer = Arc::clone(&record.buffer);
                    drop(guard);
                    buffer.wait_unlocked();
                    continue;
                }
                // the committing transaction writes it before our commit anyway
                (Some(_), _) => {}
                (None, _) => {
                    state.file_record(blocknr, tid, BlockRecordState::DirtyData);
                }
            }
            buffer.mark_dirty();
            return Ok(());
        }
    }

    /// Prevent replay of any logged copy of `blocknr` from this or earlier
    /// transactions
    pub fn revoke(&self, handle: &mut Handle, blocknr: u64) -> Result<(), JournalError> {
        check_blocknr(blocknr)?;
        {
            let guard = self.state.lock().unwrap();
            self.check_handle(&guard, handle)?;
        }
        if self.revoke.lock().unwrap().active_mut().record(blocknr, handle.tid) {
            log::trace!("Block {} revoked by transaction {}", blocknr, handle.tid);
        }

        let mut guard = self.state.lock().unwrap();
        self.forget_locked(&mut guard, handle, blocknr);
        Ok(())
    }

    /// Discard pending changes to a buffer being freed
    pub fn forget(&self, handle: &mut Handle, buffer: &Arc<Buffer>) -> Result<(), JournalError> {
        let mut guard = self.state.lock().unwrap();
        self.check_handle(&guard, handle)?;
        self.forget_locked(&mut guard, handle, buffer.blocknr());
        Ok(())
    }

    fn forget_locked(&self, state: &mut JournalState, handle: &mut Handle, blocknr: u64) {
        let tid = handle.tid;
        let Some(record) = state.records.get_mut(&blocknr) else {
            return;
        };

        if record.transaction == Some(tid) {
            record.journal_dirty = false;
            record.buffer.clear_dirty();
            if record.modified {
                record.modified = false;
                handle.credits += 1;
            }
            if record.cp_transaction.is_some() {
                // an older commit of this block still awaits checkpoint;
                // our commit drops it from that queue
                state.file_record(blocknr, tid, BlockRecordState::Forget);
            } else {
                record.committed_data = None;
                record.frozen_data = None;
                state.unfile_record(blocknr);
                state.release_if_idle(blocknr);
            }
        } else if record.next_transaction == Some(tid) {
            record.next_transaction = None;
            if record.modified {
                record.modified = false;
                handle.credits += 1;
            }
        } else if record.transaction.is_none() && record.cp_transaction.is_some() {
            record.buffer.clear_dirty();
            state.file_record(blocknr, tid, BlockRecordState::Forget);
        }
    }

    /// Detach a handle, returning unused credits. Sync handles wait for
    /// their transaction to commit.
    pub fn stop(&self, mut handle: Handle) -> Result<(), JournalError> {
        self.stop_handle(&mut handle)
    }

    pub(crate) fn stop_handle(&self, handle: &mut Handle) -> Result<(), JournalError> {
        if handle.stopped {
            return Ok(());
        }
        handle.stopped = true;
        let tid = handle.tid;

        let commit = {
            let mut guard = self.state.lock().unwrap();
            let max = self.max_transaction_buffers;
            let txn = guard.txn_mut(tid);
            txn.outstanding_credits = txn.outstanding_credits.saturating_sub(handle.credits);
            txn.users -= 1;
            let idle = txn.users == 0;
            let mut commit = handle.sync || txn.outstanding_credits > max || Instant::now() >= txn.expires;
            if idle {
                self.wait_updates.notify_all();
            }
            if guard.running == Some(tid) {
                if commit {
                    self.request_commit(&mut guard, tid);
                } else if tid_geq(guard.commit_request, tid) {
                    commit = true;
                }
            }
            commit
        };
        handle.credits = 0;

        if handle.sync {
            self.wait_for_commit(tid)?;
        } else if commit {
            self.kick_commit(tid)?;
        }
        if handle.aborted {
            return Err(JournalError::Aborted(EIO));
        }
        Ok(())
    }

    /// Ask for `tid` to be committed
    pub(crate) fn request_commit(&self, state: &mut JournalState, tid: Tid) {
        if !tid_geq(state.commit_request, tid) {
            state.commit_request = tid;
            log::trace!("Commit of transaction {} requested", tid);
        }
        self.wait_commit.notify_all();
    }

    /// Without a commit thread the requester commits inline
    pub(crate) fn kick_commit(&self, tid: Tid) -> Result<(), JournalError> {
        if self.has_commit_thread() {
            return Ok(());
        }
        let users = self.state.lock().unwrap().transactions.get(&tid).map_or(0, |t| t.users);
        if users > 0 {
            // the last handle out commits
            return Ok(());
        }
        self.commit_requested()
    }

    /// Largest credit request that can ever be satisfied
    pub(crate) fn max_space(&self) -> u64 {
        let state = self.state.lock().unwrap();
        log_space(state.last - state.first)
    }
}

#[cfg(test)]
mod tests {
    use crate::{JournalConfig, Journal};
    use jbd_core::{BufferCache, JournalError, MemoryDevice};
    use std::sync::Arc;

    fn journal() -> Arc<Journal> {
        let config = JournalConfig {
            block_size: 1024,
            ..JournalConfig::default()
        };
        let log = Arc::new(MemoryDevice::new(1024, 128));
        Journal::create(log.as_ref(), &config).unwrap();
        let home = Arc::new(BufferCache::new(Arc::new(MemoryDevice::new(1024, 64))));
        Journal::load(log, home, config).unwrap()
    }

    #[test]
    fn test_credit_ceiling() {
        let journal = journal();
        let limit = journal.max_transaction_buffers();
        assert!(matches!(
            journal.start_transaction(limit + 1),
            Err(JournalError::TooManyCredits { .. })
        ));
        journal.start_transaction(limit).unwrap().stop().unwrap();
    }

    #[test]
    fn test_mark_dirty_consumes_one_credit_per_block() {
        let journal = journal();
        let buffer = journal.home().getblk(3);
        let mut handle = journal.start_transaction(2).unwrap();
        handle.attach_for_write(&buffer).unwrap();
        handle.mark_dirty(&buffer).unwrap();
        handle.mark_dirty(&buffer).unwrap();
        assert_eq!(handle.credits(), 1);
        handle.stop().unwrap();
    }

    #[test]
    fn test_mark_dirty_without_attach() {
        let journal = journal();
        let buffer = journal.home().getblk(3);
        let mut handle = journal.start_transaction(1).unwrap();
        assert!(matches!(handle.mark_dirty(&buffer), Err(JournalError::NotAttached(3))));
    }

    #[test]
    fn test_credits_exhausted() {
        let journal = journal();
        let a = journal.home().getblk(3);
        let b = journal.home().getblk(4);
        let mut handle = journal.start_transaction(1).unwrap();
        handle.attach_for_write(&a).unwrap();
        handle.attach_for_write(&b).unwrap();
        handle.mark_dirty(&a).unwrap();
        assert!(matches!(handle.mark_dirty(&b), Err(JournalError::CreditsExhausted)));
    }

    #[test]
    fn test_forget_refunds_credit() {
        let journal = journal();
        let buffer = journal.home().getblk(9);
        let mut handle = journal.start_transaction(1).unwrap();
        handle.attach_for_write(&buffer).unwrap();
        handle.mark_dirty(&buffer).unwrap();
        assert_eq!(handle.credits(), 0);
        handle.forget(&buffer).unwrap();
        assert_eq!(handle.credits(), 1);
        assert!(journal.record_state(9).is_none());
    }

    #[test]
    fn test_extend_within_ceiling() {
        let journal = journal();
        let limit = journal.max_transaction_buffers();
        let mut handle = journal.start_transaction(1).unwrap();
        assert!(handle.extend(limit - 1).unwrap());
        assert!(!handle.extend(1).unwrap());
        assert_eq!(handle.credits(), limit);
    }

    #[test]
    fn test_write_access_cancels_own_revoke() {
        let journal = journal();
        let buffer = journal.home().getblk(7);
        let mut handle = journal.start_transaction(1).unwrap();
        handle.revoke(7).unwrap();
        assert_eq!(journal.revoke.lock().unwrap().active().get(7), Some(handle.tid()));

        handle.attach_for_write(&buffer).unwrap();
        assert!(journal.revoke.lock().unwrap().active().get(7).is_none());
        handle.stop().unwrap();
    }

    #[test]
    fn test_dropped_handle_is_stopped() {
        let journal = journal();
        let tid = {
            let handle = journal.start_transaction(1).unwrap();
            handle.tid()
        };
        let state = journal.state.lock().unwrap();
        assert_eq!(state.txn(tid).users, 0);
        assert_eq!(state.txn(tid).outstanding_credits, 0);
    }

    #[test]
    fn test_aborted_handle_fails() {
        let journal = journal();
        let buffer = journal.home().getblk(1);
        let mut handle = journal.start_transaction(1).unwrap();
        handle.abort();
        assert!(handle.attach_for_write(&buffer).is_err());
        assert!(handle.stop().is_err());
    }
}
