// Journal
// The circular log, its watermarks, and the transactions and block records it tracks

use crate::config::JournalConfig;
use crate::format::{descriptor_capacity, JournalSuperblock};
use crate::record::{BlockRecord, BlockRecordState};
use crate::recovery::{RecoveryEngine, RecoveryInfo};
use crate::revoke::RevokeTables;
use crate::transaction::{Tid, Transaction, TransactionState};
use crate::JournalStats;
use jbd_core::error::EROFS;
use jbd_core::{BlockDevice, BufferCache, JournalError};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::Instant;

/// Log blocks kept out of every free-space calculation
pub(crate) const MIN_LOG_RESERVED_BLOCKS: u64 = 7;

/// Smallest log a journal can be created on
pub const MIN_JOURNAL_BLOCKS: u64 = 32;

/// Observer for transaction state changes; must not call back into the journal
pub type TransitionHook = Box<dyn Fn(Tid, TransactionState) + Send + Sync>;

/// Usable log space for `free` free blocks
pub(crate) fn log_space(free: u64) -> u64 {
    let left = free.saturating_sub(MIN_LOG_RESERVED_BLOCKS);
    left - (left >> 3)
}

/// Everything guarded by the journal-wide list lock
pub(crate) struct JournalState {
    /// First usable log block
    pub(crate) first: u64,
    /// One past the last usable log block
    pub(crate) last: u64,
    /// Next log block to write
    pub(crate) head: u64,
    /// Oldest log block still referenced
    pub(crate) tail: u64,
    pub(crate) free: u64,
    /// Oldest transaction still in the log
    pub(crate) tail_sequence: Tid,
    /// Id the next transaction will get
    pub(crate) transaction_sequence: Tid,
    /// Most recently committed transaction
    pub(crate) commit_sequence: Tid,
    /// Highest transaction a commit has been requested for
    pub(crate) commit_request: Tid,

    pub(crate) running: Option<Tid>,
    pub(crate) committing: Option<Tid>,
    /// Committed transactions with buffers awaiting write-back, oldest first
    pub(crate) checkpoint_transactions: VecDeque<Tid>,
    pub(crate) transactions: HashMap<Tid, Transaction>,
    /// Block records keyed by home block number
    pub(crate) records: HashMap<u64, BlockRecord>,

    pub(crate) aborted: bool,
    pub(crate) errno: i32,
    pub(crate) err_acked: bool,
    pub(crate) unmounting: bool,
}

impl JournalState {
    pub(crate) fn txn(&self, tid: Tid) -> &Transaction {
        match self.transactions.get(&tid) {
            Some(t) => t,
            None => panic!("transaction {} is not tracked by the journal", tid),
        }
    }

    pub(crate) fn txn_mut(&mut self, tid: Tid) -> &mut Transaction {
        match self.transactions.get_mut(&tid) {
            Some(t) => t,
            None => panic!("transaction {} is not tracked by the journal", tid),
        }
    }

    pub(crate) fn space_left(&self) -> u64 {
        log_space(self.free)
    }

    /// Log space a new handle must find before it may join the running transaction
    pub(crate) fn space_needed(&self, max_transaction_buffers: u32) -> u64 {
        let committing = self
            .committing
            .and_then(|tid| self.transactions.get(&tid))
            .map_or(0, |t| t.outstanding_credits as u64);
        max_transaction_buffers as u64 + committing
    }

    /// Claim the next log block
    pub(crate) fn next_log_block(&mut self) -> Result<u64, JournalError> {
        if self.free == 0 {
            return Err(JournalError::NoSpace { needed: 1, available: 0 });
        }
        let block = self.head;
        self.head += 1;
        self.free -= 1;
        if self.head == self.last {
            self.head = self.first;
        }
        Ok(block)
    }

    /// Move a record onto queue `state` of transaction `tid`
    pub(crate) fn file_record(&mut self, blocknr: u64, tid: Tid, state: BlockRecordState) {
        let record = match self.records.get_mut(&blocknr) {
            Some(record) => record,
            None => panic!("filing untracked block {}", blocknr),
        };
        if let Some(owner) = record.transaction {
            assert_eq!(owner, tid, "block {} already owned by transaction {}", blocknr, owner);
            if let Some(t) = self.transactions.get_mut(&owner) {
                t.unlink(blocknr, record.state);
            }
        }
        record.transaction = Some(tid);
        record.state = state;
        self.txn_mut(tid).link(blocknr, state);
    }

    /// Take a record off its transaction queue
    pub(crate) fn unfile_record(&mut self, blocknr: u64) {
        let Some(record) = self.records.get_mut(&blocknr) else {
            return;
        };
        if let Some(owner) = record.transaction.take() {
            if let Some(t) = self.transactions.get_mut(&owner) {
                t.unlink(blocknr, record.state);
            }
        }
        record.state = BlockRecordState::None;
    }

    /// Hand a record to the transaction waiting for it, or let it go.
    ///
    /// Without a next transaction, pending journal changes become ordinary
    /// dirty data for write-back.
    pub(crate) fn refile_record(&mut self, blocknr: u64) {
        let Some(record) = self.records.get_mut(&blocknr) else {
            return;
        };
        match record.next_transaction.take() {
            Some(next) => {
                let state = if record.modified {
                    BlockRecordState::Metadata
                } else {
                    BlockRecordState::Reserved
                };
                if let Some(owner) = record.transaction.take() {
                    if let Some(t) = self.transactions.get_mut(&owner) {
                        t.unlink(blocknr, record.state);
                    }
                }
                record.state = BlockRecordState::None;
                self.file_record(blocknr, next, state);
            }
            None => {
                if record.journal_dirty {
                    record.journal_dirty = false;
                    record.buffer.mark_dirty();
                }
                record.modified = false;
                self.unfile_record(blocknr);
                self.release_if_idle(blocknr);
            }
        }
    }

    /// Forget a record nothing refers to any more
    pub(crate) fn release_if_idle(&mut self, blocknr: u64) {
        if self.records.get(&blocknr).map_or(false, |r| r.is_idle()) {
            self.records.remove(&blocknr);
        }
    }

    pub(crate) fn insert_checkpoint(&mut self, blocknr: u64, tid: Tid) {
        let Some(record) = self.records.get_mut(&blocknr) else {
            return;
        };
        if record.cp_transaction == Some(tid) {
            return;
        }
        debug_assert!(record.cp_transaction.is_none());
        record.cp_transaction = Some(tid);
        self.txn_mut(tid).checkpoint.push(blocknr);
    }

    /// Take a record off its checkpoint queue; returns true if that emptied
    /// and dropped the checkpointing transaction
    pub(crate) fn remove_checkpoint(&mut self, blocknr: u64) -> bool {
        let Some(cp) = self.records.get_mut(&blocknr).and_then(|r| r.cp_transaction.take()) else {
            return false;
        };
        let mut dropped = false;
        if let Some(t) = self.transactions.get_mut(&cp) {
            t.remove_checkpoint(blocknr);
            if t.checkpoint.is_empty() {
                dropped = self.drop_transaction_if_done(cp);
            }
        }
        self.release_if_idle(blocknr);
        dropped
    }

    /// Drop a finished transaction whose checkpoint queue has drained
    pub(crate) fn drop_transaction_if_done(&mut self, tid: Tid) -> bool {
        let done = self.transactions.get(&tid).map_or(false, |t| {
            t.state == TransactionState::Finished && t.checkpoint.is_empty()
        });
        if !done || self.committing == Some(tid) {
            return false;
        }
        self.checkpoint_transactions.retain(|&t| t != tid);
        self.transactions.remove(&tid);
        log::trace!("Transaction {} fully checkpointed", tid);
        true
    }
}

/// A write-ahead journal
pub struct Journal {
    pub(crate) config: JournalConfig,
    pub(crate) log_device: Arc<dyn BlockDevice>,
    pub(crate) home: Arc<BufferCache>,
    pub(crate) block_size: usize,
    pub(crate) uuid: [u8; 16],
    pub(crate) max_transaction_buffers: u32,
    /// Tags written per descriptor block
    pub(crate) descriptor_tags: usize,

    pub(crate) state: Mutex<JournalState>,
    pub(crate) superblock: Mutex<JournalSuperblock>,
    pub(crate) revoke: Mutex<RevokeTables>,

    /// Attached handle count of a transaction dropped to zero
    pub(crate) wait_updates: Condvar,
    /// Running transaction closed, or a new one may start
    pub(crate) wait_transaction_locked: Condvar,
    pub(crate) wait_done_commit: Condvar,
    /// A buffer's log copy finished writing
    pub(crate) wait_unshadow: Condvar,
    /// Wakes the commit thread
    pub(crate) wait_commit: Condvar,

    /// Single active committer
    pub(crate) commit_mutex: Mutex<()>,
    /// Single-slot semaphore serialising checkpoint runs
    pub(crate) checkpoint_mutex: Mutex<()>,

    /// Log device accepts barrier writes; cleared for good on first refusal
    pub(crate) barrier: AtomicBool,
    pub(crate) stats: RwLock<JournalStats>,
    pub(crate) transition_hook: RwLock<Option<TransitionHook>>,
    pub(crate) recovery_info: Option<RecoveryInfo>,
    pub(crate) commit_thread: Mutex<Option<JoinHandle<()>>>,
    pub(crate) commit_thread_active: AtomicBool,
}

impl Journal {
    /// Format a new, empty journal on `log_device`
    pub fn create(log_device: &dyn BlockDevice, config: &JournalConfig) -> Result<JournalSuperblock, JournalError> {
        config.validate()?;
        let block_size = log_device.block_size();
        if block_size != config.block_size as usize {
            return Err(JournalError::Config(format!(
                "device block size {} does not match configured block size {}",
                block_size, config.block_size
            )));
        }
        let maxlen = log_device.num_blocks();
        if maxlen < MIN_JOURNAL_BLOCKS {
            return Err(JournalError::Config(format!(
                "journal length {} too short, need at least {} blocks",
                maxlen, MIN_JOURNAL_BLOCKS
            )));
        }
        let maxlen = u32::try_from(maxlen)
            .map_err(|_| JournalError::Config(format!("journal length {} exceeds 32-bit block numbers", maxlen)))?;

        if config.zero_log_on_create {
            let zeros = vec![0u8; block_size];
            for block in 1..maxlen as u64 {
                log_device.write_block(block, &zeros)?;
            }
        }

        let superblock = JournalSuperblock::new(block_size as u32, maxlen, *uuid::Uuid::new_v4().as_bytes());
        let mut buf = vec![0u8; block_size];
        superblock.write(&mut buf);
        log_device.write_block(0, &buf)?;
        log_device.flush()?;

        log::info!(
            "Created journal: {} blocks of {} bytes, uuid {}",
            maxlen,
            block_size,
            uuid::Uuid::from_bytes(superblock.uuid)
        );
        Ok(superblock)
    }

    /// Read the journal superblock from block 0
    pub fn read_superblock(log_device: &dyn BlockDevice) -> Result<JournalSuperblock, JournalError> {
        let mut buf = vec![0u8; log_device.block_size()];
        log_device.read_block(0, &mut buf)?;
        JournalSuperblock::parse(&buf)
    }

    /// Mount a journal: validate it, replay committed transactions into
    /// `home`, and reset the log for new transactions
    pub fn load(
        log_device: Arc<dyn BlockDevice>,
        home: Arc<BufferCache>,
        config: JournalConfig,
    ) -> Result<Arc<Journal>, JournalError> {
        config.validate()?;
        let block_size = log_device.block_size();
        let mut superblock = Self::read_superblock(log_device.as_ref())?;
        superblock.validate(block_size, log_device.num_blocks())?;
        if home.block_size() != block_size {
            return Err(JournalError::Config(format!(
                "filesystem block size {} does not match journal block size {}",
                home.block_size(),
                block_size
            )));
        }

        let (next_tid, recovery_info) = if superblock.start == 0 {
            log::debug!("No recovery required, last transaction {}", superblock.sequence);
            (superblock.sequence.wrapping_add(1), None)
        } else {
            let mut engine = RecoveryEngine::new(log_device.as_ref(), &superblock);
            match engine.scan() {
                Ok(()) => {
                    let info = engine.replay(&home)?;
                    (info.end_transaction.wrapping_add(1), Some(info))
                }
                Err(e) => {
                    log::warn!("Error scanning journal ({}); ignoring its contents", e);
                    let mut info = engine.info().clone();
                    info.ignored = true;
                    (info.end_transaction.wrapping_add(1), Some(info))
                }
            }
        };

        let first = superblock.first as u64;
        let last = superblock.maxlen as u64;
        superblock.sequence = next_tid;
        superblock.start = superblock.first;

        // a running and a committing transaction must fit in the log together
        let log_limit = superblock.maxlen / 4;
        let max_transaction_buffers = match config.max_transaction_buffers {
            Some(requested) if requested > log_limit => {
                log::warn!(
                    "Transaction credit ceiling {} too large for a {} block log, using {}",
                    requested,
                    superblock.maxlen,
                    log_limit
                );
                log_limit
            }
            Some(requested) => requested,
            None => log_limit,
        }
        .max(1);
        let capacity = descriptor_capacity(block_size);
        let descriptor_tags = config.descriptor_tags.map_or(capacity, |tags| tags.min(capacity));

        let state = JournalState {
            first,
            last,
            head: first,
            tail: first,
            free: last - first,
            tail_sequence: next_tid,
            transaction_sequence: next_tid,
            commit_sequence: next_tid.wrapping_sub(1),
            commit_request: next_tid.wrapping_sub(1),
            running: None,
            committing: None,
            checkpoint_transactions: VecDeque::new(),
            transactions: HashMap::new(),
            records: HashMap::new(),
            aborted: false,
            errno: superblock.errno,
            err_acked: false,
            unmounting: false,
        };

        let journal = Journal {
            barrier: AtomicBool::new(config.barrier),
            config,
            log_device,
            home,
            block_size,
            uuid: superblock.uuid,
            max_transaction_buffers,
            descriptor_tags,
            state: Mutex::new(state),
            superblock: Mutex::new(superblock),
            revoke: Mutex::new(RevokeTables::new()),
            wait_updates: Condvar::new(),
            wait_transaction_locked: Condvar::new(),
            wait_done_commit: Condvar::new(),
            wait_unshadow: Condvar::new(),
            wait_commit: Condvar::new(),
            commit_mutex: Mutex::new(()),
            checkpoint_mutex: Mutex::new(()),
            stats: RwLock::new(JournalStats::default()),
            transition_hook: RwLock::new(None),
            recovery_info,
            commit_thread: Mutex::new(None),
            commit_thread_active: AtomicBool::new(false),
        };

        {
            let superblock = journal.superblock.lock().unwrap();
            journal.write_superblock(&superblock)?;
        }

        log::info!(
            "Journal loaded: {} log blocks, next transaction {}, {}",
            last - first,
            next_tid,
            match &journal.recovery_info {
                Some(info) if info.ignored => "contents ignored".to_string(),
                Some(info) => format!(
                    "recovered transactions {}..{} ({} blocks replayed, {} revoked)",
                    info.start_transaction, info.end_transaction, info.nr_replays, info.nr_revoke_hits
                ),
                None => "clean".to_string(),
            }
        );
        Ok(Arc::new(journal))
    }

    /// Commit everything and write all checkpointed buffers home
    pub fn flush(&self) -> Result<(), JournalError> {
        self.force_commit()?;
        {
            let mut state = self.state.lock().unwrap();
            while state.committing.is_some() {
                state = self.wait_done_commit.wait(state).unwrap();
            }
        }

        let _slot = self.checkpoint_mutex.lock().unwrap();
        loop {
            let pending = !self.state.lock().unwrap().checkpoint_transactions.is_empty();
            if !pending {
                break;
            }
            self.run_checkpoint()?;
        }
        self.cleanup_tail()?;
        self.check_aborted()
    }

    /// Flush the journal and mark it clean
    pub fn destroy(&self) -> Result<(), JournalError> {
        self.stop_commit_thread();
        let flushed = self.flush();

        let _slot = self.checkpoint_mutex.lock().unwrap();
        let sequence = {
            let mut state = self.state.lock().unwrap();
            state.unmounting = true;
            if state.aborted {
                return Err(JournalError::Aborted(state.errno));
            }
            state.tail_sequence = state.transaction_sequence;
            state.tail = 0;
            state.tail_sequence
        };
        flushed?;
        self.update_superblock(sequence, 0)?;
        log::info!("Journal closed cleanly at transaction {}", sequence);
        Ok(())
    }

    pub(crate) fn write_superblock(&self, superblock: &JournalSuperblock) -> Result<(), JournalError> {
        let mut buf = vec![0u8; self.block_size];
        superblock.write(&mut buf);
        self.log_device.write_block(0, &buf)?;
        self.log_device.flush()
    }

    /// Persist the log tail watermark
    pub(crate) fn update_superblock(&self, sequence: Tid, start: u64) -> Result<(), JournalError> {
        let mut superblock = self.superblock.lock().unwrap();
        superblock.sequence = sequence;
        superblock.start = start as u32;
        superblock.errno = self.state.lock().unwrap().errno;
        log::debug!("Updating journal superblock: sequence {}, start {}", sequence, start);
        self.write_superblock(&superblock)
    }

    fn record_errno(&self, errno: i32) -> Result<(), JournalError> {
        let mut superblock = self.superblock.lock().unwrap();
        superblock.errno = errno;
        self.write_superblock(&superblock)
    }

    /// Abort the journal. No further log writes happen and every later
    /// `start_transaction` fails.
    pub fn abort(&self, errno: i32) {
        {
            let mut state = self.state.lock().unwrap();
            if state.aborted {
                return;
            }
            state.aborted = true;
            if state.errno == 0 {
                state.errno = errno;
            }
        }
        log::error!("Journal aborted with errno {}", errno);
        self.wait_transaction_locked.notify_all();
        self.wait_done_commit.notify_all();
        self.wait_commit.notify_all();
        if let Err(e) = self.record_errno(errno) {
            log::warn!("Could not record journal error in superblock: {}", e);
        }
    }

    pub(crate) fn abort_with(&self, err: &JournalError) {
        self.abort(err.errno());
    }

    pub fn is_aborted(&self) -> bool {
        self.state.lock().unwrap().aborted
    }

    pub(crate) fn check_aborted(&self) -> Result<(), JournalError> {
        let state = self.state.lock().unwrap();
        if state.aborted {
            Err(JournalError::Aborted(state.errno))
        } else {
            Ok(())
        }
    }

    /// Error code recorded by the last abort
    pub fn errno(&self) -> i32 {
        self.state.lock().unwrap().errno
    }

    /// Reset the recorded error; refused while aborted
    pub fn clear_err(&self) -> Result<(), JournalError> {
        let mut state = self.state.lock().unwrap();
        if state.aborted {
            return Err(JournalError::Aborted(EROFS));
        }
        state.errno = 0;
        state.err_acked = false;
        Ok(())
    }

    /// Acknowledge the recorded error
    pub fn ack_err(&self) {
        let mut state = self.state.lock().unwrap();
        if state.errno != 0 {
            state.err_acked = true;
        }
    }

    pub fn is_err_acked(&self) -> bool {
        self.state.lock().unwrap().err_acked
    }

    pub fn set_transition_hook(&self, hook: TransitionHook) {
        *self.transition_hook.write().unwrap() = Some(hook);
    }

    /// Move transaction `tid` to its next state
    pub(crate) fn advance(&self, state: &mut JournalState, tid: Tid, next: TransactionState) {
        state.txn_mut(tid).advance(next);
        log::debug!("Transaction {} -> {:?}", tid, next);
        if let Some(hook) = self.transition_hook.read().unwrap().as_ref() {
            hook(tid, next);
        }
    }

    /// Open a new running transaction
    pub(crate) fn new_transaction(&self, state: &mut JournalState) -> Tid {
        let tid = state.transaction_sequence;
        state.transaction_sequence = tid.wrapping_add(1);
        let expires = Instant::now() + self.config.commit_interval();
        state.transactions.insert(tid, Transaction::new(tid, expires));
        state.running = Some(tid);
        self.stats.write().unwrap().transactions_started += 1;
        log::trace!("Starting transaction {}", tid);
        if let Some(hook) = self.transition_hook.read().unwrap().as_ref() {
            hook(tid, TransactionState::Running);
        }
        tid
    }

    pub fn config(&self) -> &JournalConfig {
        &self.config
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn uuid(&self) -> [u8; 16] {
        self.uuid
    }

    pub fn home(&self) -> &Arc<BufferCache> {
        &self.home
    }

    pub fn max_transaction_buffers(&self) -> u32 {
        self.max_transaction_buffers
    }

    pub fn descriptor_tags(&self) -> usize {
        self.descriptor_tags
    }

    pub fn has_barrier(&self) -> bool {
        self.barrier.load(Ordering::SeqCst)
    }

    /// Outcome of the recovery run at load, if the log was not clean
    pub fn recovery_info(&self) -> Option<&RecoveryInfo> {
        self.recovery_info.as_ref()
    }

    pub fn running_transaction(&self) -> Option<Tid> {
        self.state.lock().unwrap().running
    }

    pub fn committing_transaction(&self) -> Option<Tid> {
        self.state.lock().unwrap().committing
    }

    pub fn checkpoint_transactions(&self) -> Vec<Tid> {
        self.state.lock().unwrap().checkpoint_transactions.iter().copied().collect()
    }

    pub fn transaction_state(&self, tid: Tid) -> Option<TransactionState> {
        self.state.lock().unwrap().transactions.get(&tid).map(|t| t.state)
    }

    /// Queue the journal currently has `blocknr` on, if it tracks it
    pub fn record_state(&self, blocknr: u64) -> Option<BlockRecordState> {
        self.state.lock().unwrap().records.get(&blocknr).map(|r| r.state)
    }

    /// Undo pre-image captured for `blocknr`
    pub fn committed_data(&self, blocknr: u64) -> Option<Vec<u8>> {
        self.state
            .lock()
            .unwrap()
            .records
            .get(&blocknr)
            .and_then(|r| r.committed_data.clone())
    }

    pub fn free_blocks(&self) -> u64 {
        self.state.lock().unwrap().free
    }

    /// Log space available to new transactions
    pub fn space_left(&self) -> u64 {
        self.state.lock().unwrap().space_left()
    }

    pub fn head(&self) -> u64 {
        self.state.lock().unwrap().head
    }

    pub fn tail(&self) -> u64 {
        self.state.lock().unwrap().tail
    }

    pub fn tail_sequence(&self) -> Tid {
        self.state.lock().unwrap().tail_sequence
    }

    pub fn next_transaction_id(&self) -> Tid {
        self.state.lock().unwrap().transaction_sequence
    }

    pub fn commit_sequence(&self) -> Tid {
        self.state.lock().unwrap().commit_sequence
    }

    pub fn superblock(&self) -> JournalSuperblock {
        self.superblock.lock().unwrap().clone()
    }

    pub fn stats(&self) -> JournalStats {
        let mut stats = self.stats.read().unwrap().clone();
        let state = self.state.lock().unwrap();
        stats.current_tid = state.commit_sequence;
        stats.oldest_tid = state.tail_sequence;
        stats
    }
}
