// Journal Block Records
// Per-buffer bookkeeping binding a cached block to the transaction that owns it

use crate::transaction::Tid;
use jbd_core::Buffer;
use std::sync::Arc;

/// Which half of a logged metadata pair a record describes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogSide {
    /// The cached home-location buffer, frozen while its copy is written
    Original,
    /// The temporary log-block copy being written
    Copy,
}

/// Queue a block record currently sits on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockRecordState {
    /// Not on any transaction queue
    None,
    /// Write access taken, not yet dirtied
    Reserved,
    /// Ordered data waiting to be written before commit
    DirtyData,
    /// Ordered data write in flight
    LockedData,
    /// Dirty metadata waiting to be logged
    Metadata,
    /// Metadata being written to the log
    LogMetadata(LogSide),
    /// Logged or released; resolved after the commit record
    Forget,
    /// Descriptor or revoke block
    Control,
}

/// Journal state for one buffer
#[derive(Debug)]
pub struct BlockRecord {
    pub(crate) buffer: Arc<Buffer>,
    /// Transaction whose queue holds this record (non-owning)
    pub(crate) transaction: Option<Tid>,
    /// Running transaction waiting to take the buffer over after commit
    pub(crate) next_transaction: Option<Tid>,
    pub(crate) state: BlockRecordState,
    /// Transaction whose checkpoint queue holds this record
    pub(crate) cp_transaction: Option<Tid>,
    /// Log copy had its leading magic zeroed
    pub(crate) escaped: bool,
    /// Image the committing transaction logs while the running one modifies the buffer
    pub(crate) frozen_data: Option<Vec<u8>>,
    /// Pre-image kept for undo access
    pub(crate) committed_data: Option<Vec<u8>>,
    /// Contents changed and not yet made durable in the log
    pub(crate) journal_dirty: bool,
    /// Dirtied by the transaction that owns (or will own) the record
    pub(crate) modified: bool,
}

impl BlockRecord {
    pub fn new(buffer: Arc<Buffer>) -> Self {
        Self {
            buffer,
            transaction: None,
            next_transaction: None,
            state: BlockRecordState::None,
            cp_transaction: None,
            escaped: false,
            frozen_data: None,
            committed_data: None,
            journal_dirty: false,
            modified: false,
        }
    }

    /// Record for a log block written by the commit pipeline
    pub(crate) fn log_block(buffer: Arc<Buffer>, tid: Tid, state: BlockRecordState, escaped: bool) -> Self {
        let mut record = Self::new(buffer);
        record.transaction = Some(tid);
        record.state = state;
        record.escaped = escaped;
        record
    }

    pub fn blocknr(&self) -> u64 {
        self.buffer.blocknr()
    }

    pub fn buffer(&self) -> &Arc<Buffer> {
        &self.buffer
    }

    pub fn state(&self) -> BlockRecordState {
        self.state
    }

    pub fn transaction(&self) -> Option<Tid> {
        self.transaction
    }

    pub fn next_transaction(&self) -> Option<Tid> {
        self.next_transaction
    }

    pub fn cp_transaction(&self) -> Option<Tid> {
        self.cp_transaction
    }

    pub fn is_escaped(&self) -> bool {
        self.escaped
    }

    pub fn has_undo_copy(&self) -> bool {
        self.committed_data.is_some()
    }

    /// Nothing references the record any more
    pub(crate) fn is_idle(&self) -> bool {
        self.transaction.is_none()
            && self.next_transaction.is_none()
            && self.cp_transaction.is_none()
            && self.committed_data.is_none()
    }
}
