// JBD Write-Ahead Journal
// Transactional metadata logging with ordered data, checkpointing and crash recovery

pub mod checkpoint;
pub mod commit;
pub mod commit_thread;
pub mod config;
pub mod format;
pub mod handle;
pub mod journal;
pub mod record;
pub mod recovery;
pub mod revoke;
pub mod transaction;

pub use config::JournalConfig;
pub use format::{BlockTag, BlockType, JournalHeader, JournalSuperblock, JBD_MAGIC_NUMBER};
pub use handle::Handle;
pub use journal::{Journal, TransitionHook};
pub use record::{BlockRecord, BlockRecordState, LogSide};
pub use recovery::{RecoveryEngine, RecoveryInfo, RecoveryPass};
pub use revoke::{RevokeTable, RevokeTables};
pub use transaction::{tid_geq, tid_gt, Tid, Transaction, TransactionState};

use serde::Serialize;

/// Journal statistics
#[derive(Debug, Default, Clone, Serialize)]
pub struct JournalStats {
    /// Total transactions started
    pub transactions_started: u64,
    /// Total transactions committed
    pub transactions_committed: u64,
    /// Handles started
    pub handles_started: u64,
    /// Metadata blocks written to the log
    pub blocks_logged: u64,
    /// Descriptor blocks written
    pub descriptor_blocks: u64,
    /// Revoke blocks written
    pub revoke_blocks: u64,
    /// Ordered data blocks flushed before commit
    pub data_blocks_flushed: u64,
    /// Checkpoint passes run
    pub checkpoint_passes: u64,
    /// Buffers written back by checkpointing
    pub buffers_checkpointed: u64,
    /// Most recently committed transaction ID
    pub current_tid: u32,
    /// Oldest transaction ID in journal
    pub oldest_tid: u32,
}
