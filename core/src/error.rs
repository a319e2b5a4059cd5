use thiserror::Error;

/// POSIX-style error codes recorded in the journal superblock
pub const EIO: i32 = 5;
pub const ENOMEM: i32 = 12;
pub const EINVAL: i32 = 22;
pub const ENOSPC: i32 = 28;
pub const EROFS: i32 = 30;

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Device I/O failed on block {block}: {reason}")]
    DeviceIo { block: u64, reason: String },

    #[error("Write barrier not supported by device")]
    BarrierUnsupported,

    #[error("Journal aborted (errno {0})")]
    Aborted(i32),

    #[error("Journal corrupted: {0}")]
    Corrupted(String),

    #[error("Journal has no space: needed {needed} blocks, {available} available")]
    NoSpace { needed: u64, available: u64 },

    #[error("Transaction too large: requested {requested} credits, limit {limit}")]
    TooManyCredits { requested: u32, limit: u32 },

    #[error("Handle has no buffer credits left")]
    CreditsExhausted,

    #[error("Block {0} is not attached to this transaction")]
    NotAttached(u64),

    #[error("Unsupported journal feature: {0}")]
    Unsupported(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Other error: {0}")]
    Other(String),
}

impl JournalError {
    /// Error code stored in the superblock when this error aborts the journal
    pub fn errno(&self) -> i32 {
        match self {
            JournalError::Io(_) | JournalError::DeviceIo { .. } => EIO,
            JournalError::BarrierUnsupported => EIO,
            JournalError::Aborted(errno) => *errno,
            JournalError::Corrupted(_) => EIO,
            JournalError::NoSpace { .. } => ENOSPC,
            JournalError::TooManyCredits { .. } => ENOSPC,
            JournalError::CreditsExhausted => ENOSPC,
            JournalError::NotAttached(_) => EINVAL,
            JournalError::Unsupported(_) => EROFS,
            JournalError::Config(_) | JournalError::Serialization(_) => EINVAL,
            JournalError::Other(_) => EIO,
        }
    }

    /// Shorthand for a failed block transfer
    pub fn device_io(block: u64, reason: impl Into<String>) -> Self {
        JournalError::DeviceIo { block, reason: reason.into() }
    }

    pub fn corrupted(reason: impl Into<String>) -> Self {
        JournalError::Corrupted(reason.into())
    }
}
