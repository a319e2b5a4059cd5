// Journal Configuration

use crate::format::MIN_BLOCK_SIZE;
use jbd_core::JournalError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Journal tunables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JournalConfig {
    /// Log block size used when creating a journal
    pub block_size: u32,
    /// Idle commit interval (in seconds)
    pub commit_interval_secs: u64,
    /// Credit ceiling per transaction; defaults to a quarter of the log
    pub max_transaction_buffers: Option<u32>,
    /// Tags per descriptor block; defaults to what fits in a block
    pub descriptor_tags: Option<usize>,
    /// Buffers written per checkpoint batch
    pub checkpoint_batch: usize,
    /// Use barrier writes for commit records
    pub barrier: bool,
    /// Zero the log region when creating a journal
    pub zero_log_on_create: bool,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            block_size: 4096,
            commit_interval_secs: 5,
            max_transaction_buffers: None,
            descriptor_tags: None,
            checkpoint_batch: 64,
            barrier: true,
            zero_log_on_create: true,
        }
    }
}

impl JournalConfig {
    pub fn from_json(json: &str) -> Result<Self, JournalError> {
        let config: JournalConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, JournalError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    pub fn to_json(&self) -> Result<String, JournalError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn commit_interval(&self) -> Duration {
        Duration::from_secs(self.commit_interval_secs)
    }

    pub fn validate(&self) -> Result<(), JournalError> {
        let block_size = self.block_size as usize;
        if !block_size.is_power_of_two() || !(MIN_BLOCK_SIZE..=65536).contains(&block_size) {
            return Err(JournalError::Config(format!(
                "block size {} must be a power of two between {} and 65536",
                self.block_size, MIN_BLOCK_SIZE
            )));
        }
        if self.commit_interval_secs == 0 {
            return Err(JournalError::Config("commit interval must be at least one second".to_string()));
        }
        if self.checkpoint_batch == 0 {
            return Err(JournalError::Config("checkpoint batch must not be zero".to_string()));
        }
        if self.descriptor_tags == Some(0) {
            return Err(JournalError::Config("descriptor tag count must not be zero".to_string()));
        }
        if self.max_transaction_buffers == Some(0) {
            return Err(JournalError::Config("transaction credit ceiling must not be zero".to_string()));
        }
        Ok(())
    }
}
