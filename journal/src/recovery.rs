// Journal Recovery
// Three passes over the log after an unclean shutdown: find the end of the
// committed transactions, collect revoke records, replay what was not revoked

use crate::format::{parse_descriptor, parse_revoke_block, unescape, BlockType, JournalHeader, JournalSuperblock};
use crate::revoke::RevokeTable;
use crate::transaction::{tid_geq, Tid};
use jbd_core::{BlockDevice, BufferCache, JournalError};
use serde::Serialize;

/// Outcome of a recovery run
#[derive(Debug, Default, Clone, Serialize)]
pub struct RecoveryInfo {
    /// First transaction found in the log
    pub start_transaction: Tid,
    /// One past the last fully committed transaction
    pub end_transaction: Tid,
    /// Blocks copied to their home locations
    pub nr_replays: u64,
    /// Revoke entries read from the log
    pub nr_revokes: u64,
    /// Logged blocks skipped because they were revoked
    pub nr_revoke_hits: u64,
    /// The log could not be scanned and its contents were discarded
    pub ignored: bool,
    /// Log blocks that could not be read during replay
    pub io_errors: u64,
}

impl RecoveryInfo {
    /// Number of committed transactions found
    pub fn transactions(&self) -> u32 {
        self.end_transaction.wrapping_sub(self.start_transaction)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryPass {
    /// Find the last committed transaction
    Scan,
    /// Build the revoke table
    Revoke,
    /// Copy logged blocks home
    Replay,
}

pub struct RecoveryEngine<'a> {
    device: &'a dyn BlockDevice,
    superblock: &'a JournalSuperblock,
    revoke: RevokeTable,
    info: RecoveryInfo,
    scanned: bool,
}

impl<'a> RecoveryEngine<'a> {
    pub fn new(device: &'a dyn BlockDevice, superblock: &'a JournalSuperblock) -> Self {
        Self {
            device,
            superblock,
            revoke: RevokeTable::new(),
            info: RecoveryInfo {
                start_transaction: superblock.sequence,
                end_transaction: superblock.sequence,
                ..RecoveryInfo::default()
            },
            scanned: false,
        }
    }

    pub fn info(&self) -> &RecoveryInfo {
        &self.info
    }

    pub fn revoke_table(&self) -> &RevokeTable {
        &self.revoke
    }

    /// Whether the log holds anything to recover
    pub fn needs_recovery(&self) -> bool {
        self.superblock.start != 0
    }

    /// Find the committed transactions without touching anything else
    pub fn scan(&mut self) -> Result<(), JournalError> {
        self.scanned = true;
        if !self.needs_recovery() {
            return Ok(());
        }
        let result = self.do_one_pass(RecoveryPass::Scan, None);
        log::debug!(
            "Journal scan: transactions {}..{}",
            self.info.start_transaction,
            self.info.end_transaction
        );
        result
    }

    /// Replay every committed, non-revoked block into `home` and sync it
    pub fn replay(&mut self, home: &BufferCache) -> Result<RecoveryInfo, JournalError> {
        if !self.scanned {
            self.scan()?;
        }
        if !self.needs_recovery() {
            return Ok(self.info.clone());
        }

        self.do_one_pass(RecoveryPass::Revoke, None)?;
        let replayed = self.do_one_pass(RecoveryPass::Replay, Some(home));
        self.revoke.clear();

        // replayed blocks are on disk before the log is reset
        let synced = home.sync();
        replayed?;
        synced?;
        if self.info.io_errors > 0 {
            log::warn!(
                "{} log blocks were unreadable during replay; their home blocks were left as they were",
                self.info.io_errors
            );
        }

        log::info!(
            "Recovery complete: transactions {}..{}, {} blocks replayed, {} revoked, {} revoke records",
            self.info.start_transaction,
            self.info.end_transaction,
            self.info.nr_replays,
            self.info.nr_revoke_hits,
            self.info.nr_revokes
        );
        Ok(self.info.clone())
    }

    /// Run all three passes
    pub fn recover(&mut self, home: &BufferCache) -> Result<RecoveryInfo, JournalError> {
        self.scanned = false;
        self.replay(home)
    }

    fn wrap(&self, block: u64) -> u64 {
        let first = self.superblock.first as u64;
        let last = self.superblock.maxlen as u64;
        if block >= last {
            block - (last - first)
        } else {
            block
        }
    }

    /// Read the log block at `*block` and step past it
    fn read_log_block(&self, block: &mut u64, buf: &mut [u8]) -> Result<(), JournalError> {
        if *block >= self.superblock.maxlen as u64 {
            return Err(JournalError::corrupted(format!("log block {} beyond end of journal", block)));
        }
        self.device.read_block(*block, buf)?;
        *block = self.wrap(*block + 1);
        Ok(())
    }

    fn do_one_pass(&mut self, pass: RecoveryPass, home: Option<&BufferCache>) -> Result<(), JournalError> {
        let block_size = self.device.block_size();
        let mut next_commit_id = self.superblock.sequence;
        let mut next_log_block = self.superblock.start as u64;
        let mut buf = vec![0u8; block_size];
        // revokes of the transaction being read take effect at its commit
        let mut pending_revokes: Vec<u64> = Vec::new();

        let result = loop {
            // later passes stop at the end the scan found
            if pass != RecoveryPass::Scan && tid_geq(next_commit_id, self.info.end_transaction) {
                break Ok(());
            }

            let this_block = next_log_block;
            if let Err(e) = self.read_log_block(&mut next_log_block, &mut buf) {
                break Err(e);
            }

            let header = JournalHeader::parse(&buf);
            if !header.has_magic() || header.sequence != next_commit_id {
                break Ok(());
            }
            log::trace!(
                "{:?} pass: block {} type {} of transaction {}",
                pass,
                this_block,
                header.blocktype,
                next_commit_id
            );

            match header.block_type() {
                Some(BlockType::Descriptor) => {
                    let tags = parse_descriptor(&buf);
                    if pass != RecoveryPass::Replay {
                        next_log_block = self.wrap(next_log_block + tags.len() as u64);
                        continue;
                    }
                    let mut data = vec![0u8; block_size];
                    for tag in tags {
                        let log_block = next_log_block;
                        if let Err(e) = self.read_log_block(&mut next_log_block, &mut data) {
                            log::error!("I/O error recovering block {} from log block {}: {}", tag.blocknr, log_block, e);
                            self.info.io_errors += 1;
                            next_log_block = self.wrap(log_block + 1);
                            continue;
                        }
                        let target = tag.blocknr as u64;
                        if self.revoke.is_revoked(target, next_commit_id) {
                            self.info.nr_revoke_hits += 1;
                            continue;
                        }
                        let Some(home) = home else {
                            continue;
                        };
                        if tag.is_escaped() {
                            unescape(&mut data);
                        }
                        let buffer = home.getblk(target);
                        buffer.copy_from(&data);
                        buffer.set_uptodate();
                        buffer.mark_dirty();
                        self.info.nr_replays += 1;
                    }
                }
                Some(BlockType::Commit) => {
                    for block in pending_revokes.drain(..) {
                        self.revoke.record(block, next_commit_id);
                        self.info.nr_revokes += 1;
                    }
                    next_commit_id = next_commit_id.wrapping_add(1);
                }
                Some(BlockType::Revoke) => {
                    if pass == RecoveryPass::Revoke {
                        match parse_revoke_block(&buf) {
                            Ok(blocks) => pending_revokes.extend(blocks),
                            Err(e) => {
                                // the valid log ends before this transaction
                                log::warn!(
                                    "Damaged revoke record at log block {} ({}); recovery stops before transaction {}",
                                    this_block,
                                    e,
                                    next_commit_id
                                );
                                self.info.end_transaction = next_commit_id;
                                break Ok(());
                            }
                        }
                    }
                }
                _ => {
                    log::debug!("Unrecognised block type {} at log block {}", header.blocktype, this_block);
                    break Ok(());
                }
            }
        };

        if pass == RecoveryPass::Scan {
            self.info.end_transaction = next_commit_id;
            return result;
        }
        result?;
        if next_commit_id != self.info.end_transaction {
            return Err(JournalError::corrupted(format!(
                "{:?} pass ended at transaction {}, scan found {}",
                pass, next_commit_id, self.info.end_transaction
            )));
        }
        Ok(())
    }
}
