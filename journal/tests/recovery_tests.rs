// Crash Recovery Tests
// Simulated power loss: snapshot both devices mid-flight, reload, and check
// the home locations against what was committed

use jbd_core::{BufferCache, MemoryDevice};
use jbd_journal::{Journal, JournalConfig, RecoveryEngine, Tid};
use std::sync::Arc;

const BS: usize = 1024;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn config() -> JournalConfig {
    JournalConfig {
        block_size: BS as u32,
        ..JournalConfig::default()
    }
}

struct Devices {
    log: Arc<MemoryDevice>,
    home: Arc<MemoryDevice>,
}

impl Devices {
    fn new(log_blocks: u64, home_blocks: u64) -> Self {
        init_logging();
        let devices = Devices {
            log: Arc::new(MemoryDevice::new(BS, log_blocks)),
            home: Arc::new(MemoryDevice::new(BS, home_blocks)),
        };
        Journal::create(devices.log.as_ref(), &config()).unwrap();
        devices
    }

    fn mount(&self) -> Arc<Journal> {
        Journal::load(
            self.log.clone(),
            Arc::new(BufferCache::new(self.home.clone())),
            config(),
        )
        .unwrap()
    }

    /// What survives a power cut right now
    fn crash(&self) -> Devices {
        Devices {
            log: Arc::new(self.log.snapshot()),
            home: Arc::new(self.home.snapshot()),
        }
    }
}

fn write_metadata(journal: &Arc<Journal>, blocknr: u64, fill: u8) -> Tid {
    let buffer = journal.home().getblk(blocknr);
    let mut handle = journal.start_transaction(1).unwrap();
    handle.attach_for_write(&buffer).unwrap();
    buffer.copy_from(&[fill; BS]);
    handle.mark_dirty(&buffer).unwrap();
    let tid = handle.tid();
    handle.stop().unwrap();
    tid
}

#[test]
fn test_committed_metadata_survives_crash() {
    let devices = Devices::new(256, 64);
    let journal = devices.mount();
    write_metadata(&journal, 4, 0x44);
    write_metadata(&journal, 5, 0x55);
    journal.force_commit().unwrap();
    write_metadata(&journal, 4, 0x46);
    journal.force_commit().unwrap();

    let crashed = devices.crash();
    assert_eq!(crashed.home.block(4), vec![0u8; BS]);

    let recovered = crashed.mount();
    let info = recovered.recovery_info().unwrap();
    assert_eq!(info.transactions(), 2);
    assert_eq!(info.nr_replays, 3);
    assert!(!info.ignored);
    assert_eq!(crashed.home.block(4), vec![0x46; BS]);
    assert_eq!(crashed.home.block(5), vec![0x55; BS]);
}

#[test]
fn test_uncommitted_changes_are_lost() {
    let devices = Devices::new(256, 64);
    let journal = devices.mount();
    write_metadata(&journal, 4, 0x44);
    journal.force_commit().unwrap();
    // still running at the time of the crash
    write_metadata(&journal, 5, 0x55);

    let crashed = devices.crash();
    crashed.mount();
    assert_eq!(crashed.home.block(4), vec![0x44; BS]);
    assert_eq!(crashed.home.block(5), vec![0u8; BS]);
}

#[test]
fn test_recovery_is_idempotent() {
    let devices = Devices::new(256, 64);
    let journal = devices.mount();
    for (blocknr, fill) in [(1u64, 1u8), (2, 2), (3, 3)] {
        write_metadata(&journal, blocknr, fill);
        journal.force_commit().unwrap();
    }

    let crashed = devices.crash();
    let first = crashed.mount();
    let replayed = first.recovery_info().unwrap().clone();
    assert_eq!(replayed.transactions(), 3);
    assert_eq!(first.next_transaction_id(), replayed.end_transaction.wrapping_add(1));
    let home_after_first: Vec<Vec<u8>> = (0..8).map(|b| crashed.home.block(b)).collect();

    // crash again before anything new commits
    let again = crashed.crash();
    let second = again.mount();
    let info = second.recovery_info().unwrap();
    assert_eq!(info.transactions(), 0);
    assert_eq!(info.nr_replays, 0);
    let home_after_second: Vec<Vec<u8>> = (0..8).map(|b| again.home.block(b)).collect();
    assert_eq!(home_after_first, home_after_second);
    assert_eq!(info.start_transaction, first.next_transaction_id());
}

#[test]
fn test_revoked_block_is_not_replayed() {
    let devices = Devices::new(256, 64);
    let journal = devices.mount();
    write_metadata(&journal, 7, 0x77);
    journal.force_commit().unwrap();

    let mut handle = journal.start_transaction(1).unwrap();
    handle.revoke(7).unwrap();
    handle.stop().unwrap();
    journal.force_commit().unwrap();
    assert_eq!(journal.stats().revoke_blocks, 1);

    let crashed = devices.crash();
    let recovered = crashed.mount();
    let info = recovered.recovery_info().unwrap();
    assert_eq!(info.nr_revokes, 1);
    assert_eq!(info.nr_revoke_hits, 1);
    assert_eq!(crashed.home.block(7), vec![0u8; BS]);
}

#[test]
fn test_revoke_after_reuse_in_same_transaction() {
    let devices = Devices::new(256, 64);
    let journal = devices.mount();
    write_metadata(&journal, 7, 0x70);

    // block 7 reused then revoked inside the next transaction
    journal.force_commit().unwrap();
    let buffer = journal.home().getblk(7);
    let mut handle = journal.start_transaction(2).unwrap();
    handle.attach_for_write(&buffer).unwrap();
    buffer.copy_from(&[0x71; BS]);
    handle.mark_dirty(&buffer).unwrap();
    handle.revoke(7).unwrap();
    handle.stop().unwrap();
    journal.force_commit().unwrap();

    let crashed = devices.crash();
    crashed.mount();
    assert_eq!(crashed.home.block(7), vec![0u8; BS]);
}

#[test]
fn test_block_reused_after_revoke_in_same_transaction() {
    let devices = Devices::new(256, 64);
    let journal = devices.mount();
    write_metadata(&journal, 7, 0x70);
    journal.force_commit().unwrap();

    let buffer = journal.home().getblk(7);
    let mut handle = journal.start_transaction(2).unwrap();
    handle.revoke(7).unwrap();
    handle.attach_for_write(&buffer).unwrap();
    buffer.copy_from(&[0xAB; BS]);
    handle.mark_dirty(&buffer).unwrap();
    handle.stop().unwrap();
    journal.force_commit().unwrap();
    assert_eq!(journal.stats().revoke_blocks, 0);

    let crashed = devices.crash();
    let recovered = crashed.mount();
    let info = recovered.recovery_info().unwrap();
    assert_eq!(info.transactions(), 2);
    assert_eq!(info.nr_revokes, 0);
    assert_eq!(info.nr_revoke_hits, 0);
    assert_eq!(crashed.home.block(7), vec![0xAB; BS]);
}

#[test]
fn test_block_rewritten_after_revoke_is_replayed() {
    let devices = Devices::new(256, 64);
    let journal = devices.mount();
    write_metadata(&journal, 7, 0x70);
    journal.force_commit().unwrap();

    let mut handle = journal.start_transaction(1).unwrap();
    handle.revoke(7).unwrap();
    handle.stop().unwrap();
    journal.force_commit().unwrap();

    write_metadata(&journal, 7, 0x72);
    journal.force_commit().unwrap();

    let crashed = devices.crash();
    crashed.mount();
    assert_eq!(crashed.home.block(7), vec![0x72; BS]);
}

#[test]
fn test_escaped_metadata_round_trips() {
    let devices = Devices::new(256, 64);
    let journal = devices.mount();
    let mut image = vec![0x5Au8; BS];
    image[..4].copy_from_slice(&jbd_journal::JBD_MAGIC_NUMBER.to_be_bytes());

    let buffer = journal.home().getblk(9);
    let mut handle = journal.start_transaction(1).unwrap();
    handle.attach_for_write(&buffer).unwrap();
    buffer.copy_from(&image);
    handle.mark_dirty(&buffer).unwrap();
    handle.stop().unwrap();
    journal.force_commit().unwrap();
    // the log copy must not look like a journal block
    assert_eq!(&devices.log.block(2)[..4], &[0u8; 4]);

    let crashed = devices.crash();
    crashed.mount();
    assert_eq!(crashed.home.block(9), image);
}

#[test]
fn test_crash_after_wrap() {
    let devices = Devices::new(64, 32);
    let journal = devices.mount();
    let mut expected = vec![0u8; 16];
    for round in 0..60u64 {
        let blocknr = round % 16;
        write_metadata(&journal, blocknr, round as u8 + 1);
        expected[blocknr as usize] = round as u8 + 1;
        journal.force_commit().unwrap();
    }
    assert!(journal.tail() > 1 || journal.head() < journal.tail());

    let crashed = devices.crash();
    crashed.mount();
    for blocknr in 0..16u64 {
        assert_eq!(crashed.home.block(blocknr), vec![expected[blocknr as usize]; BS]);
    }
}

#[test]
fn test_clean_shutdown_needs_no_recovery() {
    let devices = Devices::new(256, 64);
    let journal = devices.mount();
    let tid = write_metadata(&journal, 3, 3);
    journal.destroy().unwrap();
    assert_eq!(journal.superblock().start, 0);
    assert_eq!(devices.home.block(3), vec![3u8; BS]);

    let remounted = devices.mount();
    assert!(remounted.recovery_info().is_none());
    assert!(jbd_journal::tid_gt(remounted.next_transaction_id(), tid));
}

#[test]
fn test_unreadable_log_is_ignored() {
    let devices = Devices::new(256, 64);
    let journal = devices.mount();
    write_metadata(&journal, 4, 4);
    journal.force_commit().unwrap();

    let crashed = devices.crash();
    // descriptor at 1, copy at 2, commit record at 3
    crashed.log.fail_reads_from(3);
    let recovered = crashed.mount();
    let info = recovered.recovery_info().unwrap();
    assert!(info.ignored);
    assert_eq!(crashed.home.block(4), vec![0u8; BS]);

    // the reset log accepts new transactions
    crashed.log.clear_failures();
    write_metadata(&recovered, 6, 6);
    recovered.force_commit().unwrap();
    assert!(!recovered.is_aborted());
}

#[test]
fn test_damaged_revoke_record_ends_log() {
    let devices = Devices::new(256, 64);
    let journal = devices.mount();
    write_metadata(&journal, 7, 7);
    journal.force_commit().unwrap();
    let mut handle = journal.start_transaction(1).unwrap();
    handle.revoke(7).unwrap();
    handle.stop().unwrap();
    journal.force_commit().unwrap();

    let crashed = devices.crash();
    // revoke block follows the first transaction's three blocks
    let mut revoke = crashed.log.block(4);
    revoke[12..16].copy_from_slice(&(BS as u32 + 4).to_be_bytes());
    crashed.log.set_block(4, &revoke);

    let recovered = crashed.mount();
    let info = recovered.recovery_info().unwrap();
    assert_eq!(info.transactions(), 1);
    assert_eq!(info.nr_revokes, 0);
    assert_eq!(crashed.home.block(7), vec![7u8; BS]);
    assert_eq!(recovered.next_transaction_id(), info.end_transaction.wrapping_add(1));
}

#[test]
fn test_read_only_scan_reports_transactions() {
    let devices = Devices::new(256, 64);
    let journal = devices.mount();
    write_metadata(&journal, 4, 4);
    journal.force_commit().unwrap();
    write_metadata(&journal, 5, 5);
    journal.force_commit().unwrap();

    let crashed = devices.crash();
    let superblock = Journal::read_superblock(crashed.log.as_ref()).unwrap();
    let mut engine = RecoveryEngine::new(crashed.log.as_ref(), &superblock);
    engine.scan().unwrap();
    assert_eq!(engine.info().transactions(), 2);
    assert_eq!(crashed.home.block(4), vec![0u8; BS]);
}
