// Journal Transactions
// Transaction ids, the commit state machine and per-transaction block queues

use crate::record::{BlockRecord, BlockRecordState, LogSide};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

/// Transaction id; compared with wraparound-safe helpers, never raw `<`
pub type Tid = u32;

/// `x` is strictly after `y`
pub fn tid_gt(x: Tid, y: Tid) -> bool {
    (x.wrapping_sub(y) as i32) > 0
}

/// `x` is `y` or after it
pub fn tid_geq(x: Tid, y: Tid) -> bool {
    (x.wrapping_sub(y) as i32) >= 0
}

/// Later of two transaction ids
pub fn tid_max(x: Tid, y: Tid) -> Tid {
    if tid_gt(y, x) {
        y
    } else {
        x
    }
}

/// Transaction states, entered strictly in declaration order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TransactionState {
    /// Accepting handles
    Running,
    /// Closed to new handles, waiting for attached handles to stop
    PrepareCommit,
    /// Writing ordered data to home locations
    SyncData,
    /// Writing revoke, descriptor, metadata and commit blocks to the log
    CommitMetadata,
    /// Commit record durable (or journal aborted)
    Finished,
}

impl TransactionState {
    pub fn next(self) -> Option<Self> {
        match self {
            TransactionState::Running => Some(TransactionState::PrepareCommit),
            TransactionState::PrepareCommit => Some(TransactionState::SyncData),
            TransactionState::SyncData => Some(TransactionState::CommitMetadata),
            TransactionState::CommitMetadata => Some(TransactionState::Finished),
            TransactionState::Finished => None,
        }
    }
}

/// An atomic group of block updates
#[derive(Debug)]
pub struct Transaction {
    pub(crate) id: Tid,
    pub(crate) state: TransactionState,
    /// First log block used by this transaction's commit
    pub(crate) start_block: u64,
    /// Upper bound on log blocks the transaction may still consume
    pub(crate) outstanding_credits: u32,
    /// Handles currently attached
    pub(crate) users: u32,

    pub(crate) reserved: BlockQueue,
    pub(crate) dirty_data: BlockQueue,
    pub(crate) locked_data: BlockQueue,
    pub(crate) metadata: BlockQueue,
    /// Originals whose log copies are in flight
    pub(crate) log_metadata: BlockQueue,
    pub(crate) forget: BlockQueue,
    pub(crate) checkpoint: BlockQueue,
    /// Log copies of metadata blocks
    pub(crate) log_copies: Vec<BlockRecord>,
    /// Descriptor and revoke blocks
    pub(crate) control: Vec<BlockRecord>,

    pub(crate) start_time: Instant,
    pub(crate) expires: Instant,
}

impl Transaction {
    pub(crate) fn new(id: Tid, expires: Instant) -> Self {
        Self {
            id,
            state: TransactionState::Running,
            start_block: 0,
            outstanding_credits: 0,
            users: 0,
            reserved: BlockQueue::default(),
            dirty_data: BlockQueue::default(),
            locked_data: BlockQueue::default(),
            metadata: BlockQueue::default(),
            log_metadata: BlockQueue::default(),
            forget: BlockQueue::default(),
            checkpoint: BlockQueue::default(),
            log_copies: Vec::new(),
            control: Vec::new(),
            start_time: Instant::now(),
            expires,
        }
    }

    pub fn id(&self) -> Tid {
        self.id
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn users(&self) -> u32 {
        self.users
    }

    pub fn outstanding_credits(&self) -> u32 {
        self.outstanding_credits
    }

    pub fn start_block(&self) -> u64 {
        self.start_block
    }

    /// Move to the next state; anything else is a broken invariant
    pub(crate) fn advance(&mut self, next: TransactionState) {
        assert_eq!(
            self.state.next(),
            Some(next),
            "transaction {} cannot move from {:?} to {:?}",
            self.id,
            self.state,
            next
        );
        self.state = next;
    }

    /// Queue holding home-location records in `state`
    pub(crate) fn queue_mut(&mut self, state: BlockRecordState) -> Option<&mut BlockQueue> {
        match state {
            BlockRecordState::Reserved => Some(&mut self.reserved),
            BlockRecordState::DirtyData => Some(&mut self.dirty_data),
            BlockRecordState::LockedData => Some(&mut self.locked_data),
            BlockRecordState::Metadata => Some(&mut self.metadata),
            BlockRecordState::LogMetadata(LogSide::Original) => Some(&mut self.log_metadata),
            BlockRecordState::Forget => Some(&mut self.forget),
            BlockRecordState::None | BlockRecordState::LogMetadata(LogSide::Copy) | BlockRecordState::Control => None,
        }
    }

    pub(crate) fn link(&mut self, blocknr: u64, state: BlockRecordState) {
        match self.queue_mut(state) {
            Some(queue) => queue.push(blocknr),
            None => panic!("block {} cannot be queued as {:?}", blocknr, state),
        }
    }

    pub(crate) fn unlink(&mut self, blocknr: u64, state: BlockRecordState) -> bool {
        self.queue_mut(state).map_or(false, |queue| queue.remove(blocknr))
    }

    pub(crate) fn remove_checkpoint(&mut self, blocknr: u64) -> bool {
        self.checkpoint.remove(blocknr)
    }

    /// Number of home-location records on the commit queues
    pub fn buffer_count(&self) -> usize {
        self.reserved.len()
            + self.dirty_data.len()
            + self.locked_data.len()
            + self.metadata.len()
            + self.log_metadata.len()
            + self.forget.len()
    }

    pub fn checkpoint_count(&self) -> usize {
        self.checkpoint.len()
    }
}

/// Block numbers in filing order, with removal by block number in
/// logarithmic time
#[derive(Debug, Default, Clone)]
pub(crate) struct BlockQueue {
    order: BTreeMap<u64, u64>,
    position: HashMap<u64, u64>,
    next_seq: u64,
}

impl BlockQueue {
    pub(crate) fn push(&mut self, blocknr: u64) {
        if self.contains(blocknr) {
            return;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.order.insert(seq, blocknr);
        self.position.insert(blocknr, seq);
    }

    pub(crate) fn remove(&mut self, blocknr: u64) -> bool {
        match self.position.remove(&blocknr) {
            Some(seq) => {
                self.order.remove(&seq);
                true
            }
            None => false,
        }
    }

    /// Oldest block still queued
    pub(crate) fn first(&self) -> Option<u64> {
        self.order.values().next().copied()
    }

    pub(crate) fn contains(&self, blocknr: u64) -> bool {
        self.position.contains_key(&blocknr)
    }

    pub(crate) fn len(&self) -> usize {
        self.order.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub(crate) fn to_vec(&self) -> Vec<u64> {
        self.order.values().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn transaction() -> Transaction {
        Transaction::new(1, Instant::now() + Duration::from_secs(5))
    }

    #[test]
    fn test_tid_comparison_wraps() {
        assert!(tid_gt(5, 4));
        assert!(!tid_gt(4, 4));
        assert!(tid_geq(4, 4));
        assert!(tid_gt(0, u32::MAX));
        assert!(tid_gt(3, u32::MAX - 3));
        assert!(!tid_geq(u32::MAX, 2));
        assert_eq!(tid_max(u32::MAX, 1), 1);
    }

    #[test]
    fn test_state_sequence() {
        let mut t = transaction();
        let mut seen = vec![t.state()];
        while let Some(next) = t.state().next() {
            t.advance(next);
            seen.push(next);
        }
        assert_eq!(
            seen,
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
    #[should_panic(expected = "cannot move")]
    fn test_state_cannot_skip() {
        let mut t = transaction();
        t.advance(TransactionState::SyncData);
    }

    #[test]
    #[should_panic(expected = "cannot move")]
    fn test_state_cannot_go_back() {
        let mut t = transaction();
        t.advance(TransactionState::PrepareCommit);
        t.advance(TransactionState::Running);
    }

    #[test]
    fn test_queue_link_unlink() {
        let mut t = transaction();
        t.link(10, BlockRecordState::Metadata);
        t.link(11, BlockRecordState::Metadata);
        t.link(12, BlockRecordState::DirtyData);
        assert_eq!(t.buffer_count(), 3);

        assert!(t.unlink(10, BlockRecordState::Metadata));
        assert!(!t.unlink(10, BlockRecordState::Metadata));
        assert!(!t.unlink(12, BlockRecordState::Metadata));
        assert_eq!(t.metadata.to_vec(), vec![11]);
    }

    #[test]
    fn test_queue_keeps_filing_order_across_removals() {
        let mut queue = BlockQueue::default();
        for blocknr in 0..1000u64 {
            queue.push(blocknr);
        }
        for blocknr in (0..1000u64).step_by(2) {
            assert!(queue.remove(blocknr));
        }
        assert_eq!(queue.len(), 500);
        assert_eq!(queue.first(), Some(1));
        assert!(!queue.contains(2));
        queue.push(2);
        assert_eq!(queue.to_vec().last(), Some(&2));
        assert_eq!(&queue.to_vec()[..3], &[1, 3, 5]);
    }

    #[test]
    #[should_panic(expected = "cannot be queued")]
    fn test_control_is_not_a_home_queue() {
        let mut t = transaction();
        t.link(1, BlockRecordState::Control);
    }
}
