// Journal Revoke Tables
// Records blocks that must not be replayed from the log at or before a given transaction

use crate::transaction::{tid_geq, tid_gt, Tid};
use std::collections::HashMap;

/// Block number -> highest transaction id that revoked it
#[derive(Debug, Default, Clone)]
pub struct RevokeTable {
    entries: HashMap<u64, Tid>,
}

impl RevokeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a revoke of `block` by transaction `tid`.
    ///
    /// Returns false when an entry already covered `tid`.
    pub fn record(&mut self, block: u64, tid: Tid) -> bool {
        match self.entries.get_mut(&block) {
            Some(existing) => {
                if tid_gt(tid, *existing) {
                    *existing = tid;
                    true
                } else {
                    false
                }
            }
            None => {
                self.entries.insert(block, tid);
                true
            }
        }
    }

    /// Whether a copy of `block` logged by transaction `tid` is revoked
    pub fn is_revoked(&self, block: u64, tid: Tid) -> bool {
        self.entries
            .get(&block)
            .map_or(false, |&revoked_by| tid_geq(revoked_by, tid))
    }

    /// Drop the revoke of `block` made by transaction `tid`, if that is
    /// the entry on record. Returns whether an entry was removed.
    pub fn cancel(&mut self, block: u64, tid: Tid) -> bool {
        if self.entries.get(&block) == Some(&tid) {
            self.entries.remove(&block);
            true
        } else {
            false
        }
    }

    pub fn get(&self, block: u64) -> Option<Tid> {
        self.entries.get(&block).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Revoked block numbers in ascending order
    pub fn blocks(&self) -> Vec<u64> {
        let mut blocks: Vec<u64> = self.entries.keys().copied().collect();
        blocks.sort_unstable();
        blocks
    }
}

/// The pair of revoke tables owned by a journal
///
/// The active table collects revokes from the running transaction; the
/// other one holds the committing transaction's revokes while they are
/// written to the log. `swap` exchanges the roles at commit.
#[derive(Debug, Default)]
pub struct RevokeTables {
    tables: [RevokeTable; 2],
    active: usize,
}

impl RevokeTables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active(&self) -> &RevokeTable {
        &self.tables[self.active]
    }

    pub fn active_mut(&mut self) -> &mut RevokeTable {
        &mut self.tables[self.active]
    }

    /// Table being written out by the committing transaction
    pub fn building(&self) -> &RevokeTable {
        &self.tables[1 - self.active]
    }

    pub fn building_mut(&mut self) -> &mut RevokeTable {
        &mut self.tables[1 - self.active]
    }

    /// Index of the active table
    pub fn active_index(&self) -> usize {
        self.active
    }

    /// Hand the active table to the committer and start collecting into the other
    pub fn swap(&mut self) {
        debug_assert!(self.building().is_empty(), "building revoke table not drained");
        self.active = 1 - self.active;
    }

    pub fn clear(&mut self) {
        self.tables[0].clear();
        self.tables[1].clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_raises_to_max() {
        let mut table = RevokeTable::new();
        assert!(table.record(10, 5));
        assert!(table.record(10, 8));
        assert!(!table.record(10, 6));
        assert_eq!(table.get(10), Some(8));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_revoke_protects_only_up_to_revoker() {
        let mut table = RevokeTable::new();
        table.record(42, 3);
        table.record(42, 7);

        for tid in 0..=7 {
            assert!(table.is_revoked(42, tid), "tid {} should be revoked", tid);
        }
        assert!(!table.is_revoked(42, 8));
        assert!(!table.is_revoked(43, 1));
    }

    #[test]
    fn test_revoke_across_tid_wraparound() {
        let mut table = RevokeTable::new();
        table.record(1, u32::MAX - 1);
        table.record(1, 2);
        assert_eq!(table.get(1), Some(2));
        assert!(table.is_revoked(1, u32::MAX));
        assert!(!table.is_revoked(1, 3));
    }

    #[test]
    fn test_cancel_only_matching_revoker() {
        let mut table = RevokeTable::new();
        table.record(12, 4);
        assert!(!table.cancel(12, 3));
        assert!(!table.cancel(13, 4));
        assert!(table.is_revoked(12, 4));

        assert!(table.cancel(12, 4));
        assert!(!table.is_revoked(12, 4));
        assert!(table.is_empty());
    }

    #[test]
    fn test_swap_roles() {
        let mut tables = RevokeTables::new();
        tables.active_mut().record(5, 1);
        let before = tables.active_index();

        tables.swap();
        assert_ne!(tables.active_index(), before);
        assert!(tables.building().is_revoked(5, 1));
        assert!(tables.active().is_empty());

        tables.active_mut().record(6, 2);
        tables.building_mut().clear();
        tables.swap();
        assert!(tables.building().is_revoked(6, 2));
        assert!(tables.active().is_empty());
    }

    #[test]
    fn test_blocks_sorted() {
        let mut table = RevokeTable::new();
        for block in [9u64, 1, 5] {
            table.record(block, 1);
        }
        assert_eq!(table.blocks(), vec![1, 5, 9]);
        table.clear();
        assert!(table.is_empty());
    }
}
