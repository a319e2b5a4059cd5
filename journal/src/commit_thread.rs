// Background Commit Thread
// Commits the running transaction when a commit is requested or its interval expires

use crate::journal::Journal;
use crate::transaction::tid_geq;
use jbd_core::JournalError;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Instant;

impl Journal {
    /// Start the commit thread. Handles stop committing inline once it runs.
    pub fn spawn_commit_thread(self: &Arc<Self>) -> Result<(), JournalError> {
        let mut slot = self.commit_thread.lock().unwrap();
        if slot.is_some() {
            return Ok(());
        }
        self.state.lock().unwrap().unmounting = false;

        let journal = Arc::downgrade(self);
        let handle = thread::Builder::new()
            .name("jbd-commit".to_string())
            .spawn(move || commit_loop(journal))?;
        self.commit_thread_active.store(true, Ordering::SeqCst);
        *slot = Some(handle);
        log::info!("Commit thread started, interval {:?}", self.config.commit_interval());
        Ok(())
    }

    /// Stop the commit thread, committing anything it was asked to first
    pub fn stop_commit_thread(&self) {
        let Some(handle) = self.commit_thread.lock().unwrap().take() else {
            return;
        };
        self.state.lock().unwrap().unmounting = true;
        self.wait_commit.notify_all();
        if handle.join().is_err() {
            log::error!("Commit thread panicked");
        }
        self.commit_thread_active.store(false, Ordering::SeqCst);
        // waiters that relied on the thread now commit inline
        self.wait_done_commit.notify_all();
        log::debug!("Commit thread stopped");
    }

    pub fn has_commit_thread(&self) -> bool {
        self.commit_thread_active.load(Ordering::SeqCst)
    }
}

fn commit_loop(journal: Weak<Journal>) {
    loop {
        let Some(journal) = journal.upgrade() else {
            return;
        };

        {
            let mut state = journal.state.lock().unwrap();
            loop {
                let requested = state.running.map_or(false, |tid| tid_geq(state.commit_request, tid));
                if requested || state.unmounting {
                    break;
                }
                let expires = state.running.map(|tid| state.txn(tid).expires);
                match expires {
                    Some(expires) if Instant::now() >= expires => {
                        if let Some(tid) = state.running {
                            log::trace!("Transaction {} expired", tid);
                            state.commit_request = tid;
                        }
                        break;
                    }
                    Some(expires) => {
                        let timeout = expires.saturating_duration_since(Instant::now());
                        state = journal.wait_commit.wait_timeout(state, timeout).unwrap().0;
                    }
                    None => {
                        state = journal.wait_commit.wait(state).unwrap();
                    }
                }
            }
        }

        if let Err(e) = journal.commit_requested() {
            log::warn!("Background commit failed: {}", e);
        }

        let state = journal.state.lock().unwrap();
        if state.unmounting {
            let pending = state.running.map_or(false, |tid| tid_geq(state.commit_request, tid));
            drop(state);
            if pending {
                if let Err(e) = journal.commit_requested() {
                    log::warn!("Final commit failed: {}", e);
                }
            }
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{Journal, JournalConfig};
    use jbd_core::{BufferCache, MemoryDevice};
    use std::sync::Arc;
    use std::thread;

    fn journal() -> Arc<Journal> {
        let config = JournalConfig {
            block_size: 1024,
            commit_interval_secs: 1,
            ..JournalConfig::default()
        };
        let log = Arc::new(MemoryDevice::new(1024, 256));
        Journal::create(log.as_ref(), &config).unwrap();
        let home = Arc::new(BufferCache::new(Arc::new(MemoryDevice::new(1024, 64))));
        Journal::load(log, home, config).unwrap()
    }

    #[test]
    fn test_thread_commits_sync_handles() {
        let journal = journal();
        journal.spawn_commit_thread().unwrap();

        let workers: Vec<_> = (0..4u64)
            .map(|i| {
                let journal = Arc::clone(&journal);
                thread::spawn(move || {
                    let buffer = journal.home().getblk(i);
                    let mut handle = journal.start_transaction(1).unwrap();
                    handle.attach_for_write(&buffer).unwrap();
                    buffer.copy_from(&[i as u8; 1024]);
                    handle.mark_dirty(&buffer).unwrap();
                    handle.set_sync(true);
                    let tid = handle.tid();
                    handle.stop().unwrap();
                    tid
                })
            })
            .collect();
        for worker in workers {
            let tid = worker.join().unwrap();
            assert!(crate::tid_geq(journal.commit_sequence(), tid));
        }

        journal.stop_commit_thread();
        assert!(!journal.has_commit_thread());
    }

    #[test]
    fn test_wait_for_commit_wakes_thread() {
        let journal = journal();
        journal.spawn_commit_thread().unwrap();
        let handle = journal.start_transaction(1).unwrap();
        let tid = handle.tid();
        handle.stop().unwrap();

        journal.wait_for_commit(tid).unwrap();
        assert!(journal.running_transaction().is_none());
        journal.stop_commit_thread();
    }
}
