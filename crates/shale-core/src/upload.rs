//! In-process tracking of active shard transfers.
//!
//! Every push or pull claims its upload identifier before touching
//! storage and releases it when done, so at most one transfer per
//! `(customer, indexer, well, shard)` tuple is in flight at any instant.
//! Claims never survive a process restart.

use std::collections::HashSet;
use std::sync::Mutex;

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UploadError {
    #[error("shard upload already in progress")]
    InProgress,

    #[error("shard upload not in progress")]
    NotInProgress,
}

/// Identity of one shard transfer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UploadId {
    pub cid: u64,
    pub indexer: Uuid,
    pub well: String,
    pub shard: String,
}

impl UploadId {
    pub fn new(cid: u64, indexer: Uuid, well: &str, shard: &str) -> Self {
        Self {
            cid,
            indexer,
            well: well.to_string(),
            shard: shard.to_string(),
        }
    }
}

/// Mutex-guarded set of in-flight transfers.
#[derive(Debug, Default)]
pub struct UploadTracker {
    active: Mutex<HashSet<UploadId>>,
}

impl UploadTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim an upload id, failing if a transfer for it is already active.
    /// The returned guard releases the claim when dropped, on every exit
    /// path.
    pub fn enter(&self, id: UploadId) -> Result<UploadGuard<'_>, UploadError> {
        let mut active = self.active.lock().unwrap();
        if !active.insert(id.clone()) {
            return Err(UploadError::InProgress);
        }
        Ok(UploadGuard { tracker: self, id })
    }

    fn exit(&self, id: &UploadId) -> Result<(), UploadError> {
        let mut active = self.active.lock().unwrap();
        if active.remove(id) {
            Ok(())
        } else {
            Err(UploadError::NotInProgress)
        }
    }
}

/// Live claim on an upload id.
#[derive(Debug)]
pub struct UploadGuard<'a> {
    tracker: &'a UploadTracker,
    id: UploadId,
}

impl Drop for UploadGuard<'_> {
    fn drop(&mut self) {
        let _ = self.tracker.exit(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(shard: &str) -> UploadId {
        UploadId::new(1337, Uuid::nil(), "default", shard)
    }

    #[test]
    fn enter_then_exit() {
        let t = UploadTracker::new();
        let g = t.enter(id("769f2")).unwrap();
        drop(g);
        // released, claimable again
        t.enter(id("769f2")).unwrap();
    }

    #[test]
    fn second_enter_fails_until_released() {
        let t = UploadTracker::new();
        let g = t.enter(id("769f2")).unwrap();
        assert_eq!(t.enter(id("769f2")).unwrap_err(), UploadError::InProgress);
        drop(g);
        t.enter(id("769f2")).unwrap();
    }

    #[test]
    fn distinct_ids_are_independent() {
        let t = UploadTracker::new();
        let _a = t.enter(id("769f2")).unwrap();
        let _b = t.enter(id("769f3")).unwrap();
    }

    #[test]
    fn concurrent_claims_admit_exactly_one() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::{Arc, Barrier};

        let t = Arc::new(UploadTracker::new());
        let wins = Arc::new(AtomicUsize::new(0));
        // all threads race for the claim, then hold until everyone has tried
        let start = Arc::new(Barrier::new(16));
        let done = Arc::new(Barrier::new(16));
        let mut handles = Vec::new();
        for _ in 0..16 {
            let t = Arc::clone(&t);
            let wins = Arc::clone(&wins);
            let start = Arc::clone(&start);
            let done = Arc::clone(&done);
            handles.push(std::thread::spawn(move || {
                start.wait();
                let claim = t.enter(id("769f2"));
                if claim.is_ok() {
                    wins.fetch_add(1, Ordering::SeqCst);
                }
                done.wait();
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(wins.load(Ordering::SeqCst), 1);
        // the winner's guard has dropped; the id is claimable again
        t.enter(id("769f2")).unwrap();
    }
}
