//! Process-wide reference-counted tag manager handles.
//!
//! Concurrent request handlers for the same `(customer, indexer)` must
//! share one open [`TagManager`]: the exclusive file lock belongs to the
//! open handle, and allocation state lives in memory. The registry owns
//! the managers and their refcounts; managers never reference the
//! registry back. Release is strictly caller-driven; a leaked handle
//! surfaces at shutdown through [`TagRegistry::close_all`].

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use crate::error::TagError;
use crate::manager::TagManager;
use crate::pair::TAG_FILE_NAME;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct Key {
    cid: u64,
    indexer: Uuid,
}

struct Slot {
    manager: Arc<TagManager>,
    handles: usize,
}

/// Refcounted map of open tag managers. `None` once closed.
pub struct TagRegistry {
    inner: Mutex<Option<HashMap<Key, Slot>>>,
}

impl TagRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Some(HashMap::new())),
        }
    }

    /// Fetch the manager for `(cid, indexer)`, opening
    /// `base_dir/tags.dat` on first reference and bumping the refcount
    /// otherwise.
    pub fn get(
        &self,
        cid: u64,
        indexer: Uuid,
        base_dir: &Path,
    ) -> Result<Arc<TagManager>, TagError> {
        let mut guard = self.inner.lock().unwrap();
        let map = guard.as_mut().ok_or(TagError::RegistryClosed)?;
        let key = Key { cid, indexer };
        if let Some(slot) = map.get_mut(&key) {
            if slot.handles > 0 {
                slot.handles += 1;
                return Ok(slot.manager.clone());
            }
        }
        let manager = Arc::new(TagManager::open(base_dir.join(TAG_FILE_NAME))?);
        map.insert(
            key,
            Slot {
                manager: manager.clone(),
                handles: 1,
            },
        );
        Ok(manager)
    }

    /// Drop one handle; the manager closes when the last handle goes.
    pub fn release(&self, cid: u64, indexer: Uuid) -> Result<(), TagError> {
        let mut guard = self.inner.lock().unwrap();
        let map = guard.as_mut().ok_or(TagError::RegistryClosed)?;
        let key = Key { cid, indexer };
        let slot = match map.get_mut(&key) {
            Some(slot) if slot.handles > 0 => slot,
            _ => return Err(TagError::NoActiveHandles),
        };
        slot.handles -= 1;
        if slot.handles == 0 {
            let slot = map.remove(&key).expect("slot present");
            slot.manager.close()?;
        }
        Ok(())
    }

    /// Shutdown gate: fails if any handle is still out, otherwise closes
    /// every manager and marks the registry closed.
    pub fn close_all(&self) -> Result<(), TagError> {
        let mut guard = self.inner.lock().unwrap();
        let map = guard.as_mut().ok_or(TagError::RegistryClosed)?;
        if map.values().any(|s| s.handles > 0) {
            return Err(TagError::OpenHandles);
        }
        let mut first_err = None;
        for (_, slot) in map.drain() {
            if let Err(e) = slot.manager.close() {
                first_err.get_or_insert(e);
            }
        }
        *guard = None;
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Default for TagRegistry {
    fn default() -> Self {
        Self::new()
    }
}
