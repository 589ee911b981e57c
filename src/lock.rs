//! Per-path exclusive locks
//!
//! Whole-file read-modify-write cycles are not atomic on their own, so
//! every content operation holds the lock of its real path for the whole
//! cycle. Entries are created on demand and dropped again when the last
//! holder releases them.

use dashmap::DashMap;
use parking_lot::{ArcMutexGuard, Mutex, RawMutex};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Arena of locks keyed by real path
#[derive(Default)]
pub struct PathLocks {
    locks: DashMap<PathBuf, Arc<Mutex<()>>>,
}

/// Held lock on one real path
pub struct PathGuard<'a> {
    guard: Option<ArcMutexGuard<RawMutex, ()>>,
    path: PathBuf,
    locks: &'a PathLocks,
}

impl PathLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until `path` is exclusively held by the caller
    pub fn lock(&self, path: &Path) -> PathGuard<'_> {
        // Clone the entry under the shard lock, then wait outside of it.
        let mutex = self
            .locks
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone();

        PathGuard {
            guard: Some(mutex.lock_arc()),
            path: path.to_path_buf(),
            locks: self,
        }
    }

    /// Lock two paths in a fixed order so opposite renames cannot deadlock
    pub fn lock_pair<'a>(&'a self, a: &Path, b: &Path) -> (PathGuard<'a>, Option<PathGuard<'a>>) {
        if a == b {
            return (self.lock(a), None);
        }
        if a < b {
            let first = self.lock(a);
            let second = self.lock(b);
            (first, Some(second))
        } else {
            let second = self.lock(b);
            let first = self.lock(a);
            (first, Some(second))
        }
    }

    /// Number of paths with a live lock entry
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

impl PathGuard<'_> {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PathGuard<'_> {
    fn drop(&mut self) {
        // Release first so our own Arc no longer counts as a holder.
        drop(self.guard.take());
        self.locks
            .locks
            .remove_if(&self.path, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}
