//! File handle management
//!
//! Handles carry no descriptor: content is reopened by path on every call.
//! They only remember how the file was opened so writes through a
//! read-only handle can be refused.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Represents an open file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHandle {
    /// Inode number
    pub ino: u64,
    /// Open flags
    pub flags: i32,
}

impl FileHandle {
    pub fn new(ino: u64, flags: i32) -> Self {
        FileHandle { ino, flags }
    }

    /// Check if opened for reading
    pub fn is_readable(&self) -> bool {
        let mode = self.flags & libc::O_ACCMODE;
        mode == libc::O_RDONLY || mode == libc::O_RDWR
    }

    /// Check if opened for writing
    pub fn is_writable(&self) -> bool {
        let mode = self.flags & libc::O_ACCMODE;
        mode == libc::O_WRONLY || mode == libc::O_RDWR
    }
}

/// Manages open file handles
pub struct HandleTable {
    next_id: AtomicU64,
    handles: RwLock<HashMap<u64, FileHandle>>,
}

impl HandleTable {
    pub fn new() -> Self {
        HandleTable {
            next_id: AtomicU64::new(1),
            handles: RwLock::new(HashMap::new()),
        }
    }

    /// Register an open file and return its handle ID
    pub fn open(&self, ino: u64, flags: i32) -> u64 {
        let fh = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.handles.write().insert(fh, FileHandle::new(ino, flags));
        fh
    }

    pub fn get(&self, fh: u64) -> Option<FileHandle> {
        self.handles.read().get(&fh).copied()
    }

    pub fn close(&self, fh: u64) -> Option<FileHandle> {
        self.handles.write().remove(&fh)
    }

    pub fn is_valid(&self, fh: u64) -> bool {
        self.handles.read().contains_key(&fh)
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}
