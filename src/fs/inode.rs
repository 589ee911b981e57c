//! Inode management
//!
//! The kernel addresses nodes by inode number while the driver works on
//! virtual paths. This table hands out stable numbers per path for the
//! lifetime of the mount.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::ffi::OsStr;
use std::fs::Metadata;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Inode number of the mount root
pub const ROOT_INO: u64 = 1;

/// File type of a mirrored node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    RegularFile,
    Directory,
    Symlink,
    BlockDevice,
    CharDevice,
    Fifo,
    Socket,
}

impl From<std::fs::FileType> for NodeKind {
    fn from(ft: std::fs::FileType) -> Self {
        if ft.is_dir() {
            NodeKind::Directory
        } else if ft.is_symlink() {
            NodeKind::Symlink
        } else if ft.is_block_device() {
            NodeKind::BlockDevice
        } else if ft.is_char_device() {
            NodeKind::CharDevice
        } else if ft.is_fifo() {
            NodeKind::Fifo
        } else if ft.is_socket() {
            NodeKind::Socket
        } else {
            NodeKind::RegularFile
        }
    }
}

impl NodeKind {
    pub fn to_fuser_type(self) -> fuser::FileType {
        match self {
            NodeKind::RegularFile => fuser::FileType::RegularFile,
            NodeKind::Directory => fuser::FileType::Directory,
            NodeKind::Symlink => fuser::FileType::Symlink,
            NodeKind::BlockDevice => fuser::FileType::BlockDevice,
            NodeKind::CharDevice => fuser::FileType::CharDevice,
            NodeKind::Fifo => fuser::FileType::NamedPipe,
            NodeKind::Socket => fuser::FileType::Socket,
        }
    }
}

/// Kernel attributes for a node
///
/// `size` is the size applications see, which differs from the stored
/// length for encrypted files.
pub fn file_attr(ino: u64, meta: &Metadata, size: u64) -> fuser::FileAttr {
    fuser::FileAttr {
        ino,
        size,
        blocks: meta.blocks(),
        atime: system_time(meta.atime(), meta.atime_nsec()),
        mtime: system_time(meta.mtime(), meta.mtime_nsec()),
        ctime: system_time(meta.ctime(), meta.ctime_nsec()),
        crtime: meta.created().unwrap_or(UNIX_EPOCH),
        kind: NodeKind::from(meta.file_type()).to_fuser_type(),
        perm: (meta.mode() & 0o7777) as u16,
        nlink: meta.nlink() as u32,
        uid: meta.uid(),
        gid: meta.gid(),
        rdev: meta.rdev() as u32,
        blksize: meta.blksize() as u32,
        flags: 0,
    }
}

fn system_time(secs: i64, nsecs: i64) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + Duration::new(secs as u64, nsecs as u32)
    } else {
        UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs())
    }
}

/// Bidirectional inode number to virtual path map
pub struct InodeTable {
    next_ino: AtomicU64,
    /// ino -> virtual path
    paths: RwLock<HashMap<u64, PathBuf>>,
    /// virtual path -> ino
    inos: RwLock<HashMap<PathBuf, u64>>,
}

impl InodeTable {
    pub fn new() -> Self {
        let table = Self {
            next_ino: AtomicU64::new(ROOT_INO + 1),
            paths: RwLock::new(HashMap::new()),
            inos: RwLock::new(HashMap::new()),
        };
        table.paths.write().insert(ROOT_INO, PathBuf::from("/"));
        table.inos.write().insert(PathBuf::from("/"), ROOT_INO);
        table
    }

    /// Virtual path of an inode
    pub fn path(&self, ino: u64) -> Option<PathBuf> {
        self.paths.read().get(&ino).cloned()
    }

    /// Virtual path of `name` inside the directory `parent`
    pub fn child_path(&self, parent: u64, name: &OsStr) -> Option<PathBuf> {
        self.paths.read().get(&parent).map(|p| p.join(name))
    }

    /// Inode of `path`, allocating one on first sight
    pub fn ino_for(&self, path: &Path) -> u64 {
        if let Some(ino) = self.inos.read().get(path) {
            return *ino;
        }

        let mut paths = self.paths.write();
        let mut inos = self.inos.write();
        // Another caller may have raced us between the two locks.
        if let Some(ino) = inos.get(path) {
            return *ino;
        }
        let ino = self.next_ino.fetch_add(1, Ordering::SeqCst);
        paths.insert(ino, path.to_path_buf());
        inos.insert(path.to_path_buf(), ino);
        ino
    }

    /// Forget `path` and everything below it
    pub fn remove(&self, path: &Path) {
        let mut paths = self.paths.write();
        let mut inos = self.inos.write();
        inos.retain(|p, ino| {
            let gone = p.starts_with(path) && *ino != ROOT_INO;
            if gone {
                paths.remove(ino);
            }
            !gone
        });
    }

    /// Move `from` and its descendants to `to`, keeping their numbers
    ///
    /// Whatever lived at `to` before is dropped, as rename replaced it.
    pub fn rename(&self, from: &Path, to: &Path) {
        if from == to {
            return;
        }
        let mut paths = self.paths.write();
        let mut inos = self.inos.write();

        inos.retain(|p, ino| {
            let replaced = p.starts_with(to);
            if replaced {
                paths.remove(ino);
            }
            !replaced
        });

        let moved: Vec<(PathBuf, u64)> = inos
            .iter()
            .filter(|(p, _)| p.starts_with(from))
            .map(|(p, ino)| (p.clone(), *ino))
            .collect();

        for (old, ino) in moved {
            let new = match old.strip_prefix(from) {
                Ok(rest) if rest.as_os_str().is_empty() => to.to_path_buf(),
                Ok(rest) => to.join(rest),
                Err(_) => continue,
            };
            inos.remove(&old);
            inos.insert(new.clone(), ino);
            paths.insert(ino, new);
        }
    }

    /// Number of known inodes, root included
    pub fn len(&self) -> usize {
        self.paths.read().len()
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}
