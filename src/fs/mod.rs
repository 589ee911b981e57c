//! FUSE filesystem implementation
//!
//! [`Driver`] is the path-based operation table over the mirror directory;
//! [`MirrorFs`] adapts it to the kernel's inode-based protocol.

mod driver;
mod filesystem;
mod handle;
mod inode;

pub use driver::{DirEntry, Driver, Stat};
pub use filesystem::MirrorFs;
pub use handle::{FileHandle, HandleTable};
pub use inode::{file_attr, InodeTable, NodeKind, ROOT_INO};
