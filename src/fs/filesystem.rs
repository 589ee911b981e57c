//! FUSE filesystem implementation
//!
//! Translates inode-addressed kernel requests into path-based [`Driver`]
//! calls and driver errors into errno replies.

use fuser::{
    FileAttr, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr, Request, TimeOrNow,
};
use libc::{c_int, EBADF, EINVAL, ENOENT, ERANGE};
use std::ffi::{OsStr, OsString};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, error, info};

use super::{
    driver::{Driver, Stat},
    handle::HandleTable,
    inode::{file_attr, InodeTable, NodeKind, ROOT_INO},
};
use crate::error::{Error, Result};
use crate::pipeline::TEMP_PREFIX;

/// Mirror filesystem mounted through FUSE
pub struct MirrorFs {
    driver: Driver,
    inodes: InodeTable,
    handles: HandleTable,
    /// How long the kernel may cache entries and attributes
    ttl: Duration,
}

impl MirrorFs {
    pub fn new(driver: Driver, ttl: Duration) -> Self {
        Self {
            driver,
            inodes: InodeTable::new(),
            handles: HandleTable::new(),
            ttl,
        }
    }

    fn path_of(&self, ino: u64) -> Result<PathBuf> {
        self.inodes
            .path(ino)
            .ok_or(Error::Errno(nix::errno::Errno::ENOENT))
    }

    fn child_of(&self, parent: u64, name: &OsStr) -> Result<PathBuf> {
        self.inodes
            .child_path(parent, name)
            .ok_or(Error::Errno(nix::errno::Errno::ENOENT))
    }

    /// Attributes for `path`, registering its inode
    fn attr_for(&self, path: &Path, stat: &Stat) -> FileAttr {
        file_attr(self.inodes.ino_for(path), &stat.meta, stat.size)
    }

    fn lookup_path(&self, parent: u64, name: &OsStr) -> Result<FileAttr> {
        if name.as_bytes().starts_with(TEMP_PREFIX.as_bytes()) {
            return Err(Error::Errno(nix::errno::Errno::ENOENT));
        }
        let path = self.child_of(parent, name)?;
        let stat = self.driver.getattr(&path)?;
        Ok(self.attr_for(&path, &stat))
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_setattr(
        &self,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
    ) -> Result<FileAttr> {
        let path = self.path_of(ino)?;

        if let Some(mode) = mode {
            self.driver.chmod(&path, mode)?;
        }
        if uid.is_some() || gid.is_some() {
            self.driver.chown(&path, uid, gid)?;
        }
        if let Some(size) = size {
            self.driver.truncate(&path, size)?;
        }
        if atime.is_some() || mtime.is_some() {
            self.driver.utimens(&path, atime, mtime)?;
        }

        let stat = self.driver.getattr(&path)?;
        Ok(file_attr(ino, &stat.meta, stat.size))
    }

    fn list_dir(&self, ino: u64) -> Result<Vec<(u64, fuser::FileType, OsString)>> {
        let path = self.path_of(ino)?;
        let parent_ino = match path.parent() {
            Some(parent) => self.inodes.ino_for(parent),
            None => ROOT_INO,
        };

        let mut entries = vec![
            (ino, fuser::FileType::Directory, OsString::from(".")),
            (parent_ino, fuser::FileType::Directory, OsString::from("..")),
        ];
        for entry in self.driver.readdir(&path)? {
            let child_ino = self.inodes.ino_for(&path.join(&entry.name));
            let kind = NodeKind::from(entry.kind).to_fuser_type();
            entries.push((child_ino, kind, entry.name));
        }
        Ok(entries)
    }
}

/// Log a failed request and return the errno to reply with
fn errno_of(op: &str, err: &Error) -> c_int {
    let code = err.errno();
    match err {
        Error::Cipher(_) => error!(op, error = %err, "stored ciphertext rejected"),
        _ if code == libc::EIO => error!(op, error = %err, "request failed"),
        _ => debug!(op, error = %err, code, "request failed"),
    }
    code
}

fn offset_of(offset: i64) -> std::result::Result<u64, c_int> {
    u64::try_from(offset).map_err(|_| EINVAL)
}

/// Answer an xattr request following the size-probe protocol
fn reply_xattr(data: &[u8], size: u32, reply: ReplyXattr) {
    if size == 0 {
        reply.size(data.len() as u32);
    } else if data.len() > size as usize {
        reply.error(ERANGE);
    } else {
        reply.data(data);
    }
}

impl Filesystem for MirrorFs {
    fn init(
        &mut self,
        _req: &Request<'_>,
        _config: &mut KernelConfig,
    ) -> std::result::Result<(), c_int> {
        info!(root = %self.driver.session().root().display(), "filesystem mounted");
        Ok(())
    }

    fn destroy(&mut self) {
        info!(
            root = %self.driver.session().root().display(),
            inodes = self.inodes.len(),
            "filesystem unmounted"
        );
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        debug!("lookup(parent={}, name={:?})", parent, name);

        match self.lookup_path(parent, name) {
            Ok(attr) => reply.entry(&self.ttl, &attr, 0),
            Err(e) => reply.error(errno_of("lookup", &e)),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        debug!("getattr(ino={})", ino);

        let result = self
            .path_of(ino)
            .and_then(|path| self.driver.getattr(&path))
            .map(|stat| file_attr(ino, &stat.meta, stat.size));
        match result {
            Ok(attr) => reply.attr(&self.ttl, &attr),
            Err(e) => reply.error(errno_of("getattr", &e)),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        debug!(
            "setattr(ino={}, mode={:?}, uid={:?}, gid={:?}, size={:?})",
            ino, mode, uid, gid, size
        );

        match self.apply_setattr(ino, mode, uid, gid, size, atime, mtime) {
            Ok(attr) => reply.attr(&self.ttl, &attr),
            Err(e) => reply.error(errno_of("setattr", &e)),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        debug!("readlink(ino={})", ino);

        match self.path_of(ino).and_then(|path| self.driver.readlink(&path)) {
            Ok(target) => reply.data(target.as_os_str().as_bytes()),
            Err(e) => reply.error(errno_of("readlink", &e)),
        }
    }

    fn mknod(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        debug!("mknod(parent={}, name={:?}, mode={:o})", parent, name, mode);

        let result = self.child_of(parent, name).and_then(|path| {
            let stat = self.driver.mknod(&path, mode & !(umask & 0o7777), rdev)?;
            Ok(self.attr_for(&path, &stat))
        });
        match result {
            Ok(attr) => reply.entry(&self.ttl, &attr, 0),
            Err(e) => reply.error(errno_of("mknod", &e)),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        debug!("mkdir(parent={}, name={:?}, mode={:o})", parent, name, mode);

        let result = self.child_of(parent, name).and_then(|path| {
            let stat = self.driver.mkdir(&path, mode & !umask)?;
            Ok(self.attr_for(&path, &stat))
        });
        match result {
            Ok(attr) => reply.entry(&self.ttl, &attr, 0),
            Err(e) => reply.error(errno_of("mkdir", &e)),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        debug!("unlink(parent={}, name={:?})", parent, name);

        let result = self.child_of(parent, name).and_then(|path| {
            self.driver.unlink(&path)?;
            self.inodes.remove(&path);
            Ok(())
        });
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno_of("unlink", &e)),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        debug!("rmdir(parent={}, name={:?})", parent, name);

        let result = self.child_of(parent, name).and_then(|path| {
            self.driver.rmdir(&path)?;
            self.inodes.remove(&path);
            Ok(())
        });
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno_of("rmdir", &e)),
        }
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        debug!("symlink(parent={}, name={:?}, target={:?})", parent, link_name, target);

        let result = self.child_of(parent, link_name).and_then(|path| {
            let stat = self.driver.symlink(target, &path)?;
            Ok(self.attr_for(&path, &stat))
        });
        match result {
            Ok(attr) => reply.entry(&self.ttl, &attr, 0),
            Err(e) => reply.error(errno_of("symlink", &e)),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        debug!(
            "rename(parent={}, name={:?}, newparent={}, newname={:?}, flags={})",
            parent, name, newparent, newname, flags
        );

        let result = self.child_of(parent, name).and_then(|from| {
            let to = self.child_of(newparent, newname)?;
            self.driver.rename(&from, &to, flags)?;
            self.inodes.rename(&from, &to);
            Ok(())
        });
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno_of("rename", &e)),
        }
    }

    fn link(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        debug!("link(ino={}, newparent={}, newname={:?})", ino, newparent, newname);

        let result = self.path_of(ino).and_then(|from| {
            let to = self.child_of(newparent, newname)?;
            let stat = self.driver.link(&from, &to)?;
            Ok(self.attr_for(&to, &stat))
        });
        match result {
            Ok(attr) => reply.entry(&self.ttl, &attr, 0),
            Err(e) => reply.error(errno_of("link", &e)),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        debug!("open(ino={}, flags={:#x})", ino, flags);

        match self.path_of(ino).and_then(|path| self.driver.open(&path, flags)) {
            Ok(()) => reply.opened(self.handles.open(ino, flags), 0),
            Err(e) => reply.error(errno_of("open", &e)),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        debug!("read(ino={}, fh={}, offset={}, size={})", ino, fh, offset, size);

        if matches!(self.handles.get(fh), Some(handle) if !handle.is_readable()) {
            reply.error(EBADF);
            return;
        }
        let offset = match offset_of(offset) {
            Ok(offset) => offset,
            Err(code) => {
                reply.error(code);
                return;
            }
        };

        let result = self
            .path_of(ino)
            .and_then(|path| self.driver.read(&path, offset, size as usize));
        match result {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(errno_of("read", &e)),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        debug!("write(ino={}, fh={}, offset={}, len={})", ino, fh, offset, data.len());

        if matches!(self.handles.get(fh), Some(handle) if !handle.is_writable()) {
            reply.error(EBADF);
            return;
        }
        let offset = match offset_of(offset) {
            Ok(offset) => offset,
            Err(code) => {
                reply.error(code);
                return;
            }
        };

        let result = self
            .path_of(ino)
            .and_then(|path| self.driver.write(&path, offset, data));
        match result {
            Ok(written) => reply.written(written as u32),
            Err(e) => reply.error(errno_of("write", &e)),
        }
    }

    fn flush(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        _lock_owner: u64,
        reply: ReplyEmpty,
    ) {
        // Every write already reached the mirror before it was acknowledged.
        debug!("flush(ino={}, fh={})", ino, fh);
        reply.ok();
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        debug!("release(ino={}, fh={})", ino, fh);
        self.handles.close(fh);
        reply.ok();
    }

    fn fsync(&mut self, _req: &Request<'_>, ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        debug!("fsync(ino={}, fh={}, datasync={})", ino, fh, datasync);

        match self
            .path_of(ino)
            .and_then(|path| self.driver.fsync(&path, datasync))
        {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno_of("fsync", &e)),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        debug!("readdir(ino={}, offset={})", ino, offset);

        let entries = match self.list_dir(ino) {
            Ok(entries) => entries,
            Err(e) => {
                reply.error(errno_of("readdir", &e));
                return;
            }
        };

        let skip = usize::try_from(offset).unwrap_or(0);
        for (i, (child_ino, kind, name)) in entries.iter().enumerate().skip(skip) {
            if reply.add(*child_ino, (i + 1) as i64, *kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyStatfs) {
        debug!("statfs(ino={})", ino);

        let path = self.path_of(ino).unwrap_or_else(|_| PathBuf::from("/"));
        match self.driver.statfs(&path) {
            Ok(stats) => reply.statfs(
                stats.blocks() as u64,
                stats.blocks_free() as u64,
                stats.blocks_available() as u64,
                stats.files() as u64,
                stats.files_free() as u64,
                stats.block_size() as u32,
                stats.name_max() as u32,
                stats.fragment_size() as u32,
            ),
            Err(e) => reply.error(errno_of("statfs", &e)),
        }
    }

    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        debug!("setxattr(ino={}, name={:?}, len={})", ino, name, value.len());

        match self
            .path_of(ino)
            .and_then(|path| self.driver.setxattr(&path, name, value, flags))
        {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno_of("setxattr", &e)),
        }
    }

    fn getxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        size: u32,
        reply: ReplyXattr,
    ) {
        debug!("getxattr(ino={}, name={:?}, size={})", ino, name, size);

        match self
            .path_of(ino)
            .and_then(|path| self.driver.getxattr(&path, name))
        {
            Ok(value) => reply_xattr(&value, size, reply),
            Err(e) => reply.error(errno_of("getxattr", &e)),
        }
    }

    fn listxattr(&mut self, _req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        debug!("listxattr(ino={}, size={})", ino, size);

        match self.path_of(ino).and_then(|path| self.driver.listxattr(&path)) {
            Ok(list) => reply_xattr(&list, size, reply),
            Err(e) => reply.error(errno_of("listxattr", &e)),
        }
    }

    fn removexattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        debug!("removexattr(ino={}, name={:?})", ino, name);

        match self
            .path_of(ino)
            .and_then(|path| self.driver.removexattr(&path, name))
        {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno_of("removexattr", &e)),
        }
    }

    fn access(&mut self, _req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        debug!("access(ino={}, mask={})", ino, mask);

        match self.path_of(ino).and_then(|path| self.driver.access(&path, mask)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno_of("access", &e)),
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        debug!("create(parent={}, name={:?}, mode={:o}, flags={:#x})", parent, name, mode, flags);

        let result = self.child_of(parent, name).and_then(|path| {
            let stat = self.driver.create(&path, mode & !umask, flags)?;
            Ok(self.attr_for(&path, &stat))
        });
        match result {
            Ok(attr) => {
                let fh = self.handles.open(attr.ino, flags);
                reply.created(&self.ttl, &attr, 0, fh, 0);
            }
            Err(e) => reply.error(errno_of("create", &e)),
        }
    }
}
