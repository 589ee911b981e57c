//! Path-based driver surface
//!
//! One method per filesystem operation, each taking virtual paths. Content
//! operations go through the [`ContentPipeline`]; everything else is a
//! direct call to the native primitive on the resolved real path. Errors
//! are returned as [`Error`] and turned into errno by the FUSE adapter.

use crate::error::{Error, Result};
use crate::marker;
use crate::path;
use crate::pipeline::{ContentPipeline, TEMP_PREFIX};
use crate::session::SessionContext;
use fuser::TimeOrNow;
use nix::sys::stat::{Mode, SFlag, UtimensatFlags};
use nix::sys::statvfs::Statvfs;
use nix::sys::time::TimeSpec;
use nix::unistd::AccessFlags;
use std::ffi::{OsStr, OsString};
use std::fs::{self, DirBuilder, Metadata, OpenOptions};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;
use tracing::{debug, warn};

/// Metadata of a node plus the size applications should see
#[derive(Debug, Clone)]
pub struct Stat {
    pub meta: Metadata,
    pub size: u64,
}

/// Directory entry of the mirror
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: OsString,
    pub kind: fs::FileType,
}

/// The operation table the FUSE adapter dispatches to
pub struct Driver {
    pipeline: ContentPipeline,
    encrypt_new_files: bool,
}

impl Driver {
    pub fn new(session: Arc<SessionContext>, encrypt_new_files: bool) -> Self {
        Self {
            pipeline: ContentPipeline::new(session),
            encrypt_new_files,
        }
    }

    pub fn session(&self) -> &SessionContext {
        self.pipeline.session()
    }

    fn real(&self, virtual_path: &Path) -> Result<PathBuf> {
        path::resolve(self.pipeline.session(), virtual_path)
    }

    fn stat_real(&self, real: &Path) -> Result<Stat> {
        let meta = fs::symlink_metadata(real)?;
        let size = self.pipeline.content_len(real, &meta);
        Ok(Stat { meta, size })
    }

    pub fn getattr(&self, path: &Path) -> Result<Stat> {
        self.stat_real(&self.real(path)?)
    }

    pub fn access(&self, path: &Path, mask: i32) -> Result<()> {
        let real = self.real(path)?;
        nix::unistd::access(real.as_path(), AccessFlags::from_bits_truncate(mask))?;
        Ok(())
    }

    /// Entries of a mirror directory, without `.`/`..` and temp files
    pub fn readdir(&self, path: &Path) -> Result<Vec<DirEntry>> {
        let real = self.real(path)?;
        let mut entries = Vec::new();

        for entry in fs::read_dir(&real)? {
            let entry = entry?;
            let name = entry.file_name();
            if name.as_bytes().starts_with(TEMP_PREFIX.as_bytes()) {
                continue;
            }
            entries.push(DirEntry {
                name,
                kind: entry.file_type()?,
            });
        }

        Ok(entries)
    }

    /// Create a regular file, fifo or device node
    pub fn mknod(&self, path: &Path, mode: u32, rdev: u32) -> Result<Stat> {
        let real = self.real(path)?;
        let kind = mode & libc::S_IFMT as u32;
        let perm = Mode::from_bits_truncate((mode & 0o7777) as libc::mode_t);

        if kind == libc::S_IFREG as u32 || kind == 0 {
            OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(mode & 0o7777)
                .open(&real)?;
        } else if kind == libc::S_IFIFO as u32 {
            nix::unistd::mkfifo(real.as_path(), perm)?;
        } else {
            let sflag = SFlag::from_bits_truncate(kind as libc::mode_t);
            nix::sys::stat::mknod(real.as_path(), sflag, perm, rdev as libc::dev_t)?;
        }

        self.stat_real(&real)
    }

    pub fn mkdir(&self, path: &Path, mode: u32) -> Result<Stat> {
        let real = self.real(path)?;
        DirBuilder::new().mode(mode & 0o7777).create(&real)?;
        self.stat_real(&real)
    }

    pub fn unlink(&self, path: &Path) -> Result<()> {
        fs::remove_file(self.real(path)?)?;
        Ok(())
    }

    pub fn rmdir(&self, path: &Path) -> Result<()> {
        fs::remove_dir(self.real(path)?)?;
        Ok(())
    }

    /// Create `link` pointing at `target`; the target is stored verbatim
    pub fn symlink(&self, target: &Path, link: &Path) -> Result<Stat> {
        let real = self.real(link)?;
        std::os::unix::fs::symlink(target, &real)?;
        self.stat_real(&real)
    }

    pub fn readlink(&self, path: &Path) -> Result<PathBuf> {
        Ok(fs::read_link(self.real(path)?)?)
    }

    /// Rename `from` to `to`; `RENAME_NOREPLACE` is the only flag honored
    pub fn rename(&self, from: &Path, to: &Path, flags: u32) -> Result<()> {
        let real_from = self.real(from)?;
        let real_to = self.real(to)?;

        if flags & !libc::RENAME_NOREPLACE != 0 {
            return Err(Error::Errno(nix::errno::Errno::EINVAL));
        }

        let _guards = self.pipeline.lock_pair(&real_from, &real_to);
        if flags & libc::RENAME_NOREPLACE != 0 && fs::symlink_metadata(&real_to).is_ok() {
            return Err(Error::Errno(nix::errno::Errno::EEXIST));
        }
        fs::rename(&real_from, &real_to)?;
        Ok(())
    }

    /// Hard link `to` to the existing `from`
    pub fn link(&self, from: &Path, to: &Path) -> Result<Stat> {
        let real_to = self.real(to)?;
        fs::hard_link(self.real(from)?, &real_to)?;
        self.stat_real(&real_to)
    }

    pub fn chmod(&self, path: &Path, mode: u32) -> Result<()> {
        let real = self.real(path)?;
        fs::set_permissions(&real, fs::Permissions::from_mode(mode & 0o7777))?;
        Ok(())
    }

    /// Change ownership without following symlinks
    pub fn chown(&self, path: &Path, uid: Option<u32>, gid: Option<u32>) -> Result<()> {
        std::os::unix::fs::lchown(self.real(path)?, uid, gid)?;
        Ok(())
    }

    /// Set the plaintext size; encrypted files are re-encoded
    pub fn truncate(&self, path: &Path, size: u64) -> Result<()> {
        self.pipeline.truncate(&self.real(path)?, size)
    }

    /// Set timestamps without following symlinks; `None` leaves one unchanged
    pub fn utimens(
        &self,
        path: &Path,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
    ) -> Result<()> {
        let real = self.real(path)?;
        nix::sys::stat::utimensat(
            None,
            real.as_path(),
            &to_timespec(atime),
            &to_timespec(mtime),
            UtimensatFlags::NoFollowSymlink,
        )?;
        Ok(())
    }

    /// Check that the real file opens with `flags`
    ///
    /// No descriptor is kept; every content call reopens the file.
    /// `O_TRUNC` is applied through the pipeline so encrypted files stay
    /// well formed.
    pub fn open(&self, path: &Path, flags: i32) -> Result<()> {
        let real = self.real(path)?;
        open_options(flags).open(&real)?;

        if flags & libc::O_TRUNC != 0 && flags & libc::O_ACCMODE != libc::O_RDONLY {
            self.pipeline.truncate(&real, 0)?;
        }
        Ok(())
    }

    /// Create and open a regular file
    pub fn create(&self, path: &Path, mode: u32, flags: i32) -> Result<Stat> {
        let real = self.real(path)?;
        let existed = fs::symlink_metadata(&real).is_ok();
        let mut options = open_options(flags);
        options.create(true).mode(mode & 0o7777);
        if flags & libc::O_EXCL != 0 {
            options.create_new(true);
        }
        if flags & libc::O_ACCMODE == libc::O_RDONLY {
            options.write(true);
        }
        options.open(&real)?;

        if existed {
            if flags & libc::O_TRUNC != 0 {
                self.pipeline.truncate(&real, 0)?;
            }
        } else if self.encrypt_new_files {
            if let Err(e) = marker::set_marker(&real, true) {
                warn!(path = %real.display(), error = %e, "cannot mark new file encrypted");
                let _ = fs::remove_file(&real);
                return Err(e);
            }
        }

        self.stat_real(&real)
    }

    pub fn read(&self, path: &Path, offset: u64, size: usize) -> Result<Vec<u8>> {
        self.pipeline.read(&self.real(path)?, offset, size)
    }

    pub fn write(&self, path: &Path, offset: u64, data: &[u8]) -> Result<usize> {
        self.pipeline.write(&self.real(path)?, offset, data)
    }

    /// Flush the real file to stable storage
    pub fn fsync(&self, path: &Path, datasync: bool) -> Result<()> {
        let real = self.real(path)?;
        let file = match OpenOptions::new().read(true).open(&real) {
            Ok(file) => file,
            Err(e) if e.raw_os_error() == Some(libc::EACCES) => {
                OpenOptions::new().write(true).open(&real)?
            }
            Err(e) => return Err(e.into()),
        };

        if datasync {
            file.sync_data()?;
        } else {
            file.sync_all()?;
        }
        Ok(())
    }

    pub fn statfs(&self, path: &Path) -> Result<Statvfs> {
        let real = self.real(path)?;
        Ok(nix::sys::statvfs::statvfs(real.as_path())?)
    }

    /// Value of an extended attribute, verbatim
    pub fn getxattr(&self, path: &Path, name: &OsStr) -> Result<Vec<u8>> {
        let real = self.real(path)?;
        xattr::get(&real, name)?.ok_or(Error::Errno(nix::errno::Errno::ENODATA))
    }

    /// Attribute names, each NUL terminated, as listxattr(2) returns them
    pub fn listxattr(&self, path: &Path) -> Result<Vec<u8>> {
        let real = self.real(path)?;
        let mut list = Vec::new();
        for name in xattr::list(&real)? {
            list.extend_from_slice(name.as_bytes());
            list.push(0);
        }
        Ok(list)
    }

    /// Set an extended attribute
    ///
    /// Setting the encryption marker re-transforms the content before
    /// returning so stored bytes always match the marker.
    pub fn setxattr(&self, path: &Path, name: &OsStr, value: &[u8], flags: i32) -> Result<()> {
        let real = self.real(path)?;

        if flags & (libc::XATTR_CREATE | libc::XATTR_REPLACE) != 0 {
            let exists = xattr::get(&real, name)?.is_some();
            if flags & libc::XATTR_CREATE != 0 && exists {
                return Err(Error::Errno(nix::errno::Errno::EEXIST));
            }
            if flags & libc::XATTR_REPLACE != 0 && !exists {
                return Err(Error::Errno(nix::errno::Errno::ENODATA));
            }
        }

        if marker::is_marker_name(name) {
            let encrypted = marker::parse_marker(value)?;
            debug!(path = %real.display(), encrypted, "encryption marker set");
            return self.pipeline.set_encrypted(&real, encrypted);
        }

        xattr::set(&real, name, value)?;
        Ok(())
    }

    /// Remove an extended attribute; removing the marker decrypts content
    pub fn removexattr(&self, path: &Path, name: &OsStr) -> Result<()> {
        let real = self.real(path)?;

        if marker::is_marker_name(name) {
            if marker::read_marker(&real)?.is_none() {
                return Err(Error::Errno(nix::errno::Errno::ENODATA));
            }
            debug!(path = %real.display(), "encryption marker removed");
            return self.pipeline.clear_encrypted(&real);
        }

        xattr::remove(&real, name)?;
        Ok(())
    }
}

/// Open options matching the access mode and extra flags of `flags`
fn open_options(flags: i32) -> OpenOptions {
    let mut options = OpenOptions::new();
    match flags & libc::O_ACCMODE {
        libc::O_RDONLY => options.read(true),
        libc::O_WRONLY => options.write(true),
        _ => options.read(true).write(true),
    };
    options.custom_flags(flags & !(libc::O_ACCMODE | libc::O_CREAT | libc::O_EXCL | libc::O_TRUNC));
    options
}

fn to_timespec(time: Option<TimeOrNow>) -> TimeSpec {
    match time {
        None => TimeSpec::new(0, libc::UTIME_OMIT),
        Some(TimeOrNow::Now) => TimeSpec::new(0, libc::UTIME_NOW),
        Some(TimeOrNow::SpecificTime(at)) => {
            TimeSpec::from(at.duration_since(UNIX_EPOCH).unwrap_or_default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::HEADER_SIZE;
    use crate::testing::{test_session, xattrs_supported};
    use std::os::unix::fs::MetadataExt;
    use std::time::Duration;
    use tempfile::tempdir;

    fn driver(dir: &Path) -> Driver {
        Driver::new(test_session(dir), false)
    }

    #[test]
    fn test_directory_passthrough() {
        let dir = tempdir().unwrap();
        let driver = driver(dir.path());

        let stat = driver.mkdir(Path::new("/docs"), 0o750).unwrap();
        assert!(stat.meta.is_dir());
        assert!(dir.path().join("docs").is_dir());

        driver.create(Path::new("/docs/a.txt"), 0o600, libc::O_WRONLY).unwrap();
        driver.mknod(Path::new("/docs/b.txt"), libc::S_IFREG as u32 | 0o644, 0).unwrap();

        let mut names: Vec<_> = driver
            .readdir(Path::new("/docs"))
            .unwrap()
            .into_iter()
            .map(|e| e.name.to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec!["a.txt", "b.txt"]);

        let err = driver.rmdir(Path::new("/docs")).unwrap_err();
        assert_eq!(err.errno(), libc::ENOTEMPTY);

        driver.unlink(Path::new("/docs/a.txt")).unwrap();
        driver.unlink(Path::new("/docs/b.txt")).unwrap();
        driver.rmdir(Path::new("/docs")).unwrap();
        assert!(!dir.path().join("docs").exists());
    }

    #[test]
    fn test_getattr_missing_is_enoent() {
        let dir = tempdir().unwrap();
        let err = driver(dir.path()).getattr(Path::new("/absent")).unwrap_err();
        assert_eq!(err.errno(), libc::ENOENT);
    }

    #[test]
    fn test_create_exclusive() {
        let dir = tempdir().unwrap();
        let driver = driver(dir.path());
        driver.create(Path::new("/x"), 0o644, libc::O_WRONLY | libc::O_EXCL).unwrap();
        let err = driver
            .create(Path::new("/x"), 0o644, libc::O_WRONLY | libc::O_EXCL)
            .unwrap_err();
        assert_eq!(err.errno(), libc::EEXIST);
    }

    #[test]
    fn test_fifo_node() {
        let dir = tempdir().unwrap();
        let driver = driver(dir.path());
        let stat = driver
            .mknod(Path::new("/pipe"), libc::S_IFIFO as u32 | 0o600, 0)
            .unwrap();
        use std::os::unix::fs::FileTypeExt;
        assert!(stat.meta.file_type().is_fifo());
    }

    #[test]
    fn test_symlink_and_hard_link() {
        let dir = tempdir().unwrap();
        let driver = driver(dir.path());
        fs::write(dir.path().join("target.txt"), b"t").unwrap();

        let stat = driver
            .symlink(Path::new("target.txt"), Path::new("/link"))
            .unwrap();
        assert!(stat.meta.file_type().is_symlink());
        assert_eq!(
            driver.readlink(Path::new("/link")).unwrap(),
            PathBuf::from("target.txt")
        );

        let stat = driver
            .link(Path::new("/target.txt"), Path::new("/hard.txt"))
            .unwrap();
        assert_eq!(stat.meta.nlink(), 2);
    }

    #[test]
    fn test_rename_noreplace() {
        let dir = tempdir().unwrap();
        let driver = driver(dir.path());
        fs::write(dir.path().join("a"), b"a").unwrap();
        fs::write(dir.path().join("b"), b"b").unwrap();

        let err = driver
            .rename(Path::new("/a"), Path::new("/b"), libc::RENAME_NOREPLACE)
            .unwrap_err();
        assert_eq!(err.errno(), libc::EEXIST);

        driver.rename(Path::new("/a"), Path::new("/b"), 0).unwrap();
        assert_eq!(fs::read(dir.path().join("b")).unwrap(), b"a");

        let err = driver
            .rename(Path::new("/b"), Path::new("/c"), libc::RENAME_EXCHANGE)
            .unwrap_err();
        assert_eq!(err.errno(), libc::EINVAL);
    }

    #[test]
    fn test_chmod_truncate_utimens() {
        let dir = tempdir().unwrap();
        let driver = driver(dir.path());
        fs::write(dir.path().join("f"), b"0123456789").unwrap();

        driver.chmod(Path::new("/f"), 0o600).unwrap();
        driver.truncate(Path::new("/f"), 4).unwrap();
        let when = UNIX_EPOCH + Duration::from_secs(1_000_000);
        driver
            .utimens(Path::new("/f"), None, Some(TimeOrNow::SpecificTime(when)))
            .unwrap();

        let stat = driver.getattr(Path::new("/f")).unwrap();
        assert_eq!(stat.meta.permissions().mode() & 0o777, 0o600);
        assert_eq!(stat.size, 4);
        assert_eq!(stat.meta.mtime(), 1_000_000);
    }

    #[test]
    fn test_open_checks_existence_and_truncates() {
        let dir = tempdir().unwrap();
        let driver = driver(dir.path());
        fs::write(dir.path().join("f"), b"content").unwrap();

        driver.open(Path::new("/f"), libc::O_RDONLY).unwrap();
        assert_eq!(
            driver.open(Path::new("/missing"), libc::O_RDONLY).unwrap_err().errno(),
            libc::ENOENT
        );

        driver.open(Path::new("/f"), libc::O_WRONLY | libc::O_TRUNC).unwrap();
        assert_eq!(fs::metadata(dir.path().join("f")).unwrap().len(), 0);
    }

    #[test]
    fn test_statfs_and_fsync() {
        let dir = tempdir().unwrap();
        let driver = driver(dir.path());
        fs::write(dir.path().join("f"), b"x").unwrap();

        let stats = driver.statfs(Path::new("/")).unwrap();
        assert!(stats.blocks() > 0);
        driver.fsync(Path::new("/f"), false).unwrap();
        driver.fsync(Path::new("/f"), true).unwrap();
    }

    #[test]
    fn test_readdir_hides_temp_files() {
        let dir = tempdir().unwrap();
        let driver = driver(dir.path());
        fs::write(dir.path().join(format!("{}abc", TEMP_PREFIX)), b"").unwrap();
        fs::write(dir.path().join("visible"), b"").unwrap();

        let entries = driver.readdir(Path::new("/")).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "visible");
    }

    #[test]
    fn test_marker_xattr_drives_encryption() {
        let dir = tempdir().unwrap();
        if !xattrs_supported(dir.path()) {
            return;
        }
        let driver = driver(dir.path());
        let marker_name = OsStr::new(marker::MARKER_ATTR);
        fs::write(dir.path().join("note.txt"), b"hello").unwrap();

        driver
            .setxattr(Path::new("/note.txt"), marker_name, b"true", 0)
            .unwrap();
        assert_eq!(
            fs::metadata(dir.path().join("note.txt")).unwrap().len(),
            (HEADER_SIZE + 5) as u64
        );
        assert_eq!(driver.getattr(Path::new("/note.txt")).unwrap().size, 5);
        assert_eq!(
            driver.getxattr(Path::new("/note.txt"), marker_name).unwrap(),
            b"true"
        );

        let err = driver
            .setxattr(Path::new("/note.txt"), marker_name, b"yes", 0)
            .unwrap_err();
        assert_eq!(err.errno(), libc::EINVAL);

        driver
            .removexattr(Path::new("/note.txt"), marker_name)
            .unwrap();
        assert_eq!(fs::read(dir.path().join("note.txt")).unwrap(), b"hello");
        assert_eq!(
            driver
                .removexattr(Path::new("/note.txt"), marker_name)
                .unwrap_err()
                .errno(),
            libc::ENODATA
        );
    }

    #[test]
    fn test_plain_xattr_passthrough() {
        let dir = tempdir().unwrap();
        if !xattrs_supported(dir.path()) {
            return;
        }
        let driver = driver(dir.path());
        let name = OsStr::new("user.comment");
        fs::write(dir.path().join("f"), b"x").unwrap();

        driver.setxattr(Path::new("/f"), name, b"hi", 0).unwrap();
        assert_eq!(driver.getxattr(Path::new("/f"), name).unwrap(), b"hi");
        assert_eq!(
            driver
                .setxattr(Path::new("/f"), name, b"again", libc::XATTR_CREATE)
                .unwrap_err()
                .errno(),
            libc::EEXIST
        );

        let list = driver.listxattr(Path::new("/f")).unwrap();
        assert!(list.split(|b| *b == 0).any(|n| n == b"user.comment"));

        driver.removexattr(Path::new("/f"), name).unwrap();
        assert_eq!(
            driver.getxattr(Path::new("/f"), name).unwrap_err().errno(),
            libc::ENODATA
        );
        assert_eq!(
            driver
                .setxattr(Path::new("/f"), name, b"x", libc::XATTR_REPLACE)
                .unwrap_err()
                .errno(),
            libc::ENODATA
        );
    }

    #[test]
    fn test_encrypt_new_files() {
        let dir = tempdir().unwrap();
        if !xattrs_supported(dir.path()) {
            return;
        }
        let driver = Driver::new(test_session(dir.path()), true);

        driver.create(Path::new("/new.txt"), 0o644, libc::O_WRONLY).unwrap();
        driver.write(Path::new("/new.txt"), 0, b"fresh").unwrap();

        assert!(marker::is_encrypted(&dir.path().join("new.txt")));
        assert_eq!(driver.read(Path::new("/new.txt"), 0, 16).unwrap(), b"fresh");
        assert_ne!(fs::read(dir.path().join("new.txt")).unwrap(), b"fresh");
    }
}
