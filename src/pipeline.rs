//! Content pipeline: reads and writes through the cipher
//!
//! A stream cipher cannot decode byte `i` without decoding everything in
//! front of it, and there is no per-file index to seek with. Every content
//! operation therefore materializes the whole file:
//!
//! - read: decode the whole file into memory, then slice the requested window
//! - write (encrypted): decode, splice, re-encode, atomically replace
//! - write (plaintext): ordinary positional write
//!
//! This is O(file size) per call and nothing is cached between calls.
//! Each operation holds the lock of its real path for the whole cycle.

use crate::crypto::Direction;
use crate::error::{Error, Result};
use crate::lock::{PathGuard, PathLocks};
use crate::marker;
use crate::session::SessionContext;
use std::fs::{self, File, Metadata, OpenOptions};
use std::io::{BufWriter, Write};
use std::os::unix::fs::{FileExt, MetadataExt};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};
use zeroize::Zeroizing;

/// Prefix of the temporary files used for atomic replacement
pub const TEMP_PREFIX: &str = ".mirrorcrypt-";

/// Whole-file plaintext for the duration of one call
type Materialized = Zeroizing<Vec<u8>>;

/// Read/write orchestration over the session cipher
pub struct ContentPipeline {
    session: Arc<SessionContext>,
    locks: PathLocks,
}

impl ContentPipeline {
    pub fn new(session: Arc<SessionContext>) -> Self {
        Self {
            session,
            locks: PathLocks::new(),
        }
    }

    pub fn session(&self) -> &SessionContext {
        &self.session
    }

    /// Lock two real paths for operations that move content around
    pub fn lock_pair(&self, a: &Path, b: &Path) -> (PathGuard<'_>, Option<PathGuard<'_>>) {
        self.locks.lock_pair(a, b)
    }

    /// Read `size` bytes at `offset` of the plaintext view of `real`
    ///
    /// Reading past the end yields fewer (or zero) bytes, never an error.
    pub fn read(&self, real: &Path, offset: u64, size: usize) -> Result<Vec<u8>> {
        let _guard = self.locks.lock(real);
        let content = self.materialize(real)?;
        Ok(window(&content, offset, size).to_vec())
    }

    /// Write `data` at `offset` of the plaintext view of `real`
    pub fn write(&self, real: &Path, offset: u64, data: &[u8]) -> Result<usize> {
        let _guard = self.locks.lock(real);

        if !marker::is_encrypted(real) {
            let file = OpenOptions::new().write(true).open(real)?;
            file.write_all_at(data, offset)?;
            return Ok(data.len());
        }

        let mut plaintext = self.materialize(real)?;
        splice(&mut plaintext, offset, data)?;
        debug!(path = %real.display(), offset, len = data.len(), total = plaintext.len(), "re-encoding after write");
        self.replace(real, Some(true), |out| {
            self.session
                .cipher()
                .transform(&mut plaintext.as_slice(), out, Direction::Encode)
        })?;
        Ok(data.len())
    }

    /// Set the plaintext length of `real`, zero-extending if it grows
    pub fn truncate(&self, real: &Path, size: u64) -> Result<()> {
        let _guard = self.locks.lock(real);

        if !marker::is_encrypted(real) {
            OpenOptions::new().write(true).open(real)?.set_len(size)?;
            return Ok(());
        }

        let mut plaintext = self.materialize(real)?;
        plaintext.resize(to_len(size)?, 0);
        self.replace(real, Some(true), |out| {
            self.session
                .cipher()
                .transform(&mut plaintext.as_slice(), out, Direction::Encode)
        })
    }

    /// Set the marker of `real`, re-transforming content when it flips
    ///
    /// Blocks until the stored bytes match the new marker. Files that are
    /// not regular files only get the attribute.
    pub fn set_encrypted(&self, real: &Path, encrypted: bool) -> Result<()> {
        let _guard = self.locks.lock(real);

        let meta = fs::symlink_metadata(real)?;
        if !meta.is_file() || marker::is_encrypted(real) == encrypted {
            return marker::set_marker(real, encrypted);
        }

        let direction = if encrypted {
            Direction::Encode
        } else {
            Direction::Decode
        };
        debug!(path = %real.display(), ?direction, "re-transforming on marker change");

        let mut source = File::open(real)?;
        self.replace(real, Some(encrypted), |out| {
            self.session.cipher().transform(&mut source, out, direction)
        })
    }

    /// Remove the marker of `real`, decoding content first if it was encrypted
    pub fn clear_encrypted(&self, real: &Path) -> Result<()> {
        let _guard = self.locks.lock(real);

        let meta = fs::symlink_metadata(real)?;
        if !meta.is_file() || !marker::is_encrypted(real) {
            xattr::remove(real, marker::MARKER_ATTR)?;
            return Ok(());
        }

        debug!(path = %real.display(), "decoding on marker removal");
        let mut source = File::open(real)?;
        self.replace(real, None, |out| {
            self.session
                .cipher()
                .transform(&mut source, out, Direction::Decode)
        })
    }

    /// Length applications see for `real`: plaintext length if encrypted
    pub fn content_len(&self, real: &Path, meta: &Metadata) -> u64 {
        if meta.is_file() && marker::is_encrypted(real) {
            self.session.cipher().decoded_len(meta.len())
        } else {
            meta.len()
        }
    }

    /// Stream the whole of `real` through the cipher into memory
    fn materialize(&self, real: &Path) -> Result<Materialized> {
        let mut file = File::open(real)?;
        let direction = if marker::is_encrypted(real) {
            Direction::Decode
        } else {
            Direction::Pass
        };

        let capacity = file.metadata().map(|m| m.len() as usize).unwrap_or(0);
        let mut buffer = Zeroizing::new(Vec::with_capacity(capacity));
        self.session
            .cipher()
            .transform(&mut file, &mut *buffer, direction)?;
        Ok(buffer)
    }

    /// Atomically replace `real` with content produced by `fill`
    ///
    /// The new content goes to a temp file in the same directory which
    /// inherits mode, ownership (when permitted) and extended attributes,
    /// gets `marker` (`None` leaves it absent), is synced and then renamed
    /// over `real`. On any error the temp file is removed and `real` is
    /// left untouched.
    fn replace<F>(&self, real: &Path, marker_state: Option<bool>, fill: F) -> Result<()>
    where
        F: FnOnce(&mut dyn Write) -> Result<()>,
    {
        let parent = real.parent().ok_or_else(|| {
            Error::InvalidArgument(format!("No parent directory: {}", real.display()))
        })?;
        let original = fs::symlink_metadata(real)?;

        let mut temp = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .tempfile_in(parent)?;
        {
            let mut writer = BufWriter::new(temp.as_file_mut());
            fill(&mut writer)?;
            writer.flush()?;
        }

        copy_metadata(real, &original, temp.path())?;
        match marker_state {
            Some(state) => marker::set_marker(temp.path(), state)?,
            None => marker::clear_marker(temp.path())?,
        }
        temp.as_file().sync_all()?;

        temp.persist(real).map_err(|e| Error::Io(e.error))?;

        if let Err(e) = File::open(parent).and_then(|dir| dir.sync_all()) {
            debug!(dir = %parent.display(), error = %e, "directory sync failed");
        }
        Ok(())
    }
}

/// Carry mode, ownership and xattrs of `source` over to `target`
fn copy_metadata(source: &Path, meta: &Metadata, target: &Path) -> Result<()> {
    fs::set_permissions(target, meta.permissions())?;

    if let Err(e) = std::os::unix::fs::lchown(target, Some(meta.uid()), Some(meta.gid())) {
        debug!(path = %target.display(), error = %e, "ownership not preserved");
    }

    let names = match xattr::list(source).map_err(Error::from) {
        Ok(names) => names,
        Err(e) if e.is_unsupported() => return Ok(()),
        Err(e) => return Err(e),
    };

    for name in names {
        if marker::is_marker_name(&name) {
            continue;
        }
        match xattr::get(source, &name) {
            Ok(Some(value)) => {
                if let Err(e) = xattr::set(target, &name, &value) {
                    warn!(path = %target.display(), attr = ?name, error = %e, "extended attribute not preserved");
                }
            }
            Ok(None) => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// The `[offset, offset + size)` window of `content`, clamped to its end
fn window(content: &[u8], offset: u64, size: usize) -> &[u8] {
    let len = content.len();
    let start = usize::try_from(offset).unwrap_or(usize::MAX).min(len);
    let end = start.saturating_add(size).min(len);
    &content[start..end]
}

/// Merge `data` into `buffer` at `offset`, zero-filling any gap
fn splice(buffer: &mut Vec<u8>, offset: u64, data: &[u8]) -> Result<()> {
    let start = to_len(offset)?;
    let end = start
        .checked_add(data.len())
        .ok_or_else(|| Error::Io(std::io::Error::from_raw_os_error(libc::EFBIG)))?;
    if buffer.len() < end {
        buffer.resize(end, 0);
    }
    buffer[start..end].copy_from_slice(data);
    Ok(())
}

fn to_len(value: u64) -> Result<usize> {
    usize::try_from(value).map_err(|_| Error::Io(std::io::Error::from_raw_os_error(libc::EFBIG)))
}
