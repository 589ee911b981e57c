//! Virtual to real path translation

use crate::error::{Error, Result};
use crate::session::SessionContext;
use std::path::{Path, PathBuf};

/// Longest real path the resolver will produce
pub const MAX_PATH_LEN: usize = libc::PATH_MAX as usize;

/// Map a virtual path (relative to the mount root) to the mirror directory
///
/// The caller is the FUSE runtime, which only hands out normalized paths,
/// so no `..` handling is done here. Only the length is bounded.
pub fn resolve(session: &SessionContext, virtual_path: &Path) -> Result<PathBuf> {
    let relative = virtual_path.strip_prefix("/").unwrap_or(virtual_path);

    let real = if relative.as_os_str().is_empty() {
        session.root().to_path_buf()
    } else {
        session.root().join(relative)
    };

    let len = real.as_os_str().len();
    if len >= MAX_PATH_LEN {
        return Err(Error::PathTooLong {
            len,
            max: MAX_PATH_LEN,
        });
    }
    Ok(real)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{AesCtrCipher, KEY_SIZE};
    use tempfile::tempdir;

    fn session(dir: &Path) -> SessionContext {
        SessionContext::with_cipher(dir, Box::new(AesCtrCipher::new([0; KEY_SIZE]))).unwrap()
    }

    #[test]
    fn test_resolve_joins_under_root() {
        let dir = tempdir().unwrap();
        let session = session(dir.path());

        let real = resolve(&session, Path::new("/docs/note.txt")).unwrap();
        assert_eq!(real, session.root().join("docs/note.txt"));

        let relative = resolve(&session, Path::new("docs/note.txt")).unwrap();
        assert_eq!(relative, real);
    }

    #[test]
    fn test_resolve_root() {
        let dir = tempdir().unwrap();
        let session = session(dir.path());
        assert_eq!(resolve(&session, Path::new("/")).unwrap(), session.root());
    }

    #[test]
    fn test_resolve_bounds_length() {
        let dir = tempdir().unwrap();
        let session = session(dir.path());

        let long = format!("/{}", "a/".repeat(MAX_PATH_LEN));
        let err = resolve(&session, Path::new(&long)).unwrap_err();
        assert_eq!(err.errno(), libc::ENAMETOOLONG);
    }
}
