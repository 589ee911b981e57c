//! Per-file encryption marker
//!
//! Whether a file's stored bytes are ciphertext is recorded on the file
//! itself as an extended attribute. A missing attribute means plaintext,
//! and so does a store without xattr support: the mirror stays usable,
//! it just never holds encrypted files.

use crate::error::{Error, Result};
use std::path::Path;
use tracing::{debug, warn};

/// Extended attribute holding the marker
pub const MARKER_ATTR: &str = "user.mirrorcrypt.encrypted";

/// Marker value for ciphertext
pub const ENCRYPTED: &str = "true";

/// Marker value for plaintext
pub const UNENCRYPTED: &str = "false";

/// True if `name` is the marker attribute
pub fn is_marker_name(name: &std::ffi::OsStr) -> bool {
    name == MARKER_ATTR
}

/// Parse a raw marker value
///
/// Only the two canonical strings are accepted. A single trailing NUL is
/// tolerated because C tools commonly store the terminator.
pub fn parse_marker(value: &[u8]) -> Result<bool> {
    let trimmed = value.strip_suffix(b"\0").unwrap_or(value);
    match trimmed {
        v if v == ENCRYPTED.as_bytes() => Ok(true),
        v if v == UNENCRYPTED.as_bytes() => Ok(false),
        other => Err(Error::InvalidMarker(
            String::from_utf8_lossy(other).into_owned(),
        )),
    }
}

/// Canonical attribute value for a marker state
pub fn marker_value(encrypted: bool) -> &'static str {
    if encrypted {
        ENCRYPTED
    } else {
        UNENCRYPTED
    }
}

/// Read the marker strictly
///
/// `Ok(None)` when the attribute is absent. A value other than the two
/// canonical strings is reported as plaintext.
pub fn read_marker(real: &Path) -> Result<Option<bool>> {
    match xattr::get(real, MARKER_ATTR)? {
        None => Ok(None),
        Some(value) => match parse_marker(&value) {
            Ok(state) => Ok(Some(state)),
            Err(e) => {
                warn!(path = %real.display(), error = %e, "ignoring malformed encryption marker");
                Ok(Some(false))
            }
        },
    }
}

/// Whether the stored bytes of `real` are ciphertext
///
/// Never fails: absence, lack of xattr support and read errors all mean
/// plaintext. A real I/O problem resurfaces when the content is opened.
pub fn is_encrypted(real: &Path) -> bool {
    match read_marker(real) {
        Ok(state) => state.unwrap_or(false),
        Err(e) if e.is_unsupported() => {
            debug!(path = %real.display(), "xattrs unsupported, treating as plaintext");
            false
        }
        Err(e) => {
            debug!(path = %real.display(), error = %e, "marker unreadable, treating as plaintext");
            false
        }
    }
}

/// Write the marker verbatim; does not touch content
pub fn set_marker(real: &Path, encrypted: bool) -> Result<()> {
    xattr::set(real, MARKER_ATTR, marker_value(encrypted).as_bytes())?;
    Ok(())
}

/// Remove the marker; an already missing marker is not an error
pub fn clear_marker(real: &Path) -> Result<()> {
    match xattr::remove(real, MARKER_ATTR) {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(libc::ENODATA) => Ok(()),
        Err(e) => Err(e.into()),
    }
}
