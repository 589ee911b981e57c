//! Helpers shared by unit tests

use crate::crypto::{AesCtrCipher, KEY_SIZE};
use crate::session::SessionContext;
use std::path::Path;
use std::sync::Arc;

/// Session over `dir` with a fixed key, skipping Argon2
pub(crate) fn test_session(dir: &Path) -> Arc<SessionContext> {
    let cipher = AesCtrCipher::new([0x5a; KEY_SIZE]);
    Arc::new(SessionContext::with_cipher(dir, Box::new(cipher)).unwrap())
}

/// Whether `dir` accepts user extended attributes
///
/// Tests exercising the marker return early on stores that don't.
pub(crate) fn xattrs_supported(dir: &Path) -> bool {
    let probe = dir.join(".xattr-probe");
    if std::fs::write(&probe, b"").is_err() {
        return false;
    }
    let supported = xattr::set(&probe, "user.mirrorcrypt.probe", b"1").is_ok();
    let _ = std::fs::remove_file(&probe);
    supported
}
