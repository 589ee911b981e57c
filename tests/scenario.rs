//! End-to-end behavior of the driver over a real mirror directory

use mirrorcrypt::config::EncryptionConfig;
use mirrorcrypt::crypto::HEADER_SIZE;
use mirrorcrypt::fs::Driver;
use mirrorcrypt::marker::MARKER_ATTR;
use mirrorcrypt::session::SessionContext;
use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;
use tempfile::tempdir;

fn fast_config() -> EncryptionConfig {
    EncryptionConfig {
        argon2_memory_kib: 1024,
        argon2_iterations: 1,
        argon2_parallelism: 1,
        salt: Vec::new(),
    }
}

fn driver(root: &Path, key: &str) -> Driver {
    let session = SessionContext::new(root, key, &fast_config()).unwrap();
    Driver::new(Arc::new(session), false)
}

fn xattrs_supported(dir: &Path) -> bool {
    let probe = dir.join("probe");
    std::fs::write(&probe, b"").unwrap();
    let supported = xattr::set(&probe, "user.probe", b"1").is_ok();
    std::fs::remove_file(&probe).unwrap();
    supported
}

#[test]
fn marked_file_round_trips_through_the_mount() {
    let dir = tempdir().unwrap();
    if !xattrs_supported(dir.path()) {
        return;
    }
    let data = dir.path();
    std::fs::write(data.join("note.txt"), b"hello").unwrap();
    let fs = driver(data, "k1");
    let note = Path::new("/note.txt");

    fs.setxattr(note, OsStr::new(MARKER_ATTR), b"true", 0).unwrap();

    let stored = std::fs::read(data.join("note.txt")).unwrap();
    assert_eq!(stored.len(), HEADER_SIZE + 5);
    assert!(!stored.windows(5).any(|w| w == b"hello"));

    assert_eq!(fs.read(note, 0, 5).unwrap(), b"hello");
    assert_eq!(fs.write(note, 5, b"!!").unwrap(), 2);
    assert_eq!(fs.read(note, 0, 7).unwrap(), b"hello!!");
    assert_eq!(fs.getattr(note).unwrap().size, 7);
}

#[test]
fn same_key_reads_back_after_remount() {
    let dir = tempdir().unwrap();
    if !xattrs_supported(dir.path()) {
        return;
    }
    let data = dir.path();
    std::fs::write(data.join("secret"), b"payload").unwrap();

    {
        let fs = driver(data, "k1");
        fs.setxattr(Path::new("/secret"), OsStr::new(MARKER_ATTR), b"true", 0)
            .unwrap();
    }

    let again = driver(data, "k1");
    assert_eq!(again.read(Path::new("/secret"), 0, 64).unwrap(), b"payload");

    let other = driver(data, "k2");
    assert_ne!(other.read(Path::new("/secret"), 0, 64).unwrap(), b"payload");
}

#[test]
fn unmarked_files_are_stored_verbatim() {
    let dir = tempdir().unwrap();
    let data = dir.path();
    let fs = driver(data, "k1");

    fs.create(Path::new("/plain.txt"), 0o644, libc::O_WRONLY).unwrap();
    fs.write(Path::new("/plain.txt"), 0, b"visible").unwrap();

    assert_eq!(std::fs::read(data.join("plain.txt")).unwrap(), b"visible");
    assert_eq!(fs.read(Path::new("/plain.txt"), 2, 3).unwrap(), b"sib");
}

#[test]
fn directory_operations_pass_through() {
    let dir = tempdir().unwrap();
    let data = dir.path();
    let fs = driver(data, "k1");

    fs.mkdir(Path::new("/a"), 0o755).unwrap();
    fs.create(Path::new("/a/f"), 0o600, libc::O_RDWR).unwrap();
    fs.rename(Path::new("/a/f"), Path::new("/a/g"), 0).unwrap();

    let names: Vec<_> = fs
        .readdir(Path::new("/a"))
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();
    assert_eq!(names, vec!["g"]);
    assert!(data.join("a/g").is_file());
}
