//! Mount controller
//!
//! Validates the invocation, builds the session and hands the filesystem
//! to FUSE. [`mount`] blocks until the mount point is unmounted.

use crate::config::{Config, MountConfig};
use crate::error::{Error, Result};
use crate::fs::{Driver, MirrorFs};
use crate::session::SessionContext;
use fuser::MountOption;
use nix::sys::stat::{umask, Mode};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Refuse to run with root privileges
///
/// A root-run mirror would create files owned by root on behalf of any
/// user able to reach the mount.
pub fn check_privilege(uid: u32, euid: u32) -> Result<()> {
    if uid == 0 || euid == 0 {
        return Err(Error::Privileged);
    }
    Ok(())
}

/// Check the privilege of the running process
pub fn check_process_privilege() -> Result<()> {
    check_privilege(
        nix::unistd::getuid().as_raw(),
        nix::unistd::geteuid().as_raw(),
    )
}

/// Reject directory operands that look like options
pub fn check_operands(mirror_dir: &Path, mount_point: &Path) -> Result<()> {
    for operand in [mirror_dir, mount_point] {
        if operand.as_os_str().is_empty() {
            return Err(Error::InvalidArgument("empty directory operand".to_string()));
        }
        if operand.to_string_lossy().starts_with('-') {
            return Err(Error::InvalidArgument(format!(
                "directory operand looks like an option: {}",
                operand.display()
            )));
        }
    }
    Ok(())
}

/// FUSE mount options for a mount configuration
pub fn mount_options(config: &MountConfig) -> Vec<MountOption> {
    let mut options = vec![
        MountOption::FSName(config.fs_name.clone()),
        MountOption::Subtype("mirrorcrypt".to_string()),
        MountOption::RW,
    ];

    if config.allow_other {
        options.push(MountOption::AllowOther);
        if config.auto_unmount {
            options.push(MountOption::AutoUnmount);
        }
    }

    options
}

/// Build the filesystem for `mirror_dir` without mounting it
pub fn build_filesystem(passphrase: &str, mirror_dir: &Path, config: &Config) -> Result<MirrorFs> {
    let session = SessionContext::new(mirror_dir, passphrase, &config.encryption)?;
    info!(root = %session.root().display(), "session ready");

    let driver = Driver::new(Arc::new(session), config.mount.encrypt_new_files);
    Ok(MirrorFs::new(
        driver,
        Duration::from_secs(config.mount.attr_ttl_secs),
    ))
}

/// Mount the mirror of `mirror_dir` at `mount_point` and serve it
pub fn mount(passphrase: &str, mirror_dir: &Path, mount_point: &Path, config: &Config) -> Result<()> {
    check_operands(mirror_dir, mount_point)?;
    if !mount_point.is_dir() {
        return Err(Error::PathNotFound(mount_point.display().to_string()));
    }

    // Modes requested through the mount are applied to the mirror as-is.
    umask(Mode::empty());

    let fs = build_filesystem(passphrase, mirror_dir, config)?;
    let options = mount_options(&config.mount);

    info!(
        mount_point = %mount_point.display(),
        allow_other = config.mount.allow_other,
        encrypt_new_files = config.mount.encrypt_new_files,
        "mounting"
    );
    fuser::mount2(fs, mount_point, &options).map_err(|e| Error::Mount(e.to_string()))?;
    info!(mount_point = %mount_point.display(), "unmounted");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_check_privilege() {
        assert!(check_privilege(1000, 1000).is_ok());
        assert!(matches!(check_privilege(0, 1000), Err(Error::Privileged)));
        assert!(matches!(check_privilege(1000, 0), Err(Error::Privileged)));
    }

    #[test]
    fn test_check_operands() {
        assert!(check_operands(Path::new("/data"), Path::new("/mnt")).is_ok());
        assert!(check_operands(Path::new("-f"), Path::new("/mnt")).is_err());
        assert!(check_operands(Path::new("/data"), Path::new("-d")).is_err());
        assert!(check_operands(Path::new(""), Path::new("/mnt")).is_err());
    }

    #[test]
    fn test_mount_options_default() {
        let options = mount_options(&MountConfig::default());
        assert!(options.contains(&MountOption::FSName("mirrorcrypt".to_string())));
        assert!(options.contains(&MountOption::RW));
        assert!(!options.contains(&MountOption::AllowOther));
        assert!(!options.contains(&MountOption::AutoUnmount));
    }

    #[test]
    fn test_mount_options_allow_other() {
        let config = MountConfig {
            allow_other: true,
            ..Default::default()
        };
        let options = mount_options(&config);
        assert!(options.contains(&MountOption::AllowOther));
        assert!(options.contains(&MountOption::AutoUnmount));
    }

    #[test]
    fn test_build_filesystem_rejects_missing_root() {
        let dir = tempdir().unwrap();
        let result = build_filesystem("k1", &dir.path().join("absent"), &Config::default());
        assert!(matches!(result, Err(Error::PathNotFound(_))));
    }

    #[test]
    fn test_build_filesystem_rejects_empty_key() {
        let dir = tempdir().unwrap();
        let result = build_filesystem("", dir.path(), &Config::default());
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_mount_rejects_missing_mount_point() {
        let dir = tempdir().unwrap();
        let result = mount("k1", dir.path(), &dir.path().join("absent"), &Config::default());
        assert!(matches!(result, Err(Error::PathNotFound(_))));
    }
}
