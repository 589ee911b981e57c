//! mirrorcrypt - Encrypting mirror filesystem
//!
//! This library provides a FUSE filesystem that exposes an existing
//! directory tree through a mount point. Names, directory structure and
//! metadata stay in the clear; the content of each file is stored either
//! as plaintext or as ciphertext, as recorded by an extended attribute on
//! the file itself.

pub mod config;
pub mod crypto;
pub mod error;
pub mod fs;
pub mod lock;
pub mod marker;
pub mod mount;
pub mod path;
pub mod pipeline;
pub mod session;

#[cfg(test)]
mod testing;

pub use config::Config;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{Error, Result};
    pub use crate::fs::{Driver, MirrorFs};
    pub use crate::pipeline::ContentPipeline;
    pub use crate::session::SessionContext;
}
