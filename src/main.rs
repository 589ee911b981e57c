//! mirrorcrypt - Encrypting mirror filesystem
//!
//! Usage:
//!   mirrorcrypt [OPTIONS] <KEY> <MIRROR_DIR> <MOUNT_POINT>
//!
//! Files under the mount whose `user.mirrorcrypt.encrypted` attribute is
//! "true" are stored encrypted in the mirror directory:
//!   setfattr -n user.mirrorcrypt.encrypted -v true <MOUNT_POINT>/file

use anyhow::Context;
use clap::{error::ErrorKind, CommandFactory, Parser};
use mirrorcrypt::{config::Config, mount};
use std::path::PathBuf;
use tracing::error;
use tracing_subscriber::EnvFilter;
use zeroize::Zeroizing;

#[derive(Parser)]
#[command(name = "mirrorcrypt")]
#[command(version)]
#[command(about = "Mirror a directory through FUSE, encrypting marked files")]
struct Cli {
    /// Passphrase the content key is derived from
    key: String,

    /// Directory whose contents are mirrored
    mirror_dir: PathBuf,

    /// Where the mirror is mounted
    mount_point: PathBuf,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Allow other users to access the mount
    #[arg(long)]
    allow_other: bool,

    /// Mark files created through the mount as encrypted
    #[arg(long)]
    encrypt_new: bool,
}

fn main() {
    if let Err(e) = mount::check_process_privilege() {
        eprintln!("mirrorcrypt: {}", e);
        std::process::exit(1);
    }

    let mut cli = Cli::parse();
    if let Err(e) = mount::check_operands(&cli.mirror_dir, &cli.mount_point) {
        Cli::command().error(ErrorKind::InvalidValue, e).exit();
    }

    // Setup logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let key = Zeroizing::new(std::mem::take(&mut cli.key));

    if let Err(e) = run(&cli, &key) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(cli: &Cli, key: &str) -> anyhow::Result<()> {
    let mut config = Config::resolve(cli.config.as_deref()).context("loading configuration")?;
    if cli.allow_other {
        config.mount.allow_other = true;
    }
    if cli.encrypt_new {
        config.mount.encrypt_new_files = true;
    }

    mount::mount(key, &cli.mirror_dir, &cli.mount_point, &config).with_context(|| {
        format!(
            "mounting {} at {}",
            cli.mirror_dir.display(),
            cli.mount_point.display()
        )
    })
}
