//! updraft-installer - Update Installer Daemon
//!
//! A single-shot auxiliary process: launched next to a host application
//! with the host's bundle identifier, it accepts one updater connection
//! and one agent connection, installs the update the updater submits, and
//! exits. The daemon's own bundle is transient and removed on exit.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;
use updraft_installer::{run_daemon, Collaborators, DaemonConfig, Timeouts};

/// updraft installer daemon
#[derive(Parser, Debug)]
#[command(name = "updraft-installer")]
#[command(version, about, long_about = None)]
struct Args {
    /// Bundle identifier of the host application being updated
    host_bundle_identifier: String,

    /// Allow backends that require user interaction
    #[arg(long)]
    allow_interaction: bool,

    /// Directory for the updater and agent sockets
    #[arg(long)]
    socket_dir: Option<PathBuf>,

    /// The daemon's own bundle directory, removed on exit
    /// (defaults to the executable's parent directory)
    #[arg(long)]
    bundle_path: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn default_socket_dir() -> PathBuf {
    std::env::var_os("XDG_RUNTIME_DIR")
        .map_or_else(|| std::env::temp_dir().join("updraft"), PathBuf::from)
}

/// The daemon's own bundle: the executable's parent directory, but only
/// when it actually is a bundle. A bare binary run from a build tree has
/// no bundle to remove.
fn own_bundle_path() -> Option<PathBuf> {
    let exe = std::env::current_exe().ok()?;
    let parent = exe.parent()?;
    updraft_core::bundle::BundleInfo::is_bundle(parent).then(|| parent.to_path_buf())
}

fn main() {
    let code = match try_main() {
        Ok(code) => code,
        Err(error) => {
            eprintln!("updraft-installer: {error:#}");
            1
        },
    };
    std::process::exit(code);
}

fn try_main() -> Result<i32> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(args.log_level.clone())),
        )
        .init();

    let config = DaemonConfig {
        host_bundle_identifier: args.host_bundle_identifier,
        allow_interaction: args.allow_interaction,
        socket_dir: args.socket_dir.unwrap_or_else(default_socket_dir),
        own_bundle_path: args.bundle_path.or_else(own_bundle_path),
        timeouts: Timeouts::default(),
    };
    info!(
        identifier = %config.host_bundle_identifier,
        socket_dir = %config.socket_dir.display(),
        "starting installer daemon"
    );

    // The main scheduler is cooperative and single-threaded; backend
    // work runs on the dedicated installer worker thread instead.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build runtime")?;
    let exit = runtime.block_on(run_daemon(config, Collaborators::default()));
    Ok(exit.code())
}
