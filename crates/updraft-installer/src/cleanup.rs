//! Idempotent teardown of daemon-owned resources.
//!
//! Every exit path, successful or fatal, funnels through
//! [`remove_exit_artifacts`]: the staging directory (when one was ever
//! received), both socket files, and the daemon's own bundle. The daemon
//! is a single-shot installer, so its own bundle is transient and is
//! removed unconditionally. All removals are best effort; failures are
//! logged and never block exit.

use std::fs;
use std::path::Path;

use tracing::{debug, warn};

/// Remove a directory tree if it exists. Best effort.
pub fn remove_dir_if_present(path: &Path) {
    if !path.exists() {
        return;
    }
    match fs::remove_dir_all(path) {
        Ok(()) => debug!(path = %path.display(), "removed directory"),
        Err(error) => warn!(path = %path.display(), %error, "failed to remove directory"),
    }
}

/// Remove a file if it exists. Best effort.
pub fn remove_file_if_present(path: &Path) {
    if !path.exists() {
        return;
    }
    match fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "removed file"),
        Err(error) => warn!(path = %path.display(), %error, "failed to remove file"),
    }
}

/// Remove everything the daemon owns on disk.
///
/// Safe to call more than once; every removal checks for presence first.
pub fn remove_exit_artifacts(
    staging_directory: Option<&Path>,
    socket_paths: &[&Path],
    own_bundle: Option<&Path>,
) {
    if let Some(staging) = staging_directory {
        remove_dir_if_present(staging);
    }
    for socket in socket_paths {
        remove_file_if_present(socket);
    }
    if let Some(bundle) = own_bundle {
        remove_dir_if_present(bundle);
    }
}
