//! Three-stage installer backends and the serial worker that runs them.
//!
//! Backends advance through three stages: *prepare* (stage 1, host may be
//! running), *apply* (stage 2, host may still be running), and *finalize*
//! (stage 3, after host termination). All backend calls are long,
//! synchronous, and opaque, so they execute on one dedicated worker
//! thread; the controller never blocks on them and receives results
//! through the event funnel.

mod package;
mod staged;
mod worker;

use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::Arc;

use thiserror::Error;
use updraft_core::bundle::BundleInfo;
use updraft_core::validation::InstallSource;

pub use package::PackageInstaller;
pub use staged::StagedBundleInstaller;
pub use worker::{InstallerJob, InstallerWorker};

/// Errors from installer backends.
#[derive(Debug, Error)]
pub enum InstallerError {
    /// No backend handles this install source.
    #[error("no installer for {}", path.display())]
    Unsupported {
        /// The install source nothing handles.
        path: PathBuf,
    },

    /// A guided backend was asked to proceed without interaction.
    #[error("installation cancelled")]
    Cancelled,

    /// A filesystem operation failed.
    #[error("installer io error at {}", path.display())]
    Io {
        /// Path being operated on.
        path: PathBuf,
        /// Underlying IO failure.
        #[source]
        source: std::io::Error,
    },

    /// The external package install command failed.
    #[error("package install command exited with {status}")]
    CommandFailed {
        /// Exit status of the command.
        status: ExitStatus,
    },

    /// The external package install command could not be run.
    #[error("package install command failed to run: {0}")]
    CommandUnavailable(#[source] std::io::Error),
}

/// A three-stage installer.
pub trait InstallerBackend: Send {
    /// Whether the remaining stages can run without user interaction.
    fn can_install_silently(&self) -> bool;

    /// Whether the backend presents its own progress UI during stage 3.
    fn displays_user_progress(&self) -> bool;

    /// Where the updated application will live after stage 3.
    fn installation_path(&self) -> PathBuf;

    /// Stage 1: prepare the update next to the target.
    ///
    /// # Errors
    ///
    /// Returns an [`InstallerError`]; the caller must then discard the
    /// backend after [`cleanup`](Self::cleanup).
    fn perform_first_stage(&mut self) -> Result<(), InstallerError>;

    /// Stage 2: apply preparatory work that may run while the host lives.
    ///
    /// # Errors
    ///
    /// [`InstallerError::Cancelled`] when the stage needs UI and
    /// `allow_ui` is false; any other error is a hard failure.
    fn perform_second_stage(&mut self, allow_ui: bool) -> Result<(), InstallerError>;

    /// Stage 3: finalize the swap. Only called after host termination.
    ///
    /// # Errors
    ///
    /// Returns an [`InstallerError`] on failure.
    fn perform_third_stage(&mut self) -> Result<(), InstallerError>;

    /// Remove any intermediate state the backend still holds. Idempotent.
    fn cleanup(&mut self);
}

/// Everything a factory needs to construct a backend.
#[derive(Debug, Clone)]
pub struct InstallerContext {
    /// The installed bundle being replaced.
    pub host: BundleInfo,
    /// Daemon-owned staging directory.
    pub staging_directory: PathBuf,
    /// Validated install source.
    pub source: InstallSource,
    /// Whether the daemon was launched with interaction allowed.
    pub allow_interaction: bool,
}

/// Factory constructing a backend for a validated install source.
///
/// Runs on the worker thread as the first step of stage 1.
pub type InstallerFactory =
    Arc<dyn Fn(&InstallerContext) -> Result<Box<dyn InstallerBackend>, InstallerError> + Send + Sync>;

/// Capabilities and placement reported after a successful stage 1.
#[derive(Debug, Clone)]
pub struct Stage1Ready {
    /// Whether the backend can finish without user interaction.
    pub can_install_silently: bool,
    /// Whether the backend shows its own progress UI.
    pub displays_user_progress: bool,
    /// Where the updated application will live.
    pub installation_path: PathBuf,
}

/// The default factory: staged filesystem swap for bundles, external
/// install command for packages.
#[must_use]
pub fn default_installer_factory() -> InstallerFactory {
    Arc::new(|context: &InstallerContext| {
        if context.source.is_package {
            if !context.allow_interaction {
                // A guided package install cannot run headless.
                return Err(InstallerError::Cancelled);
            }
            Ok(Box::new(PackageInstaller::new(
                &context.source.path,
                &context.host.bundle_path,
            )) as Box<dyn InstallerBackend>)
        } else {
            Ok(Box::new(StagedBundleInstaller::new(
                &context.host.bundle_path,
                &context.staging_directory,
                &context.source.path,
            )) as Box<dyn InstallerBackend>)
        }
    })
}
