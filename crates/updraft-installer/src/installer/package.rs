//! Guided installer for package updates.
//!
//! Package payloads are handed to an external install command during
//! stage 3. The command owns its own progress presentation, so this
//! backend reports `displays_user_progress` and cannot install silently.

use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::info;

use super::{InstallerBackend, InstallerError};

/// Default package install command looked up on `PATH`.
const DEFAULT_INSTALL_COMMAND: &str = "updraft-pkginstall";

/// Installer invoking an external command on a `.pkg` payload.
#[derive(Debug)]
pub struct PackageInstaller {
    package: PathBuf,
    host_path: PathBuf,
    command: PathBuf,
}

impl PackageInstaller {
    /// Create an installer for `package`, updating the bundle at
    /// `host_path`, using the default install command.
    #[must_use]
    pub fn new(package: &Path, host_path: &Path) -> Self {
        Self::with_command(package, host_path, Path::new(DEFAULT_INSTALL_COMMAND))
    }

    /// Create an installer with an explicit install command.
    #[must_use]
    pub fn with_command(package: &Path, host_path: &Path, command: &Path) -> Self {
        Self {
            package: package.to_path_buf(),
            host_path: host_path.to_path_buf(),
            command: command.to_path_buf(),
        }
    }
}

impl InstallerBackend for PackageInstaller {
    fn can_install_silently(&self) -> bool {
        false
    }

    fn displays_user_progress(&self) -> bool {
        true
    }

    fn installation_path(&self) -> PathBuf {
        // Packages install over the existing bundle location.
        self.host_path.clone()
    }

    fn perform_first_stage(&mut self) -> Result<(), InstallerError> {
        if self.package.is_file() {
            Ok(())
        } else {
            Err(InstallerError::Io {
                path: self.package.clone(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "package missing"),
            })
        }
    }

    fn perform_second_stage(&mut self, allow_ui: bool) -> Result<(), InstallerError> {
        // The install command is interactive; without UI this is a
        // cancellation, not a failure.
        if allow_ui {
            Ok(())
        } else {
            Err(InstallerError::Cancelled)
        }
    }

    fn perform_third_stage(&mut self) -> Result<(), InstallerError> {
        info!(package = %self.package.display(), "running package install command");
        let status = Command::new(&self.command)
            .arg(&self.package)
            .arg(&self.host_path)
            .status()
            .map_err(InstallerError::CommandUnavailable)?;
        if status.success() {
            Ok(())
        } else {
            Err(InstallerError::CommandFailed { status })
        }
    }

    fn cleanup(&mut self) {}
}
