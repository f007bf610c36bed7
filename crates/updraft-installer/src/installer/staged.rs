//! Staged filesystem installer for bundle updates.
//!
//! Stage 1 clones the extracted bundle into a staging area next to the
//! archive and fsyncs the copied files, so the swap in stage 3 is a pair
//! of renames: the installed bundle moves aside, the staged copy moves
//! into place, and the old copy is removed. A crash between the renames
//! leaves either the old or the new bundle present, never a partial one.
//!
//! The installation path keeps the extracted bundle's directory name: if
//! the update renamed the application, the new name wins and the old
//! directory is retired.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::{InstallerBackend, InstallerError};

/// Directory inside the staging area holding the prepared copy.
const STAGED_DIR: &str = "staged-install";

/// Suffix given to the outgoing bundle during the swap.
const RETIRED_SUFFIX: &str = "old";

/// Bundle installer performing a staged atomic swap.
#[derive(Debug)]
pub struct StagedBundleInstaller {
    host_path: PathBuf,
    staging_directory: PathBuf,
    source: PathBuf,
    staged: Option<PathBuf>,
}

impl StagedBundleInstaller {
    /// Create an installer replacing `host_path` with the bundle at
    /// `source`, staging under `staging_directory`.
    #[must_use]
    pub fn new(host_path: &Path, staging_directory: &Path, source: &Path) -> Self {
        Self {
            host_path: host_path.to_path_buf(),
            staging_directory: staging_directory.to_path_buf(),
            source: source.to_path_buf(),
            staged: None,
        }
    }

    fn io_error(path: &Path, source: std::io::Error) -> InstallerError {
        InstallerError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Sibling path the outgoing bundle moves to during the swap.
    ///
    /// Appends rather than replaces an extension so dotted bundle names
    /// survive intact.
    fn retired_path(&self) -> PathBuf {
        let mut name = self
            .host_path
            .file_name()
            .unwrap_or_default()
            .to_os_string();
        name.push(".");
        name.push(RETIRED_SUFFIX);
        self.host_path.with_file_name(name)
    }
}

/// Recursively copy a directory, fsyncing every written file.
fn copy_dir_synced(from: &Path, to: &Path) -> std::io::Result<()> {
    fs::create_dir_all(to)?;
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            copy_dir_synced(&entry.path(), &target)?;
        } else if file_type.is_symlink() {
            let link = fs::read_link(entry.path())?;
            std::os::unix::fs::symlink(link, &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
            File::open(&target)?.sync_all()?;
        }
    }
    Ok(())
}

impl InstallerBackend for StagedBundleInstaller {
    fn can_install_silently(&self) -> bool {
        true
    }

    fn displays_user_progress(&self) -> bool {
        false
    }

    fn installation_path(&self) -> PathBuf {
        let name = self
            .source
            .file_name()
            .unwrap_or_else(|| self.host_path.as_os_str());
        self.host_path
            .parent()
            .map_or_else(|| PathBuf::from(name), |parent| parent.join(name))
    }

    fn perform_first_stage(&mut self) -> Result<(), InstallerError> {
        let staged_root = self.staging_directory.join(STAGED_DIR);
        if staged_root.exists() {
            fs::remove_dir_all(&staged_root).map_err(|e| Self::io_error(&staged_root, e))?;
        }

        let name = self
            .source
            .file_name()
            .ok_or_else(|| Self::io_error(&self.source, std::io::Error::other("no file name")))?;
        let staged = staged_root.join(name);
        copy_dir_synced(&self.source, &staged).map_err(|e| Self::io_error(&staged, e))?;
        debug!(staged = %staged.display(), "update staged");
        self.staged = Some(staged);
        Ok(())
    }

    fn perform_second_stage(&mut self, _allow_ui: bool) -> Result<(), InstallerError> {
        // Nothing to apply early; the swap happens in stage 3.
        Ok(())
    }

    fn perform_third_stage(&mut self) -> Result<(), InstallerError> {
        let staged = self
            .staged
            .take()
            .ok_or_else(|| Self::io_error(&self.source, std::io::Error::other("not staged")))?;
        let install_path = self.installation_path();

        let retired = self.retired_path();
        if retired.exists() {
            fs::remove_dir_all(&retired).map_err(|e| Self::io_error(&retired, e))?;
        }

        fs::rename(&self.host_path, &retired).map_err(|e| Self::io_error(&self.host_path, e))?;
        if let Err(error) = fs::rename(&staged, &install_path) {
            // Put the old bundle back so the host is not left missing.
            if let Err(restore) = fs::rename(&retired, &self.host_path) {
                warn!(%restore, "failed to restore retired bundle");
            }
            return Err(Self::io_error(&install_path, error));
        }

        if let Err(error) = fs::remove_dir_all(&retired) {
            warn!(%error, retired = %retired.display(), "failed to remove retired bundle");
        }
        Ok(())
    }

    fn cleanup(&mut self) {
        self.staged = None;
        let staged_root = self.staging_directory.join(STAGED_DIR);
        if staged_root.exists() {
            if let Err(error) = fs::remove_dir_all(&staged_root) {
                warn!(%error, "failed to remove staged copy");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Layout {
        _dir: tempfile::TempDir,
        host: PathBuf,
        staging: PathBuf,
        source: PathBuf,
    }

    fn layout(new_name: &str) -> Layout {
        let dir = tempfile::tempdir().unwrap();
        let host = dir.path().join("apps/Example");
        fs::create_dir_all(&host).unwrap();
        fs::write(host.join("Info.toml"), "identifier = \"x\"\nversion = \"1\"\n").unwrap();

        let staging = dir.path().join("staging");
        fs::create_dir_all(&staging).unwrap();

        let source = staging.join("extracted").join(new_name);
        fs::create_dir_all(&source).unwrap();
        fs::write(source.join("Info.toml"), "identifier = \"x\"\nversion = \"2\"\n").unwrap();
        fs::write(source.join("binary"), b"v2").unwrap();

        Layout {
            _dir: dir,
            host,
            staging,
            source,
        }
    }

    #[test]
    fn swaps_bundle_in_place() {
        let layout = layout("Example");
        let mut installer =
            StagedBundleInstaller::new(&layout.host, &layout.staging, &layout.source);

        assert_eq!(installer.installation_path(), layout.host);
        installer.perform_first_stage().unwrap();
        // The host still carries the old version between stages.
        assert!(fs::read_to_string(layout.host.join("Info.toml"))
            .unwrap()
            .contains("\"1\""));

        installer.perform_second_stage(false).unwrap();
        installer.perform_third_stage().unwrap();

        assert!(fs::read_to_string(layout.host.join("Info.toml"))
            .unwrap()
            .contains("\"2\""));
        assert_eq!(fs::read(layout.host.join("binary")).unwrap(), b"v2");
        assert!(!installer.retired_path().exists());
    }

    #[test]
    fn renamed_bundle_installs_under_new_name() {
        let layout = layout("Example Pro");
        let mut installer =
            StagedBundleInstaller::new(&layout.host, &layout.staging, &layout.source);

        let install_path = installer.installation_path();
        assert_eq!(install_path.file_name().unwrap(), "Example Pro");

        installer.perform_first_stage().unwrap();
        installer.perform_third_stage().unwrap();

        assert!(install_path.join("binary").is_file());
        assert!(!layout.host.exists());
    }

    #[test]
    fn third_stage_without_staging_fails() {
        let layout = layout("Example");
        let mut installer =
            StagedBundleInstaller::new(&layout.host, &layout.staging, &layout.source);
        assert!(installer.perform_third_stage().is_err());
    }

    #[test]
    fn cleanup_removes_staged_copy() {
        let layout = layout("Example");
        let mut installer =
            StagedBundleInstaller::new(&layout.host, &layout.staging, &layout.source);
        installer.perform_first_stage().unwrap();
        assert!(layout.staging.join(STAGED_DIR).exists());

        installer.cleanup();
        assert!(!layout.staging.join(STAGED_DIR).exists());
        installer.cleanup();
    }
}
