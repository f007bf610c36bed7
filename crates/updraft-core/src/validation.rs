//! The update acceptance policy.
//!
//! Given the installed host bundle, the downloaded archive, the extraction
//! output, and the detached signature, decide whether the update may be
//! installed.
//!
//! Package updates (`.pkg` payloads) must verify under the host's existing
//! public key; no code-signing check applies. Bundle updates verify under
//! the key embedded in the NEW bundle, then apply the rotation asymmetry:
//!
//! - Keys match: the new key is already trusted, so the only extra demand
//!   is that the new bundle's code signature, if it has one, is
//!   intrinsically valid.
//! - Keys differ (or either side lacks one): the new key is untrusted, so
//!   trust is anchored in code signing instead. Both bundles must be
//!   signed, and the new bundle must satisfy the host's signing identity.

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use crate::bundle::{BundleError, BundleInfo};
use crate::codesign::{CodeSignError, CodeSignatureCheck};
use crate::signing::{verify_archive_signature, SignatureError};

/// File extension marking a package update payload.
pub const PACKAGE_EXTENSION: &str = "pkg";

/// Why an update was rejected.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// The extraction output contains neither a bundle nor a package.
    #[error("no installable bundle or package under {}", path.display())]
    NoInstallSource {
        /// Extraction root that was searched.
        path: PathBuf,
    },

    /// A package update but the host ships no public key to verify under.
    #[error("host bundle has no public key to verify a package update")]
    PackageWithoutHostKey,

    /// The new bundle ships no public key.
    #[error("updated bundle has no public key")]
    MissingNewKey,

    /// The new bundle's metadata could not be read.
    #[error("updated bundle is unreadable")]
    UnreadableNewBundle(#[from] BundleError),

    /// The archive signature does not verify under the relevant key.
    #[error("archive signature rejected: {0}")]
    SignatureRejected(#[from] SignatureError),

    /// Signing keys rotated but code-signing continuity does not hold.
    #[error("code signing continuity rejected: {0}")]
    ContinuityRejected(#[source] CodeSignError),

    /// Matching keys but the new bundle's code signature is broken.
    #[error("updated bundle code signature rejected: {0}")]
    IntegrityRejected(#[source] CodeSignError),
}

/// What the extraction output holds and where.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallSource {
    /// Bundle directory or package file inside the extraction root.
    pub path: PathBuf,
    /// Whether the payload is a package rather than a bundle.
    pub is_package: bool,
}

/// Locate the install source inside an extraction root.
///
/// Searches the root itself and its direct children for a bundle directory
/// or a `.pkg` file. Bundles win over packages when both are present.
#[must_use]
pub fn resolve_install_source(extracted: &Path) -> Option<InstallSource> {
    if BundleInfo::is_bundle(extracted) {
        return Some(InstallSource {
            path: extracted.to_path_buf(),
            is_package: false,
        });
    }

    let mut package = None;
    let entries = fs::read_dir(extracted).ok()?;
    for entry in entries.flatten() {
        let path = entry.path();
        if BundleInfo::is_bundle(&path) {
            return Some(InstallSource {
                path,
                is_package: false,
            });
        }
        if path.extension().is_some_and(|ext| ext == PACKAGE_EXTENSION) && package.is_none() {
            package = Some(path);
        }
    }

    package.map(|path| InstallSource {
        path,
        is_package: true,
    })
}

/// The validated outcome: where to install from, and the new bundle's
/// metadata when the update is a bundle.
#[derive(Debug, Clone)]
pub struct ValidatedUpdate {
    /// Resolved install source.
    pub source: InstallSource,
    /// Metadata of the new bundle; `None` for package updates.
    pub new_bundle: Option<BundleInfo>,
}

/// Apply the acceptance policy.
///
/// # Errors
///
/// Returns a [`ValidationError`] naming the first rule the update failed.
pub fn validate_update(
    host: &BundleInfo,
    archive: &Path,
    extracted: &Path,
    encoded_signature: &str,
    codesign: &dyn CodeSignatureCheck,
) -> Result<ValidatedUpdate, ValidationError> {
    let source =
        resolve_install_source(extracted).ok_or_else(|| ValidationError::NoInstallSource {
            path: extracted.to_path_buf(),
        })?;

    if source.is_package {
        let host_key = host
            .public_key
            .as_ref()
            .ok_or(ValidationError::PackageWithoutHostKey)?;
        verify_archive_signature(archive, host_key, encoded_signature)?;
        debug!(source = %source.path.display(), "package update accepted");
        return Ok(ValidatedUpdate {
            source,
            new_bundle: None,
        });
    }

    let new_bundle = BundleInfo::load(&source.path)?;
    let new_key = new_bundle.public_key.ok_or(ValidationError::MissingNewKey)?;

    verify_archive_signature(archive, &new_key, encoded_signature)?;

    let keys_match = host.public_key.as_ref() == Some(&new_key);
    if keys_match {
        if codesign.is_code_signed(&new_bundle.bundle_path) {
            codesign
                .validate_integrity(&new_bundle.bundle_path)
                .map_err(ValidationError::IntegrityRejected)?;
        }
    } else {
        // Key rotation: trust continuity is anchored in code signing.
        if !codesign.is_code_signed(&host.bundle_path)
            || !codesign.is_code_signed(&new_bundle.bundle_path)
        {
            return Err(ValidationError::ContinuityRejected(
                CodeSignError::IdentityMismatch {
                    old: host.bundle_path.clone(),
                    new: new_bundle.bundle_path.clone(),
                },
            ));
        }
        codesign
            .validate_continuity(&host.bundle_path, &new_bundle.bundle_path)
            .map_err(ValidationError::ContinuityRejected)?;
    }

    debug!(
        source = %source.path.display(),
        version = %new_bundle.version,
        keys_match,
        "bundle update accepted"
    );
    Ok(ValidatedUpdate {
        source,
        new_bundle: Some(new_bundle),
    })
}
