//! Code-signing verification seam.
//!
//! The validation policy needs three judgements about bundles: whether a
//! bundle carries a code signature at all, whether a signature is
//! intrinsically valid, and whether two bundles were signed by the same
//! identity (a designated-requirement-style comparison). The actual
//! verifier is platform machinery, so the policy depends only on the
//! [`CodeSignatureCheck`] trait.
//!
//! # Implementers
//!
//! - [`ToolCodeSignatureCheck`]: delegates to an external verifier tool
//! - [`StaticCodeSignatureCheck`]: fixed answers, for tests

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;

use thiserror::Error;

/// Errors from code-signing checks.
#[derive(Debug, Error)]
pub enum CodeSignError {
    /// The bundle's own signature is broken.
    #[error("code signature of {} is invalid", path.display())]
    InvalidSignature {
        /// Bundle whose signature failed.
        path: PathBuf,
    },

    /// Two bundles are signed by different identities.
    #[error("code signing identities of {} and {} differ", old.display(), new.display())]
    IdentityMismatch {
        /// Installed bundle.
        old: PathBuf,
        /// Freshly extracted bundle.
        new: PathBuf,
    },

    /// The external verifier tool could not be run.
    #[error("code signing verifier failed to run: {0}")]
    VerifierUnavailable(#[source] std::io::Error),
}

/// Judgements the validation policy needs about code signatures.
pub trait CodeSignatureCheck: Send + Sync {
    /// Whether the bundle at `path` carries a code signature.
    fn is_code_signed(&self, path: &Path) -> bool;

    /// Check that the bundle's signature is intrinsically valid.
    ///
    /// # Errors
    ///
    /// Returns [`CodeSignError::InvalidSignature`] when the signature does
    /// not verify, or [`CodeSignError::VerifierUnavailable`] when the check
    /// itself cannot run.
    fn validate_integrity(&self, path: &Path) -> Result<(), CodeSignError>;

    /// Check that `new` satisfies the signing identity of `old`.
    ///
    /// # Errors
    ///
    /// Returns [`CodeSignError::IdentityMismatch`] when the identities
    /// differ, or [`CodeSignError::VerifierUnavailable`] when the check
    /// itself cannot run.
    fn validate_continuity(&self, old: &Path, new: &Path) -> Result<(), CodeSignError>;
}

/// Code-signing check backed by an external verifier tool.
///
/// The tool is invoked as `<tool> probe <bundle>`, `<tool> verify <bundle>`,
/// and `<tool> continuity <old> <new>`; a zero exit status means the check
/// passed. The tool name defaults to `updraft-codesign` on `PATH`.
#[derive(Debug, Clone)]
pub struct ToolCodeSignatureCheck {
    tool: PathBuf,
}

impl Default for ToolCodeSignatureCheck {
    fn default() -> Self {
        Self::new("updraft-codesign")
    }
}

impl ToolCodeSignatureCheck {
    /// Create a check delegating to the given verifier tool.
    pub fn new(tool: impl Into<PathBuf>) -> Self {
        Self { tool: tool.into() }
    }

    fn run(&self, args: &[&std::ffi::OsStr]) -> Result<bool, CodeSignError> {
        let status = Command::new(&self.tool)
            .args(args)
            .status()
            .map_err(CodeSignError::VerifierUnavailable)?;
        Ok(status.success())
    }
}

impl CodeSignatureCheck for ToolCodeSignatureCheck {
    fn is_code_signed(&self, path: &Path) -> bool {
        self.run(&["probe".as_ref(), path.as_os_str()])
            .unwrap_or(false)
    }

    fn validate_integrity(&self, path: &Path) -> Result<(), CodeSignError> {
        if self.run(&["verify".as_ref(), path.as_os_str()])? {
            Ok(())
        } else {
            Err(CodeSignError::InvalidSignature {
                path: path.to_path_buf(),
            })
        }
    }

    fn validate_continuity(&self, old: &Path, new: &Path) -> Result<(), CodeSignError> {
        if self.run(&["continuity".as_ref(), old.as_os_str(), new.as_os_str()])? {
            Ok(())
        } else {
            Err(CodeSignError::IdentityMismatch {
                old: old.to_path_buf(),
                new: new.to_path_buf(),
            })
        }
    }
}

/// Code-signing check with fixed per-path answers.
///
/// Stores an optional signing identity per bundle path: `None` means
/// unsigned, `Some(identity)` means signed by that identity. An identity
/// string starting with `!` is treated as intrinsically broken. Intended
/// for tests; lives in production code so integration suites of dependent
/// crates can reuse it.
#[derive(Debug, Default)]
pub struct StaticCodeSignatureCheck {
    identities: HashMap<PathBuf, String>,
}

impl StaticCodeSignatureCheck {
    /// Create a check where every bundle is unsigned.
    #[must_use]
    pub fn unsigned() -> Self {
        Self::default()
    }

    /// Record `path` as signed by `identity`.
    #[must_use]
    pub fn signed(mut self, path: impl Into<PathBuf>, identity: impl Into<String>) -> Self {
        self.identities.insert(path.into(), identity.into());
        self
    }

    fn identity_of(&self, path: &Path) -> Option<&str> {
        self.identities.get(path).map(String::as_str)
    }
}

impl CodeSignatureCheck for StaticCodeSignatureCheck {
    fn is_code_signed(&self, path: &Path) -> bool {
        self.identity_of(path).is_some()
    }

    fn validate_integrity(&self, path: &Path) -> Result<(), CodeSignError> {
        match self.identity_of(path) {
            Some(identity) if !identity.starts_with('!') => Ok(()),
            _ => Err(CodeSignError::InvalidSignature {
                path: path.to_path_buf(),
            }),
        }
    }

    fn validate_continuity(&self, old: &Path, new: &Path) -> Result<(), CodeSignError> {
        let old_identity = self.identity_of(old);
        let new_identity = self.identity_of(new);
        match (old_identity, new_identity) {
            (Some(a), Some(b)) if a == b => Ok(()),
            _ => Err(CodeSignError::IdentityMismatch {
                old: old.to_path_buf(),
                new: new.to_path_buf(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_check_reports_signedness() {
        let check = StaticCodeSignatureCheck::unsigned().signed("/a", "Team A");
        assert!(check.is_code_signed(Path::new("/a")));
        assert!(!check.is_code_signed(Path::new("/b")));
    }

    #[test]
    fn static_check_continuity_requires_equal_identities() {
        let check = StaticCodeSignatureCheck::unsigned()
            .signed("/old", "Team A")
            .signed("/new", "Team A")
            .signed("/other", "Team B");

        check
            .validate_continuity(Path::new("/old"), Path::new("/new"))
            .unwrap();
        assert!(check
            .validate_continuity(Path::new("/old"), Path::new("/other"))
            .is_err());
        assert!(check
            .validate_continuity(Path::new("/old"), Path::new("/unsigned"))
            .is_err());
    }

    #[test]
    fn static_check_bang_identity_is_broken() {
        let check = StaticCodeSignatureCheck::unsigned().signed("/a", "!Team A");
        assert!(check.is_code_signed(Path::new("/a")));
        assert!(check.validate_integrity(Path::new("/a")).is_err());
    }
}
