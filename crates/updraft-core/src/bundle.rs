//! Bundle metadata extraction.
//!
//! A bundle is a directory carrying an `Info.toml` manifest:
//!
//! ```toml
//! identifier = "com.example.App"
//! version = "2.1.0"
//! public_key = "base64 ed25519 verifying key"   # optional
//! ```
//!
//! The public key, when present, is the asymmetric verification key updates
//! for this bundle must be signed with.

use std::fs;
use std::path::{Path, PathBuf};

use base64::prelude::{Engine as _, BASE64_STANDARD};
use ed25519_dalek::VerifyingKey;
use serde::Deserialize;
use thiserror::Error;

/// File name of the bundle manifest inside a bundle directory.
pub const BUNDLE_MANIFEST: &str = "Info.toml";

/// Size of an encoded ed25519 verifying key.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Errors while loading bundle metadata.
#[derive(Debug, Error)]
pub enum BundleError {
    /// The path does not exist or carries no manifest.
    #[error("no bundle at {}", path.display())]
    NotABundle {
        /// Path that was probed.
        path: PathBuf,
    },

    /// The manifest could not be read.
    #[error("failed to read bundle manifest at {}", path.display())]
    ManifestRead {
        /// Manifest path.
        path: PathBuf,
        /// Underlying IO failure.
        #[source]
        source: std::io::Error,
    },

    /// The manifest is not valid TOML of the expected shape.
    #[error("invalid bundle manifest at {}: {source}", path.display())]
    ManifestParse {
        /// Manifest path.
        path: PathBuf,
        /// Underlying parse failure.
        #[source]
        source: toml::de::Error,
    },

    /// The embedded public key is not a valid base64 ed25519 key.
    #[error("invalid public key in bundle manifest: {0}")]
    InvalidPublicKey(String),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawManifest {
    identifier: String,
    version: String,
    #[serde(default)]
    public_key: Option<String>,
}

/// Resolved metadata of an installed or freshly extracted bundle.
#[derive(Debug, Clone)]
pub struct BundleInfo {
    /// Directory the bundle lives in.
    pub bundle_path: PathBuf,
    /// Stable bundle identifier, e.g. `com.example.App`.
    pub identifier: String,
    /// Human-facing version string.
    pub version: String,
    /// Embedded update verification key, if the bundle ships one.
    pub public_key: Option<VerifyingKey>,
}

impl BundleInfo {
    /// Load bundle metadata from a bundle directory.
    ///
    /// # Errors
    ///
    /// Returns a [`BundleError`] if the directory is not a bundle, the
    /// manifest cannot be read or parsed, or the embedded key is invalid.
    pub fn load(bundle_path: &Path) -> Result<Self, BundleError> {
        let manifest_path = bundle_path.join(BUNDLE_MANIFEST);
        if !manifest_path.is_file() {
            return Err(BundleError::NotABundle {
                path: bundle_path.to_path_buf(),
            });
        }

        let text = fs::read_to_string(&manifest_path).map_err(|source| BundleError::ManifestRead {
            path: manifest_path.clone(),
            source,
        })?;
        let raw: RawManifest =
            toml::from_str(&text).map_err(|source| BundleError::ManifestParse {
                path: manifest_path,
                source,
            })?;

        let public_key = raw
            .public_key
            .as_deref()
            .map(parse_public_key)
            .transpose()?;

        Ok(Self {
            bundle_path: bundle_path.to_path_buf(),
            identifier: raw.identifier,
            version: raw.version,
            public_key,
        })
    }

    /// Whether `path` looks like a bundle directory.
    #[must_use]
    pub fn is_bundle(path: &Path) -> bool {
        path.join(BUNDLE_MANIFEST).is_file()
    }
}

/// Parse a base64-encoded ed25519 verifying key.
///
/// # Errors
///
/// Returns [`BundleError::InvalidPublicKey`] on bad base64, wrong length,
/// or a point that is not on the curve.
pub fn parse_public_key(encoded: &str) -> Result<VerifyingKey, BundleError> {
    let bytes = BASE64_STANDARD
        .decode(encoded.trim())
        .map_err(|e| BundleError::InvalidPublicKey(e.to_string()))?;
    let bytes: [u8; PUBLIC_KEY_SIZE] = bytes
        .try_into()
        .map_err(|_| BundleError::InvalidPublicKey("wrong key length".to_string()))?;
    VerifyingKey::from_bytes(&bytes).map_err(|e| BundleError::InvalidPublicKey(e.to_string()))
}
