//! Detached archive signature verification.
//!
//! Update archives are accompanied by a printable (base64) ed25519
//! signature over the raw archive bytes. Verification is strict: malleable
//! encodings that `verify` would accept are rejected.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use base64::prelude::{Engine as _, BASE64_STANDARD};
use ed25519_dalek::{Signature, VerifyingKey, SIGNATURE_LENGTH};
use thiserror::Error;

/// Errors from archive signature verification.
#[derive(Debug, Error)]
pub enum SignatureError {
    /// The encoded signature is not valid base64 of the right length.
    #[error("invalid signature encoding: {0}")]
    InvalidEncoding(String),

    /// The archive could not be read.
    #[error("failed to read archive at {}", path.display())]
    ArchiveRead {
        /// Archive path.
        path: std::path::PathBuf,
        /// Underlying IO failure.
        #[source]
        source: std::io::Error,
    },

    /// The signature does not verify under the given key.
    #[error("signature does not match archive contents")]
    Mismatch,
}

/// Parse a printable detached signature.
///
/// # Errors
///
/// Returns [`SignatureError::InvalidEncoding`] on bad base64 or a wrong
/// decoded length.
pub fn parse_signature(encoded: &str) -> Result<Signature, SignatureError> {
    let bytes = BASE64_STANDARD
        .decode(encoded.trim())
        .map_err(|e| SignatureError::InvalidEncoding(e.to_string()))?;
    let bytes: [u8; SIGNATURE_LENGTH] = bytes
        .try_into()
        .map_err(|_| SignatureError::InvalidEncoding("wrong signature length".to_string()))?;
    Ok(Signature::from_bytes(&bytes))
}

/// Verify a detached base64 signature over the contents of `archive`.
///
/// The archive is read in chunks; whole-file buffering is avoided because
/// update archives routinely run to hundreds of megabytes.
///
/// # Errors
///
/// Returns a [`SignatureError`] if the encoding is invalid, the archive
/// cannot be read, or the signature does not verify.
pub fn verify_archive_signature(
    archive: &Path,
    key: &VerifyingKey,
    encoded_signature: &str,
) -> Result<(), SignatureError> {
    let signature = parse_signature(encoded_signature)?;

    let file = File::open(archive).map_err(|source| SignatureError::ArchiveRead {
        path: archive.to_path_buf(),
        source,
    })?;
    let mut reader = BufReader::new(file);
    let mut contents = Vec::new();
    reader
        .read_to_end(&mut contents)
        .map_err(|source| SignatureError::ArchiveRead {
            path: archive.to_path_buf(),
            source,
        })?;

    key.verify_strict(&contents, &signature)
        .map_err(|_| SignatureError::Mismatch)
}
