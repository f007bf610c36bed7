//! Unarchiver interface and format implementations.
//!
//! The daemon drives extraction through the [`Unarchiver`] trait: one
//! blocking `unpack` call that streams fractional progress through a
//! callback and ends in success or failure. Formats are selected by file
//! extension; an unrecognized extension yields no unarchiver and the
//! caller reports extraction failure.

mod tar;
mod zip;

use std::path::{Path, PathBuf};

use thiserror::Error;

pub use self::tar::TarUnarchiver;
pub use self::zip::ZipUnarchiver;

/// Errors reported by unarchivers.
#[derive(Debug, Error)]
pub enum ExtractError {
    /// Reading the archive or writing an entry failed.
    #[error("extraction io error at {}", path.display())]
    Io {
        /// Path being read or written.
        path: PathBuf,
        /// Underlying IO failure.
        #[source]
        source: std::io::Error,
    },

    /// The archive is structurally invalid for its format.
    #[error("malformed archive: {0}")]
    Malformed(String),
}

/// A blocking, streaming extraction of one archive.
pub trait Unarchiver: Send {
    /// Extract into `destination`, reporting fractional progress in
    /// `[0.0, 1.0]` through `progress`.
    ///
    /// # Errors
    ///
    /// Returns an [`ExtractError`] and may leave partial output behind;
    /// the caller owns the destination directory and removes it on
    /// failure.
    fn unpack(
        &self,
        destination: &Path,
        progress: &mut dyn FnMut(f64),
    ) -> Result<(), ExtractError>;
}

/// Pick an unarchiver for `archive` by extension.
///
/// Recognizes `.tar`, `.tar.gz`/`.tgz`, and `.zip`. Returns `None` when no
/// implementation handles the file, in which case the caller synthesizes
/// an extraction failure.
#[must_use]
pub fn unarchiver_for(archive: &Path, password: Option<&str>) -> Option<Box<dyn Unarchiver>> {
    let name = archive.file_name()?.to_str()?.to_ascii_lowercase();
    if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        return Some(Box::new(TarUnarchiver::gzipped(archive)));
    }
    if name.ends_with(".tar") {
        return Some(Box::new(TarUnarchiver::plain(archive)));
    }
    if name.ends_with(".zip") {
        return Some(Box::new(ZipUnarchiver::new(archive, password)));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selects_by_extension() {
        assert!(unarchiver_for(Path::new("/a/update.tar.gz"), None).is_some());
        assert!(unarchiver_for(Path::new("/a/update.tgz"), None).is_some());
        assert!(unarchiver_for(Path::new("/a/update.tar"), None).is_some());
        assert!(unarchiver_for(Path::new("/a/update.zip"), None).is_some());
        assert!(unarchiver_for(Path::new("/a/update.rar"), None).is_none());
        assert!(unarchiver_for(Path::new("/a/update"), None).is_none());
    }
}
