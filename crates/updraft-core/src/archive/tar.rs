//! Tar and gzipped-tar extraction.
//!
//! Progress is measured against the compressed byte count: the archive
//! file size is known up front, so a counting reader under the decoder
//! yields a monotonic fraction without a second pass over the entries.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use tracing::debug;

use super::{ExtractError, Unarchiver};

/// Extracts `.tar`, `.tar.gz`, and `.tgz` archives.
#[derive(Debug, Clone)]
pub struct TarUnarchiver {
    archive: PathBuf,
    gzipped: bool,
}

impl TarUnarchiver {
    /// Unarchiver for a plain tar file.
    #[must_use]
    pub fn plain(archive: &Path) -> Self {
        Self {
            archive: archive.to_path_buf(),
            gzipped: false,
        }
    }

    /// Unarchiver for a gzip-compressed tar file.
    #[must_use]
    pub fn gzipped(archive: &Path) -> Self {
        Self {
            archive: archive.to_path_buf(),
            gzipped: true,
        }
    }

    fn io_error(&self, source: std::io::Error) -> ExtractError {
        ExtractError::Io {
            path: self.archive.clone(),
            source,
        }
    }
}

struct CountingReader<'a, R> {
    inner: R,
    read: u64,
    total: u64,
    report: &'a mut dyn FnMut(f64),
}

impl<R: Read> Read for CountingReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.read += n as u64;
        if self.total > 0 {
            #[allow(clippy::cast_precision_loss)]
            (self.report)((self.read as f64 / self.total as f64).min(1.0));
        }
        Ok(n)
    }
}

impl Unarchiver for TarUnarchiver {
    fn unpack(
        &self,
        destination: &Path,
        progress: &mut dyn FnMut(f64),
    ) -> Result<(), ExtractError> {
        let file = File::open(&self.archive).map_err(|e| self.io_error(e))?;
        let total = file.metadata().map_err(|e| self.io_error(e))?.len();
        let counting = CountingReader {
            inner: BufReader::new(file),
            read: 0,
            total,
            report: progress,
        };

        let reader: Box<dyn Read + '_> = if self.gzipped {
            Box::new(GzDecoder::new(counting))
        } else {
            Box::new(counting)
        };

        let mut archive = tar::Archive::new(reader);
        archive.set_preserve_permissions(true);

        let entries = archive
            .entries()
            .map_err(|e| ExtractError::Malformed(e.to_string()))?;
        for entry in entries {
            let mut entry = entry.map_err(|e| ExtractError::Malformed(e.to_string()))?;
            let unpacked = entry
                .unpack_in(destination)
                .map_err(|e| self.io_error(e))?;
            if !unpacked {
                // tar refuses entries that would escape the destination.
                debug!(
                    entry = %String::from_utf8_lossy(&entry.path_bytes()),
                    "skipped unsafe archive entry"
                );
            }
        }

        Ok(())
    }
}
