//! Zip extraction, with optional password decryption.
//!
//! Progress is reported per entry: the central directory gives the entry
//! count up front.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;
use zip::result::ZipError;
use zip::ZipArchive;

use super::{ExtractError, Unarchiver};

/// Extracts `.zip` archives.
#[derive(Debug, Clone)]
pub struct ZipUnarchiver {
    archive: PathBuf,
    password: Option<String>,
}

impl ZipUnarchiver {
    /// Unarchiver for a zip file, decrypting with `password` when given.
    #[must_use]
    pub fn new(archive: &Path, password: Option<&str>) -> Self {
        Self {
            archive: archive.to_path_buf(),
            password: password.map(str::to_owned),
        }
    }

    fn io_error(&self, source: std::io::Error) -> ExtractError {
        ExtractError::Io {
            path: self.archive.clone(),
            source,
        }
    }

    fn zip_error(error: ZipError) -> ExtractError {
        ExtractError::Malformed(error.to_string())
    }
}

impl Unarchiver for ZipUnarchiver {
    fn unpack(
        &self,
        destination: &Path,
        progress: &mut dyn FnMut(f64),
    ) -> Result<(), ExtractError> {
        let file = File::open(&self.archive).map_err(|e| self.io_error(e))?;
        let mut archive = ZipArchive::new(file).map_err(Self::zip_error)?;
        let total = archive.len();

        for index in 0..total {
            let mut entry = match &self.password {
                Some(password) => archive
                    .by_index_decrypt(index, password.as_bytes())
                    .map_err(Self::zip_error)?
                    .map_err(|_| ExtractError::Malformed("invalid archive password".into()))?,
                None => archive.by_index(index).map_err(Self::zip_error)?,
            };

            let Some(relative) = entry.enclosed_name().map(Path::to_path_buf) else {
                debug!(entry = entry.name(), "skipped unsafe archive entry");
                continue;
            };
            let out_path = destination.join(relative);

            if entry.is_dir() {
                fs::create_dir_all(&out_path).map_err(|e| self.io_error(e))?;
            } else {
                if let Some(parent) = out_path.parent() {
                    fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
                }
                let mut out = File::create(&out_path).map_err(|e| self.io_error(e))?;
                io::copy(&mut entry, &mut out).map_err(|e| self.io_error(e))?;
            }

            #[allow(clippy::cast_precision_loss)]
            progress((index + 1) as f64 / total.max(1) as f64);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use zip::write::FileOptions;
    use zip::ZipWriter;

    use super::*;

    fn build_zip(dir: &Path) -> PathBuf {
        let archive_path = dir.join("update.zip");
        let file = File::create(&archive_path).unwrap();
        let mut writer = ZipWriter::new(file);
        writer
            .add_directory("App/", FileOptions::default())
            .unwrap();
        writer
            .start_file("App/Info.toml", FileOptions::default())
            .unwrap();
        writer.write_all(b"identifier = \"x\"\n").unwrap();
        writer.start_file("App/binary", FileOptions::default()).unwrap();
        writer.write_all(&[0u8; 512]).unwrap();
        writer.finish().unwrap();
        archive_path
    }

    #[test]
    fn extracts_entries_with_progress() {
        let dir = tempfile::tempdir().unwrap();
        let archive_path = build_zip(dir.path());
        let dest = dir.path().join("out");
        fs::create_dir_all(&dest).unwrap();

        let mut fractions = Vec::new();
        ZipUnarchiver::new(&archive_path, None)
            .unpack(&dest, &mut |f| fractions.push(f))
            .unwrap();

        assert!(dest.join("App/Info.toml").is_file());
        assert!(dest.join("App/binary").is_file());
        assert_eq!(fractions.len(), 3);
        assert!((fractions.last().unwrap() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn garbage_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let archive_path = dir.path().join("update.zip");
        fs::write(&archive_path, b"not a zip").unwrap();
        let dest = dir.path().join("out");
        fs::create_dir_all(&dest).unwrap();

        let result = ZipUnarchiver::new(&archive_path, None).unpack(&dest, &mut |_| {});
        assert!(matches!(result, Err(ExtractError::Malformed(_))));
    }
}
