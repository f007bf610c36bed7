//! Archived objects carried inside tagged envelopes.
//!
//! These are the three opaque objects that cross the links as
//! [`envelope`](super::envelope)-wrapped payloads: the installation input
//! submitted by the updater, the appcast item it forwards, and the
//! installation info the daemon publishes to the agent.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::envelope::{decode_tagged, encode_tagged, EnvelopeError};

/// Envelope tag of [`InstallationInput`].
pub const INSTALLATION_INPUT_TAG: &str = "installation-input";

/// Envelope tag of [`AppcastItem`].
pub const APPCAST_ITEM_TAG: &str = "appcast-item";

/// Envelope tag of [`InstallationInfo`].
pub const INSTALLATION_INFO_TAG: &str = "installation-info";

/// Everything the updater hands over to drive one installation attempt.
///
/// Received once, and possibly again after an extraction failure (the
/// updater may retry with a different, e.g. non-delta, archive).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InstallationInput {
    /// Installed bundle being updated.
    pub host_bundle_path: PathBuf,
    /// Directory owned by the daemon for the archive and its extraction.
    pub staging_directory: PathBuf,
    /// Archive file name inside the staging directory.
    pub archive_file_name: String,
    /// Password for encrypted archive formats.
    #[serde(default)]
    pub decryption_password: Option<String>,
    /// Printable detached signature over the archive bytes.
    pub signature: String,
    /// Path to launch after installation. Required; optional only at the
    /// serialization layer so its absence is an input error, not a decode
    /// error.
    #[serde(default)]
    pub relaunch_path: Option<PathBuf>,
}

impl InstallationInput {
    /// Absolute path of the downloaded archive.
    #[must_use]
    pub fn archive_path(&self) -> PathBuf {
        self.staging_directory.join(&self.archive_file_name)
    }

    /// Whether the archive file name stays inside the staging directory.
    ///
    /// Rejects names with path separators or parent components; the
    /// updater has no business pointing the daemon outside its own
    /// staging area.
    #[must_use]
    pub fn archive_within_staging(&self) -> bool {
        let name = Path::new(&self.archive_file_name);
        let mut components = name.components();
        matches!(
            (components.next(), components.next()),
            (Some(std::path::Component::Normal(_)), None)
        )
    }

    /// Encode under [`INSTALLATION_INPUT_TAG`].
    ///
    /// # Errors
    ///
    /// Propagates envelope serialization failures.
    pub fn encode(&self) -> Result<Vec<u8>, EnvelopeError> {
        encode_tagged(INSTALLATION_INPUT_TAG, self)
    }

    /// Decode from a tagged envelope, refusing any other tag.
    ///
    /// # Errors
    ///
    /// Propagates envelope decode failures.
    pub fn decode(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        decode_tagged(INSTALLATION_INPUT_TAG, bytes)
    }
}

/// One appcast entry describing the update being installed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppcastItem {
    /// Machine version of the update.
    pub version: String,
    /// Display version, when it differs from `version`.
    #[serde(default)]
    pub short_version_string: Option<String>,
    /// Release notes location.
    #[serde(default)]
    pub release_notes_link: Option<String>,
}

impl AppcastItem {
    /// Encode under [`APPCAST_ITEM_TAG`].
    ///
    /// # Errors
    ///
    /// Propagates envelope serialization failures.
    pub fn encode(&self) -> Result<Vec<u8>, EnvelopeError> {
        encode_tagged(APPCAST_ITEM_TAG, self)
    }

    /// Decode from a tagged envelope, refusing any other tag.
    ///
    /// # Errors
    ///
    /// Propagates envelope decode failures.
    pub fn decode(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        decode_tagged(APPCAST_ITEM_TAG, bytes)
    }
}

/// Installation summary the agent broadcasts for discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InstallationInfo {
    /// The update being installed.
    pub appcast_item: AppcastItem,
    /// Whether the backend can finish without user interaction.
    pub can_silently_install: bool,
}

impl InstallationInfo {
    /// Encode under [`INSTALLATION_INFO_TAG`].
    ///
    /// # Errors
    ///
    /// Propagates envelope serialization failures.
    pub fn encode(&self) -> Result<Vec<u8>, EnvelopeError> {
        encode_tagged(INSTALLATION_INFO_TAG, self)
    }

    /// Decode from a tagged envelope, refusing any other tag.
    ///
    /// # Errors
    ///
    /// Propagates envelope decode failures.
    pub fn decode(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        decode_tagged(INSTALLATION_INFO_TAG, bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_input() -> InstallationInput {
        InstallationInput {
            host_bundle_path: "/apps/Example".into(),
            staging_directory: "/var/staging".into(),
            archive_file_name: "update.tar.gz".into(),
            decryption_password: None,
            signature: "c2ln".into(),
            relaunch_path: Some("/apps/Example".into()),
        }
    }

    #[test]
    fn input_roundtrip() {
        let input = sample_input();
        let decoded = InstallationInput::decode(&input.encode().unwrap()).unwrap();
        assert_eq!(decoded.archive_file_name, input.archive_file_name);
        assert_eq!(decoded.relaunch_path, input.relaunch_path);
    }

    #[test]
    fn input_refuses_appcast_tag() {
        let item = AppcastItem {
            version: "2.0".into(),
            short_version_string: None,
            release_notes_link: None,
        };
        assert!(InstallationInput::decode(&item.encode().unwrap()).is_err());
    }

    #[test]
    fn archive_name_must_be_a_bare_file_name() {
        let mut input = sample_input();
        assert!(input.archive_within_staging());

        input.archive_file_name = "../elsewhere.tar.gz".into();
        assert!(!input.archive_within_staging());

        input.archive_file_name = "nested/update.tar.gz".into();
        assert!(!input.archive_within_staging());
    }

    #[test]
    fn installation_info_roundtrip() {
        let info = InstallationInfo {
            appcast_item: AppcastItem {
                version: "2.0".into(),
                short_version_string: Some("2.0 beta".into()),
                release_notes_link: None,
            },
            can_silently_install: true,
        };
        assert_eq!(InstallationInfo::decode(&info.encode().unwrap()).unwrap(), info);
    }
}
