//! Message identifiers and payload codecs for the two installer links.
//!
//! The identifier space is closed: anything outside the enums below is a
//! protocol violation. Fixed-size numeric payloads are little-endian.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::error::{ProtocolError, ProtocolResult};

/// A control message: identifier plus opaque payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Wire identifier; see [`InstallerMessageId`] and [`AgentMessageId`].
    pub id: i32,
    /// Payload bytes; layout depends on the identifier.
    pub payload: Bytes,
}

impl Message {
    /// Build a message from a raw identifier and payload.
    #[must_use]
    pub const fn new(id: i32, payload: Bytes) -> Self {
        Self { id, payload }
    }

    /// Build a message with an empty payload.
    #[must_use]
    pub const fn empty(id: i32) -> Self {
        Self {
            id,
            payload: Bytes::new(),
        }
    }
}

/// Messages exchanged with the updater process over the installer socket.
///
/// `ExtractionStarted` through `UpdaterAlivePing` flow daemon → updater;
/// `InstallationData` through `UpdaterAlivePong` flow updater → daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum InstallerMessageId {
    /// Archive extraction has begun.
    ExtractionStarted = 0,
    /// Fractional extraction progress; payload is one little-endian f64.
    ExtractedWithProgress = 1,
    /// Extraction failed; the updater may resubmit installation data.
    ArchiveExtractionFailed = 2,
    /// Extraction succeeded and validation has begun.
    ValidationStarted = 3,
    /// Validation succeeded and stage 1 is pending.
    InstallationStartedStage1 = 4,
    /// Stage 1 finished; payload is a [`Stage1Result`].
    InstallationFinishedStage1 = 5,
    /// Stage 2 finished; payload is a [`Stage2Result`].
    InstallationFinishedStage2 = 6,
    /// Stage 3 finished; no payload.
    InstallationFinishedStage3 = 7,
    /// Liveness probe sent while waiting for host termination.
    UpdaterAlivePing = 8,
    /// Installation input; payload is a tagged [`envelope`](super::envelope)
    /// carrying [`InstallationInput`](super::objects::InstallationInput).
    InstallationData = 9,
    /// Appcast item for the agent; tagged envelope payload.
    SentUpdateAppcastItemData = 10,
    /// Resume command; payload is a [`Stage2Command`].
    ResumeToStage2 = 11,
    /// Response to [`Self::UpdaterAlivePing`].
    UpdaterAlivePong = 12,
}

impl InstallerMessageId {
    /// Map a wire identifier into the closed set.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::UnknownIdentifier`] for anything outside it.
    pub const fn from_wire(id: i32) -> ProtocolResult<Self> {
        Ok(match id {
            0 => Self::ExtractionStarted,
            1 => Self::ExtractedWithProgress,
            2 => Self::ArchiveExtractionFailed,
            3 => Self::ValidationStarted,
            4 => Self::InstallationStartedStage1,
            5 => Self::InstallationFinishedStage1,
            6 => Self::InstallationFinishedStage2,
            7 => Self::InstallationFinishedStage3,
            8 => Self::UpdaterAlivePing,
            9 => Self::InstallationData,
            10 => Self::SentUpdateAppcastItemData,
            11 => Self::ResumeToStage2,
            12 => Self::UpdaterAlivePong,
            other => return Err(ProtocolError::UnknownIdentifier { id: other }),
        })
    }
}

/// Messages exchanged with the UI agent over the agent socket.
///
/// The agent protocol mirrors the proxy calls the daemon makes on the
/// agent: everything except `RelaunchProcessId` flows daemon → agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum AgentMessageId {
    /// Ask the agent to resolve the relaunch bundle path to a process id.
    /// Payload is the UTF-8 path.
    RegisterRelaunchBundlePath = 0,
    /// Publish installation info; tagged envelope payload.
    RegisterInstallationInfo = 1,
    /// Show the agent-owned progress window.
    ShowProgress = 2,
    /// Dismiss the agent-owned progress window.
    StopProgress = 3,
    /// Relaunch the updated application; payload is the UTF-8 path.
    Relaunch = 4,
    /// Agent reply to `RegisterRelaunchBundlePath`; payload is one
    /// little-endian i32 process id.
    RelaunchProcessId = 5,
}

impl AgentMessageId {
    /// Map a wire identifier into the closed set.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::UnknownIdentifier`] for anything outside it.
    pub const fn from_wire(id: i32) -> ProtocolResult<Self> {
        Ok(match id {
            0 => Self::RegisterRelaunchBundlePath,
            1 => Self::RegisterInstallationInfo,
            2 => Self::ShowProgress,
            3 => Self::StopProgress,
            4 => Self::Relaunch,
            5 => Self::RelaunchProcessId,
            other => return Err(ProtocolError::UnknownIdentifier { id: other }),
        })
    }
}

/// Result payload of `InstallationFinishedStage1`: two bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stage1Result {
    /// Whether the installer backend can run without user interaction.
    pub can_install_silently: bool,
    /// Whether the host process had already terminated when stage 1 ended.
    pub target_terminated: bool,
}

impl Stage1Result {
    /// Encode as `{can_install_silently: u8, target_terminated: u8}`.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(2);
        buf.put_u8(u8::from(self.can_install_silently));
        buf.put_u8(u8::from(self.target_terminated));
        buf.freeze()
    }

    /// Decode from the two-byte wire layout.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::MalformedPayload`] on any other length.
    pub fn decode(payload: &[u8]) -> ProtocolResult<Self> {
        let [a, b] = payload else {
            return Err(ProtocolError::MalformedPayload {
                id: InstallerMessageId::InstallationFinishedStage1 as i32,
                reason: format!("expected 2 bytes, got {}", payload.len()),
            });
        };
        Ok(Self {
            can_install_silently: *a != 0,
            target_terminated: *b != 0,
        })
    }
}

/// Command payload of `ResumeToStage2`: two bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stage2Command {
    /// Whether the updated application should be relaunched after stage 3.
    pub relaunch: bool,
    /// Whether progress UI may be shown during the remaining stages.
    pub show_ui: bool,
}

impl Stage2Command {
    /// Encode as `{relaunch: u8, show_ui: u8}`.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(2);
        buf.put_u8(u8::from(self.relaunch));
        buf.put_u8(u8::from(self.show_ui));
        buf.freeze()
    }

    /// Decode from the two-byte wire layout.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::MalformedPayload`] on any other length.
    pub fn decode(payload: &[u8]) -> ProtocolResult<Self> {
        let [relaunch, show_ui] = payload else {
            return Err(ProtocolError::MalformedPayload {
                id: InstallerMessageId::ResumeToStage2 as i32,
                reason: format!("expected 2 bytes, got {}", payload.len()),
            });
        };
        Ok(Self {
            relaunch: *relaunch != 0,
            show_ui: *show_ui != 0,
        })
    }
}

/// Result payload of `InstallationFinishedStage2`: two bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stage2Result {
    /// Whether the user (or backend policy) cancelled the stage.
    pub cancelled: bool,
    /// Whether the host process had already terminated when stage 2 ended.
    pub target_terminated: bool,
}

impl Stage2Result {
    /// Encode as `{cancelled: u8, target_terminated: u8}`.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(2);
        buf.put_u8(u8::from(self.cancelled));
        buf.put_u8(u8::from(self.target_terminated));
        buf.freeze()
    }

    /// Decode from the two-byte wire layout.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::MalformedPayload`] on any other length.
    pub fn decode(payload: &[u8]) -> ProtocolResult<Self> {
        let [cancelled, target_terminated] = payload else {
            return Err(ProtocolError::MalformedPayload {
                id: InstallerMessageId::InstallationFinishedStage2 as i32,
                reason: format!("expected 2 bytes, got {}", payload.len()),
            });
        };
        Ok(Self {
            cancelled: *cancelled != 0,
            target_terminated: *target_terminated != 0,
        })
    }
}

/// Encode an extraction progress fraction as one little-endian f64.
#[must_use]
pub fn encode_progress(fraction: f64) -> Bytes {
    let mut buf = BytesMut::with_capacity(8);
    buf.put_f64_le(fraction);
    buf.freeze()
}

/// Decode an extraction progress payload.
///
/// # Errors
///
/// Returns [`ProtocolError::MalformedPayload`] unless the payload is exactly
/// eight bytes.
pub fn decode_progress(payload: &[u8]) -> ProtocolResult<f64> {
    if payload.len() != 8 {
        return Err(ProtocolError::MalformedPayload {
            id: InstallerMessageId::ExtractedWithProgress as i32,
            reason: format!("expected 8 bytes, got {}", payload.len()),
        });
    }
    let mut buf = payload;
    Ok(buf.get_f64_le())
}

/// Encode a process identifier as one little-endian i32.
#[must_use]
pub fn encode_process_id(pid: i32) -> Bytes {
    let mut buf = BytesMut::with_capacity(4);
    buf.put_i32_le(pid);
    buf.freeze()
}

/// Decode a process identifier payload.
///
/// # Errors
///
/// Returns [`ProtocolError::MalformedPayload`] unless the payload is exactly
/// four bytes.
pub fn decode_process_id(payload: &[u8]) -> ProtocolResult<i32> {
    if payload.len() != 4 {
        return Err(ProtocolError::MalformedPayload {
            id: AgentMessageId::RelaunchProcessId as i32,
            reason: format!("expected 4 bytes, got {}", payload.len()),
        });
    }
    let mut buf = payload;
    Ok(buf.get_i32_le())
}
