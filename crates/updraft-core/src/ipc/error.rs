//! Protocol error types shared by the codec and the link tasks.

use thiserror::Error;

/// Maximum frame size accepted on either socket (4 MiB).
///
/// Control messages are small; archives never travel over the wire (the
/// updater hands over filesystem paths). The cap bounds allocation for a
/// hostile or corrupted peer.
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// Result alias for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors produced while framing, parsing, or dispatching control messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A frame's declared length exceeds [`MAX_FRAME_SIZE`].
    #[error("frame too large: {size} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge {
        /// Declared frame size in bytes.
        size: usize,
        /// Maximum allowed size in bytes.
        max: usize,
    },

    /// A frame body was shorter than the 4-byte message identifier.
    #[error("truncated frame: {size} bytes is shorter than a message header")]
    TruncatedFrame {
        /// Actual body size in bytes.
        size: usize,
    },

    /// A message identifier outside the closed protocol set.
    #[error("unknown message identifier {id}")]
    UnknownIdentifier {
        /// The identifier received on the wire.
        id: i32,
    },

    /// A payload whose length or content does not match its identifier.
    #[error("malformed payload for message {id}: {reason}")]
    MalformedPayload {
        /// Identifier of the offending message.
        id: i32,
        /// Human-readable parse failure.
        reason: String,
    },

    /// Underlying socket IO failed.
    #[error("socket io error: {0}")]
    Io(#[from] std::io::Error),
}
