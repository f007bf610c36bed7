//! Framed control-message protocol spoken on the updater and agent sockets.
//!
//! The protocol stack is organized in layers:
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │         Typed payloads                   │  messages / envelope
//! ├─────────────────────────────────────────┤
//! │         Message (id + payload)           │  messages
//! ├─────────────────────────────────────────┤
//! │         Framing                          │  Length-prefixed
//! ├─────────────────────────────────────────┤
//! │         UDS transport                    │  Unix socket
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Wire Format
//!
//! Every frame is a 4-byte big-endian length prefix followed by the frame
//! body. The body starts with a 4-byte little-endian signed message
//! identifier; the rest is the payload. Fixed-size numeric payloads are
//! little-endian throughout.
//!
//! ```text
//! +---------------------+---------------------+------------------+
//! | Length (4 bytes BE) | Identifier (i32 LE) | Payload          |
//! +---------------------+---------------------+------------------+
//! ```
//!
//! Frame length is validated before any allocation; oversized frames are
//! rejected with [`ProtocolError::FrameTooLarge`].

pub mod envelope;
pub mod error;
pub mod framing;
pub mod messages;
pub mod objects;

pub use envelope::{decode_tagged, encode_tagged, EnvelopeError};
pub use error::{ProtocolError, ProtocolResult, MAX_FRAME_SIZE};
pub use framing::MessageCodec;
pub use messages::{
    AgentMessageId, InstallerMessageId, Message, Stage1Result, Stage2Command, Stage2Result,
};
pub use objects::{AppcastItem, InstallationInfo, InstallationInput};
