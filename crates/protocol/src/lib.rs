//! STOMP 1.2 wire protocol for the network-monitor event feed.
//!
//! Frames, the accumulating stream decoder, header escaping and
//! heart-beat negotiation. No I/O happens here.

pub mod codec;
pub mod constants;
pub mod error;
pub mod frame;
pub mod headers;
pub mod heartbeat;

// Re-export primary types for convenience.
pub use codec::{FrameDecoder, decode, encode};
pub use constants::{Command, header};
pub use error::{DecodeErrorKind, FrameValidationError, ProtocolDecodeError};
pub use frame::Frame;
pub use headers::Headers;
pub use heartbeat::HeartBeat;
