//! Codec error types.

use bytes::Bytes;

/// What was wrong with a frame that failed to decode.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeErrorKind {
    #[error("empty command line")]
    EmptyCommand,

    #[error("unrecognized command {0:?}")]
    UnrecognizedCommand(String),

    #[error("header line without ':' separator")]
    MissingColonInHeader,

    #[error("undefined escape sequence in header")]
    InvalidHeaderEscape,

    #[error("frame is not valid UTF-8 before the body")]
    InvalidUtf8,

    #[error("invalid content-length {0:?}")]
    InvalidContentLength(String),

    #[error("declared content-length {declared} not followed by NUL terminator")]
    ContentLengthMismatch { declared: usize },

    #[error("frame exceeds {limit} bytes without a terminator")]
    FrameTooLarge { limit: usize },
}

/// A frame could not be decoded. Carries the offending bytes for diagnostics.
///
/// Never retryable at the codec level: the session that produced it is
/// considered broken.
#[derive(Debug, Clone, thiserror::Error)]
#[error("protocol decode error: {kind} (raw: {:?})", String::from_utf8_lossy(.raw))]
pub struct ProtocolDecodeError {
    pub kind: DecodeErrorKind,
    pub raw: Bytes,
}

impl ProtocolDecodeError {
    pub(crate) fn new(kind: DecodeErrorKind, raw: &[u8]) -> Self {
        // Cap the diagnostic copy; oversize frames can be huge.
        const RAW_LIMIT: usize = 1024;
        let raw = &raw[..raw.len().min(RAW_LIMIT)];
        Self {
            kind,
            raw: Bytes::copy_from_slice(raw),
        }
    }
}

/// An outgoing frame is missing what its command requires.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameValidationError {
    #[error("{command} frame missing required header {header:?}")]
    MissingHeader {
        command: &'static str,
        header: &'static str,
    },

    #[error("content-length {declared} does not match body length {actual}")]
    ContentLengthMismatch { declared: String, actual: usize },
}
