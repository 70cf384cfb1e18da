//! Stream decoder for STOMP frames.
//!
//! The transport hands over arbitrary chunks of the byte stream. Chunks are
//! appended to an accumulator and [`decode`] pulls as many complete frames
//! out of it as are available, leaving partial input in place for the next
//! receive.
//!
//! ```text
//! COMMAND EOL
//! *( header-name ":" header-value EOL )
//! EOL
//! *OCTET NUL
//! ```

use bytes::{Buf, BytesMut};

use crate::constants::{CR, Command, EOL, MAX_FRAME_SIZE, NULL, header};
use crate::error::{DecodeErrorKind, ProtocolDecodeError};
use crate::frame::Frame;
use crate::headers::{Headers, unescape};

/// Encodes `frame` into its wire representation.
pub fn encode(frame: &Frame) -> bytes::Bytes {
    frame.encode()
}

/// Decodes the next frame from the front of `buf`.
///
/// Returns `Ok(None)` when `buf` holds only part of a frame; the bytes are
/// left untouched. On success the frame's bytes are consumed.
pub fn decode(buf: &mut BytesMut) -> Result<Option<Frame>, ProtocolDecodeError> {
    decode_with_limit(buf, MAX_FRAME_SIZE)
}

/// Same as [`decode`] with an explicit frame size limit.
pub fn decode_with_limit(
    buf: &mut BytesMut,
    max_frame_size: usize,
) -> Result<Option<Frame>, ProtocolDecodeError> {
    // Heartbeats: a bare EOL (or CRLF) between frames. A stray NUL is
    // tolerated the same way.
    match buf.first() {
        None => return Ok(None),
        Some(&EOL) | Some(&NULL) => {
            buf.advance(1);
            return Ok(Some(Frame::heartbeat()));
        }
        Some(&CR) => match buf.get(1) {
            None => return Ok(None),
            Some(&EOL) => {
                buf.advance(2);
                return Ok(Some(Frame::heartbeat()));
            }
            Some(_) => return Err(ProtocolDecodeError::new(DecodeErrorKind::EmptyCommand, buf)),
        },
        Some(_) => {}
    }

    match parse(buf)? {
        Parsed::Complete { frame, consumed } => {
            buf.advance(consumed);
            Ok(Some(frame))
        }
        Parsed::Incomplete if buf.len() > max_frame_size => Err(ProtocolDecodeError::new(
            DecodeErrorKind::FrameTooLarge {
                limit: max_frame_size,
            },
            buf,
        )),
        Parsed::Incomplete => Ok(None),
    }
}

enum Parsed {
    Complete { frame: Frame, consumed: usize },
    Incomplete,
}

/// Returns the line starting at `start` (without EOL/CRLF) and the offset
/// just past its EOL, or `None` if the EOL has not arrived yet.
fn next_line(buf: &[u8], start: usize) -> Option<(&[u8], usize)> {
    let rel = buf[start..].iter().position(|&b| b == EOL)?;
    let end = start + rel;
    let line = match buf[start..end].last() {
        Some(&CR) => &buf[start..end - 1],
        _ => &buf[start..end],
    };
    Some((line, end + 1))
}

fn parse(buf: &[u8]) -> Result<Parsed, ProtocolDecodeError> {
    let fail = |kind| Err(ProtocolDecodeError::new(kind, buf));

    let Some((line, mut pos)) = next_line(buf, 0) else {
        return Ok(Parsed::Incomplete);
    };
    let Ok(token) = std::str::from_utf8(line) else {
        return fail(DecodeErrorKind::InvalidUtf8);
    };
    if token.is_empty() {
        return fail(DecodeErrorKind::EmptyCommand);
    }
    let command: Command = match token.parse() {
        Ok(c) => c,
        Err(_) => return fail(DecodeErrorKind::UnrecognizedCommand(token.to_string())),
    };

    let mut headers = Headers::new();
    loop {
        let Some((line, next)) = next_line(buf, pos) else {
            return Ok(Parsed::Incomplete);
        };
        pos = next;
        if line.is_empty() {
            break;
        }
        let Ok(line) = std::str::from_utf8(line) else {
            return fail(DecodeErrorKind::InvalidUtf8);
        };
        let Some((name, value)) = line.split_once(':') else {
            return fail(DecodeErrorKind::MissingColonInHeader);
        };
        let (name, value) = if command.escapes_headers() {
            match (unescape(name), unescape(value)) {
                (Some(n), Some(v)) => (n, v),
                _ => return fail(DecodeErrorKind::InvalidHeaderEscape),
            }
        } else {
            (name.to_string(), value.to_string())
        };
        headers.insert_first(name, value);
    }

    let body_start = pos;
    let body_end = match headers.get(header::CONTENT_LENGTH) {
        Some(declared) => {
            let Ok(len) = declared.trim().parse::<usize>() else {
                return fail(DecodeErrorKind::InvalidContentLength(declared.to_string()));
            };
            let end = body_start.saturating_add(len);
            if buf.len() <= end {
                return Ok(Parsed::Incomplete);
            }
            if buf[end] != NULL {
                return fail(DecodeErrorKind::ContentLengthMismatch { declared: len });
            }
            end
        }
        None => match buf[body_start..].iter().position(|&b| b == NULL) {
            Some(rel) => body_start + rel,
            None => return Ok(Parsed::Incomplete),
        },
    };

    let frame = Frame {
        command,
        headers,
        body: bytes::Bytes::copy_from_slice(&buf[body_start..body_end]),
    };
    Ok(Parsed::Complete {
        frame,
        consumed: body_end + 1,
    })
}

/// Accumulating decoder fed by transport chunks.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: BytesMut,
    max_frame_size: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(MAX_FRAME_SIZE)
    }
}

impl FrameDecoder {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_frame_size,
        }
    }

    /// Appends a received chunk to the accumulator.
    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Pops the next complete frame, if any.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, ProtocolDecodeError> {
        decode_with_limit(&mut self.buf, self.max_frame_size)
    }

    /// Bytes waiting for the rest of their frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(bytes: &[u8]) -> Vec<Frame> {
        let mut dec = FrameDecoder::default();
        dec.extend(bytes);
        let mut out = Vec::new();
        while let Some(frame) = dec.next_frame().unwrap() {
            out.push(frame);
        }
        assert_eq!(dec.buffered(), 0);
        out
    }

    fn sample_frames() -> Vec<Frame> {
        vec![
            Frame::new(Command::Connected)
                .with_header("version", "1.2")
                .with_header("heart-beat", "5000,5000")
                .with_header("session", "abc:def"),
            Frame::new(Command::Message)
                .with_header("destination", "/topic/status")
                .with_header("subscription", "sub-0")
                .with_header("message-id", "m1")
                .with_header("content-type", "application/json")
                .with_body(&br#"{"id":"A","status":"ok"}"#[..]),
            Frame::new(Command::Error)
                .with_header("message", "line1\nline2: detail")
                .with_body(&b"binary\0body"[..]),
            Frame::new(Command::Receipt).with_header("receipt-id", "r-1"),
            Frame::heartbeat(),
            Frame::new(Command::Disconnect),
        ]
    }

    #[test]
    fn roundtrip_preserves_frames() {
        for frame in sample_frames() {
            let wire = encode(&frame);
            let decoded = decode_all(&wire);
            assert_eq!(decoded, vec![frame]);
        }
    }

    #[test]
    fn split_at_every_boundary_decodes_identically() {
        for frame in sample_frames() {
            let wire = encode(&frame);
            for split in 0..=wire.len() {
                let mut dec = FrameDecoder::default();
                dec.extend(&wire[..split]);
                let mut got = Vec::new();
                while let Some(f) = dec.next_frame().unwrap() {
                    got.push(f);
                }
                dec.extend(&wire[split..]);
                while let Some(f) = dec.next_frame().unwrap() {
                    got.push(f);
                }
                assert_eq!(got, vec![frame.clone()], "split at {split}");
            }
        }
    }

    #[test]
    fn multiple_frames_in_one_chunk() {
        let mut wire = BytesMut::new();
        for frame in sample_frames() {
            frame.encode_into(&mut wire);
        }
        assert_eq!(decode_all(&wire), sample_frames());
    }

    #[test]
    fn incomplete_leaves_buffer_untouched() {
        let mut buf = BytesMut::from(&b"MESSAGE\ndestination:/a\n"[..]);
        assert!(decode(&mut buf).unwrap().is_none());
        assert_eq!(&buf[..], b"MESSAGE\ndestination:/a\n");
    }

    #[test]
    fn body_without_content_length_ends_at_null() {
        let frames = decode_all(b"MESSAGE\ndestination:/a\n\nhello\0");
        assert_eq!(&frames[0].body[..], b"hello");
    }

    #[test]
    fn crlf_line_endings_accepted() {
        let frames = decode_all(b"CONNECTED\r\nversion:1.2\r\n\r\n\0\r\n");
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].command, Command::Connected);
        assert_eq!(frames[0].header("version"), Some("1.2"));
        assert!(frames[1].is_heartbeat());
    }

    #[test]
    fn heartbeats_between_frames() {
        let frames = decode_all(b"\n\nRECEIPT\nreceipt-id:1\n\n\0\n");
        let commands: Vec<_> = frames.iter().map(|f| f.command).collect();
        assert_eq!(
            commands,
            vec![
                Command::Heartbeat,
                Command::Heartbeat,
                Command::Receipt,
                Command::Heartbeat
            ]
        );
    }

    #[test]
    fn repeated_header_first_wins() {
        let frames = decode_all(b"MESSAGE\nfoo:one\nfoo:two\n\n\0");
        assert_eq!(frames[0].header("foo"), Some("one"));
        assert_eq!(frames[0].headers.len(), 1);
    }

    #[test]
    fn header_values_are_unescaped() {
        let frames = decode_all(b"MESSAGE\nmsg:a\\cb\\nc\n\n\0");
        assert_eq!(frames[0].header("msg"), Some("a:b\nc"));
    }

    #[test]
    fn unknown_command_fails_with_raw_bytes() {
        let mut buf = BytesMut::from(&b"BOGUS\n\n\0"[..]);
        let err = decode(&mut buf).unwrap_err();
        assert_eq!(
            err.kind,
            DecodeErrorKind::UnrecognizedCommand("BOGUS".into())
        );
        assert_eq!(&err.raw[..], b"BOGUS\n\n\0");
    }

    #[test]
    fn header_without_colon_fails() {
        let mut buf = BytesMut::from(&b"MESSAGE\nnocolon\n\n\0"[..]);
        let err = decode(&mut buf).unwrap_err();
        assert_eq!(err.kind, DecodeErrorKind::MissingColonInHeader);
    }

    #[test]
    fn content_length_mismatch_fails() {
        let mut buf = BytesMut::from(&b"MESSAGE\ncontent-length:2\n\nhello\0"[..]);
        let err = decode(&mut buf).unwrap_err();
        assert_eq!(
            err.kind,
            DecodeErrorKind::ContentLengthMismatch { declared: 2 }
        );
    }

    #[test]
    fn invalid_content_length_fails() {
        let mut buf = BytesMut::from(&b"MESSAGE\ncontent-length:abc\n\nhello\0"[..]);
        let err = decode(&mut buf).unwrap_err();
        assert!(matches!(err.kind, DecodeErrorKind::InvalidContentLength(_)));
    }

    #[test]
    fn invalid_escape_fails() {
        let mut buf = BytesMut::from(&b"MESSAGE\nfoo:bad\\x\n\n\0"[..]);
        let err = decode(&mut buf).unwrap_err();
        assert_eq!(err.kind, DecodeErrorKind::InvalidHeaderEscape);
    }

    #[test]
    fn oversize_frame_without_terminator_fails() {
        let mut dec = FrameDecoder::new(64);
        dec.extend(b"MESSAGE\ndestination:/a\n\n");
        assert!(dec.next_frame().unwrap().is_none());
        dec.extend(&[b'x'; 100]);
        let err = dec.next_frame().unwrap_err();
        assert_eq!(err.kind, DecodeErrorKind::FrameTooLarge { limit: 64 });
    }

    #[test]
    fn lone_cr_waits_for_more_input() {
        let mut buf = BytesMut::from(&b"\r"[..]);
        assert!(decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"\n");
        assert!(decode(&mut buf).unwrap().unwrap().is_heartbeat());
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        /// Characters that need care on the wire.
        const AWKWARD: &[char] = &['a', 'Z', '0', ' ', '/', '-', 'é', ':', '\\', '\n', '\r'];
        /// What an unescaped CONNECT/CONNECTED value may carry.
        const PLAIN: &[char] = &['a', 'Z', '0', ' ', '/', '-', 'é', ':', ',', '.'];

        fn text(alphabet: &'static [char], len: std::ops::Range<usize>) -> BoxedStrategy<String> {
            proptest::collection::vec(proptest::sample::select(alphabet), len)
                .prop_map(String::from_iter)
                .boxed()
        }

        fn escaped_frame() -> impl Strategy<Value = Frame> {
            let command = proptest::sample::select(vec![
                Command::Send,
                Command::Subscribe,
                Command::Unsubscribe,
                Command::Disconnect,
                Command::Message,
                Command::Receipt,
                Command::Error,
            ]);
            let headers = proptest::collection::vec((text(AWKWARD, 0..10), text(AWKWARD, 0..16)), 0..6);
            let body = proptest::option::of(proptest::collection::vec(any::<u8>(), 0..64));
            (command, headers, body).prop_map(build)
        }

        fn plain_frame() -> impl Strategy<Value = Frame> {
            let command = proptest::sample::select(vec![Command::Connect, Command::Connected]);
            let name = text(&PLAIN[..7], 1..10);
            let headers = proptest::collection::vec((name, text(PLAIN, 0..16)), 0..6);
            let body = proptest::option::of(proptest::collection::vec(any::<u8>(), 0..16));
            (command, headers, body).prop_map(build)
        }

        fn build((command, headers, body): (Command, Vec<(String, String)>, Option<Vec<u8>>)) -> Frame {
            let mut frame = Frame::new(command);
            for (name, value) in headers {
                if name != header::CONTENT_LENGTH {
                    frame = frame.with_header(name, value);
                }
            }
            match body {
                Some(body) => frame.with_body(body),
                None => frame,
            }
        }

        fn any_frame() -> impl Strategy<Value = Frame> {
            prop_oneof![
                4 => escaped_frame(),
                1 => plain_frame(),
                1 => Just(Frame::heartbeat()),
            ]
        }

        proptest! {
            #[test]
            fn decode_inverts_encode(frame in any_frame()) {
                prop_assert_eq!(decode_all(&encode(&frame)), vec![frame]);
            }

            #[test]
            fn any_split_point_decodes_identically(frame in any_frame(), cut in any::<prop::sample::Index>()) {
                let wire = encode(&frame);
                let split = cut.index(wire.len() + 1);
                let mut dec = FrameDecoder::default();
                let mut got = Vec::new();
                dec.extend(&wire[..split]);
                while let Some(f) = dec.next_frame().unwrap() {
                    got.push(f);
                }
                dec.extend(&wire[split..]);
                while let Some(f) = dec.next_frame().unwrap() {
                    got.push(f);
                }
                prop_assert_eq!(got, vec![frame], "split at {}", split);
            }

            #[test]
            fn concatenated_frames_decode_in_order(frames in proptest::collection::vec(any_frame(), 1..6)) {
                let mut wire = BytesMut::new();
                for frame in &frames {
                    frame.encode_into(&mut wire);
                }
                prop_assert_eq!(decode_all(&wire), frames);
            }
        }
    }
}
