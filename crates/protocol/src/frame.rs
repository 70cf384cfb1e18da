use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::constants::{APPLICATION_JSON, Command, EOL, NULL, header};
use crate::error::FrameValidationError;
use crate::headers::{Headers, escape};

/// A single STOMP frame: command, ordered headers and an opaque body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    pub headers: Headers,
    pub body: Bytes,
}

impl Frame {
    /// Creates a frame with no headers and an empty body.
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    /// The zero-length keep-alive frame.
    pub fn heartbeat() -> Self {
        Self::new(Command::Heartbeat)
    }

    pub fn is_heartbeat(&self) -> bool {
        self.command == Command::Heartbeat
    }

    /// Adds a header, replacing any previous value.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Sets the body and a matching `content-length` header.
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        let body = body.into();
        self.headers
            .insert(header::CONTENT_LENGTH, body.len().to_string());
        self.body = body;
        self
    }

    /// Serializes `value` as the JSON body and tags the content type.
    pub fn with_json_body<T: Serialize>(self, value: &T) -> Result<Self, serde_json::Error> {
        let json = serde_json::to_vec(value)?;
        Ok(self
            .with_header(header::CONTENT_TYPE, APPLICATION_JSON)
            .with_body(json))
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    /// Deserializes the body as JSON.
    pub fn parse_json<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    /// Returns `true` if the frame declares a JSON content type, or
    /// declares none at all.
    pub fn is_json(&self) -> bool {
        match self.header(header::CONTENT_TYPE) {
            None => true,
            Some(ct) => ct
                .split(';')
                .next()
                .is_some_and(|mime| mime.trim().eq_ignore_ascii_case(APPLICATION_JSON)),
        }
    }

    /// Encodes the frame into its canonical wire form.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len_hint());
        self.encode_into(&mut buf);
        buf.freeze()
    }

    /// Appends the wire form of the frame to `buf`.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        if self.is_heartbeat() {
            buf.put_u8(EOL);
            return;
        }

        let escaped = self.command.escapes_headers();
        buf.put_slice(self.command.as_str().as_bytes());
        buf.put_u8(EOL);
        for (name, value) in self.headers.iter() {
            if escaped {
                buf.put_slice(escape(name).as_bytes());
                buf.put_u8(b':');
                buf.put_slice(escape(value).as_bytes());
            } else {
                buf.put_slice(name.as_bytes());
                buf.put_u8(b':');
                buf.put_slice(value.as_bytes());
            }
            buf.put_u8(EOL);
        }
        buf.put_u8(EOL);
        buf.put_slice(&self.body);
        buf.put_u8(NULL);
    }

    fn encoded_len_hint(&self) -> usize {
        let headers: usize = self
            .headers
            .iter()
            .map(|(k, v)| k.len() + v.len() + 2)
            .sum();
        self.command.as_str().len() + headers + self.body.len() + 3
    }

    /// Checks that the frame carries every header its command requires.
    pub fn validate(&self) -> Result<(), FrameValidationError> {
        let required: &[&'static str] = match self.command {
            Command::Connect | Command::Stomp => &[header::ACCEPT_VERSION, header::HOST],
            Command::Send => &[header::DESTINATION],
            Command::Subscribe => &[header::DESTINATION, header::ID],
            Command::Unsubscribe | Command::Ack | Command::Nack => &[header::ID],
            Command::Begin | Command::Commit | Command::Abort => &[header::TRANSACTION],
            Command::Receipt => &[header::RECEIPT_ID],
            Command::Message => &[
                header::DESTINATION,
                header::MESSAGE_ID,
                header::SUBSCRIPTION,
            ],
            Command::Connected | Command::Disconnect | Command::Error | Command::Heartbeat => &[],
        };
        for &name in required {
            if !self.headers.contains(name) {
                return Err(FrameValidationError::MissingHeader {
                    command: self.command.as_str(),
                    header: name,
                });
            }
        }

        if let Some(declared) = self.header(header::CONTENT_LENGTH)
            && declared.parse::<usize>().ok() != Some(self.body.len())
        {
            return Err(FrameValidationError::ContentLengthMismatch {
                declared: declared.to_string(),
                actual: self.body.len(),
            });
        }
        Ok(())
    }
}
