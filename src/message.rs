//! Outgoing message builder: a fixed-width big-endian header plus a payload
//! of the command keyword and its encoded arguments.
//!
//! The header value equals the payload byte length unless a custom header is
//! supplied, which transfers use for sentinel control codes. Header width and
//! signedness vary per command family and are fixed explicitly at each call
//! site rather than inferred.

use crate::codec::{self, CodecError, Value, Width};
use crate::protocol;

#[derive(Debug, Clone)]
pub struct Message {
    body: Vec<u8>,
    header_width: Width,
    header_signed: bool,
    custom_header: Option<i64>,
}

impl Default for Message {
    fn default() -> Self {
        Message {
            body: Vec::new(),
            header_width: Width::from_bytes(protocol::DFLT_HEADER_SIZE)
                .expect("default header size is a legal width"),
            header_signed: true,
            custom_header: None,
        }
    }
}

impl Message {
    /// Start a message whose payload begins with `command`.
    pub fn new(command: &str) -> Self {
        Message {
            body: command.as_bytes().to_vec(),
            ..Message::default()
        }
    }

    /// Message with no payload at all; useful with [`custom_header`]
    /// (transfer sentinel frames are header-only).
    ///
    /// [`custom_header`]: Self::custom_header
    pub fn empty() -> Self {
        Message::default()
    }

    pub fn header_width(mut self, width: Width) -> Self {
        self.header_width = width;
        self
    }

    pub fn header_unsigned(mut self) -> Self {
        self.header_signed = false;
        self
    }

    /// Override the header value; the payload-length invariant no longer
    /// applies.
    pub fn custom_header(mut self, value: i64) -> Self {
        self.custom_header = Some(value);
        self
    }

    /// Append a space separator followed by an encoded argument.
    pub fn arg(mut self, value: Value<'_>) -> Result<Self, CodecError> {
        let encoded = codec::encode_value(&value)?;
        self.body.push(b' ');
        self.body.extend_from_slice(&encoded);
        Ok(self)
    }

    pub fn arg_str(self, value: &str) -> Self {
        // Text encoding is infallible.
        self.arg(Value::Text(value)).expect("text encodes cleanly")
    }

    /// Append a fixed-width integer argument after a space separator.
    pub fn arg_int(mut self, value: i64, width: Width, signed: bool) -> Result<Self, CodecError> {
        let encoded = codec::encode_integer(value, Some(width), signed)?;
        self.body.push(b' ');
        self.body.extend_from_slice(&encoded);
        Ok(self)
    }

    /// Append raw bytes with no separator (binary argument tails).
    pub fn push_bytes(mut self, value: &[u8]) -> Self {
        self.body.extend_from_slice(value);
        self
    }

    /// Append a fixed-width integer with no separator.
    pub fn push_int(mut self, value: i64, width: Width, signed: bool) -> Result<Self, CodecError> {
        let encoded = codec::encode_integer(value, Some(width), signed)?;
        self.body.extend_from_slice(&encoded);
        Ok(self)
    }

    pub fn payload(&self) -> &[u8] {
        &self.body
    }

    pub fn header_width_bytes(&self) -> usize {
        self.header_width.bytes()
    }

    pub fn header_signed(&self) -> bool {
        self.header_signed
    }

    /// Encode the header: the custom value if supplied, the payload length
    /// otherwise.
    pub fn header_bytes(&self) -> Result<Vec<u8>, CodecError> {
        let value = match self.custom_header {
            Some(v) => v,
            None => self.body.len() as i64,
        };
        codec::encode_integer(value, Some(self.header_width), self.header_signed)
    }
}

/// Convenience: a raw payload message (version strings, key blobs, hashes).
impl From<&[u8]> for Message {
    fn from(bytes: &[u8]) -> Self {
        Message::default().push_bytes(bytes)
    }
}

impl From<&str> for Message {
    fn from(text: &str) -> Self {
        Message::new(text)
    }
}
