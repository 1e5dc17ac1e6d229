//! Parsing of textual server replies into structured [`Status`] values.
//!
//! Grammar: `<STATUS-NAME> [<code>:] <free text>`. An unrecognized leading
//! token yields [`StatusKind::Unknown`] with the whole text as message.

use std::fmt;

/// Protocol-level classification of a server reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusKind {
    Ok,
    Failed,
    Unknown,
    Cont,
    Break,
    Disconnected,
    PayloadTooBig,
}

impl StatusKind {
    /// Numeric code the protocol assigns each kind.
    pub fn code(self) -> i64 {
        match self {
            StatusKind::Ok => 0,
            StatusKind::Failed => 1,
            StatusKind::Unknown => 2,
            StatusKind::Cont => 3,
            StatusKind::Break => 4,
            StatusKind::Disconnected => 5,
            StatusKind::PayloadTooBig => 6,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StatusKind::Ok => "OK",
            StatusKind::Failed => "FAILED",
            StatusKind::Unknown => "UNKNOWN",
            StatusKind::Cont => "CONT",
            StatusKind::Break => "BREAK",
            StatusKind::Disconnected => "DISCONNECTED",
            StatusKind::PayloadTooBig => "PAYLOAD_TOO_BIG",
        }
    }

    fn from_token(token: &str) -> Option<Self> {
        match token.to_ascii_uppercase().as_str() {
            "OK" => Some(StatusKind::Ok),
            "FAILED" => Some(StatusKind::Failed),
            "UNKNOWN" => Some(StatusKind::Unknown),
            "CONT" => Some(StatusKind::Cont),
            "BREAK" => Some(StatusKind::Break),
            "DISCONNECTED" => Some(StatusKind::Disconnected),
            "PAYLOAD_TOO_BIG" => Some(StatusKind::PayloadTooBig),
            _ => None,
        }
    }
}

/// Messages longer than this are truncated for display; the raw remainder
/// stays in `payload`.
const MESSAGE_LIMIT: usize = 1024;

/// Structured server reply. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub kind: StatusKind,
    pub code: i64,
    pub message: String,
    pub payload: Vec<u8>,
}

impl Status {
    pub fn new(kind: StatusKind, code: i64, message: impl Into<String>) -> Self {
        Status {
            kind,
            code,
            message: message.into(),
            payload: Vec::new(),
        }
    }

    pub fn ok() -> Self {
        Status::new(StatusKind::Ok, 0, "")
    }

    pub fn is_ok(&self) -> bool {
        self.kind == StatusKind::Ok
    }

    /// Parse a locally produced textual status (used for connection-phase
    /// reporting, where no frame header exists).
    pub fn parse_text(raw: &str) -> Self {
        Self::from_parts(raw.as_bytes(), raw.len() as i64)
    }

    /// Build a status from a received frame: the decoded header value and the
    /// decrypted body.
    pub fn from_frame(header: i64, body: &[u8]) -> Self {
        Self::from_parts(body, header)
    }

    fn from_parts(body: &[u8], dflt_code: i64) -> Self {
        let text = String::from_utf8_lossy(body);
        let (token, rest) = split_first_token(&text);
        match StatusKind::from_token(token) {
            None => {
                // ? <msg>
                let mut s = Status::new(StatusKind::Unknown, dflt_code, truncate(&text));
                s.payload = body.to_vec();
                s
            }
            Some(StatusKind::Failed) => {
                // ? FAILED <code> : <msg>
                let (code, msg) = split_code(rest);
                let mut s = Status::new(
                    StatusKind::Failed,
                    code.unwrap_or_else(|| StatusKind::Failed.code()),
                    truncate(msg),
                );
                s.payload = body.to_vec();
                s
            }
            Some(kind) => {
                // ? <status> [<msg>]
                let mut s = Status::new(kind, kind.code(), truncate(rest));
                s.payload = body.to_vec();
                s
            }
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[{}] \"{}\"",
            self.kind.as_str(),
            self.code,
            self.message
        )
    }
}

fn split_first_token(text: &str) -> (&str, &str) {
    let trimmed = text.trim_start();
    match trimmed.find(char::is_whitespace) {
        Some(pos) => (&trimmed[..pos], trimmed[pos..].trim_start()),
        None => (trimmed, ""),
    }
}

/// Separate a leading decimal code, swallowing the `:` separator after it.
fn split_code(rest: &str) -> (Option<i64>, &str) {
    let rest = rest.trim_start();
    let digits: usize = rest
        .char_indices()
        .take_while(|(_, c)| c.is_ascii_digit())
        .count();
    if digits == 0 {
        return (None, rest);
    }
    let code = rest[..digits].parse::<i64>().ok();
    let mut msg = rest[digits..].trim_start();
    if let Some(stripped) = msg.strip_prefix(':') {
        msg = stripped.trim_start();
    }
    (code, msg)
}

fn truncate(msg: &str) -> String {
    if msg.len() > MESSAGE_LIMIT {
        let mut cut = MESSAGE_LIMIT;
        while !msg.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}...", &msg[..cut])
    } else {
        msg.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_ok() {
        let s = Status::parse_text("OK");
        assert_eq!(s.kind, StatusKind::Ok);
        assert_eq!(s.code, 0);
        assert_eq!(s.message, "");
    }

    #[test]
    fn failed_with_code_and_message() {
        let s = Status::parse_text("FAILED 5: a lot of info before");
        assert_eq!(s.kind, StatusKind::Failed);
        assert_eq!(s.code, 5);
        assert_eq!(s.message, "a lot of info before");
    }

    #[test]
    fn failed_without_code() {
        let s = Status::parse_text("FAILED something broke");
        assert_eq!(s.kind, StatusKind::Failed);
        assert_eq!(s.code, 1);
        assert_eq!(s.message, "something broke");
    }

    #[test]
    fn unknown_keeps_full_text() {
        let s = Status::parse_text("whatever the server said");
        assert_eq!(s.kind, StatusKind::Unknown);
        assert_eq!(s.message, "whatever the server said");
    }

    #[test]
    fn kind_codes_follow_grammar() {
        for (raw, kind, code) in [
            ("CONT", StatusKind::Cont, 3),
            ("BREAK", StatusKind::Break, 4),
            ("DISCONNECTED 0 time out dns", StatusKind::Disconnected, 5),
            ("PAYLOAD_TOO_BIG", StatusKind::PayloadTooBig, 6),
        ] {
            let s = Status::parse_text(raw);
            assert_eq!(s.kind, kind);
            assert_eq!(s.code, code);
        }
    }

    #[test]
    fn case_insensitive_token() {
        assert_eq!(Status::parse_text("ok fine").kind, StatusKind::Ok);
    }

    #[test]
    fn from_frame_uses_header_for_unknown() {
        let s = Status::from_frame(11, b"ECHO hello");
        assert_eq!(s.kind, StatusKind::Unknown);
        assert_eq!(s.code, 11);
        assert_eq!(s.message, "ECHO hello");
        assert_eq!(s.payload, b"ECHO hello");
    }

    #[test]
    fn ok_with_trailing_detail() {
        let s = Status::from_frame(7, b"OK 4096");
        assert!(s.is_ok());
        assert_eq!(s.code, 0);
        assert_eq!(s.message, "4096");
    }

    #[test]
    fn long_message_truncated() {
        let raw = format!("FAILED 9: {}", "x".repeat(2000));
        let s = Status::parse_text(&raw);
        assert!(s.message.ends_with("..."));
        assert_eq!(s.message.len(), 1024 + 3);
        assert_eq!(s.payload, raw.as_bytes());
    }

    #[test]
    fn payload_is_raw_body_for_every_kind() {
        for raw in [
            "OK 4096",
            "FAILED 5: broken",
            "CONT keep going",
            "not a status at all",
        ] {
            let s = Status::parse_text(raw);
            assert_eq!(s.payload, raw.as_bytes(), "{raw}");
        }
    }
}
