//! STOMP 1.2 framing for the real-time channel.
//!
//! Each WebSocket text message carries zero or more frames. A message made
//! only of end-of-line bytes is a heart-beat and decodes to no frames.
//!
//! Wire format of one frame:
//!
//! ```text
//! COMMAND\n
//! name:value\n
//! ...
//! \n
//! body\0
//! ```

use std::fmt;
use std::time::Duration;

/// Errors produced while decoding a frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StompError {
    /// The buffer ended before the frame was complete.
    #[error("incomplete frame")]
    Incomplete,
    /// The command line did not name a STOMP command.
    #[error("unknown command: {0}")]
    UnknownCommand(String),
    /// A header line had no `:` separator.
    #[error("malformed header line: {0}")]
    MalformedHeader(String),
    /// A header contained an escape sequence STOMP 1.2 does not define.
    #[error("invalid escape sequence in header: {0}")]
    InvalidEscape(String),
    /// `content-length` was not a number or pointed past the buffer.
    #[error("invalid content-length: {0}")]
    InvalidContentLength(String),
    /// The byte after a `content-length` body was not NUL.
    #[error("frame body not terminated by NUL")]
    MissingNul,
    /// Command or header bytes were not UTF-8.
    #[error("frame header is not valid UTF-8")]
    InvalidUtf8,
}

/// Frame commands, client and server side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Client handshake.
    Connect,
    /// Alternative client handshake.
    Stomp,
    /// Server handshake reply.
    Connected,
    /// Publish to a destination.
    Send,
    /// Start receiving from a destination.
    Subscribe,
    /// Stop receiving.
    Unsubscribe,
    /// Acknowledge a message.
    Ack,
    /// Reject a message.
    Nack,
    /// Start a transaction.
    Begin,
    /// Commit a transaction.
    Commit,
    /// Abort a transaction.
    Abort,
    /// Graceful close.
    Disconnect,
    /// Server delivery to a subscription.
    Message,
    /// Server confirmation of a `receipt` header.
    Receipt,
    /// Server-side failure; the server closes afterwards.
    Error,
}

impl Command {
    /// Wire spelling.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "CONNECT",
            Self::Stomp => "STOMP",
            Self::Connected => "CONNECTED",
            Self::Send => "SEND",
            Self::Subscribe => "SUBSCRIBE",
            Self::Unsubscribe => "UNSUBSCRIBE",
            Self::Ack => "ACK",
            Self::Nack => "NACK",
            Self::Begin => "BEGIN",
            Self::Commit => "COMMIT",
            Self::Abort => "ABORT",
            Self::Disconnect => "DISCONNECT",
            Self::Message => "MESSAGE",
            Self::Receipt => "RECEIPT",
            Self::Error => "ERROR",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "CONNECT" => Self::Connect,
            "STOMP" => Self::Stomp,
            "CONNECTED" => Self::Connected,
            "SEND" => Self::Send,
            "SUBSCRIBE" => Self::Subscribe,
            "UNSUBSCRIBE" => Self::Unsubscribe,
            "ACK" => Self::Ack,
            "NACK" => Self::Nack,
            "BEGIN" => Self::Begin,
            "COMMIT" => Self::Commit,
            "ABORT" => Self::Abort,
            "DISCONNECT" => Self::Disconnect,
            "MESSAGE" => Self::Message,
            "RECEIPT" => Self::Receipt,
            "ERROR" => Self::Error,
            _ => return None,
        })
    }

    /// Handshake frames carry headers verbatim, everything else is escaped.
    const fn escapes_headers(self) -> bool {
        !matches!(self, Self::Connect | Self::Connected)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single STOMP frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame command.
    pub command: Command,
    /// Headers in wire order. Repeated names are kept; the first wins on lookup.
    pub headers: Vec<(String, String)>,
    /// Raw body bytes.
    pub body: Vec<u8>,
}

impl Frame {
    /// An empty frame with the given command.
    #[must_use]
    pub const fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// Append a header.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Replace the body.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// First value of the named header.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Body as UTF-8, replacing invalid sequences.
    #[must_use]
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Client handshake. `token` travels as an `Authorization` header.
    #[must_use]
    pub fn connect(host: &str, heart_beat: HeartBeat, token: Option<&str>) -> Self {
        let frame = Self::new(Command::Connect)
            .header("accept-version", "1.2")
            .header("host", host)
            .header("heart-beat", heart_beat.to_string());
        match token {
            Some(t) => frame.header("Authorization", format!("Bearer {t}")),
            None => frame,
        }
    }

    /// Subscribe `id` to `destination`.
    #[must_use]
    pub fn subscribe(id: &str, destination: &str) -> Self {
        Self::new(Command::Subscribe)
            .header("id", id)
            .header("destination", destination)
            .header("ack", "auto")
    }

    /// Cancel subscription `id`.
    #[must_use]
    pub fn unsubscribe(id: &str) -> Self {
        Self::new(Command::Unsubscribe).header("id", id)
    }

    /// Publish a JSON body to `destination`.
    #[must_use]
    pub fn send(destination: &str, body: impl Into<Vec<u8>>) -> Self {
        Self::new(Command::Send)
            .header("destination", destination)
            .header("content-type", "application/json")
            .with_body(body)
    }

    /// Graceful close asking for a receipt.
    #[must_use]
    pub fn disconnect(receipt: &str) -> Self {
        Self::new(Command::Disconnect).header("receipt", receipt)
    }
}

/// Heart-beat pair in milliseconds, as carried by the `heart-beat` header.
///
/// From the sender's point of view: `outgoing` is how often it can send,
/// `incoming` how often it wants to receive. Zero disables that direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeartBeat {
    /// Minimum interval between beats this side can send.
    pub outgoing_ms: u64,
    /// Desired interval between beats this side receives.
    pub incoming_ms: u64,
}

impl HeartBeat {
    /// Build from both intervals.
    #[must_use]
    pub const fn new(outgoing_ms: u64, incoming_ms: u64) -> Self {
        Self {
            outgoing_ms,
            incoming_ms,
        }
    }

    /// Parse `"cx,cy"`. Malformed input disables heart-beats.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        let mut parts = s.split(',').map(|p| p.trim().parse::<u64>());
        match (parts.next(), parts.next(), parts.next()) {
            (Some(Ok(out)), Some(Ok(inc)), None) => Self::new(out, inc),
            _ => Self::default(),
        }
    }

    /// Negotiate a client offer against the server reply.
    ///
    /// Returns `(send_every, expect_within)` for the client. `None` means
    /// the direction is disabled.
    #[must_use]
    pub fn negotiate(client: Self, server: Self) -> (Option<Duration>, Option<Duration>) {
        let pick = |ours: u64, theirs: u64| {
            (ours != 0 && theirs != 0).then(|| Duration::from_millis(ours.max(theirs)))
        };
        (
            pick(client.outgoing_ms, server.incoming_ms),
            pick(client.incoming_ms, server.outgoing_ms),
        )
    }
}

impl fmt::Display for HeartBeat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.outgoing_ms, self.incoming_ms)
    }
}

/// Serialize a frame. A `content-length` header is added for non-empty
/// bodies unless one is already present.
#[must_use]
pub fn encode(frame: &Frame) -> Vec<u8> {
    let mut out = Vec::with_capacity(64 + frame.body.len());
    out.extend_from_slice(frame.command.as_str().as_bytes());
    out.push(b'\n');
    let escape = frame.command.escapes_headers();
    for (name, value) in &frame.headers {
        if escape {
            out.extend_from_slice(escape_header(name).as_bytes());
            out.push(b':');
            out.extend_from_slice(escape_header(value).as_bytes());
        } else {
            out.extend_from_slice(name.as_bytes());
            out.push(b':');
            out.extend_from_slice(value.as_bytes());
        }
        out.push(b'\n');
    }
    if !frame.body.is_empty() && frame.get("content-length").is_none() {
        out.extend_from_slice(format!("content-length:{}\n", frame.body.len()).as_bytes());
    }
    out.push(b'\n');
    out.extend_from_slice(&frame.body);
    out.push(0);
    out
}

/// Decode every frame in `bytes`, skipping heart-beat end-of-lines.
///
/// # Errors
///
/// Returns a [`StompError`] describing the first malformed frame.
pub fn decode(bytes: &[u8]) -> Result<Vec<Frame>, StompError> {
    let mut frames = Vec::new();
    let mut pos = 0;
    loop {
        while pos < bytes.len() && (bytes[pos] == b'\n' || bytes[pos] == b'\r') {
            pos += 1;
        }
        if pos >= bytes.len() {
            return Ok(frames);
        }
        let (frame, consumed) = decode_one(&bytes[pos..])?;
        frames.push(frame);
        pos += consumed;
    }
}

/// Decode one frame at the start of `bytes`, returning it with the number
/// of bytes consumed including the NUL terminator.
fn decode_one(bytes: &[u8]) -> Result<(Frame, usize), StompError> {
    let mut pos = 0;
    let command_line = read_line(bytes, &mut pos)?;
    let command =
        Command::parse(command_line).ok_or_else(|| StompError::UnknownCommand(command_line.into()))?;

    let mut headers = Vec::new();
    loop {
        let line = read_line(bytes, &mut pos)?;
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| StompError::MalformedHeader(line.into()))?;
        if command.escapes_headers() {
            headers.push((unescape_header(name)?, unescape_header(value)?));
        } else {
            headers.push((name.to_string(), value.to_string()));
        }
    }

    let content_length = headers
        .iter()
        .find(|(k, _)| k == "content-length")
        .map(|(_, v)| {
            v.trim()
                .parse::<usize>()
                .map_err(|_| StompError::InvalidContentLength(v.clone()))
        })
        .transpose()?;

    let rest = &bytes[pos..];
    let body_len = match content_length {
        Some(len) => {
            if rest.len() <= len {
                return Err(StompError::Incomplete);
            }
            if rest[len] != 0 {
                return Err(StompError::MissingNul);
            }
            len
        }
        None => rest
            .iter()
            .position(|b| *b == 0)
            .ok_or(StompError::Incomplete)?,
    };

    let frame = Frame {
        command,
        headers,
        body: rest[..body_len].to_vec(),
    };
    Ok((frame, pos + body_len + 1))
}

/// Read one line ending in `\n` (optionally `\r\n`), advancing `pos`.
fn read_line<'a>(bytes: &'a [u8], pos: &mut usize) -> Result<&'a str, StompError> {
    let rest = &bytes[*pos..];
    let end = rest
        .iter()
        .position(|b| *b == b'\n')
        .ok_or(StompError::Incomplete)?;
    *pos += end + 1;
    let line = rest[..end].strip_suffix(b"\r").unwrap_or(&rest[..end]);
    std::str::from_utf8(line).map_err(|_| StompError::InvalidUtf8)
}

/// Escape a header name or value per STOMP 1.2.
#[must_use]
pub fn escape_header(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            other => out.push(other),
        }
    }
    out
}

/// Reverse [`escape_header`].
///
/// # Errors
///
/// Returns [`StompError::InvalidEscape`] for undefined sequences.
pub fn unescape_header(s: &str) -> Result<String, StompError> {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            _ => return Err(StompError::InvalidEscape(s.into())),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_frame_decodes_with_content_length() {
        let frame = Frame::new(Command::Message)
            .header("destination", "/topic/tasks")
            .header("subscription", "sub-0")
            .header("message-id", "m1")
            .with_body(br#"{"id":1}"#.to_vec());
        let bytes = encode(&frame);
        assert!(String::from_utf8_lossy(&bytes).contains("content-length:8\n"));

        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].get("destination"), Some("/topic/tasks"));
        assert_eq!(decoded[0].body, br#"{"id":1}"#);
    }

    #[test]
    fn body_may_contain_nul_when_length_is_given() {
        let frame = Frame::new(Command::Send)
            .header("destination", "/queue/x")
            .with_body(vec![b'a', 0, b'b']);
        let decoded = decode(&encode(&frame)).unwrap();
        assert_eq!(decoded[0].body, vec![b'a', 0, b'b']);
    }

    #[test]
    fn body_without_length_reads_to_nul() {
        let raw = b"MESSAGE\ndestination:/topic/tasks\n\nupdated\0";
        let decoded = decode(raw).unwrap();
        assert_eq!(decoded[0].body_text(), "updated");
    }

    #[test]
    fn heart_beat_decodes_to_nothing() {
        assert!(decode(b"\n").unwrap().is_empty());
        assert!(decode(b"\r\n\n").unwrap().is_empty());
    }

    #[test]
    fn several_frames_in_one_buffer() {
        let mut bytes = encode(&Frame::subscribe("sub-0", "/topic/tasks"));
        bytes.push(b'\n');
        bytes.extend(encode(&Frame::unsubscribe("sub-0")));
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[1].command, Command::Unsubscribe);
    }

    #[test]
    fn crlf_line_endings_are_accepted() {
        let raw = b"CONNECTED\r\nversion:1.2\r\nheart-beat:0,0\r\n\r\n\0";
        let decoded = decode(raw).unwrap();
        assert_eq!(decoded[0].command, Command::Connected);
        assert_eq!(decoded[0].get("version"), Some("1.2"));
    }

    #[test]
    fn headers_are_escaped_except_on_connect() {
        let sub = Frame::new(Command::Subscribe).header("destination", "a:b\nc");
        let text = String::from_utf8(encode(&sub)).unwrap();
        assert!(text.contains("destination:a\\cb\\nc\n"));
        assert_eq!(decode(text.as_bytes()).unwrap()[0].get("destination"), Some("a:b\nc"));

        let connect = Frame::connect("localhost", HeartBeat::new(4000, 4000), Some("tok"));
        let text = String::from_utf8(encode(&connect)).unwrap();
        assert!(text.contains("Authorization:Bearer tok\n"));
    }

    #[test]
    fn first_repeated_header_wins() {
        let raw = b"MESSAGE\nfoo:first\nfoo:second\n\n\0";
        let decoded = decode(raw).unwrap();
        assert_eq!(decoded[0].get("foo"), Some("first"));
    }

    #[test]
    fn decode_errors() {
        assert_eq!(
            decode(b"HELLO\n\n\0"),
            Err(StompError::UnknownCommand("HELLO".into()))
        );
        assert!(matches!(
            decode(b"MESSAGE\nnocolon\n\n\0"),
            Err(StompError::MalformedHeader(_))
        ));
        assert_eq!(decode(b"MESSAGE\nfoo:bar\n\nbody"), Err(StompError::Incomplete));
        assert_eq!(
            decode(b"MESSAGE\ncontent-length:2\n\nabc\0"),
            Err(StompError::MissingNul)
        );
        assert!(matches!(
            decode(b"MESSAGE\ncontent-length:x\n\n\0"),
            Err(StompError::InvalidContentLength(_))
        ));
        assert!(matches!(
            decode(b"MESSAGE\nfoo:a\\tb\n\n\0"),
            Err(StompError::InvalidEscape(_))
        ));
    }

    #[test]
    fn heart_beat_negotiation() {
        let client = HeartBeat::new(4000, 4000);
        let (send, expect) = HeartBeat::negotiate(client, HeartBeat::new(10_000, 0));
        assert_eq!(send, None);
        assert_eq!(expect, Some(Duration::from_millis(10_000)));

        let (send, expect) = HeartBeat::negotiate(client, HeartBeat::new(0, 0));
        assert_eq!((send, expect), (None, None));

        assert_eq!(HeartBeat::parse("10, 20"), HeartBeat::new(10, 20));
        assert_eq!(HeartBeat::parse("junk"), HeartBeat::default());
        assert_eq!(HeartBeat::new(1, 2).to_string(), "1,2");
    }
}
