//! Minimal STOMP 1.2 frame codec, one frame per WebSocket text message.
//!
//! ```text
//! COMMAND\n
//! header:value\n
//! \n
//! body\0
//! ```

use thiserror::Error;

pub const CONNECT: &str = "CONNECT";
pub const CONNECTED: &str = "CONNECTED";
pub const SUBSCRIBE: &str = "SUBSCRIBE";
pub const SEND: &str = "SEND";
pub const MESSAGE: &str = "MESSAGE";
pub const ERROR: &str = "ERROR";
pub const RECEIPT: &str = "RECEIPT";
pub const DISCONNECT: &str = "DISCONNECT";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StompError {
    #[error("Frame has no command line")]
    MissingCommand,

    #[error("Malformed header line: {0}")]
    MalformedHeader(String),

    #[error("Invalid escape sequence in header: {0}")]
    InvalidEscape(String),

    #[error("Frame is missing its NUL terminator")]
    Unterminated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl Frame {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            headers: Vec::new(),
            body: String::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// First occurrence wins, as STOMP 1.2 requires for repeated headers
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// CONNECT carrying the bearer token as a frame header.
    pub fn connect(host: &str, token: Option<&str>, heartbeat_ms: u64) -> Self {
        let mut frame = Frame::new(CONNECT)
            .with_header("accept-version", "1.2")
            .with_header("host", host)
            .with_header("heart-beat", format!("{},{}", heartbeat_ms, heartbeat_ms));
        if let Some(token) = token {
            frame = frame.with_header("Authorization", format!("Bearer {}", token));
        }
        frame
    }

    pub fn subscribe(id: &str, destination: &str) -> Self {
        Frame::new(SUBSCRIBE)
            .with_header("id", id)
            .with_header("destination", destination)
            .with_header("ack", "auto")
    }

    pub fn send_json(destination: &str, body: &serde_json::Value) -> Self {
        Frame::new(SEND)
            .with_header("destination", destination)
            .with_header("content-type", "application/json")
            .with_body(body.to_string())
    }

    pub fn disconnect(receipt: &str) -> Self {
        Frame::new(DISCONNECT).with_header("receipt", receipt)
    }

    /// CONNECT and CONNECTED headers are sent verbatim; all others are escaped.
    fn escapes_headers(command: &str) -> bool {
        command != CONNECT && command != CONNECTED
    }

    pub fn encode(&self) -> String {
        let escape = Self::escapes_headers(&self.command);
        let mut out = String::with_capacity(self.command.len() + self.body.len() + 64);
        out.push_str(&self.command);
        out.push('\n');
        for (name, value) in &self.headers {
            if escape {
                out.push_str(&escape_header(name));
                out.push(':');
                out.push_str(&escape_header(value));
            } else {
                out.push_str(name);
                out.push(':');
                out.push_str(value);
            }
            out.push('\n');
        }
        if !self.body.is_empty() && self.header("content-length").is_none() {
            out.push_str(&format!("content-length:{}\n", self.body.len()));
        }
        out.push('\n');
        out.push_str(&self.body);
        out.push('\0');
        out
    }

    /// Decode one frame. `Ok(None)` is a heart-beat (EOLs only).
    pub fn decode(raw: &str) -> Result<Option<Frame>, StompError> {
        let raw = raw.trim_start_matches(['\r', '\n']);
        if raw.is_empty() {
            return Ok(None);
        }

        let (head, rest) = match raw.find("\n\n") {
            Some(i) => (&raw[..i], &raw[i + 2..]),
            None => match raw.find("\r\n\r\n") {
                Some(i) => (&raw[..i], &raw[i + 4..]),
                None => return Err(StompError::Unterminated),
            },
        };

        let mut lines = head.lines();
        let command = lines
            .next()
            .map(str::trim_end)
            .filter(|c| !c.is_empty())
            .ok_or(StompError::MissingCommand)?
            .to_string();
        let escape = Self::escapes_headers(&command);

        let mut headers = Vec::new();
        for line in lines {
            let line = line.trim_end_matches('\r');
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| StompError::MalformedHeader(line.to_string()))?;
            if escape {
                headers.push((unescape_header(name)?, unescape_header(value)?));
            } else {
                headers.push((name.to_string(), value.to_string()));
            }
        }

        let mut frame = Frame {
            command,
            headers,
            body: String::new(),
        };

        let length = frame
            .header("content-length")
            .and_then(|v| v.trim().parse::<usize>().ok());
        frame.body = match length {
            Some(len) if rest.len() > len && rest.is_char_boundary(len) => rest[..len].to_string(),
            _ => match rest.find('\0') {
                Some(end) => rest[..end].to_string(),
                None => return Err(StompError::Unterminated),
            },
        };
        Ok(Some(frame))
    }
}

fn escape_header(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            c => out.push(c),
        }
    }
    out
}

fn unescape_header(s: &str) -> Result<String, StompError> {
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
            _ => return Err(StompError::InvalidEscape(s.to_string())),
        }
    }
    Ok(out)
}
