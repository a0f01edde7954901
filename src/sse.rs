//! Line framing for chunked `data:` streams
//!
//! Both the assistant backend's reply stream and OpenAI-compatible completion
//! streams arrive as arbitrary byte chunks carrying newline-delimited
//! `data: <payload>` lines, ended by a `[DONE]` sentinel.

/// Sentinel payload that ends a stream
pub const DONE: &str = "[DONE]";

/// One decoded line of a stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Payload of a `data:` line
    Data(String),
    /// The `[DONE]` sentinel
    Done,
}

/// Splits a byte stream into complete lines, buffering partial ones
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return the frames completed by it
    ///
    /// Blank lines, comments (`:`) and fields other than `data` are skipped.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Frame> {
        self.pending.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            if let Some(frame) = parse_line(&String::from_utf8_lossy(&line)) {
                frames.push(frame);
            }
        }
        frames
    }

    /// Flush a trailing line that was never newline-terminated
    pub fn finish(&mut self) -> Option<Frame> {
        if self.pending.is_empty() {
            return None;
        }
        let line = std::mem::take(&mut self.pending);
        parse_line(&String::from_utf8_lossy(&line))
    }
}

/// Decode a single line
#[must_use]
pub fn parse_line(line: &str) -> Option<Frame> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim() == DONE {
        return Some(Frame::Done);
    }

    let value = line.strip_prefix("data:")?;
    let value = value.strip_prefix(' ').unwrap_or(value);
    if value.trim() == DONE {
        Some(Frame::Done)
    } else {
        Some(Frame::Data(value.to_string()))
    }
}

/// Encode one text fragment as a `data:` line
///
/// Fragments are written as JSON string literals so embedded newlines cannot
/// break the line framing; [`decode_text`] reverses this.
#[must_use]
pub fn encode_text(text: &str) -> String {
    let literal = serde_json::Value::String(text.to_string()).to_string();
    format!("data: {literal}\n")
}

/// Payload of a `data:` line as text: a JSON string literal is unquoted,
/// anything else is taken verbatim
#[must_use]
pub fn decode_text(payload: &str) -> String {
    if payload.starts_with('"') {
        if let Ok(text) = serde_json::from_str::<String>(payload) {
            return text;
        }
    }
    payload.to_string()
}
