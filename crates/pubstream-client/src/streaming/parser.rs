//! Incremental frame parsers for NDJSON and SSE
//!
//! Both parsers accept arbitrary byte chunks and emit only complete frames;
//! whatever follows the last delimiter stays buffered for the next chunk.

use tracing::trace;

use super::types::{Frame, FrameMeta, WireFormat};

/// Buffer that yields `\n`-terminated lines, stripping `\r\n` endings
#[derive(Debug, Default)]
struct LineBuffer {
    buffer: Vec<u8>,
    /// Bytes already searched for a newline
    scanned: usize,
}

impl LineBuffer {
    fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    fn next_line(&mut self) -> Option<Vec<u8>> {
        let offset = self.buffer[self.scanned..].iter().position(|&b| b == b'\n');

        match offset {
            Some(offset) => {
                let pos = self.scanned + offset;
                let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
                self.scanned = 0;
                line.pop();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                Some(line)
            }
            None => {
                self.scanned = self.buffer.len();
                None
            }
        }
    }

    fn len(&self) -> usize {
        self.buffer.len()
    }
}

/// Newline-delimited JSON: every non-empty line is one frame
#[derive(Debug, Default)]
pub struct NdjsonParser {
    lines: LineBuffer,
}

impl NdjsonParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes into the parser and extract any complete frames
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Frame> {
        self.lines.push(bytes);

        let mut frames = Vec::new();
        while let Some(line) = self.lines.next_line() {
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            frames.push(Frame::new(line));
        }
        frames
    }

    /// Bytes buffered without a terminating newline
    pub fn pending_bytes(&self) -> usize {
        self.lines.len()
    }
}

/// Server-sent events: a blank line ends a block of `data:` lines
#[derive(Debug, Default)]
pub struct SseParser {
    lines: LineBuffer,
    /// Current event data being accumulated
    data_buffer: Vec<u8>,
    /// Whether the current event has seen a `data` line, even an empty one
    has_data: bool,
    /// Current event type (if any)
    event_type: Option<String>,
    /// Last event ID (persists across events)
    last_id: Option<String>,
    /// Last retry hint from the server
    retry: Option<u64>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes into the parser and extract any complete frames
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Frame> {
        self.lines.push(bytes);

        let mut frames = Vec::new();
        while let Some(line) = self.lines.next_line() {
            if let Some(frame) = self.process_line(&line) {
                frames.push(frame);
            }
        }
        frames
    }

    /// Bytes buffered that do not yet form a complete event
    pub fn pending_bytes(&self) -> usize {
        self.lines.len() + self.data_buffer.len()
    }

    fn process_line(&mut self, line: &[u8]) -> Option<Frame> {
        // Empty line signals end of event
        if line.is_empty() {
            return self.dispatch_event();
        }

        // Comment line (keepalive)
        if line.starts_with(b":") {
            trace!("SSE keepalive/comment");
            return None;
        }

        // Split on first colon; a line without one is a field with no value
        let (field, value) = match line.iter().position(|&b| b == b':') {
            Some(colon) => {
                let value = &line[colon + 1..];
                let value = value.strip_prefix(b" ").unwrap_or(value);
                (&line[..colon], value)
            }
            None => (line, &b""[..]),
        };

        match field {
            b"data" => {
                // Multiple data lines are joined with newlines
                if self.has_data {
                    self.data_buffer.push(b'\n');
                }
                self.has_data = true;
                self.data_buffer.extend_from_slice(value);
            }
            b"event" => {
                self.event_type = Some(String::from_utf8_lossy(value).into_owned());
            }
            b"id" => {
                self.last_id = Some(String::from_utf8_lossy(value).into_owned());
            }
            b"retry" => match std::str::from_utf8(value).ok().and_then(|v| v.parse().ok()) {
                Some(ms) => self.retry = Some(ms),
                None => trace!("SSE retry with non-numeric value ignored"),
            },
            _ => {
                trace!("SSE unknown field: {}", String::from_utf8_lossy(field));
            }
        }

        None
    }

    fn dispatch_event(&mut self) -> Option<Frame> {
        let event = self.event_type.take();
        self.has_data = false;

        if self.data_buffer.is_empty() {
            return None;
        }

        Some(Frame {
            payload: std::mem::take(&mut self.data_buffer),
            meta: FrameMeta {
                event,
                id: self.last_id.clone(),
                retry: self.retry,
            },
        })
    }
}

/// Frame parser for whichever wire format a stream was opened with
#[derive(Debug)]
pub enum FrameParser {
    Ndjson(NdjsonParser),
    Sse(SseParser),
}

impl FrameParser {
    pub fn new(format: WireFormat) -> Self {
        match format {
            WireFormat::Ndjson => Self::Ndjson(NdjsonParser::new()),
            WireFormat::Sse => Self::Sse(SseParser::new()),
        }
    }

    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Frame> {
        match self {
            Self::Ndjson(parser) => parser.feed(bytes),
            Self::Sse(parser) => parser.feed(bytes),
        }
    }

    pub fn pending_bytes(&self) -> usize {
        match self {
            Self::Ndjson(parser) => parser.pending_bytes(),
            Self::Sse(parser) => parser.pending_bytes(),
        }
    }
}
