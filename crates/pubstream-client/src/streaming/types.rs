//! Types for streaming subscriptions

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::error::{ClientError, Result};
use crate::transport::ClientHandle;
use crate::types::Message;

/// Default cap on a single buffered frame (1 MiB)
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Framing used by a subscription stream
///
/// Chosen by the caller when opening; never sniffed from the response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireFormat {
    /// One JSON document per `\n`-terminated line
    #[default]
    Ndjson,
    /// Server-sent events, one JSON document per `data:` block
    Sse,
}

impl WireFormat {
    /// Value for the `Accept` header
    pub fn accept(&self) -> &'static str {
        match self {
            Self::Ndjson => "application/x-ndjson",
            Self::Sse => "text/event-stream",
        }
    }
}

/// SSE fields that travel alongside a frame's data
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameMeta {
    pub event: Option<String>,
    /// Last event id seen on the stream
    pub id: Option<String>,
    /// Reconnection time requested by the server, in milliseconds
    pub retry: Option<u64>,
}

/// One delimiter-bounded unit of the wire stream, before JSON decoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub payload: Vec<u8>,
    pub meta: FrameMeta,
}

impl Frame {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            meta: FrameMeta::default(),
        }
    }

    /// Decode the payload as a JSON [`Message`]
    pub fn decode(&self) -> std::result::Result<Message, FrameError> {
        let text = std::str::from_utf8(&self.payload).map_err(|e| FrameError {
            raw_payload: String::from_utf8_lossy(&self.payload).into_owned(),
            reason: format!("Invalid UTF-8: {}", e),
        })?;

        serde_json::from_str::<Message>(text).map_err(|e| {
            let preview: String = text.chars().take(100).collect();
            FrameError {
                raw_payload: text.to_string(),
                reason: format!("Failed to parse message JSON: {} (data: {})", e, preview),
            }
        })
    }
}

/// A single frame that could not be decoded
///
/// Reported to the error observer; the stream carries on past it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Malformed frame: {reason}")]
pub struct FrameError {
    pub raw_payload: String,
    pub reason: String,
}

/// Result of one [`StreamReader::next_frame`](super::StreamReader::next_frame) call
#[derive(Debug)]
pub enum NextFrame {
    /// A complete, decoded message
    Message { message: Message, meta: FrameMeta },
    /// A complete frame that failed to decode
    Malformed(FrameError),
    /// The broker closed the stream gracefully
    EndOfStream,
    /// The connection failed mid-stream
    Error(ClientError),
    /// The cancellation token fired
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum SubscribeTarget {
    /// `GET {base}/subscribe?topics=a,b`
    Topics(Vec<String>),
    /// `GET {base}/{topic}`
    TopicPath(String),
    /// Any path relative to the base URL
    Path(String),
}

/// What to subscribe to and how the stream is framed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeRequest {
    target: SubscribeTarget,
    format: WireFormat,
    exclusive: bool,
    headers: Vec<(String, String)>,
    max_frame_bytes: usize,
}

impl SubscribeRequest {
    fn with_target(target: SubscribeTarget) -> Self {
        Self {
            target,
            format: WireFormat::default(),
            exclusive: false,
            headers: Vec::new(),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }

    /// Multi-topic stream on the broker's `subscribe` endpoint
    pub fn topics<I, S>(topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_target(SubscribeTarget::Topics(
            topics.into_iter().map(Into::into).collect(),
        ))
    }

    /// Single-topic stream on `{base}/{topic}`
    pub fn topic_path(topic: impl Into<String>) -> Self {
        Self::with_target(SubscribeTarget::TopicPath(topic.into()))
    }

    /// Stream on an arbitrary path (plus query) relative to the base URL
    pub fn path(path: impl Into<String>) -> Self {
        Self::with_target(SubscribeTarget::Path(path.into()))
    }

    pub fn format(mut self, format: WireFormat) -> Self {
        self.format = format;
        self
    }

    /// Ask the broker for an exclusive consumer on a topic-path stream
    pub fn exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    /// Extra header sent when opening the stream
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Largest frame accepted before the stream is failed
    pub fn max_frame_bytes(mut self, limit: usize) -> Self {
        self.max_frame_bytes = limit;
        self
    }

    pub fn wire_format(&self) -> WireFormat {
        self.format
    }

    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn frame_limit(&self) -> usize {
        self.max_frame_bytes
    }

    /// Topic encoded in the request path, used when a message carries none
    pub fn path_topic(&self) -> Option<&str> {
        match &self.target {
            SubscribeTarget::TopicPath(topic) => Some(topic),
            _ => None,
        }
    }

    /// Resolve the request URL against a handle's base address
    pub fn url(&self, handle: &ClientHandle) -> Result<Url> {
        match &self.target {
            SubscribeTarget::Topics(topics) => {
                if topics.is_empty() || topics.iter().any(|t| t.is_empty()) {
                    return Err(ClientError::InvalidRequest(
                        "subscribe needs at least one non-empty topic".into(),
                    ));
                }
                let mut url = handle.endpoint("subscribe")?;
                url.query_pairs_mut()
                    .append_pair("topics", &topics.join(","));
                Ok(url)
            }
            SubscribeTarget::TopicPath(topic) => {
                if topic.is_empty() {
                    return Err(ClientError::InvalidRequest("topic must not be empty".into()));
                }
                handle.topic_endpoint(topic)
            }
            SubscribeTarget::Path(path) => handle.endpoint(path),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ConnectionCredential, TlsVerification};

    fn handle() -> ClientHandle {
        ClientHandle::configure(
            ConnectionCredential::basic("u", "p"),
            "https://localhost:7110",
            TlsVerification::Enabled,
        )
        .unwrap()
    }

    #[test]
    fn test_topics_url() {
        let url = SubscribeRequest::topics(["Test", "TestAsync"])
            .url(&handle())
            .unwrap();
        assert_eq!(url.path(), "/subscribe");
        let topics: Vec<_> = url.query_pairs().collect();
        assert_eq!(topics.len(), 1);
        assert_eq!(topics[0].0, "topics");
        assert_eq!(topics[0].1, "Test,TestAsync");
    }

    #[test]
    fn test_empty_topic_list_rejected() {
        let err = SubscribeRequest::topics(Vec::<String>::new())
            .url(&handle())
            .unwrap_err();
        assert!(matches!(err, ClientError::InvalidRequest(_)));
    }

    #[test]
    fn test_topic_path_url_and_fallback_topic() {
        let request = SubscribeRequest::topic_path("Test").format(WireFormat::Sse);
        assert_eq!(request.url(&handle()).unwrap().as_str(), "https://localhost:7110/Test");
        assert_eq!(request.path_topic(), Some("Test"));
        assert_eq!(request.wire_format().accept(), "text/event-stream");
        assert_eq!(SubscribeRequest::topics(["a"]).path_topic(), None);
    }

    #[test]
    fn test_frame_decode_reports_bad_json() {
        let err = Frame::new(&b"{\"Id\":\"1\",\"Topic\""[..]).decode().unwrap_err();
        assert_eq!(err.raw_payload, "{\"Id\":\"1\",\"Topic\"");
        assert!(err.reason.contains("Failed to parse message JSON"));
    }

    #[test]
    fn test_frame_decode_reports_bad_utf8() {
        let err = Frame::new(vec![0xff, 0xfe, b'{']).decode().unwrap_err();
        assert!(err.reason.starts_with("Invalid UTF-8"));
    }
}
