//! Stream reader over one long-lived subscription response

use std::collections::VecDeque;
use std::pin::Pin;

use bytes::Bytes;
use futures::stream::{Stream, StreamExt, TryStreamExt};
use reqwest::header::{ACCEPT, CACHE_CONTROL};
use reqwest::{Method, StatusCode};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};

use super::parser::FrameParser;
use super::types::{Frame, NextFrame, SubscribeRequest, WireFormat, DEFAULT_MAX_FRAME_BYTES};
use crate::error::{ClientError, Result};
use crate::transport::ClientHandle;

type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReaderState {
    Open,
    Ended,
    Cancelled,
}

/// Lazy sequence of frames from one subscription response
///
/// Not restartable: once the connection ends the reader keeps reporting the
/// end, and the caller opens a new one to resume.
///
/// # Example
///
/// ```no_run
/// use pubstream_client::{ClientHandle, ConnectionCredential, NextFrame, StreamReader,
///     SubscribeRequest, TlsVerification};
/// use tokio_util::sync::CancellationToken;
///
/// # async fn example() -> pubstream_client::Result<()> {
/// let handle = ClientHandle::configure(
///     ConnectionCredential::basic("username", "password"),
///     "https://localhost:7110",
///     TlsVerification::Enabled,
/// )?;
/// let request = SubscribeRequest::topics(["Test"]);
/// let mut reader = StreamReader::open(&handle, &request, CancellationToken::new()).await?;
///
/// loop {
///     match reader.next_frame().await {
///         NextFrame::Message { message, .. } => println!("{}: {}", message.topic, message.payload),
///         NextFrame::Malformed(err) => eprintln!("{}", err),
///         _ => break,
///     }
/// }
/// # Ok(())
/// # }
/// ```
pub struct StreamReader {
    byte_stream: ByteStream,
    parser: FrameParser,
    /// Complete frames not yet handed out
    pending: VecDeque<Frame>,
    cancel: CancellationToken,
    state: ReaderState,
    /// Undelimited bytes tolerated before the stream is failed
    max_frame_bytes: usize,
}

impl StreamReader {
    /// Open a subscription stream
    ///
    /// Fails with `Configuration` when the broker refuses the credentials
    /// (401/403), `Server` for any other non-2xx status and `Transport` when
    /// the connection cannot be made.
    #[instrument(skip(handle, request, cancel), fields(format = ?request.wire_format()))]
    pub async fn open(
        handle: &ClientHandle,
        request: &SubscribeRequest,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let url = request.url(handle)?;
        let format = request.wire_format();

        debug!("Connecting to stream: {}", url);

        let mut builder = handle
            .request(Method::GET, url)
            .header(ACCEPT, format.accept())
            .header(CACHE_CONTROL, "no-cache");

        if request.is_exclusive() {
            builder = builder.header("x-exclusive", "true");
        }
        for (name, value) in request.headers() {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder.send().await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(match status {
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ClientError::configuration(
                    format!("Broker refused credentials ({}): {}", status, message),
                ),
                _ => ClientError::server_error(status.as_u16(), message),
            });
        }

        debug!(status = status.as_u16(), "Stream opened");

        Ok(Self::from_byte_stream(
            response.bytes_stream().map_err(ClientError::from),
            format,
            cancel,
        )
        .with_max_frame_bytes(request.frame_limit()))
    }

    /// Wrap an already-open byte stream
    pub fn from_byte_stream<S>(byte_stream: S, format: WireFormat, cancel: CancellationToken) -> Self
    where
        S: Stream<Item = Result<Bytes>> + Send + 'static,
    {
        Self {
            byte_stream: Box::pin(byte_stream),
            parser: FrameParser::new(format),
            pending: VecDeque::new(),
            cancel,
            state: ReaderState::Open,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }

    /// Fail the stream once a single frame buffers more than `limit` bytes
    pub fn with_max_frame_bytes(mut self, limit: usize) -> Self {
        self.max_frame_bytes = limit;
        self
    }

    /// Whether the stream can still produce frames
    pub fn is_open(&self) -> bool {
        self.state == ReaderState::Open && !self.cancel.is_cancelled()
    }

    /// Wait for the next complete frame
    ///
    /// Suspends only while waiting for bytes. Once the cancellation token
    /// fires, this and every later call return [`NextFrame::Cancelled`].
    pub async fn next_frame(&mut self) -> NextFrame {
        loop {
            if self.cancel.is_cancelled() {
                self.state = ReaderState::Cancelled;
            }

            match self.state {
                ReaderState::Cancelled => return NextFrame::Cancelled,
                ReaderState::Ended => return NextFrame::EndOfStream,
                ReaderState::Open => {}
            }

            if let Some(frame) = self.pending.pop_front() {
                return match frame.decode() {
                    Ok(message) => NextFrame::Message {
                        message,
                        meta: frame.meta,
                    },
                    Err(err) => NextFrame::Malformed(err),
                };
            }

            let buffered = self.parser.pending_bytes();
            if buffered > self.max_frame_bytes {
                warn!(bytes = buffered, limit = self.max_frame_bytes, "Frame too large");
                self.finish();
                return NextFrame::Error(ClientError::FrameTooLarge {
                    size: buffered,
                    limit: self.max_frame_bytes,
                });
            }

            let chunk = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                chunk = self.byte_stream.next() => Some(chunk),
            };

            match chunk {
                None => {
                    debug!("Stream cancelled");
                    self.state = ReaderState::Cancelled;
                    return NextFrame::Cancelled;
                }
                Some(Some(Ok(bytes))) => {
                    trace!(len = bytes.len(), "Received stream chunk");
                    let frames = self.parser.feed(&bytes);
                    self.pending.extend(frames);
                }
                Some(Some(Err(e))) => {
                    warn!(error = %e, "Stream failed");
                    self.finish();
                    return NextFrame::Error(e);
                }
                Some(None) => {
                    debug!("Stream closed by broker");
                    self.finish();
                    return NextFrame::EndOfStream;
                }
            }
        }
    }

    fn finish(&mut self) {
        self.state = ReaderState::Ended;
        let leftover = self.parser.pending_bytes();
        if leftover > 0 {
            warn!(bytes = leftover, "Discarding incomplete frame at end of stream");
        }
    }
}
