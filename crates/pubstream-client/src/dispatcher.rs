//! Topic dispatch over a subscription stream
//!
//! A [`Dispatcher`] opens one stream, decodes frames in arrival order and
//! calls every handler whose topic set contains the message's topic. It
//! returns when the stream ends instead of reconnecting, so a supervisor can
//! decide what happens next.
//!
//! # Example
//!
//! ```no_run
//! use pubstream_client::{ClientHandle, ConnectionCredential, Dispatcher, SubscribeRequest,
//!     TerminationReason, TlsVerification};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> pubstream_client::Result<()> {
//! let handle = ClientHandle::configure(
//!     ConnectionCredential::basic("username", "password"),
//!     "https://localhost:7110",
//!     TlsVerification::Enabled,
//! )?;
//!
//! let mut dispatcher = Dispatcher::new()
//!     .subscribe(["Test"], |message| println!("Test: {}", message.payload))?
//!     .subscribe(["TestAsync"], |message| println!("Async: {}", message.payload))?;
//!
//! let request = SubscribeRequest::topics(["Test", "TestAsync"]);
//! match dispatcher.run(&handle, &request, CancellationToken::new()).await {
//!     TerminationReason::ConnectionLost(e) => eprintln!("lost connection: {}", e),
//!     other => println!("stopped: {:?}", other),
//! }
//! # Ok(())
//! # }
//! ```

use std::collections::HashSet;
use std::fmt;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use crate::error::{ClientError, Result};
use crate::retry::{Backoff, RetryConfig};
use crate::streaming::{FrameError, NextFrame, StreamReader, SubscribeRequest};
use crate::transport::ClientHandle;
use crate::types::Message;

/// Callback invoked for each message on a subscribed topic
pub type MessageHandler = Box<dyn FnMut(&Message) + Send>;

/// Callback invoked for each frame that failed to decode
pub type FrameErrorObserver = Box<dyn FnMut(&FrameError) + Send>;

/// A set of topics and the handler that receives them
pub struct TopicSubscription {
    topics: HashSet<String>,
    handler: MessageHandler,
}

impl TopicSubscription {
    /// Fails with a configuration error if `topics` is empty
    pub fn new<I, S, F>(topics: I, handler: F) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: FnMut(&Message) + Send + 'static,
    {
        let topics: HashSet<String> = topics.into_iter().map(Into::into).collect();
        if topics.is_empty() {
            return Err(ClientError::configuration(
                "a subscription needs at least one topic",
            ));
        }
        Ok(Self {
            topics,
            handler: Box::new(handler),
        })
    }

    pub fn topics(&self) -> &HashSet<String> {
        &self.topics
    }

    pub fn matches(&self, topic: &str) -> bool {
        self.topics.contains(topic)
    }
}

impl fmt::Debug for TopicSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TopicSubscription")
            .field("topics", &self.topics)
            .finish_non_exhaustive()
    }
}

/// Dispatcher lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    Idle,
    Connecting,
    Streaming,
    Failed,
}

/// Why [`Dispatcher::run`] returned
#[derive(Debug)]
pub enum TerminationReason {
    /// The broker closed the stream
    CleanShutdown,
    /// The connection failed or could not be made; worth retrying
    ConnectionLost(ClientError),
    /// The cancellation token fired
    Cancelled,
    /// Credentials or request were rejected; retrying will not help
    ConfigurationError(ClientError),
}

impl TerminationReason {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConnectionLost(e) if e.is_retryable())
    }
}

/// Routes messages from one subscription stream to per-topic handlers
pub struct Dispatcher {
    subscriptions: Vec<TopicSubscription>,
    error_observer: FrameErrorObserver,
    state: watch::Sender<DispatcherState>,
    /// Whether the last run got as far as streaming
    reached_streaming: bool,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    /// Create a dispatcher with no subscriptions
    ///
    /// Malformed frames are logged until an observer is set with
    /// [`on_frame_error`](Self::on_frame_error).
    pub fn new() -> Self {
        let (state, _) = watch::channel(DispatcherState::Idle);
        Self {
            subscriptions: Vec::new(),
            error_observer: Box::new(|err: &FrameError| {
                warn!(error = %err, raw = %err.raw_payload, "Skipping malformed frame");
            }),
            state,
            reached_streaming: false,
        }
    }

    /// Add a handler for a set of topics
    pub fn subscribe<I, S, F>(mut self, topics: I, handler: F) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: FnMut(&Message) + Send + 'static,
    {
        self.add_subscription(TopicSubscription::new(topics, handler)?);
        Ok(self)
    }

    pub fn add_subscription(&mut self, subscription: TopicSubscription) {
        self.subscriptions.push(subscription);
    }

    pub fn subscriptions(&self) -> &[TopicSubscription] {
        &self.subscriptions
    }

    /// Replace the observer for frames that fail to decode
    pub fn on_frame_error<F>(mut self, observer: F) -> Self
    where
        F: FnMut(&FrameError) + Send + 'static,
    {
        self.error_observer = Box::new(observer);
        self
    }

    pub fn state(&self) -> DispatcherState {
        *self.state.borrow()
    }

    /// Receiver that sees every state transition
    pub fn watch_state(&self) -> watch::Receiver<DispatcherState> {
        self.state.subscribe()
    }

    /// Deliver one message to every matching handler, in registration order
    ///
    /// The message's own topic wins; `fallback_topic` (the topic in the request
    /// path) is used only when the message has none. Returns the number of
    /// handlers called.
    pub fn dispatch(&mut self, message: &Message, fallback_topic: Option<&str>) -> usize {
        let topic = if message.topic.is_empty() {
            fallback_topic.unwrap_or_default()
        } else {
            message.topic.as_str()
        };

        let mut delivered = 0;
        for subscription in self.subscriptions.iter_mut() {
            if subscription.topics.contains(topic) {
                (subscription.handler)(message);
                delivered += 1;
            }
        }

        if delivered == 0 {
            trace!(topic = %topic, id = %message.id, "No subscription for topic, dropping message");
        }
        delivered
    }

    /// Open the stream and dispatch until it ends
    ///
    /// Each frame is fully dispatched before the next one is read.
    #[instrument(skip_all)]
    pub async fn run(
        &mut self,
        handle: &ClientHandle,
        request: &SubscribeRequest,
        cancel: CancellationToken,
    ) -> TerminationReason {
        self.reached_streaming = false;
        self.transition(DispatcherState::Connecting);

        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = StreamReader::open(handle, request, cancel.clone()) => Some(result),
        };

        let mut reader = match opened {
            None => {
                info!("Cancelled while connecting");
                self.transition(DispatcherState::Idle);
                return TerminationReason::Cancelled;
            }
            Some(Ok(reader)) => reader,
            Some(Err(e)) => {
                self.transition(DispatcherState::Failed);
                return match e {
                    ClientError::Transport(_) | ClientError::Server { .. } => {
                        warn!(error = %e, "Failed to open stream");
                        TerminationReason::ConnectionLost(e)
                    }
                    _ => {
                        warn!(error = %e, "Stream rejected");
                        TerminationReason::ConfigurationError(e)
                    }
                };
            }
        };

        self.reached_streaming = true;
        self.transition(DispatcherState::Streaming);

        let fallback_topic = request.path_topic().map(str::to_owned);

        loop {
            match reader.next_frame().await {
                NextFrame::Message { message, meta } => {
                    trace!(id = %message.id, topic = %message.topic, event = ?meta.event, "Dispatching message");
                    self.dispatch(&message, fallback_topic.as_deref());
                }
                NextFrame::Malformed(err) => (self.error_observer)(&err),
                NextFrame::EndOfStream => {
                    info!("Stream ended");
                    self.transition(DispatcherState::Idle);
                    return TerminationReason::CleanShutdown;
                }
                NextFrame::Error(e) => {
                    warn!(error = %e, "Connection lost");
                    self.transition(DispatcherState::Failed);
                    return TerminationReason::ConnectionLost(e);
                }
                NextFrame::Cancelled => {
                    info!("Subscription cancelled");
                    self.transition(DispatcherState::Idle);
                    return TerminationReason::Cancelled;
                }
            }
        }
    }

    /// Re-run after lost connections, with backoff between attempts
    ///
    /// Returns on a clean shutdown, cancellation, a configuration error, a
    /// lost connection whose cause is not retryable (a 4xx answer, an
    /// oversized frame), or once `retry` runs out of attempts. A run that
    /// reached streaming resets the backoff.
    pub async fn run_with_reconnect(
        &mut self,
        handle: &ClientHandle,
        request: &SubscribeRequest,
        retry: &RetryConfig,
        cancel: CancellationToken,
    ) -> TerminationReason {
        let mut backoff = Backoff::new(retry);

        loop {
            let reason = self.run(handle, request, cancel.clone()).await;

            let TerminationReason::ConnectionLost(e) = &reason else {
                return reason;
            };

            if !e.is_retryable() {
                warn!(error = %e, "Not reconnecting after permanent failure");
                return reason;
            }

            if self.reached_streaming {
                backoff.reset();
            }

            let Some(delay) = backoff.next_delay() else {
                warn!(attempts = backoff.attempt(), error = %e, "Giving up reconnecting");
                return reason;
            };

            debug!(
                attempt = backoff.attempt(),
                delay_ms = delay.as_millis(),
                error = %e,
                "Reconnecting"
            );

            tokio::select! {
                _ = cancel.cancelled() => return TerminationReason::Cancelled,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn transition(&mut self, next: DispatcherState) {
        let previous = self.state.send_replace(next);
        debug!(from = ?previous, to = ?next, "Dispatcher state");
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("subscriptions", &self.subscriptions)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
