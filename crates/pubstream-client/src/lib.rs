//! Pubstream Client Library
//!
//! Publishes messages to an HTTP pub/sub broker and consumes its long-lived
//! topic streams (newline-delimited JSON or Server-Sent Events), routing each
//! message to the handlers registered for its topic.
//!
//! # Example
//!
//! ```rust,no_run
//! use pubstream_client::{ClientHandle, ConnectionCredential, Publisher, TlsVerification};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let handle = ClientHandle::configure(
//!         ConnectionCredential::basic("username", "password"),
//!         "https://localhost:7110",
//!         TlsVerification::Enabled,
//!     )?;
//!
//!     // Fire-and-forget publish; non-2xx answers come back as `Rejected`
//!     let result = Publisher::new(handle).publish("Test", "hello").await?;
//!     println!("delivered: {}", result.is_delivered());
//!
//!     Ok(())
//! }
//! ```
//!
//! # Subscribing
//!
//! Low-level access goes through [`StreamReader`], which yields one
//! [`NextFrame`] per call. Most callers want a [`Dispatcher`] instead:
//!
//! ```rust,ignore
//! let mut dispatcher = Dispatcher::new()
//!     .subscribe(["Test"], |m| println!("{}", m.payload))?;
//!
//! let request = SubscribeRequest::topics(["Test"]).format(WireFormat::Sse);
//! let reason = dispatcher.run(&handle, &request, cancel).await;
//! ```
//!
//! # Testing
//!
//! The `testing` module provides an in-process broker:
//!
//! ```rust,ignore
//! use pubstream_client::testing::StubBroker;
//!
//! let broker = StubBroker::start().await?;
//! let handle = broker.handle()?;
//! ```

mod dispatcher;
mod error;
mod publisher;
pub mod retry;
pub mod streaming;
pub mod testing;
mod transport;
mod types;

pub use dispatcher::{
    Dispatcher, DispatcherState, FrameErrorObserver, MessageHandler, TerminationReason,
    TopicSubscription,
};
pub use error::{ClientError, Result};
pub use publisher::{publish, Publisher};
pub use transport::{ClientHandle, TransportConfig, DEFAULT_CONNECT_TIMEOUT, DEFAULT_PUBLISH_TIMEOUT};
pub use types::*;

// Re-export streaming types for convenience
pub use streaming::{
    Frame, FrameError, FrameMeta, NextFrame, StreamReader, SubscribeRequest, WireFormat,
    DEFAULT_MAX_FRAME_BYTES,
};

// Re-export retry policy for convenience
pub use retry::RetryConfig;
