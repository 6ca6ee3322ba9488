//! Streaming support for topic subscriptions
//!
//! A subscription is one long-lived `GET` whose body is either
//! newline-delimited JSON or server-sent events. [`StreamReader`] buffers
//! bytes as they arrive and hands out one complete frame at a time; the
//! framing is picked up front with [`WireFormat`].

mod parser;
mod reader;
mod types;

pub use parser::{FrameParser, NdjsonParser, SseParser};
pub use reader::StreamReader;
pub use types::{
    Frame, FrameError, FrameMeta, NextFrame, SubscribeRequest, WireFormat, DEFAULT_MAX_FRAME_BYTES,
};
