//! Subscribe command - stream messages until Ctrl+C

use std::process::ExitCode;

use anyhow::Result;
use pubstream_client::{
    ClientHandle, Dispatcher, FrameError, Message, RetryConfig, SubscribeRequest,
    TerminationReason,
};
use tokio_util::sync::CancellationToken;

use super::{exit_configuration, exit_connection};
use crate::output::OutputContext;

/// Print every message on `topics` until the stream ends or Ctrl+C
pub async fn subscribe(
    handle: &ClientHandle,
    request: SubscribeRequest,
    topics: Vec<String>,
    reconnect: bool,
    ctx: &OutputContext,
) -> Result<ExitCode> {
    let printer = *ctx;
    let reporter = *ctx;
    let mut dispatcher = Dispatcher::new()
        .subscribe(topics.iter().cloned(), move |message: &Message| {
            printer.message(message)
        })?
        .on_frame_error(move |err: &FrameError| {
            reporter.warn(&format!("Skipping frame: {}", err.reason))
        });

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_signal.cancel();
        }
    });

    ctx.info(&format!(
        "Subscribing to {} on {}...",
        topics.join(", "),
        handle.base_url()
    ));
    ctx.info("Press Ctrl+C to stop");

    let reason = if reconnect {
        dispatcher
            .run_with_reconnect(handle, &request, &RetryConfig::infinite(), cancel)
            .await
    } else {
        dispatcher.run(handle, &request, cancel).await
    };

    Ok(match reason {
        TerminationReason::CleanShutdown => {
            ctx.info("Stream ended");
            ExitCode::SUCCESS
        }
        TerminationReason::Cancelled => {
            ctx.success("Subscription cancelled");
            ExitCode::SUCCESS
        }
        TerminationReason::ConnectionLost(e) => {
            ctx.error(&format!("Connection lost: {}", e));
            exit_connection()
        }
        TerminationReason::ConfigurationError(e) => {
            ctx.error(&e.to_string());
            exit_configuration()
        }
    })
}
