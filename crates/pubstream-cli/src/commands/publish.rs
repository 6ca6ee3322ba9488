//! Publish command - send one message

use std::process::ExitCode;

use pubstream_client::{ClientError, ClientHandle, PublishResult, PublishRoute, Publisher, RetryConfig};

use super::{exit_configuration, exit_connection, EXIT_CONFIGURATION, EXIT_CONNECTION};
use crate::output::OutputContext;

/// Publish a single message, retrying up to `retries` extra times
pub async fn publish(
    handle: ClientHandle,
    topic: &str,
    payload: &str,
    route: PublishRoute,
    retries: u32,
    ctx: &OutputContext,
) -> ExitCode {
    let publisher = Publisher::new(handle);

    let outcome = if retries > 0 {
        let retry = RetryConfig::with_max_attempts(retries + 1);
        publisher
            .publish_with_retry(route, topic, payload, &retry)
            .await
    } else {
        publisher.publish_to(route, topic, payload).await
    };

    match outcome {
        Ok(PublishResult::Delivered {
            message,
            broker_reference,
        }) => {
            ctx.published(&message, broker_reference.as_deref());
            ExitCode::SUCCESS
        }
        Ok(PublishResult::Rejected { status, body }) => {
            ctx.error(&format!("Publish rejected ({}): {}", status, body));
            ExitCode::from(rejection_exit_status(status))
        }
        Err(ClientError::PublishRejected { status, body }) => {
            ctx.error(&format!("Publish rejected ({}): {}", status, body));
            ExitCode::from(rejection_exit_status(status))
        }
        Err(e @ ClientError::InvalidRequest(_)) => {
            ctx.error(&e.to_string());
            exit_configuration()
        }
        Err(e) => {
            ctx.error(&format!("Publish failed: {}", e));
            exit_connection()
        }
    }
}

/// Refused credentials are a configuration problem; any other refusal is a
/// rejected publish
fn rejection_exit_status(status: u16) -> u8 {
    match status {
        401 | 403 => EXIT_CONFIGURATION,
        _ => EXIT_CONNECTION,
    }
}
