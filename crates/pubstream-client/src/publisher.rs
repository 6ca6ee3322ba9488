//! One-shot publish requests

use reqwest::Method;
use tracing::{debug, instrument, warn};

use crate::error::{ClientError, Result};
use crate::retry::{retry_if, RetryConfig};
use crate::transport::ClientHandle;
use crate::types::{Message, PublishResult, PublishRoute, TopicPathBody};

/// Publishes messages through a [`ClientHandle`]
///
/// Stateless; safe to use concurrently with subscriptions on the same handle.
#[derive(Debug, Clone)]
pub struct Publisher {
    handle: ClientHandle,
}

impl Publisher {
    pub fn new(handle: ClientHandle) -> Self {
        Self { handle }
    }

    /// Publish to `{base}/publish`
    pub async fn publish(&self, topic: &str, payload: &str) -> Result<PublishResult> {
        self.publish_to(PublishRoute::Broadcast, topic, payload).await
    }

    /// Publish on the given route
    ///
    /// Non-2xx answers come back as [`PublishResult::Rejected`]; only
    /// transport failures are errors. Never retries.
    pub async fn publish_to(
        &self,
        route: PublishRoute,
        topic: &str,
        payload: &str,
    ) -> Result<PublishResult> {
        let message = build_message(topic, payload)?;
        self.send(route, message).await
    }

    /// Publish with bounded backoff on transport errors and 5xx answers
    ///
    /// The same message id is reused for every attempt. When attempts run out
    /// on a 5xx answer the last rejection is returned as `Ok(Rejected)`.
    pub async fn publish_with_retry(
        &self,
        route: PublishRoute,
        topic: &str,
        payload: &str,
        retry: &RetryConfig,
    ) -> Result<PublishResult> {
        let message = build_message(topic, payload)?;

        let outcome = retry_if(retry, "publish", ClientError::is_retryable, || {
            let message = message.clone();
            async move {
                match self.send(route, message).await? {
                    PublishResult::Rejected { status, body } if status >= 500 => {
                        Err(ClientError::PublishRejected { status, body })
                    }
                    result => Ok(result),
                }
            }
        })
        .await;

        match outcome {
            Err(ClientError::PublishRejected { status, body }) => {
                Ok(PublishResult::Rejected { status, body })
            }
            other => other,
        }
    }

    #[instrument(skip(self, message), fields(topic = %message.topic, id = %message.id))]
    async fn send(&self, route: PublishRoute, message: Message) -> Result<PublishResult> {
        let request = match route {
            PublishRoute::Broadcast => {
                let url = self.handle.endpoint("publish")?;
                self.handle.request(Method::POST, url).json(&message)
            }
            PublishRoute::TopicPath => {
                let url = self.handle.topic_endpoint(&message.topic)?;
                let body = TopicPathBody {
                    description: message.payload.clone(),
                };
                self.handle.request(Method::POST, url).json(&body)
            }
        };

        let response = request
            .timeout(self.handle.publish_timeout())
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if status.is_success() {
            debug!(status = status.as_u16(), "Message delivered");
            Ok(PublishResult::Delivered {
                message,
                broker_reference: broker_reference(&body),
            })
        } else {
            warn!(status = status.as_u16(), body = %body, "Publish rejected");
            Ok(PublishResult::Rejected {
                status: status.as_u16(),
                body,
            })
        }
    }
}

/// Publish once on `{base}/publish` using `handle`
pub async fn publish(handle: &ClientHandle, topic: &str, payload: &str) -> Result<PublishResult> {
    Publisher::new(handle.clone()).publish(topic, payload).await
}

fn build_message(topic: &str, payload: &str) -> Result<Message> {
    if topic.is_empty() {
        return Err(ClientError::InvalidRequest("topic must not be empty".into()));
    }
    Ok(Message::new(topic, payload))
}

/// The broker answers `202 Accepted` with the stored message id as a JSON string
fn broker_reference(body: &str) -> Option<String> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return None;
    }
    match serde_json::from_str::<String>(trimmed) {
        Ok(reference) => Some(reference),
        Err(_) => Some(trimmed.to_string()),
    }
}
