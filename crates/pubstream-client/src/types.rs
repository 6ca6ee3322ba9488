//! Shared data types for publishing and subscribing

use std::fmt;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};

use crate::error::{ClientError, Result};

/// A topic-tagged message as carried on the wire
///
/// Decoding accepts the broker's PascalCase keys (`Id`, `Topic`, `Payload`,
/// `Timestamp`) as well as lowercase ones. Encoding always uses lowercase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Opaque identifier (the broker sends GUIDs, some publishers send numbers)
    #[serde(alias = "Id", deserialize_with = "opaque_id")]
    pub id: String,

    /// Topic the message was published on
    #[serde(default, alias = "Topic", deserialize_with = "nullable_string")]
    pub topic: String,

    /// Message body
    #[serde(default, alias = "Payload", deserialize_with = "nullable_string")]
    pub payload: String,

    /// Unix timestamp in milliseconds
    #[serde(default, alias = "Timestamp", alias = "ts", deserialize_with = "millis")]
    pub timestamp: i64,
}

impl Message {
    /// Create a message with a fresh id, stamped with the current time
    pub fn new(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            topic: topic.into(),
            payload: payload.into(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

fn opaque_id<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<String, D::Error> {
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(de::Error::custom(format!(
            "message id must be a string or number, got {}",
            other
        ))),
    }
}

fn nullable_string<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<String, D::Error> {
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

fn millis<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<i64, D::Error> {
    match Option::<serde_json::Number>::deserialize(deserializer)? {
        None => Ok(0),
        Some(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .ok_or_else(|| de::Error::custom(format!("timestamp out of range: {}", n))),
    }
}

/// Client identity presented to the broker
///
/// Exactly one variant is active per [`ClientHandle`](crate::ClientHandle).
#[derive(Clone)]
pub enum ConnectionCredential {
    /// `Authorization: Basic` on every request
    BasicAuth { username: String, password: String },

    /// Mutual TLS
    ///
    /// With an empty `private_key`, `certificate` is a PKCS#12 (PFX) bundle
    /// decrypted with `passphrase`. Otherwise both are PEM and the key must be
    /// unencrypted PKCS#8.
    ClientCertificate {
        certificate: Vec<u8>,
        private_key: Vec<u8>,
        passphrase: String,
    },
}

impl ConnectionCredential {
    /// Username/password credential
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::BasicAuth {
            username: username.into(),
            password: password.into(),
        }
    }

    /// PKCS#12 bundle protected by a passphrase
    pub fn pkcs12(bundle: Vec<u8>, passphrase: impl Into<String>) -> Self {
        Self::ClientCertificate {
            certificate: bundle,
            private_key: Vec::new(),
            passphrase: passphrase.into(),
        }
    }

    /// PEM certificate chain plus PKCS#8 private key
    pub fn pem(certificate: Vec<u8>, private_key: Vec<u8>) -> Self {
        Self::ClientCertificate {
            certificate,
            private_key,
            passphrase: String::new(),
        }
    }
}

impl fmt::Debug for ConnectionCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BasicAuth { username, .. } => f
                .debug_struct("BasicAuth")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            Self::ClientCertificate {
                certificate,
                private_key,
                ..
            } => f
                .debug_struct("ClientCertificate")
                .field("certificate_len", &certificate.len())
                .field("private_key_len", &private_key.len())
                .field("passphrase", &"<redacted>")
                .finish(),
        }
    }
}

/// Whether the broker's TLS certificate is verified
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsVerification {
    #[default]
    Enabled,
    /// Only for self-signed development brokers
    Disabled,
}

/// Which broker endpoint a publish goes to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PublishRoute {
    /// `POST {base}/publish` with the full message as body
    #[default]
    Broadcast,
    /// `POST {base}/{topic}` with `{"description": payload}` as body
    TopicPath,
}

/// Body sent on the topic-path route
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct TopicPathBody {
    pub description: String,
}

/// Outcome of a single publish request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishResult {
    /// Broker answered 2xx
    Delivered {
        message: Message,
        /// Response body, if any (the broker returns its message id here)
        broker_reference: Option<String>,
    },
    /// Broker answered with anything else
    Rejected { status: u16, body: String },
}

impl PublishResult {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered { .. })
    }

    /// Turn a rejection into [`ClientError::PublishRejected`]
    pub fn into_result(self) -> Result<Message> {
        match self {
            Self::Delivered { message, .. } => Ok(message),
            Self::Rejected { status, body } => Err(ClientError::PublishRejected { status, body }),
        }
    }
}
