//! Authenticated HTTPS transport shared by publishers and subscriptions

use std::fmt;
use std::time::Duration;

use reqwest::{Client, Identity, Method, RequestBuilder};
use tracing::{debug, warn};
use url::Url;

use crate::error::{ClientError, Result};
use crate::types::{ConnectionCredential, TlsVerification};

/// Default connection timeout
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Default timeout for a single publish request
pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(30);

/// Everything needed to build a [`ClientHandle`]
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Broker base address, e.g. `https://localhost:7110`
    pub base_url: String,
    pub credential: ConnectionCredential,
    pub tls_verification: TlsVerification,
    pub connect_timeout: Duration,
    /// Applied per publish request. Streams have no overall timeout.
    pub publish_timeout: Duration,
}

impl TransportConfig {
    pub fn new(base_url: impl Into<String>, credential: ConnectionCredential) -> Self {
        Self {
            base_url: base_url.into(),
            credential,
            tls_verification: TlsVerification::Enabled,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            publish_timeout: DEFAULT_PUBLISH_TIMEOUT,
        }
    }

    pub fn with_tls_verification(mut self, verification: TlsVerification) -> Self {
        self.tls_verification = verification;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }
}

/// A configured, immutable connection setup for one broker
///
/// Cheap to clone; clones share the underlying connection pool. Safe to use
/// from a publisher and any number of subscriptions at once.
#[derive(Clone)]
pub struct ClientHandle {
    client: Client,
    base_url: Url,
    basic_auth: Option<(String, String)>,
    publish_timeout: Duration,
}

impl ClientHandle {
    /// Build a handle from a credential, broker address and TLS policy
    ///
    /// Client certificates are loaded and decrypted here, so a bad
    /// passphrase or corrupt bundle fails now rather than on first use.
    pub fn configure(
        credential: ConnectionCredential,
        base_url: &str,
        tls_verification: TlsVerification,
    ) -> Result<Self> {
        Self::from_config(
            &TransportConfig::new(base_url, credential).with_tls_verification(tls_verification),
        )
    }

    /// Build a handle from a full [`TransportConfig`]
    pub fn from_config(config: &TransportConfig) -> Result<Self> {
        let base_url = parse_base_url(&config.base_url)?;

        // No overall timeout: it would cut long-lived streams.
        let mut builder = Client::builder().connect_timeout(config.connect_timeout);

        let basic_auth = match &config.credential {
            ConnectionCredential::BasicAuth { username, password } => {
                Some((username.clone(), password.clone()))
            }
            ConnectionCredential::ClientCertificate {
                certificate,
                private_key,
                passphrase,
            } => {
                builder = builder.identity(load_identity(certificate, private_key, passphrase)?);
                None
            }
        };

        if config.tls_verification == TlsVerification::Disabled {
            warn!(
                base_url = %base_url,
                "TLS certificate verification is disabled; use only against development brokers"
            );
            builder = builder.danger_accept_invalid_certs(true);
        }

        let client = builder
            .build()
            .map_err(|e| ClientError::configuration(format!("Failed to build HTTP client: {}", e)))?;

        debug!(base_url = %base_url, "Configured broker transport");

        Ok(Self {
            client,
            base_url,
            basic_auth,
            publish_timeout: config.publish_timeout,
        })
    }

    /// Get the base URL
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Timeout applied to each publish request
    pub fn publish_timeout(&self) -> Duration {
        self.publish_timeout
    }

    /// Resolve a relative path (and optional query) against the base URL
    pub fn endpoint(&self, path: &str) -> Result<Url> {
        Ok(self.base_url.join(path.trim_start_matches('/'))?)
    }

    /// URL of the topic-scoped endpoint `{base}/{topic}`
    ///
    /// The topic becomes a single, percent-encoded path segment.
    pub fn topic_endpoint(&self, topic: &str) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| {
                ClientError::InvalidRequest(format!("{} cannot be a base", self.base_url))
            })?
            .pop_if_empty()
            .push(topic);
        Ok(url)
    }

    /// Start a request carrying this handle's credentials
    pub(crate) fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.basic_auth {
            Some((username, password)) => builder.basic_auth(username, Some(password)),
            None => builder,
        }
    }
}

impl fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientHandle")
            .field("base_url", &self.base_url.as_str())
            .field("basic_auth", &self.basic_auth.as_ref().map(|(user, _)| user))
            .field("publish_timeout", &self.publish_timeout)
            .finish()
    }
}

fn parse_base_url(raw: &str) -> Result<Url> {
    let mut url = Url::parse(raw)
        .map_err(|e| ClientError::configuration(format!("Invalid broker address {:?}: {}", raw, e)))?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(ClientError::configuration(format!(
            "Unsupported scheme {:?} in broker address",
            url.scheme()
        )));
    }

    // Joining relative paths replaces the last segment unless the path ends in '/'
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }

    Ok(url)
}

fn load_identity(certificate: &[u8], private_key: &[u8], passphrase: &str) -> Result<Identity> {
    let identity = if private_key.is_empty() {
        Identity::from_pkcs12_der(certificate, passphrase)
    } else {
        Identity::from_pkcs8_pem(certificate, private_key)
    };

    identity.map_err(|e| ClientError::configuration(format!("Failed to load client certificate: {}", e)))
}
