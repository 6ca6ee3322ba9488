//! Configuration file handling for pubstream

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Args;
use pubstream_client::{ConnectionCredential, TlsVerification, TransportConfig, WireFormat};
use serde::{Deserialize, Serialize};

/// Broker used when neither the command line nor the config file names one
pub const DEFAULT_SERVER: &str = "https://localhost:7110";

/// Configuration for the CLI tool
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    /// Default broker URL
    pub server: Option<String>,
    /// Default stream framing
    pub format: Option<WireFormat>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// PKCS#12 bundle, or PEM certificate when `private_key` is set
    pub certificate: Option<PathBuf>,
    /// PEM private key
    pub private_key: Option<PathBuf>,
    /// Passphrase for a PKCS#12 bundle
    pub passphrase: Option<String>,
    /// Skip server certificate verification
    pub insecure: Option<bool>,
}

/// Connection flags shared by every command
#[derive(Debug, Clone, Default, Args)]
pub struct ConnectionArgs {
    /// Broker URL
    #[arg(short, long, env = "PUBSTREAM_SERVER", global = true)]
    pub server: Option<String>,

    /// Username for basic authentication
    #[arg(short, long, env = "PUBSTREAM_USERNAME", global = true)]
    pub username: Option<String>,

    /// Password for basic authentication
    #[arg(long, env = "PUBSTREAM_PASSWORD", hide_env_values = true, global = true)]
    pub password: Option<String>,

    /// Client certificate (PKCS#12, or PEM together with --private-key)
    #[arg(long, env = "PUBSTREAM_CERTIFICATE", global = true)]
    pub certificate: Option<PathBuf>,

    /// PEM private key for --certificate
    #[arg(long, env = "PUBSTREAM_PRIVATE_KEY", global = true)]
    pub private_key: Option<PathBuf>,

    /// Passphrase for a PKCS#12 certificate
    #[arg(long, env = "PUBSTREAM_PASSPHRASE", hide_env_values = true, global = true)]
    pub passphrase: Option<String>,

    /// Accept any server certificate
    #[arg(long, env = "PUBSTREAM_INSECURE", global = true)]
    pub insecure: bool,
}

impl Config {
    /// Load configuration from the default config file
    ///
    /// A missing file (or no config directory at all) gives the defaults; a
    /// file that exists but cannot be read or parsed is an error.
    pub fn load() -> Result<Self> {
        match Self::config_path() {
            Ok(config_path) => Self::load_if_exists(&config_path),
            Err(_) => Ok(Self::default()),
        }
    }

    /// Load configuration from `path` when it exists
    pub fn load_if_exists(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load_from(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Get the default config file path
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Could not determine config directory")?
            .join("pubstream");

        Ok(config_dir.join("config.toml"))
    }

    /// Merge CLI arguments over config file values
    pub fn merge_with_args(&self, args: &ConnectionArgs, format: Option<WireFormat>) -> MergedConfig {
        MergedConfig {
            server: args
                .server
                .clone()
                .or_else(|| self.server.clone())
                .unwrap_or_else(|| DEFAULT_SERVER.to_string()),
            format: format.or(self.format).unwrap_or_default(),
            username: args.username.clone().or_else(|| self.username.clone()),
            password: args.password.clone().or_else(|| self.password.clone()),
            certificate: args.certificate.clone().or_else(|| self.certificate.clone()),
            private_key: args.private_key.clone().or_else(|| self.private_key.clone()),
            passphrase: args.passphrase.clone().or_else(|| self.passphrase.clone()),
            insecure: args.insecure || self.insecure.unwrap_or(false),
        }
    }
}

/// Fully resolved configuration after merging CLI args
#[derive(Debug, Clone)]
pub struct MergedConfig {
    pub server: String,
    pub format: WireFormat,
    username: Option<String>,
    password: Option<String>,
    certificate: Option<PathBuf>,
    private_key: Option<PathBuf>,
    passphrase: Option<String>,
    pub insecure: bool,
}

impl MergedConfig {
    /// Client certificate wins over basic credentials when both are given
    pub fn credential(&self) -> Result<ConnectionCredential> {
        if let Some(certificate) = &self.certificate {
            let bundle = std::fs::read(certificate).with_context(|| {
                format!("Failed to read certificate: {}", certificate.display())
            })?;

            return match &self.private_key {
                Some(key_path) => {
                    let key = std::fs::read(key_path).with_context(|| {
                        format!("Failed to read private key: {}", key_path.display())
                    })?;
                    Ok(ConnectionCredential::pem(bundle, key))
                }
                None => Ok(ConnectionCredential::pkcs12(
                    bundle,
                    self.passphrase.clone().unwrap_or_default(),
                )),
            };
        }

        match &self.username {
            Some(username) => Ok(ConnectionCredential::basic(
                username,
                self.password.clone().unwrap_or_default(),
            )),
            None => bail!("No credentials given: set --username/--password or --certificate"),
        }
    }

    pub fn tls_verification(&self) -> TlsVerification {
        if self.insecure {
            TlsVerification::Disabled
        } else {
            TlsVerification::Enabled
        }
    }

    pub fn transport_config(&self) -> Result<TransportConfig> {
        Ok(TransportConfig::new(&self.server, self.credential()?)
            .with_tls_verification(self.tls_verification()))
    }
}
