//! pubstream - publish to and stream from a pubstream broker
//!
//! Exit status is 0 for a clean or cancelled run, 1 when the connection is
//! lost or a publish is rejected, and 2 for configuration problems (which
//! include a publish refused with 401/403).

mod commands;
mod config;
mod output;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use pubstream_client::{ClientHandle, PublishRoute, SubscribeRequest, WireFormat};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::{Config, ConnectionArgs};
use crate::output::{OutputContext, OutputFormat};

#[derive(Parser)]
#[command(name = "pubstream")]
#[command(author, version, about = "Publish/subscribe CLI for pubstream brokers")]
#[command(propagate_version = true)]
struct Cli {
    #[command(flatten)]
    connection: ConnectionArgs,

    /// Configuration file path
    #[arg(short, long, env = "PUBSTREAM_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Output format
    #[arg(short, long, value_enum, default_value = "text", global = true)]
    output: OutputFormat,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    /// Minimal output (for scripting)
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Stream framing as accepted on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum StreamFormat {
    /// Newline-delimited JSON
    Ndjson,
    /// Server-sent events
    Sse,
}

impl From<StreamFormat> for WireFormat {
    fn from(format: StreamFormat) -> Self {
        match format {
            StreamFormat::Ndjson => WireFormat::Ndjson,
            StreamFormat::Sse => WireFormat::Sse,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Publish one message
    Publish {
        /// Topic to publish on
        topic: String,

        /// Message payload
        payload: String,

        /// POST to /{topic} instead of /publish
        #[arg(long)]
        topic_path: bool,

        /// Extra attempts on transport errors and 5xx answers
        #[arg(long, default_value = "0")]
        retries: u32,
    },

    /// Stream messages for one or more topics
    Subscribe {
        /// Topic(s) to subscribe to
        #[arg(required = true)]
        topics: Vec<String>,

        /// Stream framing (defaults to the config file, then ndjson)
        #[arg(long, value_enum)]
        format: Option<StreamFormat>,

        /// Stream from /{topic} instead of /subscribe (single topic only)
        #[arg(long)]
        topic_path: bool,

        /// Ask the broker for an exclusive subscription
        #[arg(long)]
        exclusive: bool,

        /// Reconnect with backoff after a lost connection
        #[arg(long)]
        reconnect: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging; RUST_LOG wins over --verbose
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("warn")
        }
    });

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();

    let ctx = OutputContext::new(cli.output, cli.no_color, cli.quiet);

    match run(cli, &ctx).await {
        Ok(code) => code,
        Err(e) => {
            ctx.error(&format!("Error: {:#}", e));
            commands::exit_configuration()
        }
    }
}

/// Everything that fails before a request goes out is a configuration error
async fn run(cli: Cli, ctx: &OutputContext) -> Result<ExitCode> {
    // Load config file
    let config = if let Some(config_path) = &cli.config {
        Config::load_from(config_path)?
    } else {
        Config::load()?
    };

    match cli.command {
        Commands::Publish {
            topic,
            payload,
            topic_path,
            retries,
        } => {
            let merged = config.merge_with_args(&cli.connection, None);
            let handle = create_handle(&merged)?;
            let route = if topic_path {
                PublishRoute::TopicPath
            } else {
                PublishRoute::Broadcast
            };
            Ok(commands::publish(handle, &topic, &payload, route, retries, ctx).await)
        }

        Commands::Subscribe {
            topics,
            format,
            topic_path,
            exclusive,
            reconnect,
        } => {
            let merged = config.merge_with_args(&cli.connection, format.map(Into::into));
            let handle = create_handle(&merged)?;

            let request = if topic_path {
                let [topic] = topics.as_slice() else {
                    bail!("--topic-path takes exactly one topic");
                };
                SubscribeRequest::topic_path(topic.as_str())
            } else {
                SubscribeRequest::topics(topics.iter().cloned())
            };
            let request = request.format(merged.format).exclusive(exclusive);

            commands::subscribe(&handle, request, topics, reconnect, ctx).await
        }
    }
}

/// Create a client handle from the merged configuration
fn create_handle(merged: &config::MergedConfig) -> Result<ClientHandle> {
    let transport = merged.transport_config()?;
    ClientHandle::from_config(&transport).context("Failed to create client")
}
