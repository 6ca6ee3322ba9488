//! Output formatting for pubstream (text, json)
//!
//! Messages go to stdout; status lines go to stderr so `--output json` can be
//! piped straight into another tool.

use chrono::{DateTime, SecondsFormat};
use clap::ValueEnum;
use colored::Colorize;
use pubstream_client::Message;
use serde::Serialize;

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    /// One human-readable line per message (default)
    #[default]
    Text,
    /// One JSON document per line
    Json,
}

/// Context for output rendering
#[derive(Debug, Clone, Copy)]
pub struct OutputContext {
    pub format: OutputFormat,
    pub quiet: bool,
}

/// Publish acknowledgement as printed with `--output json`
#[derive(Debug, Serialize)]
pub struct PublishRow<'a> {
    pub id: &'a str,
    pub topic: &'a str,
    pub broker_reference: Option<&'a str>,
}

impl OutputContext {
    pub fn new(format: OutputFormat, no_color: bool, quiet: bool) -> Self {
        if no_color {
            colored::control::set_override(false);
        }
        Self { format, quiet }
    }

    /// Print a success message (unless in quiet mode)
    pub fn success(&self, msg: &str) {
        if !self.quiet {
            eprintln!("{}", msg.green());
        }
    }

    /// Print an info message (unless in quiet mode)
    pub fn info(&self, msg: &str) {
        if !self.quiet {
            eprintln!("{}", msg);
        }
    }

    /// Print a warning message
    pub fn warn(&self, msg: &str) {
        eprintln!("{}", msg.yellow());
    }

    /// Print an error message
    pub fn error(&self, msg: &str) {
        eprintln!("{}", msg.red());
    }

    /// Print one received message in the configured format
    pub fn message(&self, message: &Message) {
        println!("{}", self.render_message(message));
    }

    /// Print the acknowledgement for a delivered publish
    pub fn published(&self, message: &Message, broker_reference: Option<&str>) {
        match self.format {
            OutputFormat::Text => self.success(&format!(
                "Published {} to {}{}",
                message.id,
                message.topic,
                broker_reference
                    .map(|r| format!(" (broker id {})", r))
                    .unwrap_or_default()
            )),
            OutputFormat::Json => {
                let row = PublishRow {
                    id: &message.id,
                    topic: &message.topic,
                    broker_reference,
                };
                println!(
                    "{}",
                    serde_json::to_string(&row).unwrap_or_else(|_| "{}".to_string())
                );
            }
        }
    }

    fn render_message(&self, message: &Message) -> String {
        match self.format {
            OutputFormat::Text => format!(
                "[{}] {}: {}",
                format_timestamp(message.timestamp),
                message.topic.cyan().bold(),
                message.payload
            ),
            OutputFormat::Json => {
                serde_json::to_string(message).unwrap_or_else(|_| "{}".to_string())
            }
        }
    }
}

/// Milliseconds since the epoch as RFC 3339; zero means the broker sent none
fn format_timestamp(millis: i64) -> String {
    if millis == 0 {
        return "-".to_string();
    }
    DateTime::from_timestamp_millis(millis)
        .map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true))
        .unwrap_or_else(|| millis.to_string())
}
