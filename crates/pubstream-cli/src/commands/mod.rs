//! Command implementations for pubstream

pub mod publish;
pub mod subscribe;

pub use publish::publish;
pub use subscribe::subscribe;

use std::process::ExitCode;

/// Exit status for a lost connection or a publish the broker refused
pub const EXIT_CONNECTION: u8 = 1;
/// Exit status for bad credentials (including a 401/403 publish), flags or config
pub const EXIT_CONFIGURATION: u8 = 2;

pub fn exit_connection() -> ExitCode {
    ExitCode::from(EXIT_CONNECTION)
}

pub fn exit_configuration() -> ExitCode {
    ExitCode::from(EXIT_CONFIGURATION)
}
