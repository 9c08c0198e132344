//! Utility modules for collector-agent.

mod command;
mod fmt;

pub use command::{CommandError, CommandOutput, find_in_path, run_with_timeout};
pub use fmt::{format_ago, format_uptime};
