pub mod adapters;
pub mod config;
pub mod core;
pub mod domain;
pub mod utils;

#[cfg(feature = "cli")]
pub use config::cli::{parse_command_line, CliOptions, Invocation};

pub use config::AgentConfig;
pub use core::{
    agent::{Agent, AgentRole, AgentSettings},
    engine::AgentEngine,
    guest_table::GuestTable,
};
pub use utils::error::{AgentError, Result};
