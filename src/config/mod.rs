#[cfg(feature = "cli")]
pub mod cli;
pub mod toml_config;

pub use toml_config::{AgentConfig, LogFormat, SourceKind};

use crate::adapters::agentx::session::{AgentxAddress, SessionSettings};
use crate::adapters::inventory::InventorySource;
use crate::adapters::snmp::master::ListenAddress;
use crate::adapters::virsh::VirshSource;
use crate::core::agent::{AgentRole, AgentSettings};
use crate::domain::ports::{Directive, GuestSource};
use crate::utils::error::Result;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Writes the `-H` listing: a header line, then one indented line per directive.
pub fn print_directive_usage<W: Write>(
    out: &mut W,
    prefix: &str,
    directives: &[Directive],
) -> std::io::Result<()> {
    writeln!(out, "Configuration directives understood:")?;
    for directive in directives {
        writeln!(out, "{}{} {}", prefix, directive.name, directive.usage)?;
    }
    Ok(())
}

/// Command-line values that take precedence over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides<'a> {
    pub master: bool,
    pub agentx_socket: Option<&'a str>,
    pub listen_spec: Option<&'a str>,
}

/// Merges the file configuration with command-line overrides.
pub fn agent_settings(config: &AgentConfig, overrides: &Overrides<'_>) -> Result<AgentSettings> {
    let role = if overrides.master {
        AgentRole::Master
    } else {
        AgentRole::Subagent
    };

    let agentx_address = match overrides.agentx_socket {
        Some(address) => address.parse::<AgentxAddress>()?,
        None => config.agentx_address()?,
    };
    let listen_addresses = match overrides.listen_spec {
        Some(spec) => ListenAddress::parse_list(spec)?,
        None => config.listen_addresses()?,
    };

    let session = SessionSettings {
        timeout: Duration::from_secs(config.agent.agentx_timeout),
        retries: config.agent.agentx_retries,
        ping_interval: Duration::from_secs(config.agent.agentx_ping_interval),
        max_getbulk_repeats: config.agent.max_getbulk_repeats,
        ..SessionSettings::default()
    };

    Ok(AgentSettings {
        role,
        agentx_address,
        listen_addresses,
        session,
        community: config.agent.rocommunity.clone(),
    })
}

/// Builds the configured guest source. Relative paths are resolved against
/// the current directory here, since daemonizing later moves to `/`.
pub fn guest_source(config: &AgentConfig) -> Result<Arc<dyn GuestSource>> {
    Ok(match config.libvirt.source {
        SourceKind::Virsh => {
            let binary = &config.libvirt.virsh_path;
            // A bare command name is looked up on PATH.
            let binary = if binary.contains('/') {
                anchor(Path::new(binary))?.to_string_lossy().into_owned()
            } else {
                binary.clone()
            };
            Arc::new(VirshSource::new(
                binary,
                config.libvirt.uri.clone(),
                config.command_timeout(),
            ))
        }
        SourceKind::Inventory => {
            let path = crate::utils::validation::validate_required_field(
                "libvirt.inventory_path",
                &config.libvirt.inventory_path,
            )?;
            Arc::new(InventorySource::from_file(anchor(path)?))
        }
    })
}

fn anchor(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}
