use crate::adapters::agentx::session::{AgentxAddress, DEFAULT_AGENTX_SOCKET};
use crate::adapters::snmp::master::{ListenAddress, DEFAULT_LISTEN_ADDRESS};
use crate::domain::ports::Directive;
use crate::utils::error::{AgentError, Result};
use crate::utils::validation::{
    validate_non_empty_string, validate_path, validate_positive_number,
    validate_range, validate_required_field, validate_uri, Validate,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_ENV_VAR: &str = "LIBVIRT_SNMP_CONF";
pub const DEFAULT_CONFIG_PATH: &str = "/etc/snmp/libvirtGuestTable.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub agent: AgentSection,
    pub libvirt: LibvirtSection,
    pub logging: LoggingSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    pub agentaddress: Vec<String>,
    pub agentx_socket: String,
    pub agentx_timeout: u64,
    pub agentx_retries: u32,
    pub agentx_ping_interval: u64,
    pub rocommunity: String,
    pub max_getbulk_repeats: u16,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            agentaddress: vec![DEFAULT_LISTEN_ADDRESS.to_string()],
            agentx_socket: DEFAULT_AGENTX_SOCKET.to_string(),
            agentx_timeout: 1,
            agentx_retries: 5,
            agentx_ping_interval: 15,
            rocommunity: "public".to_string(),
            max_getbulk_repeats: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Virsh,
    Inventory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LibvirtSection {
    pub source: SourceKind,
    pub uri: String,
    pub virsh_path: String,
    pub inventory_path: Option<PathBuf>,
    pub cache_timeout: u64,
    pub command_timeout: u64,
}

impl Default for LibvirtSection {
    fn default() -> Self {
        Self {
            source: SourceKind::Virsh,
            uri: "qemu:///system".to_string(),
            virsh_path: "virsh".to_string(),
            inventory_path: None,
            cache_timeout: 5,
            command_timeout: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    pub file: Option<PathBuf>,
    pub format: LogFormat,
}

impl AgentConfig {
    /// Loads the first configuration file found: `explicit`, then
    /// `$LIBVIRT_SNMP_CONF`, then the system path. Defaults apply when none
    /// exists; an explicit path must exist.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }

        let candidates = std::env::var_os(CONFIG_ENV_VAR)
            .map(PathBuf::from)
            .into_iter()
            .chain(std::iter::once(PathBuf::from(DEFAULT_CONFIG_PATH)));
        for path in candidates {
            if path.is_file() {
                return Self::from_file(&path);
            }
            tracing::debug!(target: "main", "no configuration at {}", path.display());
        }
        Ok(Self::default())
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path).map_err(|e| {
            AgentError::config(format!(
                "cannot read configuration {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let processed_content = Self::substitute_env_vars(content)?;
        Ok(toml::from_str(&processed_content)?)
    }

    /// Replaces `${VAR}` with the environment value; unknown variables are left as-is.
    fn substitute_env_vars(content: &str) -> Result<String> {
        use regex::Regex;
        let re = Regex::new(r"\$\{([^}]+)\}")
            .map_err(|e| AgentError::config(format!("env substitution pattern: {}", e)))?;

        let result = re.replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            std::env::var(var_name).unwrap_or_else(|_| format!("${{{}}}", var_name))
        });

        Ok(result.to_string())
    }

    pub fn agentx_address(&self) -> Result<AgentxAddress> {
        self.agent.agentx_socket.parse()
    }

    pub fn listen_addresses(&self) -> Result<Vec<ListenAddress>> {
        ListenAddress::parse_list(&self.agent.agentaddress.join(","))
    }

    pub fn cache_timeout(&self) -> Duration {
        Duration::from_secs(self.libvirt.cache_timeout)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.libvirt.command_timeout)
    }

    /// Directives handled by the agent itself; modules add their own.
    pub fn directives() -> Vec<Directive> {
        vec![
            Directive {
                name: "agent.agentaddress",
                usage: "[\"udp:[HOST:]PORT\", ...] (master mode listening addresses)",
            },
            Directive {
                name: "agent.agentx_socket",
                usage: "PATH | unix:PATH | tcp:HOST:PORT",
            },
            Directive {
                name: "agent.agentx_timeout",
                usage: "SECONDS",
            },
            Directive {
                name: "agent.agentx_retries",
                usage: "COUNT",
            },
            Directive {
                name: "agent.agentx_ping_interval",
                usage: "SECONDS",
            },
            Directive {
                name: "agent.rocommunity",
                usage: "COMMUNITY",
            },
            Directive {
                name: "agent.max_getbulk_repeats",
                usage: "COUNT",
            },
            Directive {
                name: "logging.file",
                usage: "FILE",
            },
            Directive {
                name: "logging.format",
                usage: "compact|json",
            },
        ]
    }

    pub fn validate_config(&self) -> Result<()> {
        self.listen_addresses()?;
        self.agentx_address()?;
        validate_range("agent.agentx_timeout", self.agent.agentx_timeout, 1, 255)?;
        validate_positive_number("agent.agentx_ping_interval", self.agent.agentx_ping_interval, 1)?;
        validate_non_empty_string("agent.rocommunity", &self.agent.rocommunity)?;
        validate_positive_number(
            "agent.max_getbulk_repeats",
            u64::from(self.agent.max_getbulk_repeats),
            1,
        )?;

        validate_uri("libvirt.uri", &self.libvirt.uri)?;
        validate_positive_number("libvirt.command_timeout", self.libvirt.command_timeout, 1)?;
        match self.libvirt.source {
            SourceKind::Virsh => validate_path("libvirt.virsh_path", &self.libvirt.virsh_path)?,
            SourceKind::Inventory => {
                let path = validate_required_field(
                    "libvirt.inventory_path",
                    &self.libvirt.inventory_path,
                )?;
                validate_path("libvirt.inventory_path", &path.to_string_lossy())?;
            }
        }

        if let Some(file) = &self.logging.file {
            validate_path("logging.file", &file.to_string_lossy())?;
        }
        Ok(())
    }
}

impl Validate for AgentConfig {
    fn validate(&self) -> Result<()> {
        self.validate_config()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults_without_file() {
        let config = AgentConfig::from_toml_str("").unwrap();
        assert_eq!(config.agent.agentaddress, vec!["udp:161"]);
        assert_eq!(config.agent.agentx_socket, "/var/agentx/master");
        assert_eq!(config.agent.rocommunity, "public");
        assert_eq!(config.libvirt.source, SourceKind::Virsh);
        assert_eq!(config.libvirt.uri, "qemu:///system");
        assert_eq!(config.cache_timeout(), Duration::from_secs(5));
        assert_eq!(config.logging.format, LogFormat::Compact);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_full_config() {
        let toml_content = r#"
[agent]
agentaddress = ["udp:127.0.0.1:1161", "udp6:1161"]
agentx_socket = "tcp:localhost:705"
agentx_timeout = 3
rocommunity = "monitor"

[libvirt]
source = "inventory"
inventory_path = "/var/lib/libvirt-snmp/guests.toml"
cache_timeout = 30

[logging]
file = "/var/log/libvirt-snmp.log"
format = "json"
"#;

        let config = AgentConfig::from_toml_str(toml_content).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.listen_addresses().unwrap().len(), 2);
        assert_eq!(
            config.agentx_address().unwrap(),
            AgentxAddress::Tcp("localhost:705".to_string())
        );
        assert_eq!(config.agent.agentx_retries, 5);
        assert_eq!(config.libvirt.source, SourceKind::Inventory);
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_env_var_substitution() {
        std::env::set_var("LIBVIRT_SNMP_TEST_COMMUNITY", "s3cret");

        let toml_content = r#"
[agent]
rocommunity = "${LIBVIRT_SNMP_TEST_COMMUNITY}"
"#;

        let config = AgentConfig::from_toml_str(toml_content).unwrap();
        assert_eq!(config.agent.rocommunity, "s3cret");

        std::env::remove_var("LIBVIRT_SNMP_TEST_COMMUNITY");
    }

    #[test]
    fn test_config_validation() {
        let bad_uri = AgentConfig::from_toml_str("[libvirt]\nuri = \"no scheme here\"\n").unwrap();
        assert!(bad_uri.validate().is_err());

        let missing_inventory = AgentConfig::from_toml_str("[libvirt]\nsource = \"inventory\"\n").unwrap();
        assert!(matches!(
            missing_inventory.validate(),
            Err(AgentError::MissingConfigError { .. })
        ));

        let tcp_listener =
            AgentConfig::from_toml_str("[agent]\nagentaddress = [\"tcp:161\"]\n").unwrap();
        assert!(tcp_listener.validate().is_err());

        let timeout = AgentConfig::from_toml_str("[agent]\nagentx_timeout = 0\n").unwrap();
        assert!(timeout.validate().is_err());
    }

    #[test]
    fn test_unknown_source_is_rejected() {
        assert!(AgentConfig::from_toml_str("[libvirt]\nsource = \"xen\"\n").is_err());
    }

    #[test]
    fn test_config_from_file() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(temp_file, "[agent]\nagentx_socket = \"/run/agentx/master\"").unwrap();

        let config = AgentConfig::load(Some(temp_file.path())).unwrap();
        assert_eq!(
            config.agentx_address().unwrap(),
            AgentxAddress::Unix(PathBuf::from("/run/agentx/master"))
        );
    }

    #[test]
    fn test_explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.toml");
        assert!(AgentConfig::load(Some(&missing)).is_err());
    }

    #[test]
    fn test_directive_names_are_unique() {
        let directives = AgentConfig::directives();
        let mut names: Vec<_> = directives.iter().map(|d| d.name).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), directives.len());
    }
}
