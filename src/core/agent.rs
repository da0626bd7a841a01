//! Agent runtime: owns the MIB registry and the transport that feeds it.
//!
//! A subagent talks AgentX to a master; a master answers SNMP over UDP
//! directly. Either way the driver only sees [`RequestProcessor`].

use crate::adapters::agentx::pdu::CloseReason;
use crate::adapters::agentx::session::{AgentxAddress, AgentxSession, SessionSettings};
use crate::adapters::snmp::master::{ListenAddress, MasterListener};
use crate::core::registry::MibRegistry;
use crate::core::shutdown::Shutdown;
use crate::domain::ports::{MibModule, RequestProcessor};
use crate::utils::error::{AgentError, Result};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentRole {
    Subagent,
    Master,
}

#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub role: AgentRole,
    pub agentx_address: AgentxAddress,
    pub listen_addresses: Vec<ListenAddress>,
    pub session: SessionSettings,
    pub community: String,
}

enum Transport {
    Stopped,
    Subagent(AgentxSession),
    Master(MasterListener),
}

pub struct Agent {
    name: String,
    settings: AgentSettings,
    registry: MibRegistry,
    transport: Transport,
    started: Instant,
}

impl Agent {
    pub fn new(name: impl Into<String>, settings: AgentSettings) -> Self {
        let name = name.into();
        tracing::debug!(target: "main", "initializing agent {} as {:?}", name, settings.role);
        Self {
            name,
            settings,
            registry: MibRegistry::new(),
            transport: Transport::Stopped,
            started: Instant::now(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> AgentRole {
        self.settings.role
    }

    pub fn register(&mut self, module: Arc<dyn MibModule>) {
        self.registry.register(module);
    }

    pub fn registry(&self) -> &MibRegistry {
        &self.registry
    }

    /// Initializes every registered module, then connects to the master
    /// (subagent) or binds the listening sockets (master).
    pub async fn start(&mut self) -> Result<()> {
        for module in self.registry.modules() {
            module.init().await?;
        }

        self.transport = match self.settings.role {
            AgentRole::Subagent => {
                let mut session = AgentxSession::new(
                    self.settings.agentx_address.clone(),
                    self.settings.session.clone(),
                );
                session.try_connect(&self.registry).await;
                Transport::Subagent(session)
            }
            AgentRole::Master => {
                if self.settings.listen_addresses.is_empty() {
                    return Err(AgentError::MissingConfigError {
                        field: "agent.agentaddress".to_string(),
                    });
                }
                let listener = MasterListener::bind(
                    &self.settings.listen_addresses,
                    self.settings.community.clone(),
                    self.settings.session.max_getbulk_repeats,
                )
                .await?;
                Transport::Master(listener)
            }
        };

        tracing::info!("{} started as {:?}", self.name, self.settings.role);
        Ok(())
    }

    /// sysUpTime in hundredths of a second.
    pub fn sys_uptime(&self) -> u32 {
        (self.started.elapsed().as_millis() / 10) as u32
    }

    /// Bound UDP addresses in master mode; empty otherwise.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        match &self.transport {
            Transport::Master(listener) => listener.local_addrs(),
            _ => Vec::new(),
        }
    }

    pub fn agentx_session(&self) -> Option<&AgentxSession> {
        match &self.transport {
            Transport::Subagent(session) => Some(session),
            _ => None,
        }
    }

    /// Shuts the modules down, then closes the AgentX session or the
    /// listening sockets.
    pub async fn shutdown(mut self) {
        self.registry.shutdown().await;

        match std::mem::replace(&mut self.transport, Transport::Stopped) {
            Transport::Subagent(mut session) => session.close(CloseReason::Shutdown).await,
            Transport::Master(mut listener) => listener.close(),
            Transport::Stopped => {}
        }
        tracing::info!("{} stopped", self.name);
    }
}

#[async_trait]
impl RequestProcessor for Agent {
    async fn check_and_process(&mut self, shutdown: &mut Shutdown) -> Result<()> {
        let sys_uptime = self.sys_uptime();
        match &mut self.transport {
            Transport::Subagent(session) => {
                session.process_one(&self.registry, shutdown, sys_uptime).await
            }
            Transport::Master(listener) => listener.process_one(&self.registry, shutdown).await,
            Transport::Stopped => Err(AgentError::protocol("agent has not been started")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::inventory::InventorySource;
    use crate::core::guest_table::{GuestTable, DEFAULT_CACHE_TIMEOUT};

    fn settings(role: AgentRole) -> AgentSettings {
        AgentSettings {
            role,
            agentx_address: AgentxAddress::Unix("/nonexistent/agentx/master".into()),
            listen_addresses: vec![ListenAddress::parse("udp:127.0.0.1:0").unwrap()],
            session: SessionSettings::default(),
            community: "public".to_string(),
        }
    }

    #[tokio::test]
    async fn test_subagent_starts_without_master() {
        let mut agent = Agent::new("test", settings(AgentRole::Subagent));
        let source = Arc::new(InventorySource::from_guests(Vec::new()));
        agent.register(Arc::new(GuestTable::new(source, DEFAULT_CACHE_TIMEOUT)));

        agent.start().await.unwrap();
        let session = agent.agentx_session().unwrap();
        assert!(!session.is_connected());
        // Later reconnect failures stay at debug level.
        assert!(session.reported_unreachable());
        agent.shutdown().await;
    }

    #[tokio::test]
    async fn test_master_binds_listen_addresses() {
        let mut agent = Agent::new("test", settings(AgentRole::Master));
        agent.start().await.unwrap();

        let addrs = agent.local_addrs();
        assert_eq!(addrs.len(), 1);
        assert_ne!(addrs[0].port(), 0);
        agent.shutdown().await;
    }

    #[tokio::test]
    async fn test_unstarted_agent_refuses_work() {
        let mut agent = Agent::new("test", settings(AgentRole::Subagent));
        let (_trigger, mut shutdown) = crate::core::shutdown::channel();
        assert!(agent.check_and_process(&mut shutdown).await.is_err());
    }
}
