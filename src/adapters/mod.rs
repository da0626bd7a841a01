// Adapters layer: wire protocols and hypervisor data sources.

pub mod agentx;
pub mod inventory;
pub mod snmp;
pub mod virsh;
