// Domain layer: SNMP value model, guest rows, and the ports the agent core depends on.

pub mod model;
pub mod ports;
