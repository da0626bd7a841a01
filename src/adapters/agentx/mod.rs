pub mod pdu;
pub mod session;

pub use session::{AgentxAddress, AgentxSession, SessionSettings};
