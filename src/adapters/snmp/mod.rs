pub mod ber;
pub mod master;
pub mod message;

pub use master::{ListenAddress, MasterListener};
