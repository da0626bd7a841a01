pub mod agent;
pub mod engine;
pub mod guest_table;
pub mod registry;
pub mod shutdown;

pub use crate::domain::ports::{Directive, GuestSource, MibModule, RequestProcessor};
pub use crate::utils::error::Result;
