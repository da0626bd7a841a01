pub mod daemon;
pub mod error;
pub mod logger;
pub mod validation;
