use crate::domain::model::{Guest, Oid, Value, VarBind};
use crate::utils::error::Result;
use async_trait::async_trait;

/// Where guest inventory comes from.
#[async_trait]
pub trait GuestSource: Send + Sync {
    /// Short name used in logs.
    fn describe(&self) -> String;

    /// Checks the source is usable (binary present, file readable, ...).
    async fn probe(&self) -> Result<()>;

    async fn list_guests(&self) -> Result<Vec<Guest>>;
}

/// A configuration directive a component understands, as listed by `-H`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directive {
    pub name: &'static str,
    pub usage: &'static str,
}

/// A MIB module serving one registered subtree.
#[async_trait]
pub trait MibModule: Send + Sync {
    fn name(&self) -> &str;

    /// Root of the subtree this module answers for.
    fn subtree(&self) -> &Oid;

    /// Configuration directives this module registers.
    fn directives(&self) -> Vec<Directive> {
        Vec::new()
    }

    async fn init(&self) -> Result<()>;

    /// Exact lookup. Misses are `NoSuchObject` or `NoSuchInstance`.
    async fn get(&self, oid: &Oid) -> Value;

    /// First instance in this subtree after `oid` (or at `oid` when
    /// `include` is set).
    async fn get_next(&self, oid: &Oid, include: bool) -> Option<VarBind>;

    async fn shutdown(&self);
}

/// One pass of the agent's request loop.
#[async_trait]
pub trait RequestProcessor: Send {
    /// Waits for and handles at most one unit of work. Returns early once
    /// `shutdown` fires.
    async fn check_and_process(&mut self, shutdown: &mut crate::core::shutdown::Shutdown)
        -> Result<()>;
}
