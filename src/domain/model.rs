use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// An SNMP object identifier. Ordering is lexicographic over sub-identifiers,
/// which is the order GetNext walks.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Oid(Vec<u32>);

impl Oid {
    pub fn new(subids: Vec<u32>) -> Self {
        Self(subids)
    }

    pub fn from_slice(subids: &[u32]) -> Self {
        Self(subids.to_vec())
    }

    pub fn as_slice(&self) -> &[u32] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn starts_with(&self, prefix: &Oid) -> bool {
        self.0.starts_with(&prefix.0)
    }

    /// Returns a new OID with `suffix` appended.
    pub fn child(&self, suffix: &[u32]) -> Oid {
        let mut subids = Vec::with_capacity(self.0.len() + suffix.len());
        subids.extend_from_slice(&self.0);
        subids.extend_from_slice(suffix);
        Oid(subids)
    }
}

impl From<Vec<u32>> for Oid {
    fn from(subids: Vec<u32>) -> Self {
        Self(subids)
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for subid in &self.0 {
            if !first {
                f.write_str(".")?;
            }
            write!(f, "{}", subid)?;
            first = false;
        }
        Ok(())
    }
}

impl FromStr for Oid {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let trimmed = s.trim().trim_start_matches('.');
        if trimmed.is_empty() {
            return Ok(Oid::default());
        }
        trimmed
            .split('.')
            .map(|part| {
                part.parse::<u32>()
                    .map_err(|_| format!("invalid sub-identifier '{}' in OID '{}'", part, s))
            })
            .collect::<std::result::Result<Vec<_>, _>>()
            .map(Oid)
    }
}

/// SMIv2 values plus the three SNMPv2 exception markers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Integer(i32),
    OctetString(Vec<u8>),
    Null,
    ObjectIdentifier(Oid),
    IpAddress([u8; 4]),
    Counter32(u32),
    Gauge32(u32),
    TimeTicks(u32),
    Opaque(Vec<u8>),
    Counter64(u64),
    NoSuchObject,
    NoSuchInstance,
    EndOfMibView,
}

impl Value {
    pub fn is_exception(&self) -> bool {
        matches!(
            self,
            Value::NoSuchObject | Value::NoSuchInstance | Value::EndOfMibView
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VarBind {
    pub oid: Oid,
    pub value: Value,
}

impl VarBind {
    pub fn new(oid: Oid, value: Value) -> Self {
        Self { oid, value }
    }
}

/// A GetNext search window. `end` is exclusive; `None` means unbounded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRange {
    pub start: Oid,
    pub include: bool,
    pub end: Option<Oid>,
}

impl SearchRange {
    pub fn after(start: Oid) -> Self {
        Self {
            start,
            include: false,
            end: None,
        }
    }

    pub fn contains(&self, oid: &Oid) -> bool {
        let lower = if self.include {
            *oid >= self.start
        } else {
            *oid > self.start
        };
        lower && self.end.as_ref().map_or(true, |end| oid < end)
    }
}

/// Guest run state, numbered as the hypervisor numbers its domain states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuestState {
    #[default]
    NoState = 0,
    Running = 1,
    Blocked = 2,
    Paused = 3,
    Shutdown = 4,
    Shutoff = 5,
    Crashed = 6,
    PmSuspended = 7,
}

impl GuestState {
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// Maps the state strings printed by `virsh dominfo`.
    pub fn from_virsh(state: &str) -> Self {
        match state.trim() {
            "running" => GuestState::Running,
            "idle" | "blocked" => GuestState::Blocked,
            "paused" => GuestState::Paused,
            "in shutdown" => GuestState::Shutdown,
            "shut off" => GuestState::Shutoff,
            "crashed" => GuestState::Crashed,
            "pmsuspended" => GuestState::PmSuspended,
            _ => GuestState::NoState,
        }
    }
}

/// One row of libvirtGuestTable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Guest {
    pub uuid: Uuid,
    pub name: String,
    #[serde(default)]
    pub state: GuestState,
    #[serde(default)]
    pub cpu_count: u32,
    #[serde(default)]
    pub memory_current_kib: u64,
    #[serde(default)]
    pub memory_limit_kib: u64,
    #[serde(default)]
    pub cpu_time_ns: u64,
}
