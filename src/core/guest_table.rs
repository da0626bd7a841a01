//! The `libvirtGuestTable` MIB module.
//!
//! One row per guest, indexed by the 16-byte guest UUID encoded as sixteen
//! sub-identifiers (fixed-length string, no length prefix).

use crate::domain::model::{Guest, Oid, Value, VarBind};
use crate::domain::ports::{Directive, GuestSource, MibModule};
use crate::utils::error::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use uuid::Uuid;

/// enterprises.12345.1.1
pub const LIBVIRT_GUEST_TABLE_OID: &[u32] = &[1, 3, 6, 1, 4, 1, 12345, 1, 1];

pub const COLUMN_UUID: u32 = 1;
pub const COLUMN_NAME: u32 = 2;
pub const COLUMN_STATE: u32 = 3;
pub const COLUMN_CPU_COUNT: u32 = 4;
pub const COLUMN_MEMORY_CURRENT: u32 = 5;
pub const COLUMN_MEMORY_LIMIT: u32 = 6;
pub const COLUMN_CPU_TIME: u32 = 7;
pub const COLUMN_ROW_STATUS: u32 = 8;

const FIRST_ACCESSIBLE_COLUMN: u32 = COLUMN_NAME;
const LAST_COLUMN: u32 = COLUMN_ROW_STATUS;

const ROW_STATUS_ACTIVE: i32 = 1;

pub const DEFAULT_CACHE_TIMEOUT: Duration = Duration::from_secs(5);

struct Snapshot {
    taken: Instant,
    rows: BTreeMap<Uuid, Guest>,
}

pub struct GuestTable {
    subtree: Oid,
    entry: Oid,
    source: Arc<dyn GuestSource>,
    cache_timeout: Duration,
    snapshot: Mutex<Option<Snapshot>>,
}

impl GuestTable {
    pub fn new(source: Arc<dyn GuestSource>, cache_timeout: Duration) -> Self {
        let subtree = Oid::from_slice(LIBVIRT_GUEST_TABLE_OID);
        let entry = subtree.child(&[1]);
        Self {
            subtree,
            entry,
            source,
            cache_timeout,
            snapshot: Mutex::new(None),
        }
    }

    /// Instance OID of `column` for the row indexed by `uuid`.
    pub fn instance_oid(&self, column: u32, uuid: &Uuid) -> Oid {
        let mut suffix = Vec::with_capacity(17);
        suffix.push(column);
        suffix.extend(uuid.as_bytes().iter().map(|b| u32::from(*b)));
        self.entry.child(&suffix)
    }

    pub async fn row_count(&self) -> usize {
        self.with_rows(|rows| rows.len()).await
    }

    async fn with_rows<T>(&self, f: impl FnOnce(&BTreeMap<Uuid, Guest>) -> T) -> T {
        let mut guard = self.snapshot.lock().await;
        let stale = guard
            .as_ref()
            .map_or(true, |s| s.taken.elapsed() >= self.cache_timeout);

        if stale {
            match self.source.list_guests().await {
                Ok(guests) => {
                    tracing::debug!(
                        target: "libvirtGuestTable",
                        "refreshed {} guests from {}",
                        guests.len(),
                        self.source.describe()
                    );
                    let rows = guests.into_iter().map(|g| (g.uuid, g)).collect();
                    *guard = Some(Snapshot {
                        taken: Instant::now(),
                        rows,
                    });
                }
                Err(e) => {
                    tracing::warn!("guest refresh from {} failed: {}", self.source.describe(), e);
                    // Keep serving the previous snapshot; retry after another timeout.
                    if let Some(snapshot) = guard.as_mut() {
                        snapshot.taken = Instant::now();
                    } else {
                        *guard = Some(Snapshot {
                            taken: Instant::now(),
                            rows: BTreeMap::new(),
                        });
                    }
                }
            }
        }

        match guard.as_ref() {
            Some(snapshot) => f(&snapshot.rows),
            None => f(&BTreeMap::new()),
        }
    }

    /// Splits an instance OID into (column, uuid). `Err` carries the
    /// exception to report.
    fn parse_instance(&self, oid: &Oid) -> std::result::Result<(u32, Uuid), Value> {
        let rest = oid
            .as_slice()
            .strip_prefix(self.entry.as_slice())
            .ok_or(Value::NoSuchObject)?;

        let (&column, index) = rest.split_first().ok_or(Value::NoSuchObject)?;
        if !(FIRST_ACCESSIBLE_COLUMN..=LAST_COLUMN).contains(&column) {
            return Err(Value::NoSuchObject);
        }
        if index.len() != 16 {
            return Err(Value::NoSuchInstance);
        }
        let mut bytes = [0u8; 16];
        for (dst, &subid) in bytes.iter_mut().zip(index) {
            *dst = u8::try_from(subid).map_err(|_| Value::NoSuchInstance)?;
        }
        Ok((column, Uuid::from_bytes(bytes)))
    }

    /// Where a GetNext from `oid` starts: the first column to look at and
    /// the row bound inside it. `None` when `oid` is past the table.
    fn seek(&self, oid: &Oid, include: bool) -> Option<(u32, Bound<Uuid>)> {
        let Some(rest) = oid.as_slice().strip_prefix(self.entry.as_slice()) else {
            return (*oid < self.entry).then_some((FIRST_ACCESSIBLE_COLUMN, Bound::Unbounded));
        };
        match rest.split_first() {
            None => Some((FIRST_ACCESSIBLE_COLUMN, Bound::Unbounded)),
            Some((&column, _)) if column < FIRST_ACCESSIBLE_COLUMN => {
                Some((FIRST_ACCESSIBLE_COLUMN, Bound::Unbounded))
            }
            Some((&column, _)) if column > LAST_COLUMN => None,
            Some((&column, index)) => Some((column, row_bound(index, include))),
        }
    }
}

/// Lower bound on the row index for a GetNext starting at `index`, compared
/// sub-identifier by sub-identifier the way the instance OIDs sort.
fn row_bound(index: &[u32], include: bool) -> Bound<Uuid> {
    let mut bytes = [0u8; 16];
    for (i, &subid) in index.iter().take(16).enumerate() {
        match u8::try_from(subid) {
            Ok(b) => bytes[i] = b,
            Err(_) => {
                // Every row sharing the first `i` bytes sorts before `index`.
                bytes[i..].fill(u8::MAX);
                return Bound::Excluded(Uuid::from_bytes(bytes));
            }
        }
    }
    match index.len() {
        // Zero padding is the smallest row with this prefix, and it already
        // sorts after the shorter `index`.
        n if n < 16 => Bound::Included(Uuid::from_bytes(bytes)),
        16 if include => Bound::Included(Uuid::from_bytes(bytes)),
        _ => Bound::Excluded(Uuid::from_bytes(bytes)),
    }
}

/// Value of `column` for `guest`.
pub fn column_value(column: u32, guest: &Guest) -> Option<Value> {
    let mib = |kib: u64| u32::try_from(kib / 1024).unwrap_or(u32::MAX);
    let value = match column {
        COLUMN_NAME => Value::OctetString(guest.name.as_bytes().to_vec()),
        COLUMN_STATE => Value::Integer(guest.state.as_i32()),
        COLUMN_CPU_COUNT => Value::Gauge32(guest.cpu_count),
        COLUMN_MEMORY_CURRENT => Value::Gauge32(mib(guest.memory_current_kib)),
        COLUMN_MEMORY_LIMIT => Value::Gauge32(mib(guest.memory_limit_kib)),
        COLUMN_CPU_TIME => Value::Counter64(guest.cpu_time_ns),
        COLUMN_ROW_STATUS => Value::Integer(ROW_STATUS_ACTIVE),
        _ => return None,
    };
    Some(value)
}

#[async_trait]
impl MibModule for GuestTable {
    fn name(&self) -> &str {
        "libvirtGuestTable"
    }

    fn subtree(&self) -> &Oid {
        &self.subtree
    }

    fn directives(&self) -> Vec<Directive> {
        vec![
            Directive {
                name: "libvirt.source",
                usage: "virsh|inventory",
            },
            Directive {
                name: "libvirt.uri",
                usage: "URI (hypervisor connection, default qemu:///system)",
            },
            Directive {
                name: "libvirt.virsh_path",
                usage: "PATH",
            },
            Directive {
                name: "libvirt.inventory_path",
                usage: "FILE (.toml or .json guest list)",
            },
            Directive {
                name: "libvirt.cache_timeout",
                usage: "SECONDS",
            },
            Directive {
                name: "libvirt.command_timeout",
                usage: "SECONDS",
            },
        ]
    }

    async fn init(&self) -> Result<()> {
        if let Err(e) = self.source.probe().await {
            tracing::warn!(
                "guest source {} is not usable yet: {}",
                self.source.describe(),
                e
            );
        }
        let rows = self.row_count().await;
        tracing::info!(
            "libvirtGuestTable registered at {} with {} guests",
            self.subtree,
            rows
        );
        Ok(())
    }

    async fn get(&self, oid: &Oid) -> Value {
        let (column, uuid) = match self.parse_instance(oid) {
            Ok(parsed) => parsed,
            Err(exception) => return exception,
        };
        self.with_rows(|rows| {
            rows.get(&uuid)
                .and_then(|guest| column_value(column, guest))
                .unwrap_or(Value::NoSuchInstance)
        })
        .await
    }

    async fn get_next(&self, oid: &Oid, include: bool) -> Option<VarBind> {
        let (first_column, lower) = self.seek(oid, include)?;
        self.with_rows(|rows| {
            let mut bound = lower;
            for column in first_column..=LAST_COLUMN {
                if let Some((uuid, guest)) = rows.range((bound, Bound::Unbounded)).next() {
                    let value = column_value(column, guest)?;
                    return Some(VarBind::new(self.instance_oid(column, uuid), value));
                }
                bound = Bound::Unbounded;
            }
            None
        })
        .await
    }

    async fn shutdown(&self) {
        self.snapshot.lock().await.take();
        tracing::debug!(target: "libvirtGuestTable", "guest table shut down");
    }
}
