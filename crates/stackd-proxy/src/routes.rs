//! Route table with copy-on-write snapshots.
//!
//! The [`RouteTable`] is the only writer. Listener tasks hold
//! [`RouteReader`]s and always observe a complete [`RouteSnapshot`]; an
//! update builds a new snapshot and swaps it in through a `watch` channel.

use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use stackd_core::DescriptorStore;
use tokio::sync::watch;
use tracing::info;

use crate::error::{ProxyError, Result};

/// Static part of a route: one external port, one target service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteEntry {
    pub listen_port: u16,
    pub tls: bool,
    pub service: String,
    /// Internal address requests are forwarded to.
    pub target: SocketAddr,
    pub upgrade: bool,
}

/// Whether a route currently accepts traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteState {
    Unrouted,
    Routed,
}

impl fmt::Display for RouteState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unrouted => f.write_str("unrouted"),
            Self::Routed => f.write_str("routed"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RouteSlot {
    pub entry: RouteEntry,
    pub state: RouteState,
}

/// Immutable view of every route at one point in time.
#[derive(Debug, Clone, Default)]
pub struct RouteSnapshot {
    version: u64,
    slots: BTreeMap<u16, RouteSlot>,
}

impl RouteSnapshot {
    pub const fn version(&self) -> u64 {
        self.version
    }

    pub fn get(&self, listen_port: u16) -> Option<&RouteSlot> {
        self.slots.get(&listen_port)
    }

    /// The entry for `listen_port`, only if it is currently routed.
    pub fn routed(&self, listen_port: u16) -> Option<&RouteEntry> {
        self.slots
            .get(&listen_port)
            .filter(|slot| slot.state == RouteState::Routed)
            .map(|slot| &slot.entry)
    }

    pub fn slots(&self) -> impl Iterator<Item = &RouteSlot> {
        self.slots.values()
    }
}

/// Single writer over the route snapshots.
#[derive(Debug)]
pub struct RouteTable {
    tx: watch::Sender<Arc<RouteSnapshot>>,
}

impl RouteTable {
    /// Build a table with every entry `Unrouted`.
    pub fn new(entries: Vec<RouteEntry>) -> Result<Self> {
        let mut slots: BTreeMap<u16, RouteSlot> = BTreeMap::new();
        for entry in entries {
            if let Some(existing) = slots.get(&entry.listen_port) {
                return Err(ProxyError::DuplicatePort {
                    port: entry.listen_port,
                    first: existing.entry.service.clone(),
                    second: entry.service,
                });
            }
            slots.insert(
                entry.listen_port,
                RouteSlot {
                    entry,
                    state: RouteState::Unrouted,
                },
            );
        }
        let (tx, _rx) = watch::channel(Arc::new(RouteSnapshot { version: 0, slots }));
        Ok(Self { tx })
    }

    /// Derive entries from the descriptors that declare a route. Targets are
    /// reached on loopback.
    pub fn from_store(store: &DescriptorStore) -> Result<Self> {
        Self::from_store_with_host(store, IpAddr::V4(Ipv4Addr::LOCALHOST))
    }

    pub fn from_store_with_host(store: &DescriptorStore, upstream_host: IpAddr) -> Result<Self> {
        let entries = store
            .routed()
            .map(|(desc, route)| RouteEntry {
                listen_port: route.listen_port,
                tls: route.tls,
                service: desc.name.clone(),
                target: SocketAddr::new(upstream_host, route.target_port),
                upgrade: route.upgrade,
            })
            .collect();
        Self::new(entries)
    }

    pub fn reader(&self) -> RouteReader {
        RouteReader {
            rx: self.tx.subscribe(),
        }
    }

    pub fn snapshot(&self) -> Arc<RouteSnapshot> {
        self.tx.borrow().clone()
    }

    /// Flip every route targeting `service`. Returns whether anything changed.
    pub fn set_ready(&self, service: &str, ready: bool) -> bool {
        let state = if ready {
            RouteState::Routed
        } else {
            RouteState::Unrouted
        };
        self.tx.send_if_modified(|current| {
            let touched: Vec<u16> = current
                .slots
                .iter()
                .filter(|(_, slot)| slot.entry.service == service && slot.state != state)
                .map(|(port, _)| *port)
                .collect();
            if touched.is_empty() {
                return false;
            }
            let mut next = RouteSnapshot::clone(current);
            next.version += 1;
            for port in &touched {
                if let Some(slot) = next.slots.get_mut(port) {
                    slot.state = state;
                }
                info!(service, port, state = %state, "Route updated");
            }
            *current = Arc::new(next);
            true
        })
    }

    /// Mark every route unrouted, used during shutdown.
    pub fn unroute_all(&self) {
        self.tx.send_if_modified(|current| {
            if current.slots.values().all(|s| s.state == RouteState::Unrouted) {
                return false;
            }
            let mut next = RouteSnapshot::clone(current);
            next.version += 1;
            for slot in next.slots.values_mut() {
                slot.state = RouteState::Unrouted;
            }
            *current = Arc::new(next);
            true
        });
    }
}

/// Read handle for listener tasks.
#[derive(Debug, Clone)]
pub struct RouteReader {
    rx: watch::Receiver<Arc<RouteSnapshot>>,
}

impl RouteReader {
    pub fn current(&self) -> Arc<RouteSnapshot> {
        self.rx.borrow().clone()
    }

    /// Wait for the next published snapshot. Returns `false` once the table
    /// has been dropped.
    pub async fn changed(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }
}
