//! The Packet Forwarding Table: a pure (destination address, qos-id) to
//! next-hop port-ids lookup, per §4.1.
//!
//! No relaying or routing-protocol logic lives here; the PFT only answers
//! `nhop`, and it is somebody else's (a routing protocol, out of scope per
//! §1) job to keep it populated.
#![deny(missing_docs)]
#![deny(warnings)]
use addr::{Address, PortId, QosId};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};

/// The packet forwarding table.
///
/// Reads (`nhop`) are expected to vastly outnumber writes (`add`/`remove`),
/// so the table is guarded by a reader-writer lock rather than the spinlock
/// style used for the hot per-connection state vectors elsewhere in the
/// core; lookups here do not touch any other component's lock, so there is
/// no cross-lock ordering to preserve.
#[derive(Default)]
pub struct Pft {
    table: RwLock<HashMap<(Address, QosId), HashSet<PortId>>>,
}

impl Pft {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the next-hop set for `(dest, qos)` with `ports`.
    pub fn add(&self, dest: Address, qos: QosId, ports: impl IntoIterator<Item = PortId>) {
        let set: HashSet<PortId> = ports.into_iter().collect();
        self.table.write().insert((dest, qos), set);
    }

    /// Removes `ports` from the next-hop set for `(dest, qos)`.
    ///
    /// Only the named ports are removed; other next hops for the same
    /// destination/qos are left in place. Removing the last port leaves an
    /// empty (but present) entry, which `nhop` reports the same as an
    /// entirely unknown destination.
    pub fn remove(&self, dest: Address, qos: QosId, ports: &[PortId]) {
        let mut table = self.table.write();
        if let Some(set) = table.get_mut(&(dest, qos)) {
            for port in ports {
                set.remove(port);
            }
        }
    }

    /// Returns the next-hop port-ids for `(dest, qos)`, or an empty vec if
    /// unknown.
    pub fn nhop(&self, dest: Address, qos: QosId) -> Vec<PortId> {
        self.table
            .read()
            .get(&(dest, qos))
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Dumps every entry in the table, for diagnostics and tests.
    pub fn dump(&self) -> Vec<(Address, QosId, Vec<PortId>)> {
        self.table
            .read()
            .iter()
            .map(|(&(addr, qos), ports)| (addr, qos, ports.iter().copied().collect()))
            .collect()
    }
}
