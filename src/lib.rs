//! The `Dif` facade (§2): wires the packet forwarding table, the relaying
//! and multiplexing task, the EFCP connection registry, and the kernel flow
//! allocator into the one object graph an external control plane (a KIPCM,
//! out of scope per §1) drives for a single DIF node.
#![deny(missing_docs)]
#![deny(warnings)]
use addr::{Address, PortId, QosId};
use bytes::Bytes;
use efcp::Container;
use kfa::Kfa;
use log::debug;
use pft::Pft;
use rmt::{Rmt, RmtError, Shim};
use std::sync::Arc;

/// One node's data-transfer-plane state, generic over the N-1 transport
/// shim `S` that RMT's egress worker drives.
pub struct Dif<S> {
    /// Packet forwarding table.
    pub pft: Arc<Pft>,
    /// Relaying and multiplexing task, bound to `shim`.
    pub rmt: Arc<Rmt<S>>,
    /// EFCP connection registry.
    pub efcp: Arc<Container>,
    /// Kernel flow allocator backing every connection's SDU queues.
    pub kfa: Arc<Kfa>,
}

impl<S: Shim + 'static> Dif<S> {
    /// Assembles a DIF node at `local_addr` over `shim`, binding the EFCP
    /// container as RMT's local-delivery target so inbound PDUs addressed
    /// to this node route straight to their connection.
    pub fn new(local_addr: Address, shim: Arc<S>) -> Self {
        let pft = Arc::new(Pft::new());
        let rmt = Rmt::new(shim, pft.clone());
        rmt.address_set(local_addr);
        let kfa = Arc::new(Kfa::new());
        let efcp = Container::new(local_addr, rmt.clone(), kfa.clone());
        rmt.bind_local(efcp.clone());
        Self { pft, rmt, efcp, kfa }
    }

    /// Binds N-1 port `port` so RMT can enqueue onto and read from it.
    pub fn bind_port(&self, port: PortId) {
        debug!("binding port {}", port);
        self.rmt.bind(port);
    }

    /// Releases N-1 port `port`'s queues.
    pub fn unbind_port(&self, port: PortId) {
        debug!("unbinding port {}", port);
        self.rmt.unbind(port);
    }

    /// Installs a PFT next-hop-set entry for `(dest, qos)`.
    pub fn add_route(&self, dest: Address, qos: QosId, ports: impl IntoIterator<Item = PortId>) {
        self.pft.add(dest, qos, ports);
        debug!("route installed for {} qos {}", dest, qos);
    }

    /// Hands an inbound SDU arriving on `port` from the shim to RMT's
    /// ingress path.
    pub fn ingress(&self, port: PortId, sdu: Bytes) -> Result<(), RmtError> {
        self.rmt.receive(port, sdu)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct LoopbackShim {
        written: StdMutex<Vec<(PortId, Bytes)>>,
    }

    impl Shim for LoopbackShim {
        fn sdu_write(&self, port: PortId, sdu: Bytes) -> io::Result<()> {
            self.written.lock().unwrap().push((port, sdu));
            Ok(())
        }
    }

    #[test]
    fn new_wires_efcp_as_rmts_local_delivery_target() {
        let shim = Arc::new(LoopbackShim::default());
        let dif = Dif::new(Address(1), shim);
        dif.add_route(Address(2), QosId(0), vec![PortId(7)]);
        assert_eq!(dif.pft.nhop(Address(2), QosId(0)), vec![PortId(7)]);
        assert_eq!(dif.rmt.address(), Some(Address(1)));
    }
}
