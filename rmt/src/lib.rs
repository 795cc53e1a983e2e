//! The Relaying and Multiplexing Task (§4.2).
//!
//! Multiplexes PDUs from many connections onto bound N-1 ports,
//! demultiplexes inbound PDUs by destination address to either local
//! delivery or further forwarding, and isolates the I/O path from the EFCP
//! fast path via the single-runner worker pool in [`queue`].
#![deny(missing_docs)]
#![deny(warnings)]
mod queue;
pub mod shim;

pub use queue::{PushError, Queues, DEFAULT_CAPACITY};
pub use shim::Shim;

use addr::{Address, PortId, QosId};
use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender};
use log::{error, warn};
use parking_lot::Mutex;
use pci::Pdu;
use pft::Pft;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors raised at the RMT boundary (§7).
#[derive(Debug, Error)]
pub enum RmtError {
    /// Backpressure: the PFT has no next hop for `(dest, qos)`.
    #[error("no route to address {0} qos {1}")]
    NoRoute(Address, QosId),
    /// Parameter: no queue bound to this port.
    #[error("no queue bound to port {0}")]
    NoSuchPort(PortId),
    /// Backpressure: a bound port's egress queue is full.
    #[error("egress queue full for port {0}")]
    EgressFull(PortId),
    /// Backpressure: a bound port's ingress queue is full.
    #[error("ingress queue full for port {0}")]
    IngressFull(PortId),
}

/// Narrow send capability handed to DTP/DTCP so neither needs to know the
/// concrete shim type a given RMT is parameterized over (§9: resolve
/// cross-component references through a handle, not an embedded owning
/// reference in both directions).
pub trait RmtSend: Send + Sync {
    /// PFT-routed send, as [`Rmt::send`].
    fn send(&self, dest: Address, qos: QosId, pdu: Pdu) -> Result<(), RmtError>;
}

/// Receiver side of local delivery: whatever owns the EFCP container
/// implements this so RMT can hand it PDUs addressed to this node without
/// depending on the `efcp` crate.
pub trait LocalDelivery: Send + Sync {
    /// Delivers a PDU whose destination address matches this node.
    fn deliver(&self, pdu: Pdu);
}

/// A management SDU paired with the port it arrived on.
pub struct SduWithPort {
    /// The port the SDU arrived on.
    pub port: PortId,
    /// The raw SDU bytes (payload only, PCI stripped).
    pub sdu: Bytes,
}

const MGMT_CHANNEL_CAPACITY: usize = 256;

/// The Relaying and Multiplexing Task.
///
/// Generic over the shim trait so the core never depends on a concrete
/// transport; `S` is typically a zero-sized marker or a thin wrapper around
/// a socket owned elsewhere.
pub struct Rmt<S> {
    address: Mutex<Option<Address>>,
    pft: Arc<Pft>,
    shim: Arc<S>,
    egress: Arc<Queues<Pdu>>,
    ingress: Arc<Queues<Bytes>>,
    local: Mutex<Option<Arc<dyn LocalDelivery>>>,
    mgmt_tx: Sender<SduWithPort>,
    mgmt_rx: Receiver<SduWithPort>,
    malformed_dropped: AtomicU64,
    no_route_dropped: AtomicU64,
}

impl<S: Shim + 'static> Rmt<S> {
    /// Creates an RMT bound to no ports yet, wrapping `shim` and `pft`.
    pub fn new(shim: Arc<S>, pft: Arc<Pft>) -> Arc<Self> {
        let (mgmt_tx, mgmt_rx) = crossbeam_channel::bounded(MGMT_CHANNEL_CAPACITY);
        Arc::new(Self {
            address: Mutex::new(None),
            pft,
            shim,
            egress: Arc::new(Queues::default()),
            ingress: Arc::new(Queues::default()),
            local: Mutex::new(None),
            mgmt_tx,
            mgmt_rx,
            malformed_dropped: AtomicU64::new(0),
            no_route_dropped: AtomicU64::new(0),
        })
    }

    /// Installs the local-delivery target for PDUs addressed to this node.
    /// Idempotent only from unset, mirroring `address_set`.
    pub fn bind_local(&self, local: Arc<dyn LocalDelivery>) {
        let mut guard = self.local.lock();
        if guard.is_none() {
            *guard = Some(local);
        }
    }

    /// Sets this node's address. Idempotent only from "unset" to a valid
    /// address (§4.2).
    pub fn address_set(&self, addr: Address) {
        let mut guard = self.address.lock();
        if guard.is_none() {
            *guard = Some(addr);
        }
    }

    /// Returns this node's configured address, if any.
    pub fn address(&self) -> Option<Address> {
        *self.address.lock()
    }

    /// Allocates per-port ingress/egress queues for `port`.
    pub fn bind(&self, port: PortId) {
        self.egress.bind(port);
        self.ingress.bind(port);
    }

    /// Releases `port`'s queues and notifies the shim.
    pub fn unbind(&self, port: PortId) {
        self.egress.unbind(port);
        self.ingress.unbind(port);
        self.shim.flow_deallocate(port);
    }

    /// Looks up next hops for `(dest, qos)` via the PFT and enqueues `pdu`
    /// (duplicated per next hop) on each next hop's egress queue, arming
    /// the egress worker.
    ///
    /// Best-effort fan-out (§4.2): a per-port enqueue failure is logged,
    /// not propagated, as long as the PFT lookup itself produced at least
    /// one next hop. An empty lookup is itself the failure and destroys
    /// the PDU.
    pub fn send(&self, dest: Address, qos: QosId, pdu: Pdu) -> Result<(), RmtError> {
        let ports = self.pft.nhop(dest, qos);
        if ports.is_empty() {
            self.no_route_dropped.fetch_add(1, Ordering::Relaxed);
            error!("no route to {} qos {}, dropping pdu", dest, qos);
            return Err(RmtError::NoRoute(dest, qos));
        }
        for port in ports {
            if let Err(e) = self.send_port_id(port, pdu.clone()) {
                warn!("egress enqueue failed for port {}: {:?}", port, e);
            }
        }
        Ok(())
    }

    /// Direct enqueue onto `port`'s egress queue, bypassing the PFT lookup.
    /// Used internally by [`Rmt::send`]'s per-port fan-out, and by
    /// callers (e.g. `mgmt_write`) that already know the destination port.
    pub fn send_port_id(&self, port: PortId, pdu: Pdu) -> Result<(), RmtError> {
        match self.egress.push(port, pdu) {
            Ok(()) => {
                self.arm_egress();
                Ok(())
            }
            Err(PushError::NoSuchPort) => Err(RmtError::NoSuchPort(port)),
            Err(PushError::QueueFull) => Err(RmtError::EgressFull(port)),
        }
    }

    fn arm_egress(&self) {
        let shim = self.shim.clone();
        self.egress.arm_worker(move |port, pdu: Pdu| {
            let wire = pdu.encode();
            if let Err(e) = shim.sdu_write(port, wire) {
                warn!("shim sdu_write failed on port {}: {}", port, e);
            }
        });
    }

    /// Enqueues an inbound SDU arriving on `port` from the shim, arming the
    /// ingress worker to decode and route it.
    pub fn receive(self: &Arc<Self>, port: PortId, sdu: Bytes) -> Result<(), RmtError> {
        match self.ingress.push(port, sdu) {
            Ok(()) => {
                self.arm_ingress();
                Ok(())
            }
            Err(PushError::NoSuchPort) => Err(RmtError::NoSuchPort(port)),
            Err(PushError::QueueFull) => Err(RmtError::IngressFull(port)),
        }
    }

    fn arm_ingress(self: &Arc<Self>) {
        let rmt = self.clone();
        self.ingress.arm_worker(move |port, sdu: Bytes| {
            rmt.process_ingress(port, sdu);
        });
    }

    /// Ingress dispatch (§4.2): MGMT goes to the management-SDU channel; a
    /// DT/control PDU addressed to this node goes to local delivery;
    /// anything else is forwarded via another PFT lookup. Malformed PDUs
    /// (bad type, missing PCI, bad dest) are dropped and counted.
    fn process_ingress(&self, port: PortId, sdu: Bytes) {
        let pdu = match Pdu::decode(&sdu) {
            Ok(pdu) => pdu,
            Err(e) => {
                self.malformed_dropped.fetch_add(1, Ordering::Relaxed);
                warn!("dropping malformed pdu on port {}: {}", port, e);
                return;
            }
        };
        if pdu.pci.pdu_type.is_mgmt() {
            let item = SduWithPort {
                port,
                sdu: pdu.payload,
            };
            if self.mgmt_tx.try_send(item).is_err() {
                warn!("mgmt channel full, dropping mgmt sdu from port {}", port);
            }
            return;
        }
        match self.address() {
            Some(addr) if pdu.pci.dst_addr == addr => match self.local.lock().clone() {
                Some(local) => local.deliver(pdu),
                None => warn!("no local delivery target installed, dropping pdu"),
            },
            _ => {
                let dest = pdu.pci.dst_addr;
                let qos = pdu.pci.qos_id;
                if let Err(e) = self.send(dest, qos, pdu) {
                    warn!("forwarding to {} failed: {}", dest, e);
                }
            }
        }
    }

    /// Blocks up to `timeout` for the next management SDU from any bound
    /// port. Used by the control plane's `mgmt_sdu_read` (§4.3, §6).
    pub fn mgmt_sdu_read(&self, timeout: Duration) -> Option<SduWithPort> {
        self.mgmt_rx.recv_timeout(timeout).ok()
    }

    /// Hands a pre-built management PDU to RMT for delivery, as used by
    /// `efcp_container::mgmt_write` (§4.3).
    pub fn mgmt_send(&self, dest: Address, qos: QosId, pdu: Pdu) -> Result<(), RmtError> {
        self.send(dest, qos, pdu)
    }

    /// Count of PDUs dropped for decode failure, for diagnostics and tests.
    pub fn malformed_dropped(&self) -> u64 {
        self.malformed_dropped.load(Ordering::Relaxed)
    }

    /// Count of sends that failed PFT lookup entirely.
    pub fn no_route_dropped(&self) -> u64 {
        self.no_route_dropped.load(Ordering::Relaxed)
    }
}

impl<S: Shim + 'static> RmtSend for Rmt<S> {
    fn send(&self, dest: Address, qos: QosId, pdu: Pdu) -> Result<(), RmtError> {
        Rmt::send(self, dest, qos, pdu)
    }
}
