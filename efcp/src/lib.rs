//! The EFCP container (§4.3): a registry of live connections keyed by
//! connection-endpoint id, tying DTP, DTCP, RMT and KFA together for one
//! node.
#![deny(missing_docs)]
#![deny(warnings)]
use addr::{Address, CepId, Endpoints, PortId, QosId};
use bytes::Bytes;
use dtcp::{Dtcp, DtcpConfig, DtcpError};
use dtp::{Dtp, DtpConfig, DtpError};
use kfa::Kfa;
use log::warn;
use parking_lot::Mutex;
use pci::{Pci, Pdu};
use rmt::{LocalDelivery, RmtError, RmtSend};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Errors raised by EFCP container operations (§7).
#[derive(Debug, Error)]
pub enum EfcpError {
    /// Parameter error: no connection registered under this CEP-id.
    #[error("no connection for cep {0}")]
    UnknownCep(CepId),
    /// Parameter error: `connection_update`'s target CEP-id is already in
    /// use by a different connection.
    #[error("cep {0} already in use")]
    CepInUse(CepId),
    /// DTP reported a write/admission failure.
    #[error("dtp operation failed: {0}")]
    Dtp(#[from] DtpError),
    /// DTCP rejected an inbound control PDU.
    #[error("dtcp operation failed: {0}")]
    Dtcp(#[from] DtcpError),
    /// RMT rejected a management PDU send.
    #[error("rmt send failed: {0}")]
    Rmt(#[from] RmtError),
}

struct Entry {
    dtp: Arc<Dtp>,
    dtcp: Option<Arc<Dtcp>>,
}

struct State {
    connections: HashMap<CepId, Entry>,
    next_cep: i32,
}

impl State {
    /// Allocates the next free CEP-id from a monotonic counter, wrapping
    /// back to zero (never onto a negative, invalid value) and skipping
    /// any id still live in the map.
    fn allocate_cep(&mut self) -> CepId {
        loop {
            let candidate = CepId(self.next_cep);
            self.next_cep = self.next_cep.wrapping_add(1);
            if self.next_cep < 0 {
                self.next_cep = 0;
            }
            if candidate.is_valid() && !self.connections.contains_key(&candidate) {
                return candidate;
            }
        }
    }
}

/// The per-node registry of live EFCP connections.
pub struct Container {
    state: Mutex<State>,
    rmt: Arc<dyn RmtSend>,
    kfa: Arc<Kfa>,
    local_addr: Address,
}

impl Container {
    /// Creates an empty container for a node at `local_addr`, wired to
    /// `rmt` for PDU emission and `kfa` for SDU delivery.
    pub fn new(local_addr: Address, rmt: Arc<dyn RmtSend>, kfa: Arc<Kfa>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State {
                connections: HashMap::new(),
                next_cep: 0,
            }),
            rmt,
            kfa,
            local_addr,
        })
    }

    /// Assigns a fresh local CEP-id, instantiates DTP (and DTCP, if
    /// `dtcp_config` is given), and registers the connection.
    #[allow(clippy::too_many_arguments)]
    pub fn connection_create(
        &self,
        dst_addr: Address,
        dst_cep: CepId,
        qos_id: QosId,
        port_id: PortId,
        dtp_config: DtpConfig,
        dtcp_config: Option<DtcpConfig>,
        dtp_policies: dtp::Policies,
        dtcp_policies: dtcp::Policies,
    ) -> CepId {
        let mut state = self.state.lock();
        let src_cep = state.allocate_cep();
        let endpoints = Endpoints {
            src_addr: self.local_addr,
            dst_addr,
            src_cep,
            dst_cep,
            qos_id,
            port_id,
        };
        let dtcp =
            dtcp_config.map(|cfg| Dtcp::new(cfg, endpoints, self.rmt.clone(), dtcp_policies));
        let dtp = Dtp::new(
            dtp_config,
            endpoints,
            self.rmt.clone(),
            self.kfa.clone(),
            dtcp.clone(),
            dtp_policies,
        );
        state.connections.insert(src_cep, Entry { dtp, dtcp });
        src_cep
    }

    /// Rekeys an established half-connection from `from_cep` to `to_cep`,
    /// once the peer's CEP-id is learned from a control exchange.
    ///
    /// Only the container's registry key moves; the connection's own
    /// `Endpoints::src_cep` (baked into its DTP/DTCP at creation time) is
    /// left as originally allocated (see DESIGN.md).
    pub fn connection_update(&self, from_cep: CepId, to_cep: CepId) -> Result<(), EfcpError> {
        let mut state = self.state.lock();
        if state.connections.contains_key(&to_cep) {
            return Err(EfcpError::CepInUse(to_cep));
        }
        let entry = state
            .connections
            .remove(&from_cep)
            .ok_or(EfcpError::UnknownCep(from_cep))?;
        state.connections.insert(to_cep, entry);
        Ok(())
    }

    /// Tears down the connection at `cep`: cancels its timers, drains its
    /// queues, and removes it from the registry.
    pub fn connection_destroy(&self, cep: CepId) -> Result<(), EfcpError> {
        let entry = self
            .state
            .lock()
            .connections
            .remove(&cep)
            .ok_or(EfcpError::UnknownCep(cep))?;
        entry.dtp.shutdown();
        Ok(())
    }

    /// Routes an outbound SDU to the connection's DTP write path.
    pub fn write(&self, cep: CepId, sdu: Bytes) -> Result<(), EfcpError> {
        let dtp = self.dtp_for(cep)?;
        dtp.write(sdu).map_err(EfcpError::from)
    }

    /// Routes an inbound PDU by CEP-id: control PDUs to DTCP, DT PDUs to
    /// DTP's receive path.
    pub fn receive(&self, cep: CepId, pdu: Pdu) -> Result<(), EfcpError> {
        let (dtp, dtcp) = {
            let state = self.state.lock();
            let entry = state.connections.get(&cep).ok_or(EfcpError::UnknownCep(cep))?;
            (entry.dtp.clone(), entry.dtcp.clone())
        };
        if pdu.pci.pdu_type.is_control() {
            match dtcp {
                Some(dtcp) => dtcp.receive_control(pdu).map_err(EfcpError::from),
                None => {
                    warn!("control pdu for cep {} with no dtcp installed, dropping", cep);
                    Ok(())
                }
            }
        } else {
            dtp.receive(pdu);
            Ok(())
        }
    }

    /// Builds a MGMT PDU from this node to `dst_addr` and hands it to RMT
    /// (§4.3).
    pub fn mgmt_write(&self, dst_addr: Address, sdu: Bytes) -> Result<(), EfcpError> {
        let pdu = Pdu::new(Pci::mgmt(dst_addr, self.local_addr), sdu);
        self.rmt
            .send(dst_addr, QosId(0), pdu)
            .map_err(EfcpError::from)
    }

    fn dtp_for(&self, cep: CepId) -> Result<Arc<Dtp>, EfcpError> {
        self.state
            .lock()
            .connections
            .get(&cep)
            .map(|e| e.dtp.clone())
            .ok_or(EfcpError::UnknownCep(cep))
    }
}

impl LocalDelivery for Container {
    fn deliver(&self, pdu: Pdu) {
        let cep = pdu.pci.dst_cep;
        if let Err(e) = self.receive(cep, pdu) {
            warn!("failed to deliver pdu to cep {}: {}", cep, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use addr::SeqNum;
    use pft::Pft;
    use rmt::shim::Shim;
    use rmt::Rmt;
    use std::io;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    #[derive(Default)]
    struct LoopbackShim {
        written: StdMutex<Vec<Bytes>>,
    }

    impl Shim for LoopbackShim {
        fn sdu_write(&self, _port: PortId, sdu: Bytes) -> io::Result<()> {
            self.written.lock().unwrap().push(sdu);
            Ok(())
        }
    }

    fn wait_for<F: Fn() -> bool>(pred: F) {
        for _ in 0..200 {
            if pred() {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!("condition not met in time");
    }

    fn harness() -> (Arc<Container>, Arc<LoopbackShim>) {
        let shim = Arc::new(LoopbackShim::default());
        let pft = Arc::new(Pft::new());
        pft.add(Address(2), QosId(0), vec![PortId(7)]);
        let rmt = Rmt::new(shim.clone(), pft);
        rmt.bind(PortId(7));
        let kfa = Arc::new(Kfa::new());
        kfa.flow_commit(PortId(1));
        kfa.flow_arrived(PortId(1)).unwrap();
        let container = Container::new(Address(1), rmt, kfa);
        (container, shim)
    }

    #[test]
    fn write_routes_to_dtp_and_reaches_the_wire() {
        let (container, shim) = harness();
        let cep = container.connection_create(
            Address(2),
            CepId(9),
            QosId(0),
            PortId(1),
            DtpConfig::default(),
            None,
            dtp::Policies::new(),
            dtcp::Policies::new(),
        );
        container.write(cep, Bytes::from_static(b"hi")).unwrap();

        wait_for(|| !shim.written.lock().unwrap().is_empty());
        let written = shim.written.lock().unwrap();
        let pdu = Pdu::decode(&written[0]).unwrap();
        assert_eq!(pdu.pci.dst_cep, CepId(9));
        assert_eq!(pdu.pci.src_cep, cep);
    }

    #[test]
    fn write_on_unknown_cep_is_an_error() {
        let (container, _shim) = harness();
        let err = container.write(CepId(42), Bytes::from_static(b"x"));
        assert!(matches!(err, Err(EfcpError::UnknownCep(CepId(42)))));
    }

    #[test]
    fn receive_dispatches_dt_pdu_to_dtp_and_posts_to_kfa() {
        let (container, _shim) = harness();
        let kfa = container.kfa.clone();
        let cep = container.connection_create(
            Address(2),
            CepId(9),
            QosId(0),
            PortId(1),
            DtpConfig::default(),
            None,
            dtp::Policies::new(),
            dtcp::Policies::new(),
        );

        let mut pci = Pci::dt(Address(1), Address(2), cep, CepId(9), QosId(0), SeqNum(0));
        pci.set_drf(true);
        let pdu = Pdu::new(pci, Bytes::from_static(b"inbound"));
        container.receive(cep, pdu).unwrap();

        let sdu = kfa.flow_sdu_read(PortId(1)).unwrap();
        assert_eq!(&sdu[..], b"inbound");
    }

    #[test]
    fn connection_destroy_removes_and_write_then_fails() {
        let (container, _shim) = harness();
        let cep = container.connection_create(
            Address(2),
            CepId(9),
            QosId(0),
            PortId(1),
            DtpConfig::default(),
            None,
            dtp::Policies::new(),
            dtcp::Policies::new(),
        );
        container.connection_destroy(cep).unwrap();
        assert!(matches!(
            container.write(cep, Bytes::from_static(b"x")),
            Err(EfcpError::UnknownCep(_))
        ));
    }

    #[test]
    fn connection_update_rekeys_the_registry() {
        let (container, _shim) = harness();
        let cep = container.connection_create(
            Address(2),
            CepId(9),
            QosId(0),
            PortId(1),
            DtpConfig::default(),
            None,
            dtp::Policies::new(),
            dtcp::Policies::new(),
        );
        container.connection_update(cep, CepId(100)).unwrap();
        assert!(matches!(
            container.write(cep, Bytes::from_static(b"x")),
            Err(EfcpError::UnknownCep(_))
        ));
        container.write(CepId(100), Bytes::from_static(b"x")).unwrap();
    }
}
