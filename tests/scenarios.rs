//! End-to-end scenarios (§8), each wiring a real `Pft` + `Rmt` +
//! `efcp::Container` through the `Dif` facade with a `LoopbackShim`.
use addr::{Address, CepId, QosId, SeqNum};
use bytes::Bytes;
use dtcp::DtcpConfig;
use dtp::DtpConfig;
use pci::{ControlFields, Pci, PduType, Pdu};
use rina_efcp::Dif;
use rmt::shim::Shim;
use rmt::LocalDelivery;
use std::io;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

#[derive(Default)]
struct LoopbackShim {
    written: StdMutex<Vec<(addr::PortId, Bytes)>>,
}

impl Shim for LoopbackShim {
    fn sdu_write(&self, port: addr::PortId, sdu: Bytes) -> io::Result<()> {
        self.written.lock().unwrap().push((port, sdu));
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

fn dif_with_connection(
    dtcp_config: Option<DtcpConfig>,
) -> (Arc<Dif<LoopbackShim>>, Arc<LoopbackShim>, CepId) {
    let _ = env_logger::try_init();
    let shim = Arc::new(LoopbackShim::default());
    let dif = Arc::new(Dif::new(Address(1), shim.clone()));
    dif.add_route(Address(2), QosId(0), vec![addr::PortId(7)]);
    dif.bind_port(addr::PortId(7));
    dif.kfa.flow_commit(addr::PortId(1));
    dif.kfa.flow_arrived(addr::PortId(1)).unwrap();

    let cep = dif.efcp.connection_create(
        Address(2),
        CepId(9),
        QosId(0),
        addr::PortId(1),
        DtpConfig::default(),
        dtcp_config,
        dtp::Policies::new(),
        dtcp::Policies::new(),
    );
    (dif, shim, cep)
}

#[test]
fn scenario_1_unreliable_send() {
    let (dif, shim, cep) = dif_with_connection(None);
    dif.efcp.write(cep, Bytes::from_static(b"hello")).unwrap();

    wait_for(|| !shim.written.lock().unwrap().is_empty());
    let written = shim.written.lock().unwrap();
    assert_eq!(written.len(), 1);
    let pdu = Pdu::decode(&written[0].1).unwrap();
    assert_eq!(pdu.pci.seq_num, SeqNum(0));
    assert_eq!(pdu.pci.pdu_type, PduType::Dt);
    assert_eq!(pdu.pci.dst_addr, Address(2));
    assert_eq!(pdu.pci.src_addr, Address(1));
}

#[test]
fn scenario_2_reliable_send_and_ack() {
    // rtx_ctrl=true: three writes produce three DT PDUs and three RTXQ
    // entries; an ACK(1) then retains only seq=2, verified at the dtcp
    // unit level (`scenario_reliable_send_and_ack`); here the end-to-end
    // path is exercised through the wire.
    let (dif, shim, cep) = dif_with_connection(Some(DtcpConfig {
        rtx_ctrl: true,
        ..Default::default()
    }));
    dif.efcp.write(cep, Bytes::from_static(b"a")).unwrap();
    dif.efcp.write(cep, Bytes::from_static(b"b")).unwrap();
    dif.efcp.write(cep, Bytes::from_static(b"c")).unwrap();

    wait_for(|| shim.written.lock().unwrap().len() == 3);
    let written = shim.written.lock().unwrap();
    let seqs: Vec<_> = written
        .iter()
        .map(|(_, w)| Pdu::decode(w).unwrap().pci.seq_num)
        .collect();
    assert_eq!(seqs, vec![SeqNum(0), SeqNum(1), SeqNum(2)]);
}

#[test]
fn scenario_3_window_closure() {
    let (dif, shim, cep) = dif_with_connection(Some(DtcpConfig {
        window_based_fctrl: true,
        max_cwq_len: 4,
        initial_snd_rt_wind_edge: SeqNum(2),
        ..Default::default()
    }));
    dif.efcp.write(cep, Bytes::from_static(b"0")).unwrap();
    dif.efcp.write(cep, Bytes::from_static(b"1")).unwrap();
    dif.efcp.write(cep, Bytes::from_static(b"2")).unwrap();
    dif.efcp.write(cep, Bytes::from_static(b"3")).unwrap();

    // seq 0 and 1 fall inside the window and reach the wire; seq 2 and 3
    // close the window and queue in the CWQ instead.
    wait_for(|| shim.written.lock().unwrap().len() == 2);
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(shim.written.lock().unwrap().len(), 2);
}

fn dt_in(dst_cep: CepId, src_cep: CepId, seq: u64, drf: bool) -> Pdu {
    let mut pci = Pci::dt(Address(1), Address(2), dst_cep, src_cep, QosId(0), SeqNum(seq));
    pci.set_drf(drf);
    Pdu::new(pci, Bytes::from_static(b"x"))
}

#[test]
fn scenario_4_out_of_order_receive() {
    let (dif, _shim, cep) = dif_with_connection(None);

    dif.efcp.deliver(dt_in(cep, CepId(9), 10, true));
    let establishing = dif.kfa.flow_sdu_read(addr::PortId(1)).unwrap();
    assert_eq!(&establishing[..], b"x");

    dif.efcp.deliver(dt_in(cep, CepId(9), 12, false));
    dif.efcp.deliver(dt_in(cep, CepId(9), 11, false));

    let first = dif.kfa.flow_sdu_read(addr::PortId(1)).unwrap();
    let second = dif.kfa.flow_sdu_read(addr::PortId(1)).unwrap();
    assert_eq!(&first[..], b"x");
    assert_eq!(&second[..], b"x");

    dif.efcp.deliver(dt_in(cep, CepId(9), 10, false));
}

fn ack_pdu(dst_cep: CepId, src_cep: CepId, ctl_seq: u64, acked: u64) -> Pdu {
    Pdu::new(
        Pci {
            control: Some(ControlFields {
                ack_nack_seq: SeqNum(acked),
                ..Default::default()
            }),
            pdu_type: PduType::Ack,
            ..Pci::dt(Address(1), Address(2), dst_cep, src_cep, QosId(0), SeqNum(ctl_seq))
        },
        Bytes::new(),
    )
}

#[test]
fn scenario_5_duplicate_control_pdu() {
    let (dif, _shim, cep) = dif_with_connection(Some(DtcpConfig::default()));
    for ctl_seq in 0..=5u64 {
        dif.efcp.deliver(ack_pdu(cep, CepId(9), ctl_seq, ctl_seq));
    }
    dif.efcp.deliver(ack_pdu(cep, CepId(9), 5, 5));
    // Redelivering a stale control seq is dropped as a duplicate, observed
    // indirectly here (no panic, no RTXQ effect); the counter itself is
    // asserted at the dtcp unit level (`duplicate_control_pdu_counts_and_drops`).
}

#[test]
fn scenario_6_rmt_forward() {
    let _ = env_logger::try_init();
    let shim = Arc::new(LoopbackShim::default());
    let dif = Dif::new(Address(17), shim.clone());
    dif.add_route(Address(42), QosId(0), vec![addr::PortId(7)]);
    dif.bind_port(addr::PortId(3));
    dif.bind_port(addr::PortId(7));

    let pdu = Pdu::new(
        Pci::dt(Address(42), Address(1), CepId(1), CepId(1), QosId(0), SeqNum(5)),
        Bytes::from_static(b"hi"),
    );
    dif.ingress(addr::PortId(3), pdu.encode()).unwrap();

    wait_for(|| !shim.written.lock().unwrap().is_empty());
    let written = shim.written.lock().unwrap();
    assert_eq!(written.len(), 1);
    assert_eq!(written[0].0, addr::PortId(7));
    assert_eq!(dif.rmt.malformed_dropped(), 0);
}
