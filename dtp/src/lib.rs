//! Data Transfer Protocol (§4.4): sequencing, delimiting, the closed-window
//! write path, out-of-order buffering on receive, and the sender/receiver
//! inactivity and A-timers for one connection.
#![deny(missing_docs)]
#![deny(warnings)]
mod policies;
mod seqq;

pub use policies::Policies;
pub use seqq::SeqQ;

use addr::{Endpoints, PortId, SeqNum};
use bytes::Bytes;
use dtcp::{Dtcp, DtcpError};
use kfa::{Kfa, KfaError};
use log::warn;
use parking_lot::Mutex;
use pci::{Pci, Pdu};
use rmt::{RmtError, RmtSend};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use timers::IntervalTimer;

/// Errors raised by DTP operations (§7).
#[derive(Debug, Error)]
pub enum DtpError {
    /// Backpressure/protocol: RMT rejected the send.
    #[error("rmt send failed: {0}")]
    Rmt(#[from] RmtError),
    /// Backpressure: DTCP rejected admission (closed window queue full).
    #[error("dtcp admission failed: {0}")]
    Dtcp(#[from] DtcpError),
}

/// Configuration for one DTP instance: the timer constants from which the
/// sender/receiver-inactivity and A-timer intervals are derived (§4.4).
#[derive(Clone, Copy, Debug)]
pub struct DtpConfig {
    /// Maximum packet lifetime.
    pub mpl: Duration,
    /// Maximum round-trip time.
    pub r: Duration,
    /// A-timer interval.
    pub a: Duration,
}

impl DtpConfig {
    fn sender_inactivity_interval(&self) -> Duration {
        (self.mpl + self.r + self.a) * 2
    }

    fn receiver_inactivity_interval(&self) -> Duration {
        (self.mpl + self.r + self.a) * 3
    }
}

impl Default for DtpConfig {
    fn default() -> Self {
        Self {
            mpl: Duration::from_secs(60),
            r: Duration::from_millis(100),
            a: Duration::from_millis(200),
        }
    }
}

struct State {
    nxt_seq: SeqNum,
    left_window_edge: SeqNum,
    max_seq_nr_rcv: SeqNum,
    dropped_pdus: u64,
    drf_flag: bool,
}

/// The DTP state machine for one connection.
///
/// `dtcp` is `None` for an unreliable, unflow-controlled connection (§4.4
/// write path step 3); when present, it is consulted for RTXQ duplication,
/// window admission, and the per-arrival `sv_update` callback.
pub struct Dtp {
    config: DtpConfig,
    endpoints: Endpoints,
    rmt: Arc<dyn RmtSend>,
    kfa: Arc<Kfa>,
    dtcp: Option<Arc<Dtcp>>,
    policies: Policies,
    state: Mutex<State>,
    seqq: Mutex<SeqQ>,
    sender_inactivity: IntervalTimer,
    receiver_inactivity: IntervalTimer,
    a_timer: IntervalTimer,
}

impl Dtp {
    /// Creates a DTP instance for one connection. A freshly created
    /// connection starts with `drf_flag` set so its first outbound PDU
    /// carries the Data Run Flag (§3 Lifecycle).
    pub fn new(
        config: DtpConfig,
        endpoints: Endpoints,
        rmt: Arc<dyn RmtSend>,
        kfa: Arc<Kfa>,
        dtcp: Option<Arc<Dtcp>>,
        policies: Policies,
    ) -> Arc<Self> {
        let this = Arc::new(Self {
            config,
            endpoints,
            rmt,
            kfa,
            dtcp,
            policies,
            state: Mutex::new(State {
                nxt_seq: SeqNum(0),
                left_window_edge: SeqNum(0),
                max_seq_nr_rcv: SeqNum(0),
                dropped_pdus: 0,
                drf_flag: true,
            }),
            seqq: Mutex::new(SeqQ::new()),
            sender_inactivity: IntervalTimer::new(),
            receiver_inactivity: IntervalTimer::new(),
            a_timer: IntervalTimer::new(),
        });
        this.restart_a_timer();
        this
    }

    /// Next sequence number this connection will assign, for tests and
    /// diagnostics.
    pub fn nxt_seq(&self) -> SeqNum {
        self.state.lock().nxt_seq
    }

    /// Current left window edge (the contiguous-delivery boundary).
    pub fn left_window_edge(&self) -> SeqNum {
        self.state.lock().left_window_edge
    }

    /// Highest sequence number ever observed on receive, including
    /// out-of-order arrivals not yet delivered.
    pub fn max_seq_nr_rcv(&self) -> SeqNum {
        self.state.lock().max_seq_nr_rcv
    }

    /// Count of received DT PDUs dropped as too old (`seq < left edge`).
    pub fn dropped_pdus(&self) -> u64 {
        self.state.lock().dropped_pdus
    }

    /// Number of out-of-order PDUs currently buffered awaiting a gap fill.
    pub fn seqq_len(&self) -> usize {
        self.seqq.lock().len()
    }

    /// Write path (`dtp_write`, §4.4): allocates the next sequence number,
    /// builds a DT PDU, and either sends it directly, duplicates it into
    /// the RTXQ, or queues it behind a closed window, depending on the
    /// connection's policy flags.
    pub fn write(self: &Arc<Self>, sdu: Bytes) -> Result<(), DtpError> {
        self.sender_inactivity.cancel();

        let (seq, drf) = {
            let mut state = self.state.lock();
            let seq = state.nxt_seq;
            state.nxt_seq = seq.next();
            let drf = state.drf_flag;
            state.drf_flag = false;
            (seq, drf)
        };

        let mut pci = Pci::dt(
            self.endpoints.dst_addr,
            self.endpoints.src_addr,
            self.endpoints.dst_cep,
            self.endpoints.src_cep,
            self.endpoints.qos_id,
            seq,
        );
        pci.set_drf(drf);
        let pdu = Pdu::new(pci, sdu);

        let result = match &self.dtcp {
            None => self.rmt_send(pdu).map_err(DtpError::from),
            Some(dtcp) => {
                if dtcp.rtx_ctrl() {
                    dtcp.rtx_push(pdu.clone());
                }
                if dtcp.window_based_fctrl() {
                    dtcp.window_admit(pdu).map_err(DtpError::from)
                } else {
                    self.rmt_send(pdu).map_err(DtpError::from)
                }
            }
        };

        self.restart_sender_inactivity();
        result
    }

    fn rmt_send(&self, pdu: Pdu) -> Result<(), RmtError> {
        self.rmt.send(self.endpoints.dst_addr, self.endpoints.qos_id, pdu)
    }

    /// Receive path (`dtp_receive`, §4.4): dispatches on the incoming
    /// sequence number against the left window edge `L` and the highest
    /// sequence ever seen `M`, delivering in-order SDUs to the KFA and
    /// buffering the rest in the SeqQ until their gap fills.
    ///
    /// `L` tracks the contiguous-delivery boundary and `M` tracks the
    /// highest sequence observed at all (including not-yet-delivered
    /// out-of-order arrivals); the two advance together in the common
    /// no-gap case and diverge only while a gap is open, which is the
    /// interpretation needed for the table's `L < s < M` branch to be
    /// reachable at all (see DESIGN.md).
    pub fn receive(self: &Arc<Self>, pdu: Pdu) {
        self.receiver_inactivity.cancel();
        let s = pdu.pci.seq_num;

        if pdu.pci.drf() {
            {
                let mut state = self.state.lock();
                state.max_seq_nr_rcv = s;
                state.left_window_edge = s;
                state.drf_flag = true;
            }
            if let Some(hook) = &self.policies.initial_sequence_number {
                hook(s);
            }
            if let Some(dtcp) = &self.dtcp {
                dtcp.sv_update(s);
            }
            self.deliver(pdu);
            self.restart_receiver_inactivity();
            return;
        }

        let left_edge = self.state.lock().left_window_edge;
        if s <= left_edge {
            if s < left_edge {
                self.state.lock().dropped_pdus += 1;
            }
            if let Some(dtcp) = &self.dtcp {
                dtcp.emit_window_ack(left_edge);
            }
            self.restart_receiver_inactivity();
            return;
        }

        let max_seen = self.state.lock().max_seq_nr_rcv;
        if s > max_seen {
            self.state.lock().max_seq_nr_rcv = s;
        }

        if let Some(dtcp) = &self.dtcp {
            dtcp.sv_update(s);
        }

        if s == left_edge.next() {
            self.state.lock().left_window_edge = s;
            self.deliver(pdu);
            self.drain_seqq();
        } else {
            let mut seqq = self.seqq.lock();
            if !seqq.contains(s) {
                seqq.insert(pdu);
            }
        }
        self.restart_receiver_inactivity();
    }

    fn drain_seqq(&self) {
        let left_edge = self.state.lock().left_window_edge;
        let (drained, new_edge) = self.seqq.lock().drain_contiguous(left_edge);
        if drained.is_empty() {
            return;
        }
        self.state.lock().left_window_edge = new_edge;
        for pdu in drained {
            self.deliver(pdu);
        }
    }

    fn deliver(&self, pdu: Pdu) {
        if let Err(e) = self.kfa.sdu_post(self.endpoints.port_id, pdu.payload) {
            self.log_kfa_failure(e);
        }
    }

    fn log_kfa_failure(&self, e: KfaError) {
        warn!(
            "kfa sdu_post failed for port {}: {}",
            self.endpoints.port_id, e
        );
    }

    /// (Re)arms the A-timer: on expiry, if the SeqQ holds a gap older than
    /// `a`, skip the left window edge past it without waiting for a NACK
    /// round-trip (§4.4, §9 open question 2).
    fn restart_a_timer(self: &Arc<Self>) {
        let interval = self.config.a;
        let this = self.clone();
        self.a_timer.arm(interval, move || this.a_timer_fire());
    }

    fn a_timer_fire(self: &Arc<Self>) {
        if let Some(min_seq) = self.seqq.lock().min_seq() {
            let left_edge = self.state.lock().left_window_edge;
            if min_seq.0 > left_edge.0 + 1 {
                let new_edge = match &self.policies.a_timer_expired {
                    Some(hook) => hook(left_edge, min_seq),
                    None => SeqNum(min_seq.0 - 1),
                };
                self.state.lock().left_window_edge = new_edge;
                self.drain_seqq();
            }
        }
        self.restart_a_timer();
    }

    fn restart_sender_inactivity(self: &Arc<Self>) {
        let interval = self.config.sender_inactivity_interval();
        let this = self.clone();
        self.sender_inactivity
            .arm(interval, move || this.sender_inactivity_expired());
    }

    fn sender_inactivity_expired(self: &Arc<Self>) {
        match &self.policies.sender_inactivity {
            Some(hook) => hook(),
            None => {
                warn!("connection idle: no outbound traffic within sender-inactivity window");
                self.state.lock().drf_flag = true;
                if let Some(dtcp) = &self.dtcp {
                    dtcp.shutdown();
                }
            }
        }
    }

    fn restart_receiver_inactivity(self: &Arc<Self>) {
        let interval = self.config.receiver_inactivity_interval();
        let this = self.clone();
        self.receiver_inactivity
            .arm(interval, move || this.receiver_inactivity_expired());
    }

    fn receiver_inactivity_expired(self: &Arc<Self>) {
        match &self.policies.receiver_inactivity {
            Some(hook) => hook(),
            None => {
                warn!("connection idle: no inbound traffic within receiver-inactivity window");
                self.state.lock().drf_flag = true;
                *self.seqq.lock() = SeqQ::new();
            }
        }
    }

    /// Cancels all three timers, for connection teardown (§3 Lifecycle).
    pub fn shutdown(&self) {
        self.sender_inactivity.cancel();
        self.receiver_inactivity.cancel();
        self.a_timer.cancel();
        if let Some(dtcp) = &self.dtcp {
            dtcp.shutdown();
        }
    }
}
