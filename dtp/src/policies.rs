//! Pluggable DTP policy hooks (§9 design notes), the DTP-level counterpart
//! to [`dtcp::Policies`]. A missing hook (`None`) falls back to the
//! behavior this module's callers document as the default.
use addr::SeqNum;
use std::sync::Arc;

/// Dispatch table for DTP's pluggable policy hooks.
#[derive(Clone, Default)]
pub struct Policies {
    /// Runs when a DRF-flagged PDU (re)starts a connection, given the new
    /// initial sequence number. Default: no-op (the state vector reset
    /// already happened before this hook is consulted).
    pub initial_sequence_number: Option<Arc<dyn Fn(SeqNum) + Send + Sync>>,
    /// Computes the new left window edge when the A-timer finds a gap
    /// older than `a` unfilled, given `(current_left_edge,
    /// lowest_buffered_seq)`. Default: jump to `lowest_buffered_seq - 1`,
    /// abandoning the lost PDU without waiting for a NACK round-trip.
    pub a_timer_expired: Option<Arc<dyn Fn(SeqNum, SeqNum) -> SeqNum + Send + Sync>>,
    /// Runs on sender-inactivity timeout. Default: reassert DRF on the next
    /// write and flush the peer connection's DTCP retransmission state.
    pub sender_inactivity: Option<Arc<dyn Fn() + Send + Sync>>,
    /// Runs on receiver-inactivity timeout. Default: reassert DRF and
    /// discard the out-of-order buffer.
    pub receiver_inactivity: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl Policies {
    /// An all-default policy set.
    pub fn new() -> Self {
        Self::default()
    }
}
