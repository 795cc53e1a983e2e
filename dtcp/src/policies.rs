//! Pluggable DTCP policy hooks (§9 design notes): a record of
//! function-valued fields with a "default" implementation baked into the
//! method that consults them. A missing hook (`None`) is not a crash; the
//! caller checks presence and falls back to the spec's default behavior.
//!
//! The control plane installs overrides at connection-creation time by
//! filling in fields of a [`Policies`] value before handing it to
//! [`crate::Dtcp::new`]; this crate never loads plugins dynamically (§1
//! Non-goals: "no plugin ABI for policies").
use addr::SeqNum;
use std::sync::Arc;
use std::time::Duration;

/// Dispatch table for DTCP's pluggable policy hooks.
#[derive(Clone, Default)]
pub struct Policies {
    /// Decides whether a DT PDU may be sent immediately given `(seq,
    /// snd_rt_wind_edge)`. Default: `seq < snd_rt_wind_edge`.
    pub transmission_control: Option<Arc<dyn Fn(SeqNum, SeqNum) -> bool + Send + Sync>>,
    /// Decides whether a PDU may be admitted to the CWQ given its current
    /// length. Default: admit (capacity is enforced separately by the CWQ
    /// itself).
    pub closed_window: Option<Arc<dyn Fn(usize) -> bool + Send + Sync>>,
    /// Computes the new right window edge granted to the peer, given the
    /// just-accepted `seq` and the current receiver credit. Default:
    /// `seq + rcvr_credit`.
    pub rcvr_flow_control: Option<Arc<dyn Fn(SeqNum, u64) -> SeqNum + Send + Sync>>,
    /// Decides whether the sender's rate should be reduced this interval.
    /// Default: never (no congestion signal beyond credit/window).
    pub rate_reduction: Option<Arc<dyn Fn(u64, u64) -> bool + Send + Sync>>,
    /// Updates the smoothed RTT estimate given `(old_srtt, sample)`.
    /// Default: EWMA, `7/8 * old + 1/8 * sample`.
    pub rtt_estimator: Option<Arc<dyn Fn(Duration, Duration) -> Duration + Send + Sync>>,
}

impl Policies {
    /// An all-default policy set.
    pub fn new() -> Self {
        Self::default()
    }
}
