//! Retransmission Queue (§3, §4.6): every DT PDU sent on a `rtx_ctrl`
//! connection keeps a duplicate here until acked. A per-connection timer
//! walks it periodically, resending anything older than `trd`.
use addr::SeqNum;
use pci::Pdu;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// One outstanding retransmission-queue entry.
pub struct RtxqEntry {
    /// The duplicated PDU, ready to resend unmodified.
    pub pdu: Pdu,
    /// When this entry was last (re)transmitted.
    pub time_stamp: Instant,
    /// Number of times this entry has been resent since it was first
    /// queued.
    pub retries: u32,
}

/// Outcome of a retransmission-timer firing (§4.5).
pub struct RtxOutcome {
    /// Entries that should be resent on the wire now.
    pub to_resend: Vec<Pdu>,
    /// Whether any entry's retry count exceeded `data_retransmit_max`,
    /// meaning the connection must be declared fatally errored (§7).
    pub fatal: bool,
}

/// Ordered (by sequence number) list of unacknowledged DT PDUs.
pub struct Rtxq {
    entries: BTreeMap<SeqNum, RtxqEntry>,
    max_retries: u32,
}

impl Rtxq {
    /// Creates an empty RTXQ; `max_retries` is `data_retransmit_max` (§3).
    pub fn new(max_retries: u32) -> Self {
        Self {
            entries: BTreeMap::new(),
            max_retries,
        }
    }

    /// Pushes a freshly sent PDU's duplicate onto the queue.
    pub fn push(&mut self, pdu: Pdu) {
        let seq = pdu.pci.seq_num;
        self.entries.insert(
            seq,
            RtxqEntry {
                pdu,
                time_stamp: Instant::now(),
                retries: 0,
            },
        );
    }

    /// Evicts every entry with `seq <= acked`. Idempotent: acking the same
    /// (or an older) sequence number again is a no-op (§8 ack idempotence).
    pub fn ack(&mut self, acked: SeqNum) {
        self.entries.retain(|&seq, _| seq > acked);
    }

    /// Returns (and marks as due) every entry with `seq >= nacked`, for
    /// immediate resend, per the RINA reference model's NACK contract (§9
    /// open question 1): a NACK means "resend this and everything newer",
    /// since the receiver has no way to know which of the newer PDUs also
    /// failed to arrive.
    pub fn nack(&mut self, nacked: SeqNum) -> Vec<Pdu> {
        self.entries
            .range_mut(nacked..)
            .map(|(_, entry)| {
                entry.time_stamp = Instant::now();
                entry.retries += 1;
                entry.pdu.clone()
            })
            .collect()
    }

    /// Walks every entry; any older than `trd` is resent and has its retry
    /// counter incremented. If any entry's retries now exceed `max_retries`,
    /// reports `fatal = true` so the caller can declare the connection
    /// errored (§7 Fatal connection, §3 RTXQ).
    pub fn rtx(&mut self, trd: Duration) -> RtxOutcome {
        let mut to_resend = Vec::new();
        let mut fatal = false;
        let now = Instant::now();
        for entry in self.entries.values_mut() {
            if now.duration_since(entry.time_stamp) >= trd {
                entry.time_stamp = now;
                entry.retries += 1;
                to_resend.push(entry.pdu.clone());
                if entry.retries > self.max_retries {
                    fatal = true;
                }
            }
        }
        RtxOutcome { to_resend, fatal }
    }

    /// Number of unacknowledged entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sequence numbers currently outstanding, ascending (for tests and
    /// diagnostics).
    pub fn seqs(&self) -> Vec<SeqNum> {
        self.entries.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use addr::{Address, CepId, QosId};
    use bytes::Bytes;
    use pci::Pci;

    fn dt(seq: u64) -> Pdu {
        Pdu::new(
            Pci::dt(Address(1), Address(2), CepId(1), CepId(1), QosId(0), SeqNum(seq)),
            Bytes::new(),
        )
    }

    #[test]
    fn scenario_reliable_send_and_ack() {
        // §8 scenario 2: three DT PDUs queued, ack(1) retains only seq=2.
        let mut rtxq = Rtxq::new(3);
        rtxq.push(dt(0));
        rtxq.push(dt(1));
        rtxq.push(dt(2));
        assert_eq!(rtxq.len(), 3);
        rtxq.ack(SeqNum(1));
        assert_eq!(rtxq.seqs(), vec![SeqNum(2)]);
    }

    #[test]
    fn ack_is_idempotent() {
        let mut rtxq = Rtxq::new(3);
        rtxq.push(dt(0));
        rtxq.push(dt(1));
        rtxq.ack(SeqNum(0));
        let after_first = rtxq.seqs();
        rtxq.ack(SeqNum(0));
        assert_eq!(rtxq.seqs(), after_first);
    }

    #[test]
    fn nack_returns_entries_at_and_above() {
        let mut rtxq = Rtxq::new(5);
        rtxq.push(dt(0));
        rtxq.push(dt(1));
        rtxq.push(dt(2));
        let resent = rtxq.nack(SeqNum(1));
        let mut seqs: Vec<_> = resent.iter().map(|p| p.pci.seq_num).collect();
        seqs.sort();
        assert_eq!(seqs, vec![SeqNum(1), SeqNum(2)]);
    }

    #[test]
    fn rtx_declares_fatal_past_max_retries() {
        let mut rtxq = Rtxq::new(1);
        rtxq.push(dt(0));
        let first = rtxq.rtx(Duration::from_secs(0));
        assert_eq!(first.to_resend.len(), 1);
        assert!(!first.fatal); // retries == 1, not yet > max_retries(1)
        let second = rtxq.rtx(Duration::from_secs(0));
        assert!(second.fatal); // retries == 2 > max_retries(1)
    }
}
