//! The sequence-holding queue (SeqQ, §4.6): buffers out-of-order DT PDUs
//! above the contiguous delivery boundary until the gap filling them in is
//! received, at which point they drain in order.
use addr::SeqNum;
use pci::Pdu;
use std::collections::BTreeMap;

/// Out-of-order PDUs awaiting a gap fill, keyed by sequence number so the
/// contiguous prefix can be drained in order once it fills in. A sorted map
/// answers both "is this seq a duplicate of one already buffered" and "what
/// is the next deliverable seq" without a separate bitmap (§4.4 "the gap
/// bitmap (implementation freedom)").
#[derive(Default)]
pub struct SeqQ {
    held: BTreeMap<SeqNum, Pdu>,
}

impl SeqQ {
    /// Creates an empty SeqQ.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `seq` is already buffered (a duplicate in-gap arrival).
    pub fn contains(&self, seq: SeqNum) -> bool {
        self.held.contains_key(&seq)
    }

    /// Buffers an out-of-order PDU.
    pub fn insert(&mut self, pdu: Pdu) {
        self.held.insert(pdu.pci.seq_num, pdu);
    }

    /// Drains every PDU contiguous with `left_edge`, returning them in seq
    /// order and the new left edge. Each returned PDU advances the edge by
    /// one; draining stops at the first gap.
    pub fn drain_contiguous(&mut self, mut left_edge: SeqNum) -> (Vec<Pdu>, SeqNum) {
        let mut drained = Vec::new();
        loop {
            let next = left_edge.next();
            match self.held.remove(&next) {
                Some(pdu) => {
                    left_edge = next;
                    drained.push(pdu);
                }
                None => break,
            }
        }
        (drained, left_edge)
    }

    /// Lowest sequence number currently buffered, if any; consulted by the
    /// A-timer handler to decide how far it must skip ahead to break a
    /// stale gap (§4.4 A-timer).
    pub fn min_seq(&self) -> Option<SeqNum> {
        self.held.keys().next().copied()
    }

    /// Number of PDUs currently buffered.
    pub fn len(&self) -> usize {
        self.held.len()
    }

    /// Whether nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
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
    fn scenario_out_of_order_receive() {
        // §8 scenario 4: left_window_edge=10, max_seq_nr_rcv=10. Receive
        // 12 then 11; left edge should advance to 12 once 11 fills the gap.
        let mut seqq = SeqQ::new();
        seqq.insert(dt(12));
        let (drained, new_edge) = seqq.drain_contiguous(SeqNum(10));
        assert!(drained.is_empty());
        assert_eq!(new_edge, SeqNum(10));

        seqq.insert(dt(11));
        let (drained, new_edge) = seqq.drain_contiguous(SeqNum(10));
        let seqs: Vec<_> = drained.iter().map(|p| p.pci.seq_num).collect();
        assert_eq!(seqs, vec![SeqNum(11), SeqNum(12)]);
        assert_eq!(new_edge, SeqNum(12));
        assert!(seqq.is_empty());
    }

    #[test]
    fn duplicate_in_gap_arrival_is_detected() {
        let mut seqq = SeqQ::new();
        seqq.insert(dt(11));
        assert!(seqq.contains(SeqNum(11)));
        assert!(!seqq.contains(SeqNum(12)));
    }
}
