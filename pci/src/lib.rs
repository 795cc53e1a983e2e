//! Wire format for the Protocol Control Information (PCI) header and the
//! PDU it prefixes.
//!
//! Adapted from the teacher's `src/packet.rs` / `dtp/src/packet.rs` /
//! `dtcp/src/packet.rs` (three separate, narrower header formats), merged
//! into a single PCI shared by data and control PDUs, per §6 of the
//! specification. Fields are encoded big-endian, as the teacher's packets
//! already are.
#![deny(missing_docs)]
#![deny(warnings)]
use addr::{Address, CepId, QosId, SeqNum};
use byteorder::{BigEndian, ByteOrder};
use bytes::{Bytes, BytesMut};
use std::fmt;
use thiserror::Error;

/// Type of PDU, bit-exact with §6 of the specification.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u16)]
pub enum PduType {
    /// Bare EFCP PDU (reserved).
    Efcp = 0x8000,
    /// Data transfer PDU.
    Dt = 0x8001,
    /// Common control PDU (reserved for connection control).
    Cc = 0x8002,
    /// Acknowledgement.
    Ack = 0x8804,
    /// Negative acknowledgement.
    Nack = 0x8805,
    /// Selective acknowledgement.
    Sack = 0x8806,
    /// Selective negative acknowledgement.
    Snack = 0x8807,
    /// Flow control.
    Fc = 0x8808,
    /// Acknowledgement plus flow control.
    AckFc = 0x880C,
    /// Negative acknowledgement plus flow control.
    NackFc = 0x880D,
    /// Management PDU.
    Mgmt = 0xC000,
}

impl PduType {
    /// Parses a raw 16-bit PDU type, rejecting unknown values.
    pub fn from_u16(raw: u16) -> Result<Self, PciError> {
        Ok(match raw {
            0x8000 => PduType::Efcp,
            0x8001 => PduType::Dt,
            0x8002 => PduType::Cc,
            0x8804 => PduType::Ack,
            0x8805 => PduType::Nack,
            0x8806 => PduType::Sack,
            0x8807 => PduType::Snack,
            0x8808 => PduType::Fc,
            0x880C => PduType::AckFc,
            0x880D => PduType::NackFc,
            0xC000 => PduType::Mgmt,
            other => return Err(PciError::UnknownPduType(other)),
        })
    }

    /// Whether this type is a control PDU (anything but DT and MGMT).
    pub fn is_control(self) -> bool {
        !matches!(self, PduType::Dt | PduType::Mgmt | PduType::Efcp)
    }

    /// Whether this type is the management PDU.
    pub fn is_mgmt(self) -> bool {
        matches!(self, PduType::Mgmt)
    }
}

/// Flag byte values, bit-exact with §6.
pub mod flags {
    /// Middle fragment of a fragmented SDU.
    pub const FRAG_MIDDLE: u8 = 0x00;
    /// First fragment of a fragmented SDU.
    pub const FRAG_FIRST: u8 = 0x01;
    /// Last fragment of a fragmented SDU.
    pub const FRAG_LAST: u8 = 0x02;
    /// PDU carries exactly one complete SDU.
    pub const CARRY_COMPLETE_SDU: u8 = 0x03;
    /// PDU carries multiple complete SDUs.
    pub const CARRY_MULTIPLE_SDUS: u8 = 0x07;
    /// Data Run Flag: first PDU of a (re)started connection.
    pub const DATA_RUN: u8 = 0x80;
}

/// Errors returned while parsing a PCI header.
#[derive(Debug, Error)]
pub enum PciError {
    /// The buffer was shorter than the fixed header length.
    #[error("pci header truncated: {0} bytes")]
    Truncated(usize),
    /// The buffer was shorter than the control-PDU extension requires.
    #[error("control pci extension truncated: {0} bytes")]
    ControlTruncated(usize),
    /// An unrecognised PDU type value.
    #[error("unknown pdu type 0x{0:04x}")]
    UnknownPduType(u16),
}

/// Control-PDU-only fields (ack/nack seq, window edges).
///
/// Only meaningful when [`PduType::is_control`] is true; absent from the
/// wire encoding of DT and MGMT PDUs.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ControlFields {
    /// Acked or nacked sequence number.
    pub ack_nack_seq: SeqNum,
    /// Highest sequence number the receiver has seen.
    pub last_seq_rcvd: SeqNum,
    /// Current left edge of the sender's window.
    pub left_window_edge: SeqNum,
    /// Current right edge of the sender's window.
    pub right_window_edge: SeqNum,
    /// New left edge granted by this control PDU.
    pub new_left_edge: SeqNum,
    /// New right edge granted by this control PDU.
    pub new_right_edge: SeqNum,
}

const BASE_LEN: usize = 4 + 4 + 2 + 2 + 2 + 2 + 1 + 8;
const CONTROL_LEN: usize = 8 * 6;

/// Protocol Control Information header.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Pci {
    /// Destination node address.
    pub dst_addr: Address,
    /// Source node address.
    pub src_addr: Address,
    /// Destination connection-endpoint id.
    pub dst_cep: CepId,
    /// Source connection-endpoint id.
    pub src_cep: CepId,
    /// Quality of service class.
    pub qos_id: QosId,
    /// PDU type.
    pub pdu_type: PduType,
    /// Flag byte (bit 7 = Data Run, low bits = fragmentation).
    pub flags: u8,
    /// Sequence number.
    pub seq_num: SeqNum,
    /// Control-only fields, `None` for DT/MGMT PDUs.
    pub control: Option<ControlFields>,
}

impl Pci {
    /// Creates a DT PCI with no flags set.
    pub fn dt(
        dst_addr: Address,
        src_addr: Address,
        dst_cep: CepId,
        src_cep: CepId,
        qos_id: QosId,
        seq_num: SeqNum,
    ) -> Self {
        Self {
            dst_addr,
            src_addr,
            dst_cep,
            src_cep,
            qos_id,
            pdu_type: PduType::Dt,
            flags: 0,
            seq_num,
            control: None,
        }
    }

    /// Creates a management PCI (zero CEPs, per §4.3).
    pub fn mgmt(dst_addr: Address, src_addr: Address) -> Self {
        Self {
            dst_addr,
            src_addr,
            dst_cep: CepId(0),
            src_cep: CepId(0),
            qos_id: QosId(0),
            pdu_type: PduType::Mgmt,
            flags: 0,
            seq_num: SeqNum(0),
            control: None,
        }
    }

    /// Returns the Data Run Flag.
    pub fn drf(&self) -> bool {
        self.flags & flags::DATA_RUN != 0
    }

    /// Sets the Data Run Flag.
    pub fn set_drf(&mut self, drf: bool) {
        if drf {
            self.flags |= flags::DATA_RUN;
        } else {
            self.flags &= !flags::DATA_RUN;
        }
    }

    /// Encoded length of this header, including the control extension if
    /// present.
    pub fn encoded_len(&self) -> usize {
        BASE_LEN + if self.control.is_some() { CONTROL_LEN } else { 0 }
    }

    /// Encodes the header into a freshly allocated buffer.
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::zeroed(self.encoded_len());
        BigEndian::write_u32(&mut buf[0..4], self.dst_addr.0);
        BigEndian::write_u32(&mut buf[4..8], self.src_addr.0);
        BigEndian::write_u16(&mut buf[8..10], self.dst_cep.0 as u16);
        BigEndian::write_u16(&mut buf[10..12], self.src_cep.0 as u16);
        BigEndian::write_u16(&mut buf[12..14], self.qos_id.0);
        BigEndian::write_u16(&mut buf[14..16], self.pdu_type as u16);
        buf[16] = self.flags;
        BigEndian::write_u64(&mut buf[17..25], self.seq_num.0);
        if let Some(c) = self.control {
            let o = BASE_LEN;
            BigEndian::write_u64(&mut buf[o..o + 8], c.ack_nack_seq.0);
            BigEndian::write_u64(&mut buf[o + 8..o + 16], c.last_seq_rcvd.0);
            BigEndian::write_u64(&mut buf[o + 16..o + 24], c.left_window_edge.0);
            BigEndian::write_u64(&mut buf[o + 24..o + 32], c.right_window_edge.0);
            BigEndian::write_u64(&mut buf[o + 32..o + 40], c.new_left_edge.0);
            BigEndian::write_u64(&mut buf[o + 40..o + 48], c.new_right_edge.0);
        }
        buf
    }

    /// Parses a header from the front of `buf`, returning the header and the
    /// remaining bytes (the SDU payload).
    pub fn decode(buf: &[u8]) -> Result<(Self, &[u8]), PciError> {
        if buf.len() < BASE_LEN {
            return Err(PciError::Truncated(buf.len()));
        }
        let dst_addr = Address(BigEndian::read_u32(&buf[0..4]));
        let src_addr = Address(BigEndian::read_u32(&buf[4..8]));
        let dst_cep = CepId(BigEndian::read_u16(&buf[8..10]) as i32);
        let src_cep = CepId(BigEndian::read_u16(&buf[10..12]) as i32);
        let qos_id = QosId(BigEndian::read_u16(&buf[12..14]));
        let pdu_type = PduType::from_u16(BigEndian::read_u16(&buf[14..16]))?;
        let flags = buf[16];
        let seq_num = SeqNum(BigEndian::read_u64(&buf[17..25]));

        let mut rest = &buf[BASE_LEN..];
        let control = if pdu_type.is_control() {
            if rest.len() < CONTROL_LEN {
                return Err(PciError::ControlTruncated(rest.len()));
            }
            let c = ControlFields {
                ack_nack_seq: SeqNum(BigEndian::read_u64(&rest[0..8])),
                last_seq_rcvd: SeqNum(BigEndian::read_u64(&rest[8..16])),
                left_window_edge: SeqNum(BigEndian::read_u64(&rest[16..24])),
                right_window_edge: SeqNum(BigEndian::read_u64(&rest[24..32])),
                new_left_edge: SeqNum(BigEndian::read_u64(&rest[32..40])),
                new_right_edge: SeqNum(BigEndian::read_u64(&rest[40..48])),
            };
            rest = &rest[CONTROL_LEN..];
            Some(c)
        } else {
            None
        };

        Ok((
            Self {
                dst_addr,
                src_addr,
                dst_cep,
                src_cep,
                qos_id,
                pdu_type,
                flags,
                seq_num,
                control,
            },
            rest,
        ))
    }
}

impl fmt::Display for Pci {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Pci {{ {:?} {} -> {} seq={} cep {}->{} }}",
            self.pdu_type, self.src_addr, self.dst_addr, self.seq_num, self.src_cep, self.dst_cep
        )
    }
}

/// A PDU: a PCI header plus its SDU payload.
#[derive(Clone, Debug)]
pub struct Pdu {
    /// Header.
    pub pci: Pci,
    /// Payload, owned and immutable once built (shared, cheaply cloned).
    pub payload: Bytes,
}

impl Pdu {
    /// Builds a PDU from a header and payload.
    pub fn new(pci: Pci, payload: Bytes) -> Self {
        Self { pci, payload }
    }

    /// Encodes the whole PDU (header + payload) onto the wire.
    pub fn encode(&self) -> Bytes {
        let mut buf = self.pci.encode();
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    /// Decodes a whole PDU from wire bytes.
    pub fn decode(buf: &[u8]) -> Result<Self, PciError> {
        let (pci, rest) = Pci::decode(buf)?;
        Ok(Self {
            pci,
            payload: Bytes::copy_from_slice(rest),
        })
    }
}
