//! Identifiers shared by every layer of the data-transfer core.
//!
//! RINA distinguishes the *address* of a node within a DIF (used for
//! relaying) from the *port-id* and *cep-id* that name a local flow and a
//! local connection endpoint respectively. None of the three carry meaning
//! outside the process that allocated them; they are handles, not addresses
//! on the wire in the IP sense.
#![deny(missing_docs)]
#![deny(warnings)]
use std::fmt;

/// Address of a node within a DIF.
///
/// Unsigned: a DIF never needs negative addresses, and zero is a legal
/// address (assigned by the control plane like any other).
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct Address(pub u32);

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Quality of service class identifier.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct QosId(pub u16);

impl fmt::Display for QosId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Sequence number, monotonic per connection per direction.
///
/// Never allowed to wrap (§3); a u64 counter incremented at line rate will
/// not wrap within the lifetime of any connection (see the teacher's
/// constants module for the back-of-envelope argument this relies on).
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct SeqNum(pub u64);

impl SeqNum {
    /// Returns the successor sequence number.
    pub fn next(self) -> Self {
        SeqNum(self.0 + 1)
    }
}

impl fmt::Display for SeqNum {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

macro_rules! signed_handle {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, PartialOrd, Ord)]
        pub struct $name(pub i32);

        impl $name {
            /// The sentinel value for "no handle assigned".
            pub const INVALID: $name = $name(-1);

            /// A negative value is invalid, per the data model.
            pub fn is_valid(self) -> bool {
                self.0 >= 0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::INVALID
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

signed_handle!(PortId, "Handle to an N-1 flow bound to the RMT.");
signed_handle!(CepId, "Connection-endpoint id, scoped to one EFCP container.");

/// Identity of a connection's two endpoints (§3 "Connection" attributes,
/// minus the policy flags, which are configuration rather than identity).
///
/// Shared between the `dtp` and `dtcp` state machines so both can stamp
/// outgoing PCI headers without either owning the other's crate.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Endpoints {
    /// This node's address.
    pub src_addr: Address,
    /// The peer's address.
    pub dst_addr: Address,
    /// This endpoint's CEP-id.
    pub src_cep: CepId,
    /// The peer's CEP-id.
    pub dst_cep: CepId,
    /// Quality of service class of the connection.
    pub qos_id: QosId,
    /// The N-1 port this connection is bound to.
    pub port_id: PortId,
}
