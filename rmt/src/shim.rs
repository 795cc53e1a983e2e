//! The narrow interface RMT needs from whatever puts frames on a concrete
//! transport. The shim itself (UDP, a kernel netdev, a test-only in-memory
//! link) is an external collaborator out of scope for this core (§1, §6).
use addr::PortId;
use bytes::Bytes;
use std::io;

/// Downward interface from RMT to the shim bound to a given N-1 port.
pub trait Shim: Send + Sync {
    /// Hands an encoded PDU to the shim for transmission on `port`.
    fn sdu_write(&self, port: PortId, sdu: Bytes) -> io::Result<()>;

    /// Notifies the shim that `port` is being torn down.
    fn flow_deallocate(&self, _port: PortId) {}
}
