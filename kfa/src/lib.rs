//! Kernel Flow Allocator: the per-port SDU queue and blocking read/write
//! interface between the EFCP core and whatever hands buffers to an
//! application (§5, §6).
//!
//! Flow allocation policy itself (naming, DIF enrollment, negotiating a
//! port-id with a peer) is explicitly out of scope (§1); the KIPCM is the
//! external collaborator that owns it. This crate only implements the
//! narrow slice of KFA the data-transfer core actually touches: a per-flow
//! queue of inbound SDUs, a condition variable a reader blocks on, and the
//! PENDING-state gate a writer blocks on, with cancellation waking blocked
//! callers rather than leaving them stuck.
#![deny(missing_docs)]
#![deny(warnings)]
use addr::PortId;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced at the KFA boundary.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum KfaError {
    /// Parameter error: no flow bound to this port.
    #[error("no flow bound to port {0}")]
    UnknownPort(i32),
    /// State error: the flow was deallocated while the caller was waiting,
    /// or had already been deallocated.
    #[error("flow on port {0} was deallocated")]
    Deallocated(i32),
    /// A cancellation signal woke the waiter before the flow was ready.
    #[error("wait on port {0} was cancelled")]
    Cancelled(i32),
}

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
enum Lifecycle {
    Pending,
    Allocated,
    Deallocated,
}

struct Flow {
    state: Lifecycle,
    queue: VecDeque<Bytes>,
    cancelled: bool,
}

struct FlowHandle {
    inner: Mutex<Flow>,
    cv: Condvar,
}

/// The kernel flow allocator's per-port flow table.
#[derive(Default)]
pub struct Kfa {
    flows: Mutex<HashMap<PortId, Arc<FlowHandle>>>,
}

impl Kfa {
    /// Creates an empty flow table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Commits a new flow in the PENDING state for `port`. Called by
    /// `flow_commit` once an N-1 port has been allocated but before the
    /// control plane has finished wiring the connection up.
    pub fn flow_commit(&self, port: PortId) {
        let handle = Arc::new(FlowHandle {
            inner: Mutex::new(Flow {
                state: Lifecycle::Pending,
                queue: VecDeque::new(),
                cancelled: false,
            }),
            cv: Condvar::new(),
        });
        self.flows.lock().unwrap().insert(port, handle);
    }

    /// Transitions `port` out of PENDING, waking any blocked writer.
    pub fn flow_arrived(&self, port: PortId) -> Result<(), KfaError> {
        let handle = self.handle(port)?;
        let mut flow = handle.inner.lock().unwrap();
        flow.state = Lifecycle::Allocated;
        handle.cv.notify_all();
        Ok(())
    }

    /// Deallocates the flow on `port`, waking every blocked reader and
    /// writer before the flow is torn down, per §5's cancellation rule.
    pub fn flow_dealloc(&self, port: PortId) {
        if let Some(handle) = self.flows.lock().unwrap().remove(&port) {
            let mut flow = handle.inner.lock().unwrap();
            flow.state = Lifecycle::Deallocated;
            handle.cv.notify_all();
        }
    }

    /// Delivers an inbound SDU to the queue for `port`, waking a blocked
    /// reader. Called by DTP's receive path once a PDU has been reassembled
    /// into an SDU.
    pub fn sdu_post(&self, port: PortId, sdu: Bytes) -> Result<(), KfaError> {
        let handle = self.handle(port)?;
        let mut flow = handle.inner.lock().unwrap();
        if flow.state == Lifecycle::Deallocated {
            return Err(KfaError::Deallocated(port.0));
        }
        flow.queue.push_back(sdu);
        handle.cv.notify_all();
        Ok(())
    }

    /// Blocks until `port`'s flow leaves PENDING, then returns. Used by the
    /// write path before handing an SDU down to EFCP.
    pub fn flow_sdu_write_wait(&self, port: PortId) -> Result<(), KfaError> {
        let handle = self.handle(port)?;
        let mut flow = handle.inner.lock().unwrap();
        while flow.state == Lifecycle::Pending && !flow.cancelled {
            flow = handle.cv.wait(flow).unwrap();
        }
        if flow.cancelled {
            return Err(KfaError::Cancelled(port.0));
        }
        if flow.state == Lifecycle::Deallocated {
            return Err(KfaError::Deallocated(port.0));
        }
        Ok(())
    }

    /// Blocks until an SDU is available on `port` (or the flow is torn
    /// down), then pops and returns it.
    pub fn flow_sdu_read(&self, port: PortId) -> Result<Bytes, KfaError> {
        let handle = self.handle(port)?;
        let mut flow = handle.inner.lock().unwrap();
        loop {
            if let Some(sdu) = flow.queue.pop_front() {
                return Ok(sdu);
            }
            if flow.cancelled {
                return Err(KfaError::Cancelled(port.0));
            }
            if flow.state == Lifecycle::Deallocated {
                return Err(KfaError::Deallocated(port.0));
            }
            flow = handle.cv.wait(flow).unwrap();
        }
    }

    /// Same as [`Kfa::flow_sdu_read`], but gives up after `timeout` with
    /// `Ok(None)` instead of blocking forever. Used by polling management
    /// readers (`mgmt_sdu_read`) that must not wedge a thread indefinitely.
    pub fn flow_sdu_read_timeout(
        &self,
        port: PortId,
        timeout: Duration,
    ) -> Result<Option<Bytes>, KfaError> {
        let handle = self.handle(port)?;
        let mut flow = handle.inner.lock().unwrap();
        loop {
            if let Some(sdu) = flow.queue.pop_front() {
                return Ok(Some(sdu));
            }
            if flow.cancelled {
                return Err(KfaError::Cancelled(port.0));
            }
            if flow.state == Lifecycle::Deallocated {
                return Err(KfaError::Deallocated(port.0));
            }
            let (guard, timeout_result) = handle.cv.wait_timeout(flow, timeout).unwrap();
            flow = guard;
            if timeout_result.timed_out() {
                return Ok(flow.queue.pop_front());
            }
        }
    }

    /// Delivers a cancellation signal to any waiter blocked on `port`.
    pub fn cancel(&self, port: PortId) -> Result<(), KfaError> {
        let handle = self.handle(port)?;
        let mut flow = handle.inner.lock().unwrap();
        flow.cancelled = true;
        handle.cv.notify_all();
        Ok(())
    }

    fn handle(&self, port: PortId) -> Result<Arc<FlowHandle>, KfaError> {
        self.flows
            .lock()
            .unwrap()
            .get(&port)
            .cloned()
            .ok_or(KfaError::UnknownPort(port.0))
    }
}
