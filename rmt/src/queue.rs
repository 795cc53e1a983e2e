//! Per-port queues and the single-runner worker pattern described in §4.2:
//! one ingress and one egress queue per bound N-1 port, a hash-map lock
//! guarding both the map and an `in_use` flag, and a worker that pops one
//! item per queue per pass until every queue is drained.
use addr::PortId;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

/// Default capacity of a single per-port queue before `push` starts
/// rejecting with backpressure.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Error returned by [`Queues::push`].
#[derive(Debug, Eq, PartialEq)]
pub enum PushError {
    /// No queue bound to this port.
    NoSuchPort,
    /// The port's queue is at capacity.
    QueueFull,
}

/// A hash map of per-port FIFOs, plus the single-runner guard for whichever
/// worker drains them.
pub struct Queues<T> {
    map: Mutex<HashMap<PortId, VecDeque<T>>>,
    in_use: AtomicBool,
    capacity: usize,
}

impl<T> Default for Queues<T> {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl<T> Queues<T> {
    /// Creates an empty set of queues with the given per-port capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            map: Mutex::new(HashMap::new()),
            in_use: AtomicBool::new(false),
            capacity,
        }
    }

    /// Binds a fresh, empty queue for `port`.
    pub fn bind(&self, port: PortId) {
        self.map.lock().entry(port).or_default();
    }

    /// Releases the queue bound to `port`, dropping anything still queued.
    pub fn unbind(&self, port: PortId) {
        self.map.lock().remove(&port);
    }

    /// Pushes `item` onto `port`'s queue.
    pub fn push(&self, port: PortId, item: T) -> Result<(), PushError> {
        let mut map = self.map.lock();
        match map.get_mut(&port) {
            Some(queue) if queue.len() < self.capacity => {
                queue.push_back(item);
                Ok(())
            }
            Some(_) => Err(PushError::QueueFull),
            None => Err(PushError::NoSuchPort),
        }
    }

    /// Returns whether every bound queue is currently empty.
    fn all_empty(&self) -> bool {
        self.map.lock().values().all(VecDeque::is_empty)
    }

    /// Pops exactly one item from each non-empty queue, visiting every
    /// bound port once. Returns the (port, item) pairs popped this pass.
    fn pop_one_per_queue(&self) -> Vec<(PortId, T)> {
        let mut map = self.map.lock();
        let mut popped = Vec::new();
        for (port, queue) in map.iter_mut() {
            if let Some(item) = queue.pop_front() {
                popped.push((*port, item));
            }
        }
        popped
    }
}

impl<T: Send + 'static> Queues<T> {
    /// Arms the single worker for these queues, unless one is already
    /// running. The worker repeatedly pops one item per bound queue and
    /// calls `process` on it (without holding the queue lock), looping until
    /// every queue is empty, then clears `in_use`.
    ///
    /// `process` runs on the spawned worker thread, never on the caller's.
    /// Per §4.2/§7, an error from `process` on one item must not abort the
    /// loop; it is the caller's `process` closure's responsibility to
    /// catch and log its own per-item errors, matching "worker processing
    /// errors are isolated to one item."
    pub fn arm_worker<Q>(self: &std::sync::Arc<Self>, mut process: Q)
    where
        Q: FnMut(PortId, T) + Send + 'static,
    {
        if self
            .in_use
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let queues = self.clone();
        thread::spawn(move || loop {
            let popped = queues.pop_one_per_queue();
            if popped.is_empty() {
                if queues.all_empty() {
                    queues.in_use.store(false, Ordering::SeqCst);
                    // Something may have been pushed between the emptiness
                    // check above and clearing the flag; if so, try to
                    // reclaim the worker slot rather than leave it starved.
                    if !queues.all_empty()
                        && queues
                            .in_use
                            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                            .is_ok()
                    {
                        continue;
                    }
                    break;
                }
                continue;
            }
            for (port, item) in popped {
                process(port, item);
            }
        });
    }
}
