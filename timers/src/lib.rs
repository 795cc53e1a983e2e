//! A cancellable, rearmable interval timer.
//!
//! §4.4/§4.5 of the specification names four kinds of timer (sender
//! inactivity, receiver inactivity, the A-timer, and the DTCP retransmission
//! timer), each of which is stopped, possibly rearmed to a new interval, and
//! whose expiry must run a policy callback on a background thread without
//! blocking the caller.
//!
//! The teacher's `dtcp::Timer` (`dtcp/src/lib.rs`) only ever answers "did you
//! expire since I last started you" when polled from `send`/`recv`; it
//! never runs code on expiry. The spec's A-timer and inactivity timers must
//! actively fire a handler with nothing polling them, so this generalizes
//! the teacher's start/stop timer into one that arms a background thread per
//! interval and uses a generation counter to make a stale firing a no-op,
//! which is the standard cancel-safe pattern for a rearmable timer.
#![deny(missing_docs)]
#![deny(warnings)]
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// A single rearmable timer.
///
/// Cloning an `IntervalTimer` shares the same generation counter: canceling
/// or rearming through any clone affects all of them. This lets a timer be
/// armed from inside a lock and observed from the background thread without
/// holding that lock.
#[derive(Clone)]
pub struct IntervalTimer {
    generation: Arc<AtomicU64>,
}

impl IntervalTimer {
    /// Creates a disarmed timer.
    pub fn new() -> Self {
        Self {
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Cancels any pending firing without arming a new one.
    pub fn cancel(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Arms the timer to fire `on_expiry` after `interval`, replacing any
    /// previously armed firing (which becomes a silent no-op).
    pub fn arm<F>(&self, interval: Duration, on_expiry: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let expected = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let generation = self.generation.clone();
        thread::spawn(move || {
            thread::sleep(interval);
            if generation.compare_exchange(
                expected,
                expected,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) == Ok(expected)
            {
                on_expiry();
            } else {
                log::trace!("timer firing superseded, dropping");
            }
        });
    }
}

impl Default for IntervalTimer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn fires_after_interval() {
        let timer = IntervalTimer::new();
        let (tx, rx) = mpsc::channel();
        timer.arm(Duration::from_millis(10), move || {
            tx.send(()).unwrap();
        });
        rx.recv_timeout(Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn rearming_supersedes_previous_firing() {
        let timer = IntervalTimer::new();
        let (tx, rx) = mpsc::channel::<u32>();
        let tx1 = tx.clone();
        timer.arm(Duration::from_millis(5), move || {
            tx1.send(1).unwrap();
        });
        // Rearm before the first can fire.
        timer.arm(Duration::from_millis(30), move || {
            tx.send(2).unwrap();
        });
        let got = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(got, 2);
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    }

    #[test]
    fn cancel_suppresses_firing() {
        let timer = IntervalTimer::new();
        let (tx, rx) = mpsc::channel::<()>();
        timer.arm(Duration::from_millis(5), move || {
            tx.send(()).unwrap();
        });
        timer.cancel();
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    }
}
