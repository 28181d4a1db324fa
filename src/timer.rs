//! Host scheduler interface.
//!
//! The MAC never blocks; every wait is a value-based scheduling request
//! against the host's event queue. Requests return an opaque handle that
//! can be cancelled exactly once; expiries come back through the MAC's
//! `handle_timer`.

use crate::SimTime;

/// Timer kinds the MAC schedules
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
pub enum TimerKind {
    /// CTS or ACK response timeout
    Timeout,
    /// NAV deferral expiry
    Nav,
}

/// Handle identifying a scheduled timer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimerHandle(pub u64);

/// Scheduler collaborator interface, provided by the simulation host
pub trait Scheduler {
    /// Current simulated time
    fn now(&self) -> SimTime;

    /// Schedule a wake-up `delay` from now; the host later calls the MAC's
    /// `handle_timer` with the same kind unless the handle is cancelled
    fn schedule_after(&mut self, delay: SimTime, kind: TimerKind) -> TimerHandle;

    /// Cancel a scheduled wake-up; a cancelled timer never fires, even when
    /// cancellation and expiry fall into the same time quantum
    fn cancel(&mut self, handle: TimerHandle);
}

#[cfg(any(test, feature = "mocks"))]
pub mod mock {
    use std::sync::{Arc, Mutex};
    use std::vec::Vec;

    use super::*;

    #[derive(Debug)]
    struct Inner {
        now: SimTime,
        next_handle: u64,
        armed: Vec<(TimerHandle, TimerKind, SimTime)>,
        cancelled: Vec<TimerHandle>,
    }

    /// Mock scheduler; clones share state so tests can advance time and
    /// inspect what the MAC armed
    #[derive(Clone, Debug)]
    pub struct MockScheduler(Arc<Mutex<Inner>>);

    impl MockScheduler {
        pub fn new() -> Self {
            Self(Arc::new(Mutex::new(Inner {
                now: 0.0,
                next_handle: 1,
                armed: Vec::new(),
                cancelled: Vec::new(),
            })))
        }

        pub fn set_now(&self, now: SimTime) {
            self.0.lock().unwrap().now = now;
        }

        pub fn advance(&self, delta: SimTime) {
            self.0.lock().unwrap().now += delta;
        }

        /// Currently scheduled timers as `(handle, kind, fire_time)`
        pub fn armed(&self) -> Vec<(TimerHandle, TimerKind, SimTime)> {
            self.0.lock().unwrap().armed.clone()
        }

        /// Drain the scheduled timers
        pub fn take_armed(&self) -> Vec<(TimerHandle, TimerKind, SimTime)> {
            std::mem::take(&mut self.0.lock().unwrap().armed)
        }

        pub fn cancelled(&self) -> Vec<TimerHandle> {
            self.0.lock().unwrap().cancelled.clone()
        }
    }

    impl Scheduler for MockScheduler {
        fn now(&self) -> SimTime {
            self.0.lock().unwrap().now
        }

        fn schedule_after(&mut self, delay: SimTime, kind: TimerKind) -> TimerHandle {
            let mut inner = self.0.lock().unwrap();
            let handle = TimerHandle(inner.next_handle);
            inner.next_handle += 1;
            let at = inner.now + delay;
            inner.armed.push((handle, kind, at));
            handle
        }

        fn cancel(&mut self, handle: TimerHandle) {
            let mut inner = self.0.lock().unwrap();
            inner.armed.retain(|(h, _, _)| *h != handle);
            inner.cancelled.push(handle);
        }
    }
}
