//! Retry and backoff engine.
//!
//! Tracks the contention window, the short/long retry counters and the
//! currently pending backoff duration. Independent of the protocol state
//! machine: it only does the arithmetic.

use log::{debug, trace};
use rand_core::RngCore;

use crate::config::DcfConfig;
use crate::SimTime;

/// Contention-window growth, random backoff draws and retry accounting
#[derive(Clone, Debug, PartialEq)]
pub struct BackoffEngine {
    cw_min: u32,
    cw_max: u32,
    slot_time: SimTime,
    slot_tolerance: f64,
    short_limit: u16,
    long_limit: u16,

    short_retries: u16,
    long_retries: u16,

    /// Backoff still owed to the channel before the next transmission.
    /// Survives contention suspension and post-transmission draws.
    remaining: SimTime,
}

impl BackoffEngine {
    pub fn new(config: &DcfConfig) -> Self {
        Self {
            cw_min: config.cw_min,
            cw_max: config.cw_max,
            slot_time: config.slot_time,
            slot_tolerance: config.slot_tolerance,
            short_limit: config.short_retry_limit,
            long_limit: config.long_retry_limit,

            short_retries: 0,
            long_retries: 0,

            remaining: 0.0,
        }
    }

    /// Contention window for a given retry count:
    /// `min((cw_min + 1) << r - 1, cw_max)`
    pub fn contention_window(&self, retry_count: u16) -> u32 {
        let grown = (self.cw_min as u64 + 1)
            .checked_shl(retry_count as u32)
            .map(|w| w - 1)
            .unwrap_or(self.cw_max as u64);

        grown.min(self.cw_max as u64) as u32
    }

    /// Draw a fresh backoff for a given retry count: a slot count uniform
    /// in `[0, cw]` times the slot time
    pub fn compute_backoff<R: RngCore>(&self, rng: &mut R, retry_count: u16) -> SimTime {
        let cw = self.contention_window(retry_count);
        let slots = rng.next_u32() as u64 % (cw as u64 + 1);

        slots as SimTime * self.slot_time
    }

    /// Draw for the current counters and hold the result as the pending
    /// backoff for the next contention
    pub fn draw<R: RngCore>(&mut self, rng: &mut R, rtscts: bool) -> SimTime {
        let rc = if rtscts {
            self.long_retries
        } else {
            self.short_retries
        };

        self.remaining = self.compute_backoff(rng, rc);
        trace!("drew backoff of {} s at retry count {}", self.remaining, rc);

        self.remaining
    }

    pub fn remaining(&self) -> SimTime {
        self.remaining
    }

    /// The pending backoff has been fully served
    pub fn clear_remaining(&mut self) {
        self.remaining = 0.0;
    }

    /// Count a failed attempt against the matching budget
    pub fn record_failure(&mut self, rtscts: bool) {
        if rtscts {
            self.long_retries += 1;
        } else {
            self.short_retries += 1;
        }
    }

    pub fn short_retries(&self) -> u16 {
        self.short_retries
    }

    pub fn long_retries(&self) -> u16 {
        self.long_retries
    }

    /// True once either budget is exhausted and the current attempt must be
    /// abandoned
    pub fn limit_reached(&self) -> bool {
        self.short_retries >= self.short_limit || self.long_retries >= self.long_limit
    }

    pub fn reset_retries(&mut self) {
        self.short_retries = 0;
        self.long_retries = 0;
    }

    pub fn reset_short(&mut self) {
        self.short_retries = 0;
    }

    /// Credit the elapsed quiet time of an interrupted contention against
    /// the pending backoff.
    ///
    /// `sense_timeout` is the full window that was being sensed
    /// (`ifs + backoff`), `quiet_time` how much of it passed idle. Quiet
    /// time below the IFS consumed no backoff and leaves the draw
    /// untouched. Otherwise the remainder is converted to slots and rounded
    /// to the nearest whole slot when within `slot_tolerance` of an
    /// integral count (float noise at a slot boundary), else up, so a
    /// mid-slot interruption repeats the partial slot.
    pub fn suspend(&mut self, sense_timeout: SimTime, quiet_time: SimTime, ifs: SimTime) {
        if quiet_time < ifs {
            debug!("contention suspended during IFS, backoff untouched");
            return;
        }

        let remaining_slots = (sense_timeout - quiet_time) / self.slot_time;

        let aligned = (remaining_slots.ceil() - remaining_slots).abs() < self.slot_tolerance
            || (remaining_slots - remaining_slots.floor()).abs() < self.slot_tolerance;

        let slots = if aligned {
            (remaining_slots + 0.5).floor()
        } else {
            remaining_slots.ceil()
        };

        self.remaining = slots * self.slot_time;

        debug!(
            "contention suspended after {} s quiet, {} slots of backoff remain",
            quiet_time, slots
        );
    }
}
