//! DCF configuration.
//!
//! Defaults follow 802.11b DSSS timing. The full set is validated once at
//! construction; a machine is never built from an invalid configuration.

use heapless::Vec;

use crate::frame::{LENGTH_ACK, PHY_HEADER_BITS, HEADER_BITRATE};
use crate::neighbors::MAX_NEIGHBORS;
use crate::queue::MAX_QUEUE_CAPACITY;
use crate::SimTime;

/// Static bound on the number of bitrate steps
pub const MAX_BITRATE_STEPS: usize = 8;

/// Configuration for the DCF MAC
#[derive(Clone, Debug, PartialEq)]
pub struct DcfConfig {
    /// Maximum number of frames buffered for transmission
    pub queue_capacity: usize,

    /// Payload size above which the RTS/CTS handshake is used, bits
    pub rts_cts_threshold: u32,

    /// Retry budget for frames sent without RTS/CTS
    pub short_retry_limit: u16,

    /// Retry budget for frames sent with RTS/CTS
    pub long_retry_limit: u16,

    /// Minimum (initial) contention window, slots
    pub cw_min: u32,

    /// Maximum contention window, slots
    pub cw_max: u32,

    /// Backoff slot time, seconds
    pub slot_time: SimTime,

    /// Short interframe space, seconds
    pub sifs: SimTime,

    /// Distributed interframe space, seconds
    pub difs: SimTime,

    /// Extended interframe space used after a corrupted reception, seconds
    pub eifs: SimTime,

    /// Bitrate used when adaptive selection does not apply, bit/s
    pub default_bitrate: f64,

    /// Enable adaptive bitrate selection from the neighbor cache
    pub auto_bitrate: bool,

    /// Ascending SNR thresholds; clearing threshold `i` selects
    /// `bitrates[i + 1]`, clearing none selects `bitrates[0]`
    pub snr_thresholds: Vec<f64, MAX_BITRATE_STEPS>,

    /// Candidate bitrates, ascending, one more entry than `snr_thresholds`
    pub bitrates: Vec<f64, MAX_BITRATE_STEPS>,

    /// Maximum number of tracked neighbors
    pub neighbor_capacity: usize,

    /// Neighbor entries older than this answer as absent, seconds
    pub neighbor_max_age: SimTime,

    /// Fraction of a slot within which a suspended backoff is considered to
    /// land on a slot boundary and is rounded to the nearest whole slot
    /// instead of up
    pub slot_tolerance: f64,

    /// Transmit power stamped into outgoing signal descriptors, mW
    pub tx_power: f64,
}

impl Default for DcfConfig {
    fn default() -> Self {
        let slot_time = 20e-6;
        let sifs = 10e-6;
        let difs = 2.0 * slot_time + sifs;

        Self {
            queue_capacity: 10,
            rts_cts_threshold: 400,
            short_retry_limit: 7,
            long_retry_limit: 4,
            cw_min: 31,
            cw_max: 1023,
            slot_time,
            sifs,
            difs,
            eifs: sifs + difs + (PHY_HEADER_BITS + LENGTH_ACK) as f64 / HEADER_BITRATE,
            default_bitrate: 1.0e6,
            auto_bitrate: false,
            snr_thresholds: Vec::from_slice(&[10.0, 20.0, 40.0]).unwrap(),
            bitrates: Vec::from_slice(&[1.0e6, 2.0e6, 5.5e6, 11.0e6]).unwrap(),
            neighbor_capacity: 8,
            neighbor_max_age: 100.0,
            slot_tolerance: 1e-6,
            tx_power: 110.11,
        }
    }
}

/// Configuration faults detected by [`DcfConfig::validate`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigError {
    /// Queue capacity is zero or above the static bound
    QueueCapacity,
    /// Retry limit is zero
    RetryLimit,
    /// Contention window bounds are zero or inverted
    ContentionWindow,
    /// Slot time or an interframe space is non-positive, or the spaces are
    /// not ordered SIFS < DIFS <= EIFS
    Timing,
    /// Default bitrate is not one of the configured bitrate steps
    UnknownBitrate,
    /// Bitrate steps and SNR thresholds are missing, mismatched in length
    /// or not strictly ascending
    BitrateSteps,
    /// Neighbor cache capacity is zero or above the static bound, or the
    /// staleness bound is non-positive
    NeighborCache,
    /// Slot rounding tolerance is outside (0, 0.5)
    SlotTolerance,
}

impl DcfConfig {
    /// Check the full configuration surface. Called once at machine
    /// construction.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_capacity == 0 || self.queue_capacity > MAX_QUEUE_CAPACITY {
            return Err(ConfigError::QueueCapacity);
        }
        if self.short_retry_limit == 0 || self.long_retry_limit == 0 {
            return Err(ConfigError::RetryLimit);
        }
        if self.cw_min == 0 || self.cw_max < self.cw_min {
            return Err(ConfigError::ContentionWindow);
        }
        if self.slot_time <= 0.0
            || self.sifs <= 0.0
            || self.sifs >= self.difs
            || self.difs > self.eifs
        {
            return Err(ConfigError::Timing);
        }
        if self.bitrates.len() != self.snr_thresholds.len() + 1 {
            return Err(ConfigError::BitrateSteps);
        }
        if !ascending(&self.bitrates) || !ascending(&self.snr_thresholds) {
            return Err(ConfigError::BitrateSteps);
        }
        if !self.bitrates.iter().any(|b| *b == self.default_bitrate) {
            return Err(ConfigError::UnknownBitrate);
        }
        if self.neighbor_capacity == 0
            || self.neighbor_capacity > MAX_NEIGHBORS
            || self.neighbor_max_age <= 0.0
        {
            return Err(ConfigError::NeighborCache);
        }
        if self.slot_tolerance <= 0.0 || self.slot_tolerance >= 0.5 {
            return Err(ConfigError::SlotTolerance);
        }

        Ok(())
    }
}

fn ascending(values: &[f64]) -> bool {
    values.windows(2).all(|w| w[0] < w[1])
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert_eq!(DcfConfig::default().validate(), Ok(()));
    }

    #[test]
    fn rejects_bad_queue_capacity() {
        let mut c = DcfConfig::default();
        c.queue_capacity = 0;
        assert_eq!(c.validate(), Err(ConfigError::QueueCapacity));

        c.queue_capacity = MAX_QUEUE_CAPACITY + 1;
        assert_eq!(c.validate(), Err(ConfigError::QueueCapacity));
    }

    #[test]
    fn rejects_bad_retry_limits() {
        let mut c = DcfConfig::default();
        c.long_retry_limit = 0;
        assert_eq!(c.validate(), Err(ConfigError::RetryLimit));
    }

    #[test]
    fn rejects_inverted_contention_window() {
        let mut c = DcfConfig::default();
        c.cw_min = 63;
        c.cw_max = 31;
        assert_eq!(c.validate(), Err(ConfigError::ContentionWindow));
    }

    #[test]
    fn rejects_unordered_interframe_spaces() {
        let mut c = DcfConfig::default();
        c.difs = c.sifs / 2.0;
        assert_eq!(c.validate(), Err(ConfigError::Timing));

        let mut c = DcfConfig::default();
        c.eifs = c.difs / 2.0;
        assert_eq!(c.validate(), Err(ConfigError::Timing));
    }

    #[test]
    fn rejects_unknown_default_bitrate() {
        let mut c = DcfConfig::default();
        c.default_bitrate = 3.0e6;
        assert_eq!(c.validate(), Err(ConfigError::UnknownBitrate));
    }

    #[test]
    fn rejects_mismatched_bitrate_steps() {
        let mut c = DcfConfig::default();
        c.snr_thresholds.pop();
        assert_eq!(c.validate(), Err(ConfigError::BitrateSteps));

        let mut c = DcfConfig::default();
        c.snr_thresholds = Vec::from_slice(&[10.0, 9.0, 40.0]).unwrap();
        assert_eq!(c.validate(), Err(ConfigError::BitrateSteps));
    }

    #[test]
    fn rejects_bad_neighbor_cache() {
        let mut c = DcfConfig::default();
        c.neighbor_max_age = 0.0;
        assert_eq!(c.validate(), Err(ConfigError::NeighborCache));
    }

    #[test]
    fn rejects_bad_slot_tolerance() {
        let mut c = DcfConfig::default();
        c.slot_tolerance = 0.5;
        assert_eq!(c.validate(), Err(ConfigError::SlotTolerance));
    }
}
