//! Neighbor cache and bitrate classification.
//!
//! One entry per recently heard peer: when it was last heard, the bitrate
//! its link quality supports and the last sequence number seen from it
//! (duplicate suppression). The cache is bounded; once full, the least
//! recently updated entry is reused.

use heapless::Vec;
use log::debug;

use crate::config::{DcfConfig, MAX_BITRATE_STEPS};
use crate::frame::Address;
use crate::SimTime;

/// Static bound on the configurable cache capacity
pub const MAX_NEIGHBORS: usize = 64;

/// Link information about one peer
#[derive(Clone, Debug, PartialEq)]
pub struct NeighborEntry {
    pub address: Address,
    pub last_seen: SimTime,
    pub bitrate: f64,
    pub last_sequence: Option<u16>,
}

/// Bounded cache of neighbor link state
#[derive(Clone, Debug)]
pub struct NeighborCache {
    entries: Vec<NeighborEntry, MAX_NEIGHBORS>,
    capacity: usize,
    max_age: SimTime,
    snr_thresholds: Vec<f64, MAX_BITRATE_STEPS>,
    bitrates: Vec<f64, MAX_BITRATE_STEPS>,
}

impl NeighborCache {
    pub fn new(config: &DcfConfig) -> Self {
        Self {
            entries: Vec::new(),
            capacity: config.neighbor_capacity,
            max_age: config.neighbor_max_age,
            snr_thresholds: config.snr_thresholds.clone(),
            bitrates: config.bitrates.clone(),
        }
    }

    /// Record a reception from `address` with the given link quality,
    /// refreshing or inserting its entry. Once the cache is at capacity the
    /// least recently updated entry is reused.
    pub fn observe(&mut self, address: Address, snr: f64, now: SimTime) {
        let bitrate = self.classify(snr);

        if let Some(entry) = self.entries.iter_mut().find(|e| e.address == address) {
            entry.last_seen = now;
            entry.bitrate = bitrate;
        } else if self.entries.len() < self.capacity {
            // capacity was validated against MAX_NEIGHBORS
            let _ = self.entries.push(NeighborEntry {
                address,
                last_seen: now,
                bitrate,
                last_sequence: None,
            });
        } else if let Some(entry) = self.oldest_mut() {
            entry.address = address;
            entry.last_seen = now;
            entry.bitrate = bitrate;
            entry.last_sequence = None;
        }

        debug!(
            "neighbor {} updated: snr {}, bitrate {} bit/s",
            address, snr, bitrate
        );
    }

    /// Cached bitrate estimate for a peer, or `None` when the peer is
    /// unknown or its entry is older than the staleness bound. Stale
    /// entries keep their cache slot.
    pub fn bitrate_of(&self, address: Address, now: SimTime) -> Option<f64> {
        self.entries
            .iter()
            .find(|e| e.address == address && now - e.last_seen < self.max_age)
            .map(|e| e.bitrate)
    }

    /// Duplicate check against the last sequence number recorded for the
    /// peer: a retry repeating it is a duplicate. New sequence numbers are
    /// recorded. `None` when the peer is not in the cache.
    pub fn check_duplicate(&mut self, address: Address, sequence: u16, retry: bool) -> Option<bool> {
        let entry = self.entries.iter_mut().find(|e| e.address == address)?;

        if retry && entry.last_sequence == Some(sequence) {
            return Some(true);
        }

        entry.last_sequence = Some(sequence);
        Some(false)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn entry(&self, address: Address) -> Option<&NeighborEntry> {
        self.entries.iter().find(|e| e.address == address)
    }

    /// The highest threshold cleared selects the matching bitrate step
    fn classify(&self, snr: f64) -> f64 {
        let mut bitrate = self.bitrates[0];
        for (threshold, candidate) in self.snr_thresholds.iter().zip(self.bitrates[1..].iter()) {
            if snr > *threshold {
                bitrate = *candidate;
            }
        }

        bitrate
    }

    fn oldest_mut(&mut self) -> Option<&mut NeighborEntry> {
        self.entries
            .iter_mut()
            .min_by(|a, b| a.last_seen.partial_cmp(&b.last_seen).unwrap())
    }
}
