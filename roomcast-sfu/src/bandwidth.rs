//! REMB aggregation
//!
//! Each subscriber reports the bitrate it can take for the streams it
//! receives. A publisher's encoder has to satisfy all of them, so the value
//! sent upstream is the minimum over every subscriber of that SSRC.

use std::collections::HashMap;

use crate::types::ClientId;

/// Minimum bound over the latest report of every receiver of one SSRC
#[derive(Debug, Default)]
pub struct BandwidthEstimator {
    estimates: HashMap<ClientId, u64>,
    min_bitrate: Option<u64>,
}

impl BandwidthEstimator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a receiver's report and return the bound across all receivers.
    ///
    /// Rooms are small, so the minimum is recomputed by a full scan.
    pub fn estimate(&mut self, receiver: &ClientId, bitrate: u64) -> u64 {
        self.estimates.insert(receiver.clone(), bitrate);
        let min = self.estimates.values().copied().min().unwrap_or(bitrate);
        self.min_bitrate = Some(min);
        min
    }

    /// Forget a receiver. The cached bound is left alone and only moves on
    /// the next report from any remaining receiver.
    pub fn remove_estimation(&mut self, receiver: &ClientId) {
        self.estimates.remove(receiver);
    }

    /// Bound computed by the last `estimate` call
    #[must_use]
    pub const fn current(&self) -> Option<u64> {
        self.min_bitrate
    }

    #[must_use]
    pub fn receiver_count(&self) -> usize {
        self.estimates.len()
    }
}

/// Estimators for every forwarded SSRC of a room
#[derive(Debug, Default)]
pub struct TrackBitrateEstimators {
    by_ssrc: HashMap<u32, BandwidthEstimator>,
}

impl TrackBitrateEstimators {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one REMB report to every SSRC it names.
    ///
    /// A single report usually covers several SSRCs of one encoding, and the
    /// returned bound has to hold for all of them. With no SSRCs the reported
    /// bitrate comes back unchanged.
    pub fn estimate(&mut self, receiver: &ClientId, ssrcs: &[u32], bitrate: u64) -> u64 {
        ssrcs
            .iter()
            .map(|ssrc| {
                self.by_ssrc
                    .entry(*ssrc)
                    .or_default()
                    .estimate(receiver, bitrate)
            })
            .min()
            .unwrap_or(bitrate)
    }

    /// Drop a departed receiver from every SSRC
    pub fn remove_receiver_estimations(&mut self, receiver: &ClientId) {
        for estimator in self.by_ssrc.values_mut() {
            estimator.remove_estimation(receiver);
        }
    }

    /// Drop the estimator of a removed track
    pub fn remove(&mut self, ssrc: u32) {
        self.by_ssrc.remove(&ssrc);
    }

    #[must_use]
    pub fn get(&self, ssrc: u32) -> Option<&BandwidthEstimator> {
        self.by_ssrc.get(&ssrc)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_ssrc.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_ssrc.is_empty()
    }
}
