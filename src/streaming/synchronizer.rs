// Cross-channel alignment of front and reference sample blocks
//
// Two policies are supported:
// - Index: pair the latest block of each channel sample-for-sample (the sender
//   transmits in lockstep). O(1) per block, no time-domain correction.
// - Timestamp: every sample gets an absolute time from its block's start and
//   rate; buffers are paired when their heads agree within a tolerance.
//
// Either policy can be followed by cross-correlation drift compensation.

use super::drift::{apply_lag, estimate_lag};
use super::types::{StreamError, StreamResult};
use crate::codec::{SampleBlock, FRONT_CHANNEL, REFERENCE_CHANNEL};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::str::FromStr;
use tracing::{debug, warn};

/// How contemporaneous samples are identified
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlignmentPolicy {
    Index,
    Timestamp,
}

impl Default for AlignmentPolicy {
    fn default() -> Self {
        Self::Index
    }
}

impl FromStr for AlignmentPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(s.trim().to_lowercase()))
            .map_err(|_| format!("unknown alignment policy '{}' (index, timestamp)", s))
    }
}

/// Synchronizer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynchronizerConfig {
    pub policy: AlignmentPolicy,
    /// Maximum head-timestamp difference for pairing (timestamp policy)
    pub tolerance_ms: f64,
    /// Buffered span of the leading channel before unmatched samples of the
    /// other channel are given up on (timestamp policy)
    pub retention_ms: f64,
    /// Per-channel cap; oldest samples are evicted above it
    pub max_buffered_samples: usize,
    /// Enable cross-correlation lag correction
    pub drift_compensation: bool,
    pub max_lag_samples: usize,
}

impl Default for SynchronizerConfig {
    fn default() -> Self {
        Self {
            policy: AlignmentPolicy::Index,
            tolerance_ms: 20.0,
            retention_ms: 1000.0,
            max_buffered_samples: 5000,
            drift_compensation: false,
            max_lag_samples: 10,
        }
    }
}

/// Equal-length front/reference samples with their absolute times (ms)
#[derive(Debug, Clone, PartialEq)]
pub struct AlignedPair {
    front: Vec<f32>,
    reference: Vec<f32>,
    timestamps: Vec<f64>,
}

impl AlignedPair {
    /// Returns `None` unless all three sequences are non-empty and equally long
    pub fn new(front: Vec<f32>, reference: Vec<f32>, timestamps: Vec<f64>) -> Option<Self> {
        let n = front.len();
        if n == 0 || reference.len() != n || timestamps.len() != n {
            return None;
        }
        Some(Self {
            front,
            reference,
            timestamps,
        })
    }

    pub fn len(&self) -> usize {
        self.front.len()
    }

    pub fn is_empty(&self) -> bool {
        self.front.is_empty()
    }

    pub fn front(&self) -> &[f32] {
        &self.front
    }

    pub fn reference(&self) -> &[f32] {
        &self.reference
    }

    pub fn timestamps(&self) -> &[f64] {
        &self.timestamps
    }

    pub fn into_parts(self) -> (Vec<f32>, Vec<f32>, Vec<f64>) {
        (self.front, self.reference, self.timestamps)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Channel {
    Front,
    Reference,
}

impl Channel {
    fn from_device(device_id: u8) -> StreamResult<Self> {
        match device_id {
            FRONT_CHANNEL => Ok(Channel::Front),
            REFERENCE_CHANNEL => Ok(Channel::Reference),
            other => Err(StreamError::UnknownDevice(other)),
        }
    }
}

/// Per-session channel buffers and pairing logic
#[derive(Debug)]
pub struct ChannelSynchronizer {
    config: SynchronizerConfig,

    // Index policy: latest unpaired block per channel
    latest_front: Option<SampleBlock>,
    latest_reference: Option<SampleBlock>,

    // Timestamp policy: (time_ms, value) queues
    front: VecDeque<(f64, f32)>,
    reference: VecDeque<(f64, f32)>,

    evicted_samples: u64,
    front_overflows: usize,
    reference_overflows: usize,
}

impl ChannelSynchronizer {
    pub fn new(config: SynchronizerConfig) -> Self {
        Self {
            config,
            latest_front: None,
            latest_reference: None,
            front: VecDeque::new(),
            reference: VecDeque::new(),
            evicted_samples: 0,
            front_overflows: 0,
            reference_overflows: 0,
        }
    }

    pub fn config(&self) -> &SynchronizerConfig {
        &self.config
    }

    /// Total samples discarded without being paired
    pub fn evicted_samples(&self) -> u64 {
        self.evicted_samples
    }

    /// Longest current run of overflowing pushes on either channel.
    ///
    /// A channel's run ends with its own push that stays under the cap, or
    /// when a pair is emitted.
    pub fn consecutive_overflows(&self) -> usize {
        self.front_overflows.max(self.reference_overflows)
    }

    /// Samples currently waiting for a partner
    pub fn pending_samples(&self) -> usize {
        self.latest_front.as_ref().map_or(0, |b| b.len())
            + self.latest_reference.as_ref().map_or(0, |b| b.len())
            + self.front.len()
            + self.reference.len()
    }

    /// Buffer a block; returns an aligned pair once both channels line up.
    ///
    /// Blocks from devices other than front/reference are rejected without
    /// touching any buffer.
    pub fn push(&mut self, block: SampleBlock) -> StreamResult<Option<AlignedPair>> {
        let channel = Channel::from_device(block.device_id)?;

        let pair = match self.config.policy {
            AlignmentPolicy::Index => self.push_index(channel, block),
            AlignmentPolicy::Timestamp => self.push_timestamp(channel, block),
        };

        Ok(pair.and_then(|pair| self.compensate_drift(pair)))
    }

    /// Discard everything still buffered; returns the number of samples dropped
    pub fn drain(&mut self) -> usize {
        let pending = self.pending_samples();
        self.latest_front = None;
        self.latest_reference = None;
        self.front.clear();
        self.reference.clear();
        pending
    }

    fn push_index(&mut self, channel: Channel, block: SampleBlock) -> Option<AlignedPair> {
        let slot = match channel {
            Channel::Front => &mut self.latest_front,
            Channel::Reference => &mut self.latest_reference,
        };

        if let Some(stale) = slot.replace(block) {
            debug!(
                "Replacing unpaired {:?} block ({} samples) with a newer one",
                channel,
                stale.len()
            );
            self.evicted_samples += stale.len() as u64;
        }

        if self.latest_front.is_none() || self.latest_reference.is_none() {
            return None;
        }

        let mut front = self.latest_front.take()?;
        let mut reference = self.latest_reference.take()?;

        let n = front.len().min(reference.len());
        if front.len() != reference.len() {
            debug!(
                "Truncating unequal blocks (front {}, reference {}) to {}",
                front.len(),
                reference.len(),
                n
            );
        }
        front.samples.truncate(n);
        reference.samples.truncate(n);

        let timestamps = (0..n).map(|i| front.sample_time(i)).collect();
        AlignedPair::new(front.samples, reference.samples, timestamps)
    }

    fn push_timestamp(&mut self, channel: Channel, block: SampleBlock) -> Option<AlignedPair> {
        let cap = self.config.max_buffered_samples;
        let (buffer, overflows) = match channel {
            Channel::Front => (&mut self.front, &mut self.front_overflows),
            Channel::Reference => (&mut self.reference, &mut self.reference_overflows),
        };

        buffer.extend(
            block
                .samples
                .iter()
                .enumerate()
                .map(|(i, &v)| (block.sample_time(i), v)),
        );

        if buffer.len() > cap {
            let excess = buffer.len() - cap;
            buffer.drain(..excess);
            *overflows += 1;
            warn!(
                "{:?} buffer exceeded {} samples, evicted {} oldest (overflow #{} in a row)",
                channel, cap, excess, *overflows
            );
            self.evicted_samples += excess as u64;
        } else {
            *overflows = 0;
        }

        let pair = self.align_timestamps();
        if pair.is_some() {
            self.front_overflows = 0;
            self.reference_overflows = 0;
        }
        pair
    }

    fn align_timestamps(&mut self) -> Option<AlignedPair> {
        let tolerance = self.config.tolerance_ms;

        loop {
            let front_head = self.front.front()?.0;
            let reference_head = self.reference.front()?.0;

            if (front_head - reference_head).abs() <= tolerance {
                let n = self.front.len().min(self.reference.len());
                let mut timestamps = Vec::with_capacity(n);
                let mut front = Vec::with_capacity(n);
                for (t, v) in self.front.drain(..n) {
                    timestamps.push(t);
                    front.push(v);
                }
                let reference = self.reference.drain(..n).map(|(_, v)| v).collect();
                return AlignedPair::new(front, reference, timestamps);
            }

            // The channel with the earlier head holds samples the other channel
            // has already moved past. Keep them until the later channel has
            // buffered a full retention window, then give up on them.
            let (earlier, later, earlier_channel) = if front_head < reference_head {
                (&mut self.front, &self.reference, Channel::Front)
            } else {
                (&mut self.reference, &self.front, Channel::Reference)
            };

            let later_head = later.front()?.0;
            let later_span = later.back()?.0 - later_head;
            if later_span < self.config.retention_ms {
                return None;
            }

            let cutoff = later_head - tolerance;
            let stale = earlier.iter().take_while(|(t, _)| *t < cutoff).count();
            if stale == 0 {
                return None;
            }
            earlier.drain(..stale);
            self.evicted_samples += stale as u64;
            warn!(
                "Alignment timeout: dropped {} unmatched {:?} samples older than {:.1} ms",
                stale, earlier_channel, cutoff
            );
        }
    }

    fn compensate_drift(&self, pair: AlignedPair) -> Option<AlignedPair> {
        if !self.config.drift_compensation {
            return Some(pair);
        }

        let lag = estimate_lag(pair.front(), pair.reference(), self.config.max_lag_samples);
        if lag == 0 {
            return Some(pair);
        }

        debug!("Compensating reference lag of {} samples", lag);
        let (front, reference, timestamps) = pair.into_parts();
        let (front, reference, timestamps) = apply_lag(front, reference, timestamps, lag);
        AlignedPair::new(front, reference, timestamps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(device_id: u8, timestamp_start: i64, len: usize, value: f32) -> SampleBlock {
        SampleBlock {
            device_id,
            timestamp_start,
            sample_rate: 250,
            samples: vec![value; len],
        }
    }

    fn timestamp_sync(tolerance_ms: f64) -> ChannelSynchronizer {
        ChannelSynchronizer::new(SynchronizerConfig {
            policy: AlignmentPolicy::Timestamp,
            tolerance_ms,
            ..Default::default()
        })
    }

    #[test]
    fn test_index_alignment_truncates_to_shorter_block() {
        let mut sync = ChannelSynchronizer::new(SynchronizerConfig::default());

        assert!(sync.push(block(1, 1000, 100, 5.0)).unwrap().is_none());
        let pair = sync.push(block(2, 1000, 80, 1.0)).unwrap().unwrap();

        assert_eq!(pair.len(), 80);
        assert_eq!(pair.front().len(), 80);
        assert_eq!(pair.reference().len(), 80);
        assert_eq!(pair.timestamps().len(), 80);
        assert_eq!(pair.timestamps()[1], 1004.0);
        assert_eq!(sync.pending_samples(), 0);
    }

    #[test]
    fn test_index_alignment_keeps_latest_block() {
        let mut sync = ChannelSynchronizer::new(SynchronizerConfig::default());

        assert!(sync.push(block(1, 1000, 10, 1.0)).unwrap().is_none());
        assert!(sync.push(block(1, 1040, 10, 2.0)).unwrap().is_none());
        assert_eq!(sync.evicted_samples(), 10);

        let pair = sync.push(block(2, 1040, 10, 0.0)).unwrap().unwrap();
        assert!(pair.front().iter().all(|&v| v == 2.0));
    }

    #[test]
    fn test_unknown_device_is_rejected_without_mutation() {
        let mut sync = ChannelSynchronizer::new(SynchronizerConfig::default());
        sync.push(block(1, 0, 10, 1.0)).unwrap();

        let err = sync.push(block(7, 0, 10, 1.0)).unwrap_err();
        assert!(matches!(err, StreamError::UnknownDevice(7)));
        assert_eq!(sync.pending_samples(), 10);
    }

    #[test]
    fn test_timestamp_alignment_respects_tolerance() {
        let mut strict = timestamp_sync(20.0);
        assert!(strict.push(block(1, 1000, 250, 1.0)).unwrap().is_none());
        assert!(strict.push(block(2, 1025, 250, 1.0)).unwrap().is_none());
        assert_eq!(strict.pending_samples(), 500);

        let mut loose = timestamp_sync(30.0);
        assert!(loose.push(block(1, 1000, 250, 1.0)).unwrap().is_none());
        let pair = loose.push(block(2, 1025, 250, 1.0)).unwrap().unwrap();
        assert_eq!(pair.len(), 250);
        assert_eq!(pair.timestamps()[0], 1000.0);
        assert_eq!(loose.pending_samples(), 0);
    }

    #[test]
    fn test_timestamp_alignment_consumes_overlap_only() {
        let mut sync = timestamp_sync(20.0);
        sync.push(block(1, 1000, 100, 1.0)).unwrap();
        let pair = sync.push(block(2, 1002, 60, 1.0)).unwrap().unwrap();

        assert_eq!(pair.len(), 60);
        assert_eq!(sync.pending_samples(), 40);

        // Remaining front samples pair with the next reference block
        let pair = sync.push(block(2, 1242, 40, 1.0)).unwrap().unwrap();
        assert_eq!(pair.len(), 40);
        assert_eq!(pair.timestamps()[0], 1240.0);
    }

    #[test]
    fn test_unmatched_head_is_evicted_after_retention() {
        let mut sync = ChannelSynchronizer::new(SynchronizerConfig {
            policy: AlignmentPolicy::Timestamp,
            tolerance_ms: 20.0,
            retention_ms: 400.0,
            ..Default::default()
        });

        // Front starts 100 ms before the reference ever does
        sync.push(block(1, 900, 125, 1.0)).unwrap();
        sync.push(block(2, 1000, 50, 1.0)).unwrap();
        assert!(sync.evicted_samples() == 0);

        // Reference span now exceeds the retention window
        let pair = sync.push(block(2, 1200, 75, 1.0)).unwrap().unwrap();
        assert!(sync.evicted_samples() > 0);
        assert!((pair.timestamps()[0] - 1000.0).abs() <= 20.0);
    }

    #[test]
    fn test_stalled_channel_is_bounded() {
        let mut sync = ChannelSynchronizer::new(SynchronizerConfig {
            policy: AlignmentPolicy::Timestamp,
            max_buffered_samples: 500,
            ..Default::default()
        });

        for i in 0..10 {
            assert!(sync.push(block(1, i * 1000, 250, 1.0)).unwrap().is_none());
        }

        assert_eq!(sync.pending_samples(), 500);
        assert_eq!(sync.evicted_samples(), 2000);
        assert_eq!(sync.consecutive_overflows(), 8);
    }

    #[test]
    fn test_overflow_run_survives_other_channel_pushes() {
        let mut sync = ChannelSynchronizer::new(SynchronizerConfig {
            policy: AlignmentPolicy::Timestamp,
            max_buffered_samples: 500,
            ..Default::default()
        });

        // Reference clock a minute behind the front: its samples always time
        // out, while the front buffer overflows on every push past the cap
        for i in 0..100 {
            assert!(sync.push(block(1, 100_000 + i * 1000, 250, 1.0)).unwrap().is_none());
            assert!(sync.push(block(2, 40_000 + i * 1000, 250, 1.0)).unwrap().is_none());
        }

        assert_eq!(sync.consecutive_overflows(), 98);
    }

    #[test]
    fn test_emitted_pair_resets_overflow_run() {
        let mut sync = ChannelSynchronizer::new(SynchronizerConfig {
            policy: AlignmentPolicy::Timestamp,
            max_buffered_samples: 500,
            ..Default::default()
        });

        for i in 0..4 {
            sync.push(block(1, i * 1000, 250, 1.0)).unwrap();
        }
        assert_eq!(sync.consecutive_overflows(), 2);

        // Front buffer now starts at t=2000
        assert!(sync.push(block(2, 2000, 250, 1.0)).unwrap().is_some());
        assert_eq!(sync.consecutive_overflows(), 0);
    }

    #[test]
    fn test_drift_compensation_shortens_pair() {
        let mut sync = ChannelSynchronizer::new(SynchronizerConfig {
            drift_compensation: true,
            max_lag_samples: 8,
            ..Default::default()
        });

        let base: Vec<f32> = (0..300)
            .map(|i| ((i * i) % 37) as f32 - 18.0)
            .collect();
        let mut front = block(1, 0, 0, 0.0);
        front.samples = base[10..210].to_vec();
        let mut reference = block(2, 0, 0, 0.0);
        reference.samples = base[5..205].to_vec();

        sync.push(front).unwrap();
        let pair = sync.push(reference).unwrap().unwrap();
        assert_eq!(pair.len(), 195);
        assert_eq!(pair.front(), pair.reference());
    }

    #[test]
    fn test_aligned_pair_invariant() {
        assert!(AlignedPair::new(vec![], vec![], vec![]).is_none());
        assert!(AlignedPair::new(vec![1.0], vec![1.0, 2.0], vec![0.0]).is_none());
        assert!(AlignedPair::new(vec![1.0], vec![2.0], vec![0.0]).is_some());
    }

    #[test]
    fn test_policy_parsing() {
        assert_eq!(
            "timestamp".parse::<AlignmentPolicy>().unwrap(),
            AlignmentPolicy::Timestamp
        );
        assert!("xcorr".parse::<AlignmentPolicy>().is_err());
    }
}
