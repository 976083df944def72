// Per-session stream pipeline - owns everything one device pair needs
//
// The pipeline manages:
// - Decoding inbound frames and rejecting malformed ones
// - Channel alignment and re-referencing
// - The filter cascade, designed once the session's sample rate is known
// - Hand-off of conditioned blocks to the broadcaster and persistence queue
// - The session lifecycle (AwaitingFirstPacket -> ... -> Closed)
//
// A pipeline is owned by its connection task and is never shared.

use crate::codec::{encode_samples, PacketCodec, DEFAULT_MAX_SAMPLES, FRONT_CHANNEL, REFERENCE_CHANNEL};
use crate::persistence::{PersistenceHandle, SignalRow};
use crate::signal_processing::{spectrum, BandPower, CascadeConfig, FilterCascade};
use crate::streaming::{
    broadcaster::{Broadcaster, OutboundFrame},
    rereference::{ReReferencer, ReferenceScheme},
    synchronizer::{AlignedPair, ChannelSynchronizer, SynchronizerConfig},
    types::{ConditionedBlock, SessionState, SessionStats, StreamError, StreamResult},
};
use bytes::Bytes;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

/// Pipeline configuration shared by every session
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub max_samples_per_frame: usize,
    pub synchronizer: SynchronizerConfig,
    pub reference_scheme: ReferenceScheme,
    pub cascade: CascadeConfig,
    /// Follow each conditioned block with a spectrum text frame
    pub spectrum_enabled: bool,
    /// Rows accumulated before a batch is queued for persistence
    pub persist_batch_size: usize,
    /// Cap overflows in a row tolerated before the session is torn down
    pub max_consecutive_overflows: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_samples_per_frame: DEFAULT_MAX_SAMPLES,
            synchronizer: SynchronizerConfig::default(),
            reference_scheme: ReferenceScheme::default(),
            cascade: CascadeConfig::default(),
            spectrum_enabled: false,
            persist_batch_size: 500,
            max_consecutive_overflows: 50,
        }
    }
}

#[derive(Serialize)]
struct SpectrumFrame<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    pair_id: &'a str,
    sequence: u64,
    dominant_hz: f64,
    band_power: &'a BandPower,
}

/// Stream pipeline for one device pair
pub struct StreamPipeline {
    pair_id: String,
    config: PipelineConfig,
    state: SessionState,

    codec: PacketCodec,
    synchronizer: ChannelSynchronizer,
    rereferencer: ReReferencer,
    cascade: Option<FilterCascade>,
    sample_rate: Option<i16>,

    broadcaster: Broadcaster,
    persistence: PersistenceHandle,
    pending_rows: Vec<SignalRow>,

    sequence: u64,
    emitted_samples: u64,
    started_at: DateTime<Utc>,
    stats: SessionStats,
}

impl StreamPipeline {
    pub fn new(
        pair_id: impl Into<String>,
        config: PipelineConfig,
        broadcaster: Broadcaster,
        persistence: PersistenceHandle,
    ) -> Self {
        let pair_id = pair_id.into();
        info!("Session {} opened", pair_id);

        Self {
            codec: PacketCodec::new(config.max_samples_per_frame),
            synchronizer: ChannelSynchronizer::new(config.synchronizer.clone()),
            rereferencer: ReReferencer::new(config.reference_scheme),
            pair_id,
            config,
            state: SessionState::AwaitingFirstPacket,
            cascade: None,
            sample_rate: None,
            broadcaster,
            persistence,
            pending_rows: Vec::new(),
            sequence: 0,
            emitted_samples: 0,
            started_at: Utc::now(),
            stats: SessionStats::default(),
        }
    }

    pub fn pair_id(&self) -> &str {
        &self.pair_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    pub fn sample_rate(&self) -> Option<i16> {
        self.sample_rate
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Process one inbound frame.
    ///
    /// Returns the number of samples in the accepted block. Rejected frames
    /// leave the session state untouched; only errors for which
    /// [`StreamError::is_fatal`] holds require the caller to close the session.
    pub fn handle_frame(&mut self, bytes: &[u8]) -> StreamResult<usize> {
        if matches!(self.state, SessionState::Draining | SessionState::Closed) {
            return Err(StreamError::SessionClosed);
        }

        let result = self.accept(bytes);
        if let Err(e) = &result {
            self.stats.blocks_rejected += 1;
            debug!("Session {}: block rejected: {}", self.pair_id, e);
        }
        result
    }

    fn accept(&mut self, bytes: &[u8]) -> StreamResult<usize> {
        let block = self.codec.decode(bytes)?;

        if block.device_id != FRONT_CHANNEL && block.device_id != REFERENCE_CHANNEL {
            return Err(StreamError::UnknownDevice(block.device_id));
        }

        match self.sample_rate {
            Some(expected) if expected != block.sample_rate => {
                return Err(StreamError::SampleRateMismatch {
                    expected,
                    actual: block.sample_rate,
                });
            }
            Some(_) => {}
            None => {
                let cascade = FilterCascade::new(&self.config.cascade, block.sample_rate as f64)?;
                info!(
                    "Session {}: {} Hz, filter mode {:?}",
                    self.pair_id,
                    block.sample_rate,
                    cascade.mode()
                );
                self.cascade = Some(cascade);
                self.sample_rate = Some(block.sample_rate);
                self.state = SessionState::Synchronizing;
            }
        }

        let received = block.len();
        self.stats.blocks_received += 1;

        let pair = self.synchronizer.push(block)?;
        self.stats.samples_evicted = self.synchronizer.evicted_samples();

        let overflows = self.synchronizer.consecutive_overflows();
        if overflows > self.config.max_consecutive_overflows {
            return Err(StreamError::ResourceExhausted(format!(
                "channel buffer overflowed {} times in a row",
                overflows
            )));
        }

        if let Some(pair) = pair {
            self.emit(pair)?;
        }

        Ok(received)
    }

    fn emit(&mut self, pair: AlignedPair) -> StreamResult<()> {
        let raw = self.rereferencer.apply(&pair);
        let cascade = self.cascade.as_mut().ok_or(StreamError::SessionClosed)?;

        let filtered = match cascade.process(&raw) {
            Ok(filtered) => filtered,
            Err(e) => {
                self.stats.blocks_unstable += 1;
                warn!("Session {}: discarding block: {}", self.pair_id, e);
                return Err(e.into());
            }
        };
        if filtered.degraded {
            self.stats.blocks_degraded += 1;
        }

        let (_, _, timestamps) = pair.into_parts();
        let block = ConditionedBlock {
            pair_id: self.pair_id.clone(),
            sequence: self.sequence,
            timestamps,
            samples: filtered.samples,
            degraded: filtered.degraded,
        };

        if self.state == SessionState::Synchronizing {
            info!("Session {} active", self.pair_id);
        }
        self.state = SessionState::Active;
        self.sequence += 1;
        self.stats.pairs_emitted += 1;
        self.stats.samples_emitted += block.samples.len() as u64;

        self.publish(&block);
        self.enqueue_rows(&block);
        self.emitted_samples += block.samples.len() as u64;

        Ok(())
    }

    fn publish(&self, block: &ConditionedBlock) {
        let payload = Bytes::from(encode_samples(&block.samples));
        let report = self.broadcaster.broadcast(OutboundFrame::Samples(payload));
        if report.removed > 0 {
            debug!(
                "Session {}: {} subscribers dropped during broadcast",
                self.pair_id, report.removed
            );
        }

        if !self.config.spectrum_enabled {
            return;
        }
        let Some(rate) = self.sample_rate else {
            return;
        };
        let Some(summary) = spectrum::summarize(&block.samples, rate as f64) else {
            return;
        };

        let frame = SpectrumFrame {
            kind: "spectrum",
            pair_id: &block.pair_id,
            sequence: block.sequence,
            dominant_hz: summary.dominant_hz,
            band_power: &summary.band_power,
        };
        match serde_json::to_string(&frame) {
            Ok(json) => {
                self.broadcaster.broadcast(OutboundFrame::Text(json));
            }
            Err(e) => warn!("Failed to serialize spectrum frame: {}", e),
        }
    }

    fn enqueue_rows(&mut self, block: &ConditionedBlock) {
        if !self.persistence.is_enabled() {
            return;
        }

        let period_us = self
            .sample_rate
            .map_or(0.0, |rate| 1_000_000.0 / rate as f64);

        for (i, (&t_ms, &value)) in block.timestamps.iter().zip(&block.samples).enumerate() {
            // Fall back to the session clock when the device clock is out of range
            let timestamp = DateTime::from_timestamp_micros((t_ms * 1000.0).round() as i64)
                .unwrap_or_else(|| {
                    let offset = ((self.emitted_samples + i as u64) as f64 * period_us) as i64;
                    self.started_at + ChronoDuration::microseconds(offset)
                });
            self.pending_rows.push(SignalRow {
                device_tag: self.pair_id.clone(),
                timestamp,
                value,
            });
        }

        if self.pending_rows.len() >= self.config.persist_batch_size.max(1) {
            self.flush_rows();
        }
    }

    fn flush_rows(&mut self) {
        if self.pending_rows.is_empty() {
            return;
        }
        let rows = std::mem::take(&mut self.pending_rows);
        let count = rows.len() as u64;
        if self.persistence.submit(rows) {
            self.stats.rows_queued += count;
        } else {
            self.stats.rows_dropped += count;
        }
    }

    /// Drain and close the session: flush pending rows, discard unpaired
    /// samples, drop filter state. Idempotent.
    pub fn close(&mut self) -> SessionStats {
        if self.state == SessionState::Closed {
            return self.stats.clone();
        }

        self.state = SessionState::Draining;
        self.flush_rows();

        let discarded = self.synchronizer.drain();
        if discarded > 0 {
            info!(
                "Session {}: discarding {} unpaired samples",
                self.pair_id, discarded
            );
            self.stats.samples_evicted += discarded as u64;
        }

        self.cascade = None;
        self.state = SessionState::Closed;
        info!(
            "Session {} closed: {} pairs, {} samples emitted, {} blocks rejected",
            self.pair_id,
            self.stats.pairs_emitted,
            self.stats.samples_emitted,
            self.stats.blocks_rejected
        );

        self.stats.clone()
    }
}

impl Drop for StreamPipeline {
    fn drop(&mut self) {
        self.close();
    }
}

/// Text reply sent to the device for one inbound block
pub fn status_message(result: &StreamResult<usize>) -> String {
    match result {
        Ok(n) => format!("OK:{}", n),
        Err(e) => format!("ERROR:{}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::SampleBlock;
    use crate::signal_processing::FilterMode;
    use crate::streaming::synchronizer::AlignmentPolicy;

    fn frame(device_id: u8, timestamp_start: i64, sample_rate: i16, len: usize) -> Vec<u8> {
        let samples = (0..len).map(|i| (i as f32 * 0.1).sin() * 50.0).collect();
        PacketCodec::default().encode_frame(&SampleBlock {
            device_id,
            timestamp_start,
            sample_rate,
            samples,
        })
    }

    fn pipeline(config: PipelineConfig) -> (StreamPipeline, Broadcaster) {
        let broadcaster = Broadcaster::new();
        let pipeline = StreamPipeline::new(
            "pcb_001",
            config,
            broadcaster.clone(),
            PersistenceHandle::disabled(),
        );
        (pipeline, broadcaster)
    }

    #[test]
    fn test_state_transitions() {
        let (mut session, _) = pipeline(PipelineConfig::default());
        assert_eq!(session.state(), SessionState::AwaitingFirstPacket);

        assert_eq!(session.handle_frame(&frame(1, 0, 250, 250)).unwrap(), 250);
        assert_eq!(session.state(), SessionState::Synchronizing);
        assert_eq!(session.sample_rate(), Some(250));

        assert_eq!(session.handle_frame(&frame(2, 0, 250, 250)).unwrap(), 250);
        assert_eq!(session.state(), SessionState::Active);
        assert_eq!(session.stats().pairs_emitted, 1);

        session.close();
        assert_eq!(session.state(), SessionState::Closed);
        assert!(matches!(
            session.handle_frame(&frame(1, 0, 250, 250)),
            Err(StreamError::SessionClosed)
        ));
    }

    #[test]
    fn test_malformed_frame_leaves_state_unchanged() {
        let (mut session, _) = pipeline(PipelineConfig::default());
        let mut bytes = frame(1, 0, 250, 10);
        bytes.pop();

        let result = session.handle_frame(&bytes);
        assert!(matches!(result, Err(StreamError::Decode(_))));
        assert!(status_message(&result).starts_with("ERROR:"));
        assert_eq!(session.state(), SessionState::AwaitingFirstPacket);
        assert_eq!(session.stats().blocks_rejected, 1);

        let result = session.handle_frame(&frame(7, 0, 250, 10));
        assert!(matches!(result, Err(StreamError::UnknownDevice(7))));
        assert_eq!(session.state(), SessionState::AwaitingFirstPacket);
    }

    #[test]
    fn test_sample_rate_mismatch_rejected() {
        let (mut session, _) = pipeline(PipelineConfig::default());
        session.handle_frame(&frame(1, 0, 250, 100)).unwrap();

        let result = session.handle_frame(&frame(2, 0, 500, 100));
        assert!(matches!(
            result,
            Err(StreamError::SampleRateMismatch {
                expected: 250,
                actual: 500
            })
        ));
        assert!(status_message(&result).starts_with("ERROR:sample rate mismatch"));
        assert_eq!(session.state(), SessionState::Synchronizing);
    }

    #[test]
    fn test_status_message() {
        assert_eq!(status_message(&Ok(250)), "OK:250");
        assert_eq!(
            status_message(&Err(StreamError::UnknownDevice(3))),
            "ERROR:unknown device id 3"
        );
    }

    #[tokio::test]
    async fn test_broadcasts_conditioned_block() {
        let (mut session, broadcaster) = pipeline(PipelineConfig::default());
        let (_id, mut rx) = broadcaster.subscribe();

        session.handle_frame(&frame(1, 0, 250, 100)).unwrap();
        session.handle_frame(&frame(2, 0, 250, 80)).unwrap();

        match rx.recv().await {
            Some(OutboundFrame::Samples(bytes)) => {
                let samples = crate::codec::decode_samples(&bytes).unwrap();
                assert_eq!(samples.len(), 80);
                assert!(samples.iter().all(|s| s.is_finite()));
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_spectrum_frame_follows_samples() {
        let config = PipelineConfig {
            spectrum_enabled: true,
            ..Default::default()
        };
        let (mut session, broadcaster) = pipeline(config);
        let (_id, mut rx) = broadcaster.subscribe();

        session.handle_frame(&frame(1, 0, 250, 250)).unwrap();
        session.handle_frame(&frame(2, 0, 250, 250)).unwrap();

        assert!(matches!(rx.recv().await, Some(OutboundFrame::Samples(_))));
        match rx.recv().await {
            Some(OutboundFrame::Text(json)) => {
                let value: serde_json::Value = serde_json::from_str(&json).unwrap();
                assert_eq!(value["type"], "spectrum");
                assert_eq!(value["pair_id"], "pcb_001");
                assert_eq!(value["sequence"], 0);
                assert!(value["band_power"]["alpha"].is_number());
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_stalled_channel_exhausts_session() {
        let config = PipelineConfig {
            synchronizer: SynchronizerConfig {
                policy: AlignmentPolicy::Timestamp,
                max_buffered_samples: 100,
                ..Default::default()
            },
            cascade: CascadeConfig {
                mode: FilterMode::Bypass,
                ..Default::default()
            },
            max_consecutive_overflows: 3,
            ..Default::default()
        };
        let (mut session, _) = pipeline(config);

        let mut outcome = Ok(0);
        for i in 0..10 {
            outcome = session.handle_frame(&frame(1, i * 1000, 250, 250));
            if outcome.is_err() {
                break;
            }
        }

        let err = outcome.unwrap_err();
        assert!(matches!(err, StreamError::ResourceExhausted(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_skewed_reference_clock_exhausts_session() {
        let config = PipelineConfig {
            synchronizer: SynchronizerConfig {
                policy: AlignmentPolicy::Timestamp,
                max_buffered_samples: 500,
                ..Default::default()
            },
            cascade: CascadeConfig {
                mode: FilterMode::Bypass,
                ..Default::default()
            },
            max_consecutive_overflows: 3,
            ..Default::default()
        };
        let (mut session, _) = pipeline(config);

        let mut outcome = Ok(0);
        for i in 0..20 {
            outcome = session
                .handle_frame(&frame(1, 100_000 + i * 1000, 250, 250))
                .and_then(|_| session.handle_frame(&frame(2, 40_000 + i * 1000, 250, 250)));
            if outcome.is_err() {
                break;
            }
        }

        assert!(matches!(outcome, Err(StreamError::ResourceExhausted(_))));
        assert_eq!(session.stats().pairs_emitted, 0);
    }

    #[test]
    fn test_close_discards_unpaired_samples() {
        let (mut session, _) = pipeline(PipelineConfig::default());
        session.handle_frame(&frame(1, 0, 250, 120)).unwrap();

        let stats = session.close();
        assert_eq!(stats.samples_evicted, 120);
        assert_eq!(stats.pairs_emitted, 0);
        assert_eq!(session.close(), stats);
    }
}
