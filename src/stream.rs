//! Tare, unit conversion and aggregation over the raw sample stream.

use serde::Serialize;
use tracing::debug;

use crate::measurement::{
    Channel, ChannelStats, Distribution, ForceMeasurement, ForceSample, RunningStats, Unit,
};

/// Offsets are stored per channel; index 0 is the untagged channel.
const SLOTS: usize = 4;

fn slot(channel: Option<Channel>) -> usize {
    match channel {
        None => 0,
        Some(Channel::Left) => 1,
        Some(Channel::Center) => 2,
        Some(Channel::Right) => 3,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EngineState {
    Idle,
    Streaming,
    /// The requested duration elapsed.
    Stopped,
}

/// Zero offset in device units (kg), subtracted from every raw value.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct TareState {
    offsets: [f64; SLOTS],
    pub sample_count: u64,
    pub is_complete: bool,
}

impl TareState {
    pub fn offset(&self, channel: Option<Channel>) -> f64 {
        self.offsets[slot(channel)]
    }
}

#[derive(Debug, Clone)]
struct TareCollection {
    duration_ms: u64,
    started_at: Option<u64>,
    stats: [RunningStats; SLOTS],
    samples: u64,
    previous: TareState,
}

/// What one sample produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Ingested {
    pub measurement: Option<ForceMeasurement>,
    pub tare_completed: Option<TareState>,
    /// The stream reached the end of its requested duration.
    pub stopped: bool,
}

#[derive(Debug, Clone)]
pub struct StreamingEngine {
    unit: Unit,
    state: EngineState,
    duration_ms: Option<u64>,
    /// First sample of the stream; the duration is measured from here.
    started_at: Option<u64>,
    /// First frame of the current aggregation window.
    window_start: Option<u64>,
    last_timestamp: Option<u64>,
    frames: u64,
    tare: TareState,
    taring: Option<TareCollection>,
    total: RunningStats,
    channels: [Option<RunningStats>; 3],
}

impl StreamingEngine {
    pub fn new(unit: Unit) -> Self {
        Self {
            unit,
            state: EngineState::Idle,
            duration_ms: None,
            started_at: None,
            window_start: None,
            last_timestamp: None,
            frames: 0,
            tare: TareState::default(),
            taring: None,
            total: RunningStats::default(),
            channels: [None; 3],
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn unit(&self) -> Unit {
        self.unit
    }

    pub fn tare_state(&self) -> TareState {
        self.tare
    }

    pub fn is_taring(&self) -> bool {
        self.taring.is_some()
    }

    /// Change the display unit. Aggregation restarts since old and new
    /// values are not comparable.
    pub fn set_unit(&mut self, unit: Unit) {
        if unit != self.unit {
            self.unit = unit;
            self.reset();
        }
    }

    /// Begin emitting. `None` or `Some(0)` streams until [`stop`](Self::stop).
    pub fn start(&mut self, duration_ms: Option<u64>) {
        self.reset();
        self.duration_ms = duration_ms.filter(|d| *d > 0);
        self.state = EngineState::Streaming;
        debug!("stream started, duration {:?} ms", self.duration_ms);
    }

    /// Stop emitting. A no-op when not streaming.
    pub fn stop(&mut self) -> bool {
        if self.state != EngineState::Streaming {
            return false;
        }
        self.state = EngineState::Idle;
        debug!("stream stopped");
        true
    }

    /// Forget peak, mean and sampling history.
    pub fn reset(&mut self) {
        self.clear_window();
        self.started_at = None;
    }

    /// Restart aggregation without touching the duration clock.
    fn clear_window(&mut self) {
        self.total = RunningStats::default();
        self.channels = [None; 3];
        self.window_start = None;
        self.last_timestamp = None;
        self.frames = 0;
    }

    /// Start collecting a new baseline over `duration_ms` of samples. The
    /// current offset stays in force until the new one is complete.
    pub fn begin_tare(&mut self, duration_ms: u64) {
        let previous = match &self.taring {
            Some(collection) => collection.previous,
            None => self.tare,
        };
        self.taring = Some(TareCollection {
            duration_ms,
            started_at: None,
            stats: [RunningStats::default(); SLOTS],
            samples: 0,
            previous,
        });
        debug!("tare started over {duration_ms} ms");
    }

    /// Abandon a tare in progress, keeping the previous offset.
    pub fn cancel_tare(&mut self) -> bool {
        match self.taring.take() {
            Some(collection) => {
                self.tare = collection.previous;
                debug!("tare cancelled");
                true
            }
            None => false,
        }
    }

    pub fn ingest(&mut self, sample: ForceSample) -> Ingested {
        self.ingest_frame(std::slice::from_ref(&sample))
    }

    /// Ingest readings taken at the same instant, one per channel. The frame
    /// total is their sum and yields a single measurement.
    pub fn ingest_frame(&mut self, frame: &[ForceSample]) -> Ingested {
        let mut out = Ingested::default();
        let Some(timestamp_ms) = frame.first().map(|s| s.timestamp_ms) else {
            return out;
        };

        if let Some(collection) = &mut self.taring {
            let started_at = *collection.started_at.get_or_insert(timestamp_ms);
            let window_done = timestamp_ms.saturating_sub(started_at) >= collection.duration_ms;
            if !window_done || collection.samples == 0 {
                for sample in frame {
                    collection.stats[slot(sample.channel)].push(sample.raw_value);
                }
                collection.samples += 1;
                return out;
            }

            let mut tare = TareState {
                offsets: [0.0; SLOTS],
                sample_count: collection.samples,
                is_complete: true,
            };
            for (offset, stats) in tare.offsets.iter_mut().zip(collection.stats.iter()) {
                if !stats.is_empty() {
                    *offset = stats.mean();
                }
            }
            self.taring = None;
            self.tare = tare;
            self.clear_window();
            debug!("tare complete from {} samples: {:?}", tare.sample_count, tare.offsets);
            out.tare_completed = Some(tare);
        }

        if self.state != EngineState::Streaming {
            return out;
        }

        let started_at = *self.started_at.get_or_insert(timestamp_ms);
        if let Some(duration) = self.duration_ms {
            if timestamp_ms.saturating_sub(started_at) >= duration {
                self.state = EngineState::Stopped;
                out.stopped = true;
                debug!("stream duration of {duration} ms elapsed");
                return out;
            }
        }

        let window_start = *self.window_start.get_or_insert(timestamp_ms);
        if self.last_timestamp != Some(timestamp_ms) {
            self.frames += 1;
            self.last_timestamp = Some(timestamp_ms);
        }

        let mut total = 0.0;
        for sample in frame {
            let corrected = sample.raw_value - self.tare.offset(sample.channel);
            let value = Unit::Kg.convert(corrected, self.unit);
            if let Some(channel) = sample.channel {
                self.channels[slot(Some(channel)) - 1]
                    .get_or_insert_with(RunningStats::default)
                    .push(value);
            }
            total += value;
        }
        self.total.push(total);

        out.measurement = Some(self.measurement(timestamp_ms, window_start));
        out
    }

    fn measurement(&self, timestamp_ms: u64, window_start: u64) -> ForceMeasurement {
        let elapsed = timestamp_ms.saturating_sub(window_start);
        let sampling_rate_hz = (elapsed > 0 && self.frames > 1)
            .then(|| (self.frames - 1) as f64 * 1000.0 / elapsed as f64);

        let snapshot = |i: usize| self.channels[i].as_ref().map(RunningStats::snapshot);
        let distribution = self.channels.iter().any(Option::is_some).then(|| Distribution {
            left: snapshot(0),
            center: snapshot(1),
            right: snapshot(2),
        });

        ForceMeasurement {
            unit: self.unit,
            timestamp_ms,
            current: self.total.current(),
            peak: self.total.peak(),
            mean: self.total.mean(),
            sampling_rate_hz,
            distribution,
        }
    }

    /// Stats of one channel in the current window.
    pub fn channel_stats(&self, channel: Channel) -> Option<ChannelStats> {
        self.channels[slot(Some(channel)) - 1].map(|s| s.snapshot())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(engine: &mut StreamingEngine, samples: &[(u64, f64)]) -> Vec<ForceMeasurement> {
        samples
            .iter()
            .filter_map(|(t, v)| engine.ingest(ForceSample::new(*t, *v)).measurement)
            .collect()
    }

    #[test]
    fn test_idle_engine_emits_nothing() {
        let mut engine = StreamingEngine::new(Unit::Kg);
        assert!(feed(&mut engine, &[(0, 1.0), (10, 2.0)]).is_empty());
        assert!(!engine.stop());
        assert_eq!(engine.state(), EngineState::Idle);
    }

    #[test]
    fn test_peak_and_mean_invariants() {
        let mut engine = StreamingEngine::new(Unit::Kg);
        engine.start(None);
        let values = [5.0, 12.0, 7.5, 30.25, 2.0, 2.0, 18.0];
        let samples: Vec<(u64, f64)> = values
            .iter()
            .enumerate()
            .map(|(i, v)| (i as u64 * 10, *v))
            .collect();
        let out = feed(&mut engine, &samples);
        assert_eq!(out.len(), values.len());
        for (i, m) in out.iter().enumerate() {
            assert!(m.peak >= m.current);
            let mean = values[..=i].iter().sum::<f64>() / (i + 1) as f64;
            assert!((m.mean - mean).abs() < 1e-9);
        }
        let last = out.last().unwrap();
        assert_eq!(last.peak, 30.25);
        assert!((last.sampling_rate_hz.unwrap() - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_duration_stops_stream() {
        let mut engine = StreamingEngine::new(Unit::Kg);
        engine.start(Some(100));
        let mut emitted = 0;
        let mut stopped = false;
        for t in (1000..1200).step_by(20) {
            let r = engine.ingest(ForceSample::new(t, 1.0));
            emitted += r.measurement.is_some() as usize;
            stopped |= r.stopped;
        }
        assert_eq!(emitted, 5);
        assert!(stopped);
        assert_eq!(engine.state(), EngineState::Stopped);
    }

    #[test]
    fn test_zero_duration_streams_indefinitely() {
        let mut engine = StreamingEngine::new(Unit::Kg);
        engine.start(Some(0));
        let out = feed(&mut engine, &[(0, 1.0), (1_000_000, 1.0)]);
        assert_eq!(out.len(), 2);
        assert!(engine.stop());
        assert_eq!(engine.state(), EngineState::Idle);
    }

    #[test]
    fn test_unit_conversion_applied() {
        let mut engine = StreamingEngine::new(Unit::Lbs);
        engine.start(None);
        let out = feed(&mut engine, &[(0, 10.0)]);
        assert!((out[0].current - 22.0462).abs() < 1e-9);
        assert_eq!(out[0].unit, Unit::Lbs);
    }

    #[test]
    fn test_tare_suppresses_emission_and_zeroes_baseline() {
        let mut engine = StreamingEngine::new(Unit::Kg);
        engine.start(None);
        engine.begin_tare(500);

        let mut completed = None;
        for t in (0..500).step_by(50) {
            let r = engine.ingest(ForceSample::new(t, 3.2));
            assert!(r.measurement.is_none());
            assert!(r.tare_completed.is_none());
        }
        let r = engine.ingest(ForceSample::new(500, 3.2));
        if let Some(tare) = r.tare_completed {
            completed = Some(tare);
        }
        let tare = completed.expect("tare should complete on the first sample past the window");
        assert_eq!(tare.sample_count, 10);
        assert!((tare.offset(None) - 3.2).abs() < 1e-9);
        let m = r.measurement.unwrap();
        assert!(m.current.abs() < 1e-9);
    }

    #[test]
    fn test_tare_twice_is_idempotent() {
        let mut engine = StreamingEngine::new(Unit::Kg);
        for round in 0..2u64 {
            engine.begin_tare(100);
            let base = round * 1000;
            let mut done = None;
            for t in (0..=100).step_by(10) {
                if let Some(tare) = engine.ingest(ForceSample::new(base + t, 7.5)).tare_completed {
                    done = Some(tare);
                }
            }
            let tare = done.unwrap();
            assert!((tare.offset(None) - 7.5).abs() < 1e-9);
        }
    }

    #[test]
    fn test_cancel_tare_restores_previous_offset() {
        let mut engine = StreamingEngine::new(Unit::Kg);
        engine.begin_tare(10);
        engine.ingest(ForceSample::new(0, 2.0));
        engine.ingest(ForceSample::new(10, 2.0));
        assert!((engine.tare_state().offset(None) - 2.0).abs() < 1e-9);

        engine.begin_tare(100);
        engine.ingest(ForceSample::new(20, 9.0));
        assert!(engine.cancel_tare());
        assert!(!engine.is_taring());
        assert!((engine.tare_state().offset(None) - 2.0).abs() < 1e-9);

        engine.start(None);
        let out = feed(&mut engine, &[(30, 5.0)]);
        assert!((out[0].current - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_channel_distribution() {
        let mut engine = StreamingEngine::new(Unit::Kg);
        let frame = |t: u64, l: f64, c: f64, r: f64| {
            [
                ForceSample::on_channel(t, l, Channel::Left),
                ForceSample::on_channel(t, c, Channel::Center),
                ForceSample::on_channel(t, r, Channel::Right),
            ]
        };
        engine.begin_tare(10);
        engine.ingest_frame(&frame(0, 1.0, 0.5, 0.25));
        engine.ingest_frame(&frame(10, 1.0, 0.5, 0.25));
        engine.start(None);
        let last = engine.ingest_frame(&frame(20, 11.0, 5.5, 20.25)).measurement.unwrap();

        assert!((last.current - 35.0).abs() < 1e-9);
        let distribution = last.distribution.unwrap();
        assert!((distribution.left.unwrap().current - 10.0).abs() < 1e-9);
        assert!((distribution.center.unwrap().current - 5.0).abs() < 1e-9);
        assert!((distribution.right.unwrap().current - 20.0).abs() < 1e-9);
        assert_eq!(last.channel_current(Channel::Right), Some(distribution.right.unwrap().current));
    }

    #[test]
    fn test_channel_frames_aggregate_as_totals() {
        let mut engine = StreamingEngine::new(Unit::Kg);
        engine.start(None);
        let mut out = Vec::new();
        for t in [0, 10, 20] {
            let frame = [
                ForceSample::on_channel(t, 1.0, Channel::Left),
                ForceSample::on_channel(t, 2.0, Channel::Center),
                ForceSample::on_channel(t, 3.0, Channel::Right),
            ];
            out.extend(engine.ingest_frame(&frame).measurement);
        }
        assert_eq!(out.len(), 3);
        for m in &out {
            assert_eq!(m.current, 6.0);
            assert_eq!(m.peak, 6.0);
            assert_eq!(m.mean, 6.0);
        }
        assert_eq!(out[2].sampling_rate_hz, Some(100.0));
        assert_eq!(engine.channel_stats(Channel::Center).unwrap().mean, 2.0);
    }

    #[test]
    fn test_empty_frame_is_ignored() {
        let mut engine = StreamingEngine::new(Unit::Kg);
        engine.start(None);
        assert_eq!(engine.ingest_frame(&[]), Ingested::default());
    }

    #[test]
    fn test_tare_keeps_duration_clock() {
        let mut engine = StreamingEngine::new(Unit::Kg);
        engine.start(Some(1000));
        assert!(engine.ingest(ForceSample::new(0, 4.0)).measurement.is_some());

        engine.begin_tare(100);
        engine.ingest(ForceSample::new(500, 4.0));
        let done = engine.ingest(ForceSample::new(600, 4.0));
        assert!(done.tare_completed.is_some());
        let m = done.measurement.unwrap();
        assert_eq!(m.current, 0.0);
        assert_eq!(m.sampling_rate_hz, None);

        let late = engine.ingest(ForceSample::new(1200, 4.0));
        assert!(late.measurement.is_none());
        assert!(late.stopped);
        assert_eq!(engine.state(), EngineState::Stopped);
    }
}
