use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{ratio, Countdown, HandMode, Sided, Step};
use crate::measurement::{Channel, ForceMeasurement, Unit};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeakForceOptions {
    pub countdown_ms: u64,
    pub duration_ms: u64,
    pub mode: HandMode,
    /// Lever arm in metres; adds a torque figure to the result.
    pub moment_arm_m: Option<f64>,
    /// Reference body weight in the display unit; adds a percentage.
    pub body_weight: Option<f64>,
}

impl Default for PeakForceOptions {
    fn default() -> Self {
        Self {
            countdown_ms: 3000,
            duration_ms: 5000,
            mode: HandMode::Single,
            moment_arm_m: None,
            body_weight: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PeakForceReading {
    pub peak: f64,
    pub peak_ms: u64,
    /// `peak × moment arm`, in display unit · m.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub torque: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body_weight_pct: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeakForceResult {
    pub unit: Unit,
    pub readings: Sided<PeakForceReading>,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
struct PeakTracker {
    peak: Option<(f64, u64)>,
}

impl PeakTracker {
    fn feed(&mut self, timestamp_ms: u64, force: f64) {
        if self.peak.map_or(true, |(peak, _)| force > peak) {
            self.peak = Some((force, timestamp_ms));
        }
    }

    fn reading(&self, options: &PeakForceOptions) -> PeakForceReading {
        let (peak, peak_ms) = self.peak.unwrap_or((0.0, 0));
        PeakForceReading {
            peak,
            peak_ms,
            torque: options.moment_arm_m.map(|arm| peak * arm),
            body_weight_pct: options
                .body_weight
                .filter(|w| *w > 0.0)
                .map(|w| peak / w * 100.0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum PeakState {
    Idle,
    Countdown(Countdown),
    Capturing {
        ends_at: u64,
        first: PeakTracker,
        second: PeakTracker,
    },
    Complete,
}

/// Maximum voluntary contraction over a fixed capture window.
#[derive(Debug, Clone)]
pub struct PeakForceSession {
    options: PeakForceOptions,
    state: PeakState,
}

impl PeakForceSession {
    pub fn new(options: PeakForceOptions) -> Self {
        Self {
            options,
            state: PeakState::Countdown(Countdown::new(options.countdown_ms)),
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, PeakState::Countdown(_) | PeakState::Capturing { .. })
    }

    pub fn feed(&mut self, measurement: &ForceMeasurement) -> Step<PeakForceResult> {
        let t = measurement.timestamp_ms;

        if let PeakState::Countdown(countdown) = &mut self.state {
            let Some(started_at) = countdown.poll(t) else {
                return Step::Pending;
            };
            debug!("peak force capture from {started_at} ms");
            self.state = PeakState::Capturing {
                ends_at: started_at + self.options.duration_ms,
                first: PeakTracker::default(),
                second: PeakTracker::default(),
            };
        }

        let PeakState::Capturing {
            ends_at,
            first,
            second,
        } = &mut self.state
        else {
            return Step::Pending;
        };

        if t < *ends_at {
            match self.options.mode {
                HandMode::Single => first.feed(t, measurement.current),
                HandMode::LeftRight => {
                    if let Some(left) = measurement.channel_current(Channel::Left) {
                        first.feed(t, left);
                    }
                    if let Some(right) = measurement.channel_current(Channel::Right) {
                        second.feed(t, right);
                    }
                }
            }
            return Step::Pending;
        }

        let readings = match self.options.mode {
            HandMode::Single => Sided::Single(first.reading(&self.options)),
            HandMode::LeftRight => {
                let left = first.reading(&self.options);
                let right = second.reading(&self.options);
                Sided::LeftRight {
                    left,
                    right,
                    asymmetry: ratio(left.peak, right.peak),
                }
            }
        };
        self.state = PeakState::Complete;
        Step::Complete(PeakForceResult {
            unit: measurement.unit,
            readings,
        })
    }

    pub fn cancel(&mut self) {
        self.state = PeakState::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurement::{ChannelStats, Distribution};

    fn m(t: u64, force: f64) -> ForceMeasurement {
        ForceMeasurement::instant(Unit::Kg, t, force)
    }

    fn run(session: &mut PeakForceSession, samples: &[ForceMeasurement]) -> Option<PeakForceResult> {
        samples.iter().find_map(|s| match session.feed(s) {
            Step::Complete(r) => Some(r),
            Step::Pending => None,
        })
    }

    #[test]
    fn test_single_peak_with_derived_values() {
        let mut session = PeakForceSession::new(PeakForceOptions {
            countdown_ms: 1000,
            duration_ms: 2000,
            mode: HandMode::Single,
            moment_arm_m: Some(0.5),
            body_weight: Some(80.0),
        });
        let samples = [
            m(0, 90.0),
            m(1000, 10.0),
            m(1500, 48.0),
            m(2000, 60.0),
            m(2500, 55.0),
            m(3000, 70.0),
        ];
        let result = run(&mut session, &samples).expect("capture should complete");
        let Sided::Single(reading) = result.readings else {
            panic!("expected a single reading");
        };
        assert_eq!(reading.peak, 60.0);
        assert_eq!(reading.peak_ms, 2000);
        assert_eq!(reading.torque, Some(30.0));
        assert_eq!(reading.body_weight_pct, Some(75.0));
    }

    #[test]
    fn test_left_right() {
        let stats = |current| ChannelStats {
            current,
            peak: current,
            mean: current,
        };
        let sided = |t, left, right| ForceMeasurement {
            distribution: Some(Distribution {
                left: Some(stats(left)),
                center: None,
                right: Some(stats(right)),
            }),
            ..m(t, left + right)
        };
        let mut session = PeakForceSession::new(PeakForceOptions {
            countdown_ms: 0,
            duration_ms: 1000,
            mode: HandMode::LeftRight,
            ..PeakForceOptions::default()
        });
        let samples = [
            sided(0, 10.0, 20.0),
            sided(500, 45.0, 50.0),
            sided(900, 30.0, 30.0),
            sided(1000, 0.0, 0.0),
        ];
        let result = run(&mut session, &samples).unwrap();
        let Sided::LeftRight { left, right, asymmetry } = result.readings else {
            panic!("expected left/right readings");
        };
        assert_eq!(left.peak, 45.0);
        assert_eq!(right.peak, 50.0);
        assert_eq!(asymmetry, Some(0.9));
        assert_eq!(left.torque, None);
    }

    #[test]
    fn test_cancel_mid_capture() {
        let mut session = PeakForceSession::new(PeakForceOptions {
            countdown_ms: 0,
            ..PeakForceOptions::default()
        });
        session.feed(&m(0, 40.0));
        session.cancel();
        assert!(!session.is_running());
        assert_eq!(session.feed(&m(10_000, 40.0)), Step::Pending);
    }
}
