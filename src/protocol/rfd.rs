use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{ratio, Countdown, HandMode, Sided, Step};
use crate::measurement::{Channel, ForceMeasurement, Unit};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RfdOptions {
    pub countdown_ms: u64,
    /// Force (display unit) whose upward crossing marks the onset.
    pub threshold: f64,
    /// Capture window measured from the onset.
    pub duration_ms: u64,
    pub mode: HandMode,
}

impl Default for RfdOptions {
    fn default() -> Self {
        Self {
            countdown_ms: 3000,
            threshold: 2.0,
            duration_ms: 1000,
            mode: HandMode::Single,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RfdReading {
    pub onset_ms: u64,
    pub onset_force: f64,
    pub peak_ms: u64,
    pub peak_force: f64,
    /// Force units per second from onset to peak.
    pub rfd: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RfdResult {
    pub unit: Unit,
    pub readings: Sided<RfdReading>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Tracker {
    WaitingForOnset {
        previous: Option<f64>,
    },
    Capturing {
        onset_ms: u64,
        onset_force: f64,
        peak_ms: u64,
        peak_force: f64,
    },
    Complete(RfdReading),
}

impl Tracker {
    fn new() -> Self {
        Tracker::WaitingForOnset { previous: None }
    }

    fn reading(&self) -> Option<RfdReading> {
        match self {
            Tracker::Complete(reading) => Some(*reading),
            _ => None,
        }
    }

    fn feed(&mut self, timestamp_ms: u64, force: f64, options: &RfdOptions) {
        match *self {
            Tracker::WaitingForOnset { previous } => {
                let crossed = previous.is_some_and(|p| p < options.threshold)
                    && force >= options.threshold;
                *self = if crossed {
                    debug!("rfd onset at {timestamp_ms} ms, {force}");
                    Tracker::Capturing {
                        onset_ms: timestamp_ms,
                        onset_force: force,
                        peak_ms: timestamp_ms,
                        peak_force: force,
                    }
                } else {
                    Tracker::WaitingForOnset {
                        previous: Some(force),
                    }
                };
            }
            Tracker::Capturing {
                onset_ms,
                onset_force,
                mut peak_ms,
                mut peak_force,
            } => {
                if force > peak_force {
                    peak_force = force;
                    peak_ms = timestamp_ms;
                }
                *self = if timestamp_ms.saturating_sub(onset_ms) >= options.duration_ms {
                    let elapsed_s = (peak_ms - onset_ms) as f64 / 1000.0;
                    let rfd = if elapsed_s > 0.0 {
                        (peak_force - onset_force) / elapsed_s
                    } else {
                        0.0
                    };
                    Tracker::Complete(RfdReading {
                        onset_ms,
                        onset_force,
                        peak_ms,
                        peak_force,
                        rfd,
                    })
                } else {
                    Tracker::Capturing {
                        onset_ms,
                        onset_force,
                        peak_ms,
                        peak_force,
                    }
                };
            }
            Tracker::Complete(_) => {}
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum RfdState {
    Idle,
    Countdown(Countdown),
    Running { first: Tracker, second: Tracker },
    Complete,
}

/// Rate of force development test.
#[derive(Debug, Clone)]
pub struct RfdSession {
    options: RfdOptions,
    state: RfdState,
}

impl RfdSession {
    pub fn new(options: RfdOptions) -> Self {
        Self {
            options,
            state: RfdState::Countdown(Countdown::new(options.countdown_ms)),
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, RfdState::Countdown(_) | RfdState::Running { .. })
    }

    pub fn feed(&mut self, measurement: &ForceMeasurement) -> Step<RfdResult> {
        let t = measurement.timestamp_ms;
        match &mut self.state {
            RfdState::Idle | RfdState::Complete => return Step::Pending,
            RfdState::Countdown(countdown) => {
                if countdown.poll(t).is_some() {
                    debug!("rfd countdown over at {t} ms");
                    self.state = RfdState::Running {
                        first: Tracker::new(),
                        second: Tracker::new(),
                    };
                }
                return Step::Pending;
            }
            RfdState::Running { first, second } => match self.options.mode {
                HandMode::Single => first.feed(t, measurement.current, &self.options),
                HandMode::LeftRight => {
                    if let Some(left) = measurement.channel_current(Channel::Left) {
                        first.feed(t, left, &self.options);
                    }
                    if let Some(right) = measurement.channel_current(Channel::Right) {
                        second.feed(t, right, &self.options);
                    }
                }
            },
        }

        let RfdState::Running { first, second } = self.state else {
            return Step::Pending;
        };
        let readings = match (self.options.mode, first.reading(), second.reading()) {
            (HandMode::Single, Some(reading), _) => Sided::Single(reading),
            (HandMode::LeftRight, Some(left), Some(right)) => Sided::LeftRight {
                left,
                right,
                asymmetry: ratio(left.rfd, right.rfd),
            },
            _ => return Step::Pending,
        };
        self.state = RfdState::Complete;
        Step::Complete(RfdResult {
            unit: measurement.unit,
            readings,
        })
    }

    pub fn cancel(&mut self) {
        self.state = RfdState::Idle;
    }
}
