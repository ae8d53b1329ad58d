use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{Countdown, Step};
use crate::measurement::{ForceMeasurement, RunningStats, Unit};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CriticalForceOptions {
    pub countdown_ms: u64,
    pub pull_ms: u64,
    pub rest_ms: u64,
    pub reps: u32,
    /// How many of the final reps make up the headline number.
    pub trailing_reps: u32,
}

impl Default for CriticalForceOptions {
    fn default() -> Self {
        Self {
            countdown_ms: 3000,
            pull_ms: 7000,
            rest_ms: 3000,
            reps: 24,
            trailing_reps: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RepSummary {
    /// 1-based.
    pub rep: u32,
    pub peak: f64,
    pub mean: f64,
    pub samples: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CriticalForceResult {
    pub unit: Unit,
    pub critical_force: f64,
    pub trailing_reps: u32,
    pub reps: Vec<RepSummary>,
}

/// Where the protocol is, for live display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum CriticalForcePhase {
    Idle,
    Countdown,
    Pull { rep: u32 },
    Rest { rep: u32 },
    Complete,
}

#[derive(Debug, Clone)]
enum CfState {
    Idle,
    Countdown(Countdown),
    /// `started_at` is the scheduled start of the current pull.
    Pull { rep: u32, started_at: u64, stats: RunningStats },
    Rest { rep: u32, started_at: u64 },
    Complete,
}

/// Repeated pull/rest intervals; the critical force is the mean of the
/// per-rep mean forces over the last `trailing_reps` reps.
///
/// Phase boundaries are scheduled from the end of the countdown, not from
/// sample arrival, so jitter never stretches the protocol.
#[derive(Debug, Clone)]
pub struct CriticalForceSession {
    options: CriticalForceOptions,
    state: CfState,
    reps: Vec<RepSummary>,
    unit: Unit,
}

impl CriticalForceSession {
    pub fn new(options: CriticalForceOptions) -> Self {
        Self {
            options,
            state: CfState::Countdown(Countdown::new(options.countdown_ms)),
            reps: Vec::with_capacity(options.reps as usize),
            unit: Unit::default(),
        }
    }

    pub fn phase(&self) -> CriticalForcePhase {
        match &self.state {
            CfState::Idle => CriticalForcePhase::Idle,
            CfState::Countdown(_) => CriticalForcePhase::Countdown,
            CfState::Pull { rep, .. } => CriticalForcePhase::Pull { rep: *rep },
            CfState::Rest { rep, .. } => CriticalForcePhase::Rest { rep: *rep },
            CfState::Complete => CriticalForcePhase::Complete,
        }
    }

    pub fn is_running(&self) -> bool {
        !matches!(self.state, CfState::Idle | CfState::Complete)
    }

    pub fn feed(&mut self, measurement: &ForceMeasurement) -> Step<CriticalForceResult> {
        let t = measurement.timestamp_ms;
        self.unit = measurement.unit;

        if let CfState::Countdown(countdown) = &mut self.state {
            match countdown.poll(t) {
                Some(ends_at) => {
                    self.state = CfState::Pull {
                        rep: 1,
                        started_at: ends_at,
                        stats: RunningStats::default(),
                    };
                }
                None => return Step::Pending,
            }
        }

        // A gap in the stream may jump over whole phases.
        loop {
            match &self.state {
                CfState::Pull { rep, started_at, stats } if t >= started_at + self.options.pull_ms => {
                    let (rep, ends_at) = (*rep, started_at + self.options.pull_ms);
                    self.reps.push(RepSummary {
                        rep,
                        peak: stats.peak(),
                        mean: stats.mean(),
                        samples: stats.count(),
                    });
                    debug!("rep {rep} done: mean {:.2}", stats.mean());
                    if rep >= self.options.reps {
                        return self.finish();
                    }
                    self.state = CfState::Rest {
                        rep,
                        started_at: ends_at,
                    };
                }
                CfState::Rest { rep, started_at } if t >= started_at + self.options.rest_ms => {
                    self.state = CfState::Pull {
                        rep: rep + 1,
                        started_at: started_at + self.options.rest_ms,
                        stats: RunningStats::default(),
                    };
                }
                _ => break,
            }
        }

        if let CfState::Pull { stats, .. } = &mut self.state {
            stats.push(measurement.current);
        }
        Step::Pending
    }

    fn finish(&mut self) -> Step<CriticalForceResult> {
        self.state = CfState::Complete;
        let trailing: Vec<f64> = self
            .reps
            .iter()
            .rev()
            .filter(|r| r.samples > 0)
            .take(self.options.trailing_reps.max(1) as usize)
            .map(|r| r.mean)
            .collect();
        let critical_force = if trailing.is_empty() {
            0.0
        } else {
            trailing.iter().sum::<f64>() / trailing.len() as f64
        };
        Step::Complete(CriticalForceResult {
            unit: self.unit,
            critical_force,
            trailing_reps: trailing.len() as u32,
            reps: std::mem::take(&mut self.reps),
        })
    }

    pub fn cancel(&mut self) {
        self.state = CfState::Idle;
        self.reps.clear();
    }
}
