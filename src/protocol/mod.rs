//! Strength-test state machines.
//!
//! Every machine is driven by [`ForceMeasurement`](crate::ForceMeasurement)
//! timestamps only, so a synthetic sample sequence replays identically. A
//! machine cancelled before completion drops everything it accumulated and
//! reports nothing.

mod activity;
mod critical_force;
mod peak_force;
mod rfd;

use serde::{Deserialize, Serialize};

pub use activity::{Activity, ActivityMonitor};
pub use critical_force::{
    CriticalForceOptions, CriticalForcePhase, CriticalForceResult, CriticalForceSession, RepSummary,
};
pub use peak_force::{PeakForceOptions, PeakForceReading, PeakForceResult, PeakForceSession};
pub use rfd::{RfdOptions, RfdReading, RfdResult, RfdSession};

/// What a machine made of one measurement.
#[derive(Debug, Clone, PartialEq)]
pub enum Step<R> {
    /// Still running (or idle); nothing to report.
    Pending,
    Complete(R),
}

/// How a test run ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", content = "result", rename_all = "lowercase")]
pub enum TestOutcome<R> {
    Complete(R),
    /// Cancelled by the caller or aborted by a lost connection.
    Cancelled,
}

impl<R> TestOutcome<R> {
    pub fn complete(self) -> Option<R> {
        match self {
            TestOutcome::Complete(r) => Some(r),
            TestOutcome::Cancelled => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandMode {
    #[default]
    Single,
    /// Independent left and right channels taken from the measurement's
    /// distribution.
    LeftRight,
}

/// A reading for one channel, or for both sides with their ratio.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Sided<T> {
    Single(T),
    LeftRight {
        left: T,
        right: T,
        /// `left / right`; absent when the right side is zero.
        asymmetry: Option<f64>,
    },
}

pub(crate) fn ratio(left: f64, right: f64) -> Option<f64> {
    (right != 0.0).then(|| left / right)
}

/// Record handed to exporters.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "test", rename_all = "snake_case")]
pub enum TestResult {
    Rfd(RfdResult),
    CriticalForce(CriticalForceResult),
    PeakForce(PeakForceResult),
}

/// A test that consumes measurements until it produces a result.
pub trait TestSession {
    type Output;

    fn feed(&mut self, measurement: &crate::measurement::ForceMeasurement) -> Step<Self::Output>;

    /// Discard accumulated data and go idle.
    fn cancel(&mut self);
}

macro_rules! impl_test_session {
    ($session:ty, $output:ty) => {
        impl TestSession for $session {
            type Output = $output;

            fn feed(&mut self, measurement: &crate::measurement::ForceMeasurement) -> Step<$output> {
                <$session>::feed(self, measurement)
            }

            fn cancel(&mut self) {
                <$session>::cancel(self)
            }
        }
    };
}

impl_test_session!(RfdSession, RfdResult);
impl_test_session!(CriticalForceSession, CriticalForceResult);
impl_test_session!(PeakForceSession, PeakForceResult);

/// Countdown before a test starts, measured from the first sample seen.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Countdown {
    duration_ms: u64,
    started_at: Option<u64>,
}

impl Countdown {
    pub(crate) fn new(duration_ms: u64) -> Self {
        Self {
            duration_ms,
            started_at: None,
        }
    }

    /// Returns the timestamp the countdown ended at once `timestamp_ms`
    /// reaches it.
    pub(crate) fn poll(&mut self, timestamp_ms: u64) -> Option<u64> {
        let started_at = *self.started_at.get_or_insert(timestamp_ms);
        let ends_at = started_at + self.duration_ms;
        (timestamp_ms >= ends_at).then_some(ends_at)
    }
}
