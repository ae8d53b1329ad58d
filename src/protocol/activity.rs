use serde::Serialize;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Activity {
    Inactive,
    Active,
}

impl Activity {
    fn opposite(self) -> Self {
        match self {
            Activity::Inactive => Activity::Active,
            Activity::Active => Activity::Inactive,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum DebounceState {
    Steady(Activity),
    /// On the other side of the threshold since `since_ms`, not yet
    /// confirmed.
    Crossing { settled: Activity, since_ms: u64 },
}

/// Debounced threshold detector.
///
/// Force above `threshold` reads as active. A change is reported only after
/// the signal has stayed on the new side for `duration_ms`; going back early
/// discards the candidate.
#[derive(Debug, Clone)]
pub struct ActivityMonitor {
    threshold: f64,
    duration_ms: u64,
    state: DebounceState,
}

impl ActivityMonitor {
    pub fn new(threshold: f64, duration_ms: u64) -> Self {
        Self {
            threshold,
            duration_ms,
            state: DebounceState::Steady(Activity::Inactive),
        }
    }

    /// The last confirmed state.
    pub fn activity(&self) -> Activity {
        match self.state {
            DebounceState::Steady(activity) => activity,
            DebounceState::Crossing { settled, .. } => settled,
        }
    }

    /// Feed one reading; returns the new state when a transition is
    /// confirmed.
    pub fn feed(&mut self, timestamp_ms: u64, force: f64) -> Option<Activity> {
        let side = if force > self.threshold {
            Activity::Active
        } else {
            Activity::Inactive
        };

        match self.state {
            DebounceState::Steady(settled) if side == settled => None,
            DebounceState::Steady(settled) => {
                self.state = DebounceState::Crossing {
                    settled,
                    since_ms: timestamp_ms,
                };
                self.confirm(timestamp_ms)
            }
            DebounceState::Crossing { settled, .. } if side == settled => {
                self.state = DebounceState::Steady(settled);
                None
            }
            DebounceState::Crossing { .. } => self.confirm(timestamp_ms),
        }
    }

    fn confirm(&mut self, timestamp_ms: u64) -> Option<Activity> {
        let DebounceState::Crossing { settled, since_ms } = self.state else {
            return None;
        };
        if timestamp_ms.saturating_sub(since_ms) < self.duration_ms {
            return None;
        }
        let activity = settled.opposite();
        self.state = DebounceState::Steady(activity);
        debug!("activity changed to {activity:?} at {timestamp_ms} ms");
        Some(activity)
    }

    /// Back to inactive with no pending candidate.
    pub fn cancel(&mut self) {
        self.state = DebounceState::Steady(Activity::Inactive);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(monitor: &mut ActivityMonitor, signal: &[(u64, f64)]) -> Vec<(u64, Activity)> {
        signal
            .iter()
            .filter_map(|(t, f)| monitor.feed(*t, *f).map(|a| (*t, a)))
            .collect()
    }

    /// 1 ms samples: above threshold on `[0, high_ms]`, then low until 2000.
    fn pulse(high_ms: u64) -> Vec<(u64, f64)> {
        (0..2000)
            .map(|t| (t, if t <= high_ms { 10.0 } else { 0.0 }))
            .collect()
    }

    #[test]
    fn test_short_crossing_does_not_trigger() {
        let mut monitor = ActivityMonitor::new(5.0, 500);
        assert!(run(&mut monitor, &pulse(499)).is_empty());
        assert_eq!(monitor.activity(), Activity::Inactive);
    }

    #[test]
    fn test_long_crossing_triggers_once() {
        let mut monitor = ActivityMonitor::new(5.0, 500);
        let changes = run(&mut monitor, &pulse(501));
        assert_eq!(changes[0], (500, Activity::Active));
        assert_eq!(
            changes.iter().filter(|(_, a)| *a == Activity::Active).count(),
            1
        );
        assert_eq!(changes[1], (1002, Activity::Inactive));
        assert_eq!(changes.len(), 2);
    }

    #[test]
    fn test_noise_spike_is_ignored() {
        let mut monitor = ActivityMonitor::new(5.0, 100);
        let mut signal: Vec<(u64, f64)> = (0..1000).map(|t| (t * 10, 0.0)).collect();
        signal[40].1 = 50.0;
        assert!(run(&mut monitor, &signal).is_empty());
    }

    #[test]
    fn test_zero_duration_reacts_immediately() {
        let mut monitor = ActivityMonitor::new(1.0, 0);
        assert_eq!(monitor.feed(0, 2.0), Some(Activity::Active));
        assert_eq!(monitor.feed(1, 2.0), None);
        assert_eq!(monitor.feed(2, 0.0), Some(Activity::Inactive));
    }

    #[test]
    fn test_cancel_discards_candidate() {
        let mut monitor = ActivityMonitor::new(1.0, 100);
        monitor.feed(0, 2.0);
        monitor.cancel();
        assert_eq!(monitor.feed(150, 2.0), None);
        assert_eq!(monitor.feed(250, 2.0), Some(Activity::Active));
    }
}
