use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::GripError;
use crate::measurement::Unit;
use crate::protocol::{CriticalForceOptions, PeakForceOptions, RfdOptions};

/// Runtime settings for a [`ForceDevice`](crate::ForceDevice).
///
/// Every field has a default, so a JSON file only needs the keys it
/// changes:
///
/// ```json
/// { "unit": "lbs", "tare_duration_ms": 3000, "critical_force": { "trailing_reps": 4 } }
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub unit: Unit,
    /// How long a command waits for its response.
    pub write_timeout_ms: u64,
    /// A running stream or test gives up after this long without a sample.
    pub sample_timeout_ms: u64,
    pub tare_duration_ms: u64,
    /// Measurements buffered per subscriber before a slow one starts
    /// skipping.
    pub broadcast_capacity: usize,
    pub rfd: RfdOptions,
    pub critical_force: CriticalForceOptions,
    pub peak_force: PeakForceOptions,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            unit: Unit::Kg,
            write_timeout_ms: 5000,
            sample_timeout_ms: 5000,
            tare_duration_ms: 5000,
            broadcast_capacity: 1024,
            rfd: RfdOptions::default(),
            critical_force: CriticalForceOptions::default(),
            peak_force: PeakForceOptions::default(),
        }
    }
}

impl DeviceConfig {
    pub fn from_json_str(json: &str) -> Result<Self, GripError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| GripError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, GripError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| GripError::Config(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<(), GripError> {
        if self.broadcast_capacity == 0 {
            return Err(GripError::Config("broadcast_capacity must be positive".to_string()));
        }
        if self.critical_force.reps == 0 {
            return Err(GripError::Config("critical_force.reps must be positive".to_string()));
        }
        if self.critical_force.trailing_reps == 0
            || self.critical_force.trailing_reps > self.critical_force.reps
        {
            return Err(GripError::Config(format!(
                "critical_force.trailing_reps must be between 1 and {}",
                self.critical_force.reps
            )));
        }
        Ok(())
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn sample_timeout(&self) -> Duration {
        Duration::from_millis(self.sample_timeout_ms)
    }
}
