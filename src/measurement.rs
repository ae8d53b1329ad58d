use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::GripError;

const LBS_PER_KG: f64 = 2.20462;
const NEWTONS_PER_KG: f64 = 9.80665;

/// Display unit for force values. Devices report kilograms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Unit {
    #[default]
    Kg,
    Lbs,
    #[serde(rename = "n")]
    Newton,
}

impl Unit {
    fn per_kg(self) -> f64 {
        match self {
            Unit::Kg => 1.0,
            Unit::Lbs => LBS_PER_KG,
            Unit::Newton => NEWTONS_PER_KG,
        }
    }

    /// Convert `value` expressed in `self` into `target`.
    pub fn convert(self, value: f64, target: Unit) -> f64 {
        if self == target {
            return value;
        }
        value / self.per_kg() * target.per_kg()
    }

    pub fn symbol(self) -> &'static str {
        match self {
            Unit::Kg => "kg",
            Unit::Lbs => "lbs",
            Unit::Newton => "n",
        }
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

impl FromStr for Unit {
    type Err = GripError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "kg" => Ok(Unit::Kg),
            "lbs" | "lb" => Ok(Unit::Lbs),
            "n" => Ok(Unit::Newton),
            other => Err(GripError::Config(format!("unknown unit {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Left,
    Center,
    Right,
}

/// One reading straight out of a decoder, in device-native units (kg).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ForceSample {
    /// Monotonic milliseconds, device clock where the device provides one.
    pub timestamp_ms: u64,
    pub raw_value: f64,
    pub channel: Option<Channel>,
}

impl ForceSample {
    pub fn new(timestamp_ms: u64, raw_value: f64) -> Self {
        Self {
            timestamp_ms,
            raw_value,
            channel: None,
        }
    }

    pub fn on_channel(timestamp_ms: u64, raw_value: f64, channel: Channel) -> Self {
        Self {
            timestamp_ms,
            raw_value,
            channel: Some(channel),
        }
    }
}

/// Current/peak/mean of one value stream.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct ChannelStats {
    pub current: f64,
    pub peak: f64,
    pub mean: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct Distribution {
    pub left: Option<ChannelStats>,
    pub center: Option<ChannelStats>,
    pub right: Option<ChannelStats>,
}

impl Distribution {
    pub fn get(&self, channel: Channel) -> Option<&ChannelStats> {
        match channel {
            Channel::Left => self.left.as_ref(),
            Channel::Center => self.center.as_ref(),
            Channel::Right => self.right.as_ref(),
        }
    }
}

/// A calibrated, unit-converted reading with its aggregation window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ForceMeasurement {
    pub unit: Unit,
    pub timestamp_ms: u64,
    pub current: f64,
    pub peak: f64,
    pub mean: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sampling_rate_hz: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distribution: Option<Distribution>,
}

impl ForceMeasurement {
    /// A bare measurement with `peak` and `mean` equal to `current`.
    pub fn instant(unit: Unit, timestamp_ms: u64, current: f64) -> Self {
        Self {
            unit,
            timestamp_ms,
            current,
            peak: current,
            mean: current,
            sampling_rate_hz: None,
            distribution: None,
        }
    }

    /// Instantaneous force on `channel`, if the measurement carries one.
    pub fn channel_current(&self, channel: Channel) -> Option<f64> {
        self.distribution
            .as_ref()
            .and_then(|d| d.get(channel))
            .map(|s| s.current)
    }
}

/// Incremental peak and mean. Each update is O(1).
#[derive(Debug, Clone, Copy, Default)]
pub struct RunningStats {
    count: u64,
    current: f64,
    peak: f64,
    mean: f64,
}

impl RunningStats {
    pub fn push(&mut self, value: f64) {
        self.count += 1;
        self.current = value;
        if self.count == 1 || value > self.peak {
            self.peak = value;
        }
        self.mean += (value - self.mean) / self.count as f64;
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn current(&self) -> f64 {
        self.current
    }

    pub fn peak(&self) -> f64 {
        self.peak
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    pub fn snapshot(&self) -> ChannelStats {
        ChannelStats {
            current: self.current,
            peak: self.peak,
            mean: self.mean,
        }
    }
}
