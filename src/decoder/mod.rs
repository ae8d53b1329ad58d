//! Per-family notification decoding and command encoding.
//!
//! A decoder never fails: a malformed frame comes out as a
//! [`DecodedEvent::DecodeError`] so one bad notification cannot stop the
//! stream.

mod advertisement;
mod binary;
mod text;

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

pub use advertisement::AdvertisementCodec;
pub use binary::{ack_frame, weight_frame, BinaryCodec, MAX_SAMPLES_PER_FRAME};
pub use text::TextCodec;

use crate::descriptor::DeviceFamily;
use crate::error::GripError;
use crate::measurement::ForceSample;

/// Commands understood by at least one device family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    TareScale,
    StartWeightMeasurement,
    StopWeightMeasurement,
    StartPeakRfd,
    GetAppVersion,
    GetErrorInfo,
    ClearErrorInfo,
    Sleep,
    GetBattery,
    /// Sent to the device byte for byte.
    Raw(Vec<u8>),
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::TareScale => "TARE_SCALE",
            Command::StartWeightMeasurement => "START_WEIGHT_MEAS",
            Command::StopWeightMeasurement => "STOP_WEIGHT_MEAS",
            Command::StartPeakRfd => "START_PEAK_RFD_MEAS",
            Command::GetAppVersion => "GET_APP_VERSION",
            Command::GetErrorInfo => "GET_ERROR_INFORMATION",
            Command::ClearErrorInfo => "CLR_ERROR_INFORMATION",
            Command::Sleep => "SLEEP",
            Command::GetBattery => "GET_BATTERY",
            Command::Raw(_) => "RAW",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Raw(bytes) => write!(f, "RAW({})", hex::encode(bytes)),
            other => f.write_str(other.name()),
        }
    }
}

impl FromStr for Command {
    type Err = GripError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let command = match s {
            "TARE_SCALE" => Command::TareScale,
            "START_WEIGHT_MEAS" => Command::StartWeightMeasurement,
            "STOP_WEIGHT_MEAS" => Command::StopWeightMeasurement,
            "START_PEAK_RFD_MEAS" => Command::StartPeakRfd,
            "GET_APP_VERSION" => Command::GetAppVersion,
            "GET_ERROR_INFORMATION" => Command::GetErrorInfo,
            "CLR_ERROR_INFORMATION" => Command::ClearErrorInfo,
            "SLEEP" => Command::Sleep,
            "GET_BATTERY" | "GET_BATTERY_VOLTAGE" => Command::GetBattery,
            other => return Err(GripError::Config(format!("unknown command {other:?}"))),
        };
        Ok(command)
    }
}

/// Payload of a response frame.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandResponse {
    /// Zero means success.
    pub return_code: u8,
    pub payload: Vec<u8>,
}

impl CommandResponse {
    pub fn is_success(&self) -> bool {
        self.return_code == 0
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload)
            .trim_end_matches('\0')
            .to_string()
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("frame truncated: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("unknown opcode 0x{0:02x}")]
    UnknownOpcode(u8),

    #[error("weight payload of {0} bytes is not a whole number of samples")]
    PartialSample(usize),

    #[error("force value {0} is not finite")]
    NonFiniteForce(String),

    #[error("unrecognized line {0:?}")]
    UnrecognizedLine(String),

    #[error("line exceeds {0} bytes without a terminator")]
    LineTooLong(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub enum DecodedEvent {
    WeightSample(ForceSample),
    /// One reading per channel, all taken at the same instant.
    WeightFrame(Vec<ForceSample>),
    CommandAck(CommandResponse),
    BatteryLevel(u8),
    ErrorInfo(String),
    /// Unsolicited; never answers a command.
    LowPower,
    DecodeError(DecodeError),
}

impl DecodedEvent {
    /// Response-class events may resolve a pending command.
    pub fn is_response(&self) -> bool {
        self.as_reply().is_some()
    }

    pub fn as_reply(&self) -> Option<Reply> {
        match self {
            DecodedEvent::CommandAck(response) => Some(Reply::Ack(response.clone())),
            DecodedEvent::ErrorInfo(text) => Some(Reply::ErrorInfo(text.clone())),
            _ => None,
        }
    }
}

/// What a pending command receives from the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Ack(CommandResponse),
    ErrorInfo(String),
}

impl Reply {
    /// The outcome of `command` given this reply. Error information is the
    /// payload of `GetErrorInfo` and a device error for anything else.
    pub fn answer(self, command: &Command) -> Result<CommandResponse, GripError> {
        match self {
            Reply::Ack(response) => Ok(response),
            Reply::ErrorInfo(text) if *command == Command::GetErrorInfo => Ok(CommandResponse {
                return_code: 0,
                payload: text.into_bytes(),
            }),
            Reply::ErrorInfo(text) => Err(GripError::DeviceError(text)),
        }
    }
}

/// How a characteristic read is presented to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawValue {
    Number(u64),
    Text(String),
    Bytes(Vec<u8>),
}

impl RawValue {
    /// The default convention: `"level"` is a single unsigned byte,
    /// everything else is UTF-8 text.
    pub fn by_convention(characteristic_id: &str, bytes: &[u8]) -> Self {
        if characteristic_id == "level" {
            RawValue::Number(bytes.first().copied().unwrap_or_default() as u64)
        } else {
            RawValue::Text(String::from_utf8_lossy(bytes).trim_end_matches('\0').to_string())
        }
    }
}

/// The decode/encode capability set of one device family.
#[derive(Debug, Clone)]
pub enum DeviceCodec {
    Binary(BinaryCodec),
    Advertisement(AdvertisementCodec),
    Text(TextCodec),
}

impl DeviceCodec {
    pub fn for_family(family: DeviceFamily) -> Self {
        match family {
            DeviceFamily::BinaryCommand => DeviceCodec::Binary(BinaryCodec::default()),
            DeviceFamily::Advertisement => DeviceCodec::Advertisement(AdvertisementCodec),
            DeviceFamily::TextCommand => DeviceCodec::Text(TextCodec::default()),
        }
    }

    /// Decode one notification. `received_at_ms` is the host clock and is
    /// only used by families whose payloads carry no time base.
    pub fn decode(&mut self, bytes: &[u8], received_at_ms: u64) -> Vec<DecodedEvent> {
        match self {
            DeviceCodec::Binary(codec) => codec.decode(bytes),
            DeviceCodec::Advertisement(codec) => vec![codec.decode(bytes, received_at_ms)],
            DeviceCodec::Text(codec) => codec.decode(bytes),
        }
    }

    pub fn encode(&self, command: &Command) -> Result<Vec<u8>, GripError> {
        match self {
            DeviceCodec::Binary(codec) => Ok(codec.encode(command)),
            DeviceCodec::Advertisement(_) => {
                Err(GripError::Unsupported("commands on an advertising device"))
            }
            DeviceCodec::Text(codec) => codec.encode(command),
        }
    }

    /// Whether a write waits for a correlated response frame.
    pub fn acknowledges_commands(&self) -> bool {
        matches!(self, DeviceCodec::Binary(_))
    }

    /// Called after a command reached the device.
    pub fn command_sent(&mut self, command: &Command) {
        if let (DeviceCodec::Binary(codec), Command::StartWeightMeasurement) = (self, command) {
            codec.reset_clock();
        }
    }

    pub fn decode_read(&self, characteristic_id: &str, bytes: &[u8]) -> RawValue {
        match self {
            DeviceCodec::Binary(_) if matches!(characteristic_id, "rx" | "tx") => {
                RawValue::Bytes(bytes.to_vec())
            }
            _ => RawValue::by_convention(characteristic_id, bytes),
        }
    }
}
