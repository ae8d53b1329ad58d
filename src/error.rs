use thiserror::Error;

/// Errors surfaced to callers of the device and characteristic layers.
///
/// Decode failures on individual notifications are not part of this type;
/// they travel through the stream as [`crate::decoder::DecodeError`] events.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GripError {
    #[error("device is not connected")]
    NotConnected,

    #[error("unknown characteristic {service}/{characteristic}")]
    UnknownCharacteristic {
        service: String,
        characteristic: String,
    },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("no response within {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },

    #[error("a command is already awaiting a response on {0}")]
    CommandInFlight(String),

    #[error("{0} is already running")]
    Busy(&'static str),

    #[error("operation not supported by this device family: {0}")]
    Unsupported(&'static str),

    #[error("device reported an error: {0}")]
    DeviceError(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl From<crate::transport::TransportError> for GripError {
    fn from(err: crate::transport::TransportError) -> Self {
        match err {
            crate::transport::TransportError::Disconnected => GripError::NotConnected,
            other => GripError::Transport(other.to_string()),
        }
    }
}
