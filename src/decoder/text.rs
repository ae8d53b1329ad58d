use tracing::trace;

use super::{Command, DecodeError, DecodedEvent};
use crate::error::GripError;
use crate::measurement::{Channel, ForceSample};

/// Longest unterminated tail kept between notifications.
pub const MAX_LINE_BYTES: usize = 256;

/// Codec for UART-bridge devices.
///
/// Commands are short ASCII tokens. Samples arrive as newline-terminated
/// lines, either `<ms>,<kg>` or `<ms>,<left>,<center>,<right>`. A line may be
/// split across notifications, so the tail after the last newline is held
/// until the next one.
#[derive(Debug, Clone, Default)]
pub struct TextCodec {
    partial: String,
}

impl TextCodec {
    pub fn decode(&mut self, bytes: &[u8]) -> Vec<DecodedEvent> {
        self.partial.push_str(&String::from_utf8_lossy(bytes));

        let mut events = Vec::new();
        while let Some(end) = self.partial.find('\n') {
            let line: String = self.partial.drain(..=end).collect();
            let line = line.trim();
            if !line.is_empty() {
                Self::decode_line(line, &mut events);
            }
        }
        if self.partial.len() > MAX_LINE_BYTES {
            trace!("dropping {} unterminated bytes", self.partial.len());
            self.partial.clear();
            events.push(DecodedEvent::DecodeError(DecodeError::LineTooLong(
                MAX_LINE_BYTES,
            )));
        }
        events
    }

    fn decode_line(line: &str, events: &mut Vec<DecodedEvent>) {
        trace!("text RX: {line}");

        let fields: Option<Vec<f64>> = line
            .split(',')
            .map(|f| f.trim().parse::<f64>().ok().filter(|v| v.is_finite()))
            .collect();
        let fields = match fields {
            Some(fields) => fields,
            None => {
                events.push(DecodedEvent::DecodeError(DecodeError::UnrecognizedLine(
                    line.to_string(),
                )));
                return;
            }
        };

        match fields[..] {
            [ms, kg] if ms >= 0.0 => {
                events.push(DecodedEvent::WeightSample(ForceSample::new(ms as u64, kg)));
            }
            [ms, left, center, right] if ms >= 0.0 => {
                let ms = ms as u64;
                events.push(DecodedEvent::WeightFrame(vec![
                    ForceSample::on_channel(ms, left, Channel::Left),
                    ForceSample::on_channel(ms, center, Channel::Center),
                    ForceSample::on_channel(ms, right, Channel::Right),
                ]));
            }
            _ => events.push(DecodedEvent::DecodeError(DecodeError::UnrecognizedLine(
                line.to_string(),
            ))),
        }
    }

    pub fn encode(&self, command: &Command) -> Result<Vec<u8>, GripError> {
        let token = match command {
            Command::Raw(bytes) => return Ok(bytes.clone()),
            Command::StartWeightMeasurement => "S30",
            Command::StopWeightMeasurement => "S0",
            Command::GetAppVersion => "V",
            Command::GetBattery => "P",
            Command::Sleep => "Z",
            Command::TareScale
            | Command::StartPeakRfd
            | Command::GetErrorInfo
            | Command::ClearErrorInfo => {
                return Err(GripError::Unsupported(command.name()));
            }
        };
        Ok(token.as_bytes().to_vec())
    }
}
