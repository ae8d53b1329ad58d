use tracing::trace;

use super::{Command, CommandResponse, DecodeError, DecodedEvent};
use crate::measurement::ForceSample;

const RES_CMD_RESPONSE: u8 = 0x00;
const RES_WEIGHT_MEAS: u8 = 0x01;
const RES_BATTERY_LEVEL: u8 = 0x02;
const RES_ERROR_INFO: u8 = 0x03;
const RES_LOW_PWR_WARNING: u8 = 0x04;

const CMD_TARE_SCALE: u8 = 0x64;
const CMD_START_WEIGHT_MEAS: u8 = 0x65;
const CMD_STOP_WEIGHT_MEAS: u8 = 0x66;
const CMD_START_PEAK_RFD_MEAS: u8 = 0x67;
const CMD_GET_APP_VERSION: u8 = 0x6b;
const CMD_GET_ERROR_INFORMATION: u8 = 0x6c;
const CMD_CLR_ERROR_INFORMATION: u8 = 0x6d;
const CMD_ENTER_SLEEP: u8 = 0x6e;
const CMD_GET_BATTERY_VOLTAGE: u8 = 0x6f;

/// Bytes per `(delta_time_ms, force)` tuple in a weight payload.
const SAMPLE_STRIDE: usize = 8;

/// Most samples one weight frame can carry with a one-byte length.
pub const MAX_SAMPLES_PER_FRAME: usize = u8::MAX as usize / SAMPLE_STRIDE;

/// Codec for the opcode/length/payload protocol.
///
/// Frame format:
///
/// ```text
/// Byte     | Meaning
/// 0        | opcode
/// 1        | payload length n
/// 2..2+n   | payload
/// ```
///
/// Several frames may be packed into one notification.
#[derive(Debug, Clone, Default)]
pub struct BinaryCodec {
    /// Milliseconds since the weight session started, summed from the
    /// per-sample deltas.
    elapsed_ms: u64,
}

impl BinaryCodec {
    /// Restart the sample clock at zero.
    pub fn reset_clock(&mut self) {
        self.elapsed_ms = 0;
    }

    pub fn decode(&mut self, bytes: &[u8]) -> Vec<DecodedEvent> {
        trace!("binary RX: {}", hex::encode(bytes));

        let mut events = Vec::new();
        let mut rest = bytes;
        while !rest.is_empty() {
            if rest.len() < 2 {
                events.push(DecodedEvent::DecodeError(DecodeError::Truncated {
                    expected: 2,
                    actual: rest.len(),
                }));
                break;
            }
            let opcode = rest[0];
            let len = rest[1] as usize;
            if rest.len() < 2 + len {
                events.push(DecodedEvent::DecodeError(DecodeError::Truncated {
                    expected: 2 + len,
                    actual: rest.len(),
                }));
                break;
            }
            self.decode_frame(opcode, &rest[2..2 + len], &mut events);
            rest = &rest[2 + len..];
        }
        events
    }

    fn decode_frame(&mut self, opcode: u8, payload: &[u8], events: &mut Vec<DecodedEvent>) {
        match opcode {
            RES_CMD_RESPONSE => {
                let (return_code, data) = match payload.split_first() {
                    Some((code, data)) => (*code, data.to_vec()),
                    None => (0, Vec::new()),
                };
                events.push(DecodedEvent::CommandAck(CommandResponse {
                    return_code,
                    payload: data,
                }));
            }
            RES_WEIGHT_MEAS => self.decode_weights(payload, events),
            RES_BATTERY_LEVEL => match payload.first() {
                Some(level) => events.push(DecodedEvent::BatteryLevel(*level)),
                None => events.push(DecodedEvent::DecodeError(DecodeError::Truncated {
                    expected: 1,
                    actual: 0,
                })),
            },
            RES_ERROR_INFO => events.push(DecodedEvent::ErrorInfo(
                String::from_utf8_lossy(payload)
                    .trim_end_matches('\0')
                    .to_string(),
            )),
            RES_LOW_PWR_WARNING => events.push(DecodedEvent::LowPower),
            unknown => events.push(DecodedEvent::DecodeError(DecodeError::UnknownOpcode(unknown))),
        }
    }

    fn decode_weights(&mut self, payload: &[u8], events: &mut Vec<DecodedEvent>) {
        let mut chunks = payload.chunks_exact(SAMPLE_STRIDE);
        for chunk in &mut chunks {
            let delta_ms = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            let force = f32::from_le_bytes([chunk[4], chunk[5], chunk[6], chunk[7]]);
            self.elapsed_ms += delta_ms as u64;
            if !force.is_finite() {
                events.push(DecodedEvent::DecodeError(DecodeError::NonFiniteForce(
                    force.to_string(),
                )));
                continue;
            }
            events.push(DecodedEvent::WeightSample(ForceSample::new(
                self.elapsed_ms,
                force as f64,
            )));
        }
        if !chunks.remainder().is_empty() {
            events.push(DecodedEvent::DecodeError(DecodeError::PartialSample(
                payload.len(),
            )));
        }
    }

    pub fn encode(&self, command: &Command) -> Vec<u8> {
        let opcode = match command {
            Command::Raw(bytes) => return bytes.clone(),
            Command::TareScale => CMD_TARE_SCALE,
            Command::StartWeightMeasurement => CMD_START_WEIGHT_MEAS,
            Command::StopWeightMeasurement => CMD_STOP_WEIGHT_MEAS,
            Command::StartPeakRfd => CMD_START_PEAK_RFD_MEAS,
            Command::GetAppVersion => CMD_GET_APP_VERSION,
            Command::GetErrorInfo => CMD_GET_ERROR_INFORMATION,
            Command::ClearErrorInfo => CMD_CLR_ERROR_INFORMATION,
            Command::Sleep => CMD_ENTER_SLEEP,
            Command::GetBattery => CMD_GET_BATTERY_VOLTAGE,
        };
        vec![opcode, 0]
    }
}

/// Build a weight frame from `(delta_time_ms, force)` pairs.
///
/// # Panics
///
/// If `samples` holds more than [`MAX_SAMPLES_PER_FRAME`] pairs.
pub fn weight_frame(samples: &[(u32, f32)]) -> Vec<u8> {
    assert!(
        samples.len() <= MAX_SAMPLES_PER_FRAME,
        "{} samples do not fit one weight frame",
        samples.len()
    );
    let mut frame = vec![RES_WEIGHT_MEAS, (samples.len() * SAMPLE_STRIDE) as u8];
    for (delta, force) in samples {
        frame.extend_from_slice(&delta.to_le_bytes());
        frame.extend_from_slice(&force.to_le_bytes());
    }
    frame
}

/// Build a command response frame.
pub fn ack_frame(return_code: u8, data: &[u8]) -> Vec<u8> {
    let mut frame = vec![RES_CMD_RESPONSE, (data.len() + 1) as u8, return_code];
    frame.extend_from_slice(data);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batched_weight_frame() {
        let mut codec = BinaryCodec::default();
        let events = codec.decode(&weight_frame(&[(0, 25.0), (100, 26.5)]));
        assert_eq!(
            events,
            vec![
                DecodedEvent::WeightSample(ForceSample::new(0, 25.0)),
                DecodedEvent::WeightSample(ForceSample::new(100, 26.5)),
            ]
        );
    }

    #[test]
    fn test_timestamps_accumulate_across_notifications() {
        let mut codec = BinaryCodec::default();
        codec.decode(&weight_frame(&[(0, 1.0), (80, 1.0)]));
        let events = codec.decode(&weight_frame(&[(80, 2.0)]));
        assert_eq!(
            events,
            vec![DecodedEvent::WeightSample(ForceSample::new(160, 2.0))]
        );
        codec.reset_clock();
        let events = codec.decode(&weight_frame(&[(5, 3.0)]));
        assert_eq!(
            events,
            vec![DecodedEvent::WeightSample(ForceSample::new(5, 3.0))]
        );
    }

    #[test]
    fn test_ack_and_battery_in_one_notification() {
        let mut codec = BinaryCodec::default();
        let mut bytes = ack_frame(0, &[0x10, 0x0e]);
        bytes.extend_from_slice(&[RES_BATTERY_LEVEL, 1, 77]);
        let events = codec.decode(&bytes);
        assert_eq!(
            events,
            vec![
                DecodedEvent::CommandAck(CommandResponse {
                    return_code: 0,
                    payload: vec![0x10, 0x0e],
                }),
                DecodedEvent::BatteryLevel(77),
            ]
        );
    }

    #[test]
    fn test_malformed_frames_are_events() {
        let mut codec = BinaryCodec::default();
        assert_eq!(
            codec.decode(&[0x42, 0]),
            vec![DecodedEvent::DecodeError(DecodeError::UnknownOpcode(0x42))]
        );
        assert_eq!(
            codec.decode(&[RES_WEIGHT_MEAS, 8, 0, 0]),
            vec![DecodedEvent::DecodeError(DecodeError::Truncated {
                expected: 10,
                actual: 4,
            })]
        );

        let mut frame = weight_frame(&[(10, 4.0)]);
        frame[1] = 11;
        frame.extend_from_slice(&[0, 0, 0]);
        let events = codec.decode(&frame);
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[0],
            DecodedEvent::WeightSample(ForceSample::new(10, 4.0))
        );
        assert_eq!(
            events[1],
            DecodedEvent::DecodeError(DecodeError::PartialSample(11))
        );
    }

    #[test]
    fn test_error_info_and_low_power() {
        let mut codec = BinaryCodec::default();
        let mut bytes = vec![RES_ERROR_INFO, 4];
        bytes.extend_from_slice(b"E12\0");
        bytes.extend_from_slice(&[RES_LOW_PWR_WARNING, 0]);
        assert_eq!(
            codec.decode(&bytes),
            vec![
                DecodedEvent::ErrorInfo("E12".to_string()),
                DecodedEvent::LowPower,
            ]
        );
    }

    #[test]
    fn test_non_finite_force_skipped_clock_kept() {
        let mut codec = BinaryCodec::default();
        let events = codec.decode(&weight_frame(&[(10, f32::NAN), (10, f32::INFINITY), (10, 2.0)]));
        assert_eq!(
            events,
            vec![
                DecodedEvent::DecodeError(DecodeError::NonFiniteForce("NaN".to_string())),
                DecodedEvent::DecodeError(DecodeError::NonFiniteForce("inf".to_string())),
                DecodedEvent::WeightSample(ForceSample::new(30, 2.0)),
            ]
        );
    }

    #[test]
    fn test_full_weight_frame() {
        let samples = [(1u32, 1.0f32); MAX_SAMPLES_PER_FRAME];
        let frame = weight_frame(&samples);
        assert_eq!(frame[1] as usize, MAX_SAMPLES_PER_FRAME * SAMPLE_STRIDE);
        assert_eq!(BinaryCodec::default().decode(&frame).len(), MAX_SAMPLES_PER_FRAME);
    }

    #[test]
    #[should_panic(expected = "do not fit one weight frame")]
    fn test_oversized_weight_frame_refused() {
        weight_frame(&[(1u32, 1.0f32); MAX_SAMPLES_PER_FRAME + 1]);
    }

    #[test]
    fn test_encode() {
        let codec = BinaryCodec::default();
        assert_eq!(codec.encode(&Command::GetBattery), vec![0x6f, 0]);
        assert_eq!(codec.encode(&Command::TareScale), vec![0x64, 0]);
        assert_eq!(codec.encode(&Command::Raw(vec![1, 2, 3])), vec![1, 2, 3]);
    }
}
