use tracing::trace;

use super::DecodedEvent;
use crate::measurement::ForceSample;

/// Byte offset of the big-endian weight field in the manufacturer data.
const WEIGHT_OFFSET: usize = 12;
/// Raw weight units per kilogram.
const WEIGHT_DIVISOR: f64 = 100.0;

/// Decoder for scales that publish their reading in advertisements.
///
/// Manufacturer data is accepted either as raw bytes or as the ASCII hex
/// string some platform stacks hand out. Anything that does not carry a
/// weight field decodes to a zero reading so a lost advertisement never
/// ends a passive listener.
#[derive(Debug, Clone, Copy, Default)]
pub struct AdvertisementCodec;

impl AdvertisementCodec {
    pub fn decode(&self, bytes: &[u8], received_at_ms: u64) -> DecodedEvent {
        let kg = Self::weight_kg(bytes).unwrap_or_else(|| {
            trace!("advertisement without weight: {}", hex::encode(bytes));
            0.0
        });
        DecodedEvent::WeightSample(ForceSample::new(received_at_ms, kg))
    }

    fn weight_kg(bytes: &[u8]) -> Option<f64> {
        let decoded;
        let data = if Self::looks_like_hex(bytes) {
            decoded = hex::decode(bytes).ok()?;
            &decoded[..]
        } else {
            bytes
        };
        let field = data.get(WEIGHT_OFFSET..WEIGHT_OFFSET + 2)?;
        let raw = u16::from_be_bytes([field[0], field[1]]);
        Some(raw as f64 / WEIGHT_DIVISOR)
    }

    fn looks_like_hex(bytes: &[u8]) -> bool {
        !bytes.is_empty() && bytes.len() % 2 == 0 && bytes.iter().all(u8::is_ascii_hexdigit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(event: DecodedEvent) -> ForceSample {
        match event {
            DecodedEvent::WeightSample(s) => s,
            other => panic!("expected a weight sample, got {other:?}"),
        }
    }

    #[test]
    fn test_raw_manufacturer_data() {
        let mut data = vec![0u8; 16];
        data[12] = 0x0b;
        data[13] = 0xb8;
        let s = sample(AdvertisementCodec.decode(&data, 1234));
        assert_eq!(s.timestamp_ms, 1234);
        assert!((s.raw_value - 30.0).abs() < 1e-9);
    }

    #[test]
    fn test_hex_encoded_manufacturer_data() {
        let data = format!("{}0960aaaa", "00".repeat(12));
        let s = sample(AdvertisementCodec.decode(data.as_bytes(), 0));
        assert!((s.raw_value - 24.0).abs() < 1e-9);
    }

    #[test]
    fn test_missing_data_is_zero() {
        assert_eq!(sample(AdvertisementCodec.decode(&[], 7)).raw_value, 0.0);
        assert_eq!(sample(AdvertisementCodec.decode(&[1, 2, 3], 7)).raw_value, 0.0);
        assert_eq!(sample(AdvertisementCodec.decode(b"zz", 7)).raw_value, 0.0);
    }
}
