//! PCM16 helpers for the provider's audio encoding.
//!
//! Audio is mono, signed 16-bit little-endian. Inside JSON events it travels
//! base64 encoded.

use base64::Engine;

/// Sample rate the realtime provider expects for PCM16 input and output.
pub const SAMPLE_RATE: u32 = 24_000;

/// Converts samples to little-endian bytes.
pub fn samples_to_le_bytes(samples: &[i16]) -> Vec<u8> {
    samples
        .iter()
        .flat_map(|&sample| sample.to_le_bytes())
        .collect()
}

/// Interprets little-endian bytes as samples. A trailing odd byte is ignored.
pub fn samples_from_le_bytes(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]))
        .collect()
}

pub fn encode_base64(samples: &[i16]) -> String {
    base64::engine::general_purpose::STANDARD.encode(samples_to_le_bytes(samples))
}

pub fn decode_base64(fragment: &str) -> Result<Vec<i16>, base64::DecodeError> {
    let bytes = base64::engine::general_purpose::STANDARD.decode(fragment)?;
    Ok(samples_from_le_bytes(&bytes))
}

/// Root-mean-square level of a chunk, normalised to `0.0..=1.0`.
pub fn rms_level(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples
        .iter()
        .map(|&s| {
            let v = s as f64 / 32768.0;
            v * v
        })
        .sum();
    ((sum / samples.len() as f64).sqrt() as f32).clamp(0.0, 1.0)
}
