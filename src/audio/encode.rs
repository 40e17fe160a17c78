//! # Audio Wire Encoding
//!
//! Conversions between the capture/playback sample formats and the wire
//! format: native f32 samples ↔ 16-bit signed little-endian PCM ↔ base64.
//!
//! ## Audio Format Requirements:
//! - **Sample Rate**: 24 kHz on both legs, fixed, never negotiated
//! - **Bit Depth**: 16-bit signed PCM
//! - **Channels**: Mono (1 channel)
//! - **Encoding**: Little-endian samples, base64 over the wire

use crate::error::{AppError, AppResult};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

/// Convert native floating-point samples to 16-bit signed PCM.
///
/// Linear scaling with clamping to the representable range; no dithering.
/// Out-of-range input (beyond ±1.0) saturates instead of wrapping.
pub fn floats_to_pcm16(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&sample| (sample.clamp(-1.0, 1.0) * 32767.0) as i16)
        .collect()
}

/// Convert 16-bit PCM samples back to floats in [-1.0, 1.0].
pub fn pcm16_to_floats(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&sample| sample as f32 / 32768.0).collect()
}

/// Serialize PCM16 samples as little-endian bytes.
pub fn pcm16_to_bytes(samples: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    bytes
}

/// Parse little-endian bytes into PCM16 samples.
///
/// ## Errors:
/// `MalformedEnvelope` when the byte count is odd — 16-bit samples always
/// occupy whole byte pairs.
pub fn bytes_to_pcm16(data: &[u8]) -> AppResult<Vec<i16>> {
    if data.len() % 2 != 0 {
        return Err(AppError::MalformedEnvelope(
            "audio payload length must be even for 16-bit samples".to_string(),
        ));
    }

    let mut cursor = Cursor::new(data);
    let mut samples = Vec::with_capacity(data.len() / 2);
    while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
        samples.push(sample);
    }

    Ok(samples)
}

/// Encode one captured frame for the wire: f32 → PCM16 → LE bytes → base64.
pub fn encode_frame(samples: &[f32]) -> String {
    STANDARD.encode(pcm16_to_bytes(&floats_to_pcm16(samples)))
}

/// Decode one inbound base64 audio payload into PCM16 samples.
///
/// ## Errors:
/// `MalformedEnvelope` when the base64 is invalid or the decoded byte count
/// is odd.
pub fn decode_frame(audio_b64: &str) -> AppResult<Vec<i16>> {
    let bytes = STANDARD
        .decode(audio_b64)
        .map_err(|e| AppError::MalformedEnvelope(format!("invalid base64 audio: {}", e)))?;
    bytes_to_pcm16(&bytes)
}

/// Playback duration of a frame at the given sample rate, in seconds.
pub fn frame_duration_seconds(sample_count: usize, sample_rate: u32) -> f64 {
    sample_count as f64 / sample_rate as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_float_conversion_scales_and_clamps() {
        let samples = [0.0f32, 0.5, -0.5, 1.0, -1.0, 1.5, -2.0];
        let pcm = floats_to_pcm16(&samples);

        assert_eq!(pcm[0], 0);
        assert_eq!(pcm[1], 16383);
        assert_eq!(pcm[2], -16383);
        assert_eq!(pcm[3], 32767);
        assert_eq!(pcm[4], -32767);
        // Out-of-range input saturates, it does not wrap
        assert_eq!(pcm[5], 32767);
        assert_eq!(pcm[6], -32767);
    }

    #[test]
    fn test_pcm_byte_round_trip() {
        let samples = vec![0i16, 1, -1, 32767, -32768, 12345];
        let bytes = pcm16_to_bytes(&samples);
        assert_eq!(bytes.len(), samples.len() * 2);

        let decoded = bytes_to_pcm16(&bytes).unwrap();
        assert_eq!(decoded, samples);
    }

    #[test]
    fn test_odd_length_payload_rejected() {
        let err = bytes_to_pcm16(&[0u8, 1, 2]).unwrap_err();
        assert!(matches!(err, AppError::MalformedEnvelope(_)));
    }

    #[test]
    fn test_wire_round_trip() {
        let samples: Vec<f32> = (0..480).map(|i| (i as f32 / 480.0).sin() * 0.8).collect();
        let encoded = encode_frame(&samples);
        let decoded = decode_frame(&encoded).unwrap();

        assert_eq!(decoded.len(), samples.len());
        // Quantization error of one PCM16 step at most
        for (original, &quantized) in samples.iter().zip(decoded.iter()) {
            let recovered = quantized as f32 / 32767.0;
            assert!((original - recovered).abs() < 1.0 / 32000.0);
        }
    }

    #[test]
    fn test_decode_rejects_invalid_base64() {
        assert!(decode_frame("not/valid/base64!!!").is_err());
    }

    #[test]
    fn test_frame_duration() {
        // 24000 samples at 24 kHz is exactly one second
        assert_eq!(frame_duration_seconds(24000, 24000), 1.0);
        assert_eq!(frame_duration_seconds(12000, 24000), 0.5);
        assert_eq!(frame_duration_seconds(0, 24000), 0.0);
    }
}
