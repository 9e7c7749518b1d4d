//! # PCM16 Wire Codec
//!
//! Pure conversions between the float samples used by capture/playback and the
//! base64-framed PCM16 chunks carried on the socket.
//!
//! ## Audio Format on the Wire:
//! - **Encoding**: signed 16-bit little-endian PCM, mono
//! - **Framing**: the raw byte buffer is base64 (standard alphabet) encoded
//! - **Scaling**: samples are clamped to [-1, 1], scaled by 32768 and rounded;
//!   1.0 saturates at `i16::MAX`
//!
//! Decoding divides by 32768, so a round trip is exact for every value that is
//! itself a multiple of 1/32768 and within half a quantization step otherwise.

use crate::error::CodecError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

/// Convert a single float sample to PCM16, clamping to [-1, 1].
pub fn float_to_pcm(sample: f32) -> i16 {
    if sample.is_nan() {
        return 0;
    }
    let scaled = (sample.clamp(-1.0, 1.0) * 32768.0).round();
    scaled.clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

/// Convert a PCM16 sample to a float in [-1, 1).
pub fn pcm_to_float(sample: i16) -> f32 {
    sample as f32 / 32768.0
}

/// Encode float samples as little-endian PCM16 bytes.
pub fn encode_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        // Writing into a Vec cannot fail
        let _ = bytes.write_i16::<LittleEndian>(float_to_pcm(sample));
    }
    bytes
}

/// Decode little-endian PCM16 bytes into float samples.
///
/// A trailing odd byte (half a sample) is ignored.
pub fn decode_pcm16(bytes: &[u8]) -> Vec<f32> {
    let mut cursor = Cursor::new(bytes);
    let mut samples = Vec::with_capacity(bytes.len() / 2);
    while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
        samples.push(pcm_to_float(sample));
    }
    samples
}

/// Captured float samples → base64 PCM16 chunk for `input_audio_chunk`.
pub fn float_to_pcm16_base64(samples: &[f32]) -> String {
    STANDARD.encode(encode_pcm16(samples))
}

/// Base64 PCM16 chunk from the server → float samples for playback.
pub fn pcm16_base64_to_float(chunk: &str) -> Result<Vec<f32>, CodecError> {
    let bytes = STANDARD.decode(chunk.trim())?;
    Ok(decode_pcm16(&bytes))
}

/// Linear-interpolation resampler used when device and wire rates differ.
pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>, CodecError> {
    if from_rate == 0 {
        return Err(CodecError::InvalidSampleRate(from_rate));
    }
    if to_rate == 0 {
        return Err(CodecError::InvalidSampleRate(to_rate));
    }
    if from_rate == to_rate || samples.is_empty() {
        return Ok(samples.to_vec());
    }

    let ratio = from_rate as f64 / to_rate as f64;
    let out_len = ((samples.len() as f64) / ratio).round().max(1.0) as usize;
    let last = samples.len() - 1;

    let mut out = Vec::with_capacity(out_len);
    for i in 0..out_len {
        let pos = i as f64 * ratio;
        let idx = (pos.floor() as usize).min(last);
        let next = (idx + 1).min(last);
        let frac = (pos - idx as f64) as f32;
        out.push(samples[idx] + (samples[next] - samples[idx]) * frac);
    }
    Ok(out)
}

/// Linear-interpolation resampler for a continuous stream split into blocks.
///
/// The fractional read position and the last input sample carry over from one
/// block to the next, so block boundaries neither drop nor repeat output samples.
#[derive(Debug, Clone)]
pub struct StreamResampler {
    ratio: f64,
    /// Read position of the next output sample, relative to the next block's first sample.
    pos: f64,
    last: Option<f32>,
}

impl StreamResampler {
    pub fn new(from_rate: u32, to_rate: u32) -> Result<Self, CodecError> {
        if from_rate == 0 {
            return Err(CodecError::InvalidSampleRate(from_rate));
        }
        if to_rate == 0 {
            return Err(CodecError::InvalidSampleRate(to_rate));
        }
        Ok(Self { ratio: from_rate as f64 / to_rate as f64, pos: 0.0, last: None })
    }

    pub fn is_passthrough(&self) -> bool {
        self.ratio == 1.0
    }

    /// Resample the next block of the stream.
    pub fn process(&mut self, block: &[f32]) -> Vec<f32> {
        if self.is_passthrough() || block.is_empty() {
            return block.to_vec();
        }

        // Index 0 holds the previous block's last sample when there is one
        let mut input = Vec::with_capacity(block.len() + 1);
        input.extend(self.last);
        input.extend_from_slice(block);
        let mut pos = self.pos + (input.len() - block.len()) as f64;

        let mut out = Vec::with_capacity((block.len() as f64 / self.ratio).ceil() as usize + 1);
        while (pos.floor() as usize) + 1 < input.len() {
            let idx = pos.floor() as usize;
            let frac = (pos - idx as f64) as f32;
            out.push(input[idx] + (input[idx + 1] - input[idx]) * frac);
            pos += self.ratio;
        }

        self.pos = pos - input.len() as f64;
        self.last = block.last().copied();
        out
    }
}

/// Duration in seconds of `len` samples at `sample_rate`.
pub fn duration_secs(len: usize, sample_rate: u32) -> f64 {
    if sample_rate == 0 {
        return 0.0;
    }
    len as f64 / sample_rate as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scaling_saturates_and_clamps() {
        assert_eq!(float_to_pcm(1.0), i16::MAX);
        assert_eq!(float_to_pcm(-1.0), i16::MIN);
        assert_eq!(float_to_pcm(0.0), 0);
        assert_eq!(float_to_pcm(4.2), i16::MAX);
        assert_eq!(float_to_pcm(-9.0), i16::MIN);
        assert_eq!(float_to_pcm(f32::NAN), 0);
    }

    #[test]
    fn test_round_trip_within_one_lsb() {
        let samples: Vec<f32> = (0..2000)
            .map(|i| ((i as f32) * 0.013).sin() * 0.9)
            .collect();
        let chunk = float_to_pcm16_base64(&samples);
        let decoded = pcm16_base64_to_float(&chunk).unwrap();

        assert_eq!(decoded.len(), samples.len());
        for (orig, back) in samples.iter().zip(decoded.iter()) {
            assert!((orig - back).abs() <= 1.0 / 32768.0);
        }
    }

    #[test]
    fn test_exact_for_representable_values() {
        let samples = [-0.5f32, 0.25, -1.0, 0.0, 12345.0 / 32768.0];
        let decoded = pcm16_base64_to_float(&float_to_pcm16_base64(&samples)).unwrap();
        assert_eq!(decoded, samples.to_vec());
    }

    #[test]
    fn test_little_endian_layout() {
        // 0x7FFF little endian is FF 7F
        assert_eq!(encode_pcm16(&[1.0]), vec![0xFF, 0x7F]);
        assert_eq!(encode_pcm16(&[-1.0]), vec![0x00, 0x80]);
    }

    #[test]
    fn test_malformed_base64_is_an_error() {
        assert!(pcm16_base64_to_float("not base64!!").is_err());
    }

    #[test]
    fn test_odd_trailing_byte_ignored() {
        assert_eq!(decode_pcm16(&[0x00, 0x40, 0x12]), vec![0.5]);
    }

    #[test]
    fn test_resample_lengths() {
        let input = vec![0.0f32; 1600];
        assert_eq!(resample(&input, 16000, 24000).unwrap().len(), 2400);
        assert_eq!(resample(&input, 16000, 8000).unwrap().len(), 800);
        assert_eq!(resample(&input, 16000, 16000).unwrap().len(), 1600);
        assert!(resample(&input, 0, 16000).is_err());
    }

    #[test]
    fn test_stream_resampler_keeps_phase_across_blocks() {
        // A ramp stays a ramp only if no block boundary shifts the phase
        let ramp: Vec<f32> = (0..1600).map(|n| n as f32 / 1600.0).collect();
        let mut resampler = StreamResampler::new(16000, 24000).unwrap();
        let out: Vec<f32> = ramp.chunks(160).flat_map(|block| resampler.process(block)).collect();

        assert!((out.len() as i64 - 2399).abs() <= 1);
        for (k, sample) in out.iter().enumerate() {
            let expected = (k as f64 * 16000.0 / 24000.0 / 1600.0) as f32;
            assert!((sample - expected).abs() < 1e-4, "sample {} drifted", k);
        }

        let mut down = StreamResampler::new(48000, 16000).unwrap();
        let total: usize = (0..10).map(|_| down.process(&[0.0; 480]).len()).sum();
        assert_eq!(total, 1600);
        assert!(StreamResampler::new(0, 16000).is_err());
    }

    #[test]
    fn test_resample_interpolates() {
        let out = resample(&[0.0, 1.0], 1, 2).unwrap();
        assert_eq!(out.len(), 4);
        assert!((out[1] - 0.5).abs() < 1e-6);
    }
}
