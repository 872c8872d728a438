//! 16-bit PCM wire format.
//!
//! Outbound audio is mono f32 in `[-1, 1]` encoded as signed little-endian
//! 16-bit samples; inbound audio arrives base64-encoded in the same layout.

use crate::error::DecodeError;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

pub const INPUT_SAMPLE_RATE: u32 = 16_000;
pub const OUTPUT_SAMPLE_RATE: u32 = 24_000;

const SCALE: f32 = 32768.0;

/// Encoded PCM ready for the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedFrame {
    pub data: Vec<u8>,
    pub mime_type: String,
}

impl EncodedFrame {
    pub fn sample_count(&self) -> usize {
        self.data.len() / 2
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(&self.data)
    }
}

/// MIME descriptor for raw 16-bit PCM at `sample_rate`.
pub fn pcm_mime_type(sample_rate: u32) -> String {
    format!("audio/pcm;rate={}", sample_rate)
}

/// Decoded, playable audio. Samples are interleaved when `channels > 1`.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioBuffer {
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels.max(1) as usize
    }

    /// Length in seconds on the buffer's own clock.
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / self.sample_rate as f64
    }
}

/// Quantize one sample. Out-of-range input clamps, NaN becomes silence.
pub fn quantize(sample: f32) -> i16 {
    (sample * SCALE).round().clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

pub fn encode(samples: &[f32], sample_rate: u32) -> EncodedFrame {
    let data = samples
        .iter()
        .flat_map(|&s| quantize(s).to_le_bytes())
        .collect();
    EncodedFrame {
        data,
        mime_type: pcm_mime_type(sample_rate),
    }
}

pub fn decode(bytes: &[u8], sample_rate: u32, channels: u16) -> Result<AudioBuffer, DecodeError> {
    if channels == 0 {
        return Err(DecodeError::NoChannels);
    }
    if bytes.len() % 2 != 0 {
        return Err(DecodeError::PartialSample(bytes.len()));
    }
    let samples = bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / SCALE)
        .collect();
    Ok(AudioBuffer {
        samples,
        sample_rate,
        channels,
    })
}

pub fn decode_base64(
    payload: &str,
    sample_rate: u32,
    channels: u16,
) -> Result<AudioBuffer, DecodeError> {
    let bytes = BASE64
        .decode(payload.as_bytes())
        .map_err(|e| DecodeError::Base64(e.to_string()))?;
    decode(&bytes, sample_rate, channels)
}
