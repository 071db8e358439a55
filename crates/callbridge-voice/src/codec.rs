//! Audio frame codec.
//!
//! The telephony side speaks 8 kHz mono G.711 µ-law, base64-encoded, in
//! small chunks (typically 160 bytes / 20 ms). The AI backend speaks
//! little-endian PCM16 at a higher integer multiple of that rate.
//!
//! Every function here is pure and works on one chunk at a time. Anything
//! that needs to carry samples across chunks (the remainder left over when
//! downsampling backend audio) is held by the caller.

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use thiserror::Error;

/// Sample rate of the telephony wire audio.
pub const WIRE_SAMPLE_RATE: u32 = 8_000;

/// Largest chunk accepted in either direction: one second of wire audio.
pub const MAX_FRAME_SAMPLES: usize = WIRE_SAMPLE_RATE as usize;

const MULAW_BIAS: i32 = 0x84;
const MULAW_CLIP: i32 = 32_635;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("payload is empty")]
    Empty,

    #[error("payload of {0} samples exceeds the one-second frame limit")]
    Oversized(usize),

    #[error("payload is not valid base64: {0}")]
    InvalidEncoding(String),

    #[error("pcm16 buffer has odd length {0}")]
    OddLength(usize),

    #[error("unsupported backend sample rate {0} Hz")]
    UnsupportedRate(u32),
}

/// A chunk of linear PCM16 samples at the wire rate.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PcmChunk {
    pub samples: Vec<i16>,
}

impl PcmChunk {
    pub fn new(samples: Vec<i16>) -> Self {
        Self { samples }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Root-mean-square energy of the chunk, `0.0` when empty.
    pub fn rms(&self) -> f64 {
        rms(&self.samples)
    }
}

fn check_len(len: usize) -> Result<(), CodecError> {
    if len == 0 {
        return Err(CodecError::Empty);
    }
    if len > MAX_FRAME_SAMPLES {
        return Err(CodecError::Oversized(len));
    }
    Ok(())
}

/// Decodes one base64 µ-law payload from the wire.
///
/// # Errors
///
/// Returns `CodecError` if the payload is not base64, is empty, or is longer
/// than [`MAX_FRAME_SAMPLES`].
pub fn decode(payload: &str) -> Result<PcmChunk, CodecError> {
    let bytes = B64
        .decode(payload.trim())
        .map_err(|e| CodecError::InvalidEncoding(e.to_string()))?;
    check_len(bytes.len())?;
    Ok(PcmChunk::new(bytes.into_iter().map(mulaw_to_linear).collect()))
}

/// Encodes one chunk into a base64 µ-law payload for the wire.
///
/// # Errors
///
/// Returns `CodecError` if the chunk is empty or longer than
/// [`MAX_FRAME_SAMPLES`].
pub fn encode(chunk: &PcmChunk) -> Result<String, CodecError> {
    check_len(chunk.len())?;
    let bytes: Vec<u8> = chunk.samples.iter().copied().map(linear_to_mulaw).collect();
    Ok(B64.encode(bytes))
}

/// ITU-T G.711 µ-law expansion.
pub fn mulaw_to_linear(byte: u8) -> i16 {
    let b = !byte;
    let exponent = i32::from((b >> 4) & 0x07);
    let mantissa = i32::from(b & 0x0F);
    let magnitude = (((mantissa << 3) + MULAW_BIAS) << exponent) - MULAW_BIAS;
    if b & 0x80 != 0 {
        -magnitude as i16
    } else {
        magnitude as i16
    }
}

/// ITU-T G.711 µ-law compression.
pub fn linear_to_mulaw(sample: i16) -> u8 {
    let mut pcm = i32::from(sample);
    let sign: u8 = if pcm < 0 {
        pcm = -pcm;
        0x80
    } else {
        0
    };
    pcm = pcm.min(MULAW_CLIP) + MULAW_BIAS;

    // pcm is now in [0x84, 0x7FFF]; the segment is the top bit position minus 7.
    let top_bit = 15 - (pcm as u16).leading_zeros() as i32;
    let exponent = (top_bit - 7).clamp(0, 7);
    let mantissa = (pcm >> (exponent + 3)) & 0x0F;

    !(sign | ((exponent as u8) << 4) | mantissa as u8)
}

/// Root-mean-square energy of a sample slice.
pub fn rms(samples: &[i16]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples.iter().map(|&s| f64::from(s) * f64::from(s)).sum();
    (sum / samples.len() as f64).sqrt()
}

/// Conversion between wire-rate PCM and the backend's PCM16 stream.
///
/// The backend rate must be an integer multiple of [`WIRE_SAMPLE_RATE`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendAudio {
    factor: usize,
}

impl BackendAudio {
    /// # Errors
    ///
    /// Returns `CodecError::UnsupportedRate` unless `sample_rate` is 8, 16 or
    /// 24 kHz.
    pub fn new(sample_rate: u32) -> Result<Self, CodecError> {
        match sample_rate {
            8_000 | 16_000 | 24_000 => Ok(Self {
                factor: (sample_rate / WIRE_SAMPLE_RATE) as usize,
            }),
            other => Err(CodecError::UnsupportedRate(other)),
        }
    }

    /// Number of backend samples per wire sample.
    pub fn factor(&self) -> usize {
        self.factor
    }

    pub fn sample_rate(&self) -> u32 {
        WIRE_SAMPLE_RATE * self.factor as u32
    }

    /// Upsamples a wire chunk and serializes it as little-endian PCM16.
    ///
    /// Interpolates linearly between neighbouring samples; the last sample of
    /// the chunk is held rather than reaching into the next chunk.
    pub fn to_backend(&self, chunk: &PcmChunk) -> Vec<u8> {
        let samples = &chunk.samples;
        let mut out = Vec::with_capacity(samples.len() * self.factor * 2);
        for (i, &current) in samples.iter().enumerate() {
            let next = samples.get(i + 1).copied().unwrap_or(current);
            for step in 0..self.factor {
                let t = step as i32;
                let f = self.factor as i32;
                let v = (i32::from(current) * (f - t) + i32::from(next) * t) / f;
                out.extend_from_slice(&(v as i16).to_le_bytes());
            }
        }
        out
    }

    /// Parses little-endian PCM16 backend audio.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::OddLength` for a buffer that is not whole samples.
    pub fn parse_backend(&self, bytes: &[u8]) -> Result<Vec<i16>, CodecError> {
        if bytes.len() % 2 != 0 {
            return Err(CodecError::OddLength(bytes.len()));
        }
        Ok(bytes
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect())
    }

    /// Downsamples backend-rate samples to the wire rate by averaging.
    ///
    /// Returns the wire samples and how many input samples were consumed.
    /// Input beyond the last whole group is left for the caller to carry
    /// into the next call.
    pub fn downsample(&self, samples: &[i16]) -> (Vec<i16>, usize) {
        let groups = samples.len() / self.factor;
        let consumed = groups * self.factor;
        let out = samples[..consumed]
            .chunks_exact(self.factor)
            .map(|group| {
                let sum: i32 = group.iter().map(|&s| i32::from(s)).sum();
                (sum / self.factor as i32) as i16
            })
            .collect();
        (out, consumed)
    }
}
