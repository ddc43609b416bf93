//! Telephony audio format
//!
//! The carrier streams narrowband G.711 μ-law at 8 kHz mono. Audio is passed
//! through to the speech services untouched; this module only knows how big
//! the stream is in bytes and time, plus the μ-law table needed to turn
//! captured audio into WAV files for inspection.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Sample encoding used on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    /// G.711 μ-law, one byte per sample
    Mulaw,
    /// Signed 16-bit little-endian PCM
    Linear16,
}

impl Encoding {
    /// Name used by the speech services' query parameters
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mulaw => "mulaw",
            Self::Linear16 => "linear16",
        }
    }

    /// Parse the carrier's `mediaFormat.encoding` string
    pub fn from_mime(mime: &str) -> Option<Self> {
        match mime.to_ascii_lowercase().as_str() {
            "audio/x-mulaw" | "audio/mulaw" | "mulaw" | "pcmu" => Some(Self::Mulaw),
            "audio/l16" | "linear16" => Some(Self::Linear16),
            _ => None,
        }
    }

    fn bytes_per_sample(&self) -> usize {
        match self {
            Self::Mulaw => 1,
            Self::Linear16 => 2,
        }
    }
}

/// Fixed stream format, shared by inbound and outbound audio
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub encoding: Encoding,
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioFormat {
    /// Carrier default: 8 kHz mono μ-law
    pub const TELEPHONY: Self = Self {
        encoding: Encoding::Mulaw,
        sample_rate: 8000,
        channels: 1,
    };

    pub fn bytes_per_second(&self) -> usize {
        self.sample_rate as usize * self.channels as usize * self.encoding.bytes_per_sample()
    }

    /// Number of bytes holding `duration` of audio, rounded down to whole samples
    pub fn bytes_for(&self, duration: Duration) -> usize {
        let frame = self.channels as usize * self.encoding.bytes_per_sample();
        let bytes = (self.bytes_per_second() as u128 * duration.as_micros() / 1_000_000) as usize;
        bytes - bytes % frame.max(1)
    }

    /// Playback time of `bytes`, rounded up to the next microsecond so the
    /// result is never shorter than the audio itself
    pub fn duration_of(&self, bytes: usize) -> Duration {
        let bps = self.bytes_per_second().max(1) as u128;
        let micros = (bytes as u128 * 1_000_000).div_ceil(bps);
        Duration::from_micros(micros as u64)
    }
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self::TELEPHONY
    }
}

const MULAW_BIAS: i32 = 0x84;
const MULAW_CLIP: i32 = 32635;

/// Encode one linear sample to μ-law
pub fn mulaw_encode(sample: i16) -> u8 {
    let sample = sample as i32;
    let sign = if sample < 0 { 0x80 } else { 0 };
    let magnitude = sample.abs().min(MULAW_CLIP) + MULAW_BIAS;

    let mut exponent = 7;
    let mut mask = 0x4000;
    while exponent > 0 && magnitude & mask == 0 {
        exponent -= 1;
        mask >>= 1;
    }
    let mantissa = (magnitude >> (exponent + 3)) & 0x0F;
    !((sign | (exponent << 4) | mantissa) as u8)
}

/// Decode one μ-law byte to a linear sample
pub fn mulaw_decode(byte: u8) -> i16 {
    let byte = !byte;
    let sign = byte & 0x80;
    let exponent = ((byte >> 4) & 0x07) as i32;
    let mantissa = (byte & 0x0F) as i32;
    let magnitude = (((mantissa << 3) + MULAW_BIAS) << exponent) - MULAW_BIAS;
    if sign != 0 {
        -magnitude as i16
    } else {
        magnitude as i16
    }
}

pub fn decode_mulaw(bytes: &[u8]) -> Vec<i16> {
    bytes.iter().map(|b| mulaw_decode(*b)).collect()
}

pub fn encode_mulaw(samples: &[i16]) -> Vec<u8> {
    samples.iter().map(|s| mulaw_encode(*s)).collect()
}

/// Decode any stream payload to 16-bit PCM
pub fn to_pcm16(bytes: &[u8], format: AudioFormat) -> Vec<i16> {
    match format.encoding {
        Encoding::Mulaw => decode_mulaw(bytes),
        Encoding::Linear16 => bytes
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_telephony_byte_rate() {
        let format = AudioFormat::TELEPHONY;
        assert_eq!(format.bytes_per_second(), 8000);
        assert_eq!(format.bytes_for(Duration::from_millis(20)), 160);
        assert_eq!(format.bytes_for(Duration::from_secs(3)), 24_000);
    }

    #[test]
    fn test_duration_never_shorter_than_audio() {
        let format = AudioFormat::TELEPHONY;
        for bytes in [0usize, 1, 159, 160, 7999, 8000, 12_345] {
            let duration = format.duration_of(bytes);
            let exact = bytes as f64 / format.bytes_per_second() as f64;
            assert!(duration.as_secs_f64() >= exact, "{} bytes -> {:?}", bytes, duration);
        }
        assert_eq!(format.duration_of(8000), Duration::from_secs(1));
    }

    #[test]
    fn test_linear16_frames_are_whole_samples() {
        let format = AudioFormat {
            encoding: Encoding::Linear16,
            sample_rate: 16000,
            channels: 1,
        };
        assert_eq!(format.bytes_per_second(), 32_000);
        assert_eq!(format.bytes_for(Duration::from_micros(31)) % 2, 0);
    }

    #[test]
    fn test_mulaw_silence_and_extremes() {
        assert_eq!(mulaw_encode(0), 0xFF);
        assert_eq!(mulaw_decode(0xFF), 0);
        assert!(mulaw_decode(mulaw_encode(i16::MAX)) > 30_000);
        assert!(mulaw_decode(mulaw_encode(i16::MIN)) < -30_000);
    }

    #[test]
    fn test_mulaw_is_close_to_source() {
        for sample in [-20_000i16, -1000, -3, 3, 1000, 20_000] {
            let back = mulaw_decode(mulaw_encode(sample));
            let error = (sample as i32 - back as i32).abs();
            // μ-law quantisation error grows with magnitude, ~3% at the top
            assert!(error <= (sample as i32).abs() / 16 + 8, "{} -> {}", sample, back);
        }
    }

    #[test]
    fn test_encoding_from_mime() {
        assert_eq!(Encoding::from_mime("audio/x-mulaw"), Some(Encoding::Mulaw));
        assert_eq!(Encoding::from_mime("audio/L16"), Some(Encoding::Linear16));
        assert_eq!(Encoding::from_mime("audio/opus"), None);
    }
}
