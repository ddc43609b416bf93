//! Turn recorder - saves each turn's audio as WAV for inspection
//!
//! Layout: `<dir>/<YYYYmmdd_HHMMSS>/<callSid>/turn_<nnn>_{caller,assistant}.wav`,
//! one timestamped directory per server run.

use crate::audio::{to_pcm16, AudioFormat};
use crate::records::Speaker;
use chrono::Local;
use std::fs;
use std::path::{Path, PathBuf};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Base directory for one server run
#[derive(Debug, Clone)]
pub struct RecordingRoot {
    base: PathBuf, // ./recordings/20250603_153055/
}

impl RecordingRoot {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        let ts = Local::now().format("%Y%m%d_%H%M%S").to_string();
        let base = dir.as_ref().join(ts);
        info!("🎙️ Recording enabled, saving to: {:?}", base);
        Self { base }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn for_call(&self, call_sid: &str, format: AudioFormat) -> CallRecorder {
        let safe: String = call_sid
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        let safe = if safe.is_empty() { "unknown".to_string() } else { safe };
        CallRecorder {
            dir: self.base.join(safe),
            format,
        }
    }
}

/// Writes one call's turns
#[derive(Debug, Clone)]
pub struct CallRecorder {
    dir: PathBuf,
    format: AudioFormat,
}

impl CallRecorder {
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, turn: u64, speaker: Speaker) -> PathBuf {
        let who = match speaker {
            Speaker::Caller => "caller",
            Speaker::Assistant => "assistant",
        };
        self.dir.join(format!("turn_{:03}_{}.wav", turn, who))
    }

    /// Write `audio` on the blocking pool. Failures are logged only.
    pub fn record(&self, turn: u64, speaker: Speaker, audio: Vec<u8>) -> JoinHandle<()> {
        let path = self.path_for(turn, speaker);
        let format = self.format;
        tokio::task::spawn_blocking(move || match write_wav(&path, format, &audio) {
            Ok(()) => debug!("Saved {} bytes of audio to {:?}", audio.len(), path),
            Err(e) => error!("Failed to write recording {:?}: {}", path, e),
        })
    }
}

fn write_wav(path: &Path, format: AudioFormat, audio: &[u8]) -> Result<(), hound::Error> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let spec = hound::WavSpec {
        channels: format.channels,
        sample_rate: format.sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut writer = hound::WavWriter::create(path, spec)?;
    for sample in to_pcm16(audio, format) {
        writer.write_sample(sample)?;
    }
    writer.finalize()
}
