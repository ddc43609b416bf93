//! Text-to-speech client
//!
//! Audio is requested in the stream's own encoding and sample rate with no
//! container, so it can be written to the carrier as-is.

use crate::audio::AudioFormat;
use crate::config::SpeechConfig;
use crate::error::{ServiceError, ServiceResult};
use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;
use tracing::debug;

#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Raw audio for `text` in `format`
    async fn synthesize(&self, text: &str, format: AudioFormat) -> ServiceResult<Vec<u8>>;
}

/// Deepgram Aura speech over HTTP
pub struct DeepgramSynthesizer {
    client: reqwest::Client,
    config: SpeechConfig,
}

impl DeepgramSynthesizer {
    pub fn new(client: reqwest::Client, config: SpeechConfig) -> Self {
        Self { client, config }
    }
}

#[async_trait]
impl SpeechSynthesizer for DeepgramSynthesizer {
    async fn synthesize(&self, text: &str, format: AudioFormat) -> ServiceResult<Vec<u8>> {
        let url = format!("{}/v1/speak", self.config.base_url.trim_end_matches('/'));
        let query = [
            ("model", self.config.tts_voice.clone()),
            ("encoding", format.encoding.as_str().to_string()),
            ("sample_rate", format.sample_rate.to_string()),
            ("container", "none".to_string()),
        ];

        let response = self
            .client
            .post(&url)
            .query(&query)
            .header("Authorization", format!("Token {}", self.config.api_key))
            .timeout(Duration::from_secs(15))
            .json(&json!({ "text": text }))
            .send()
            .await?;

        let audio = ServiceError::check(response).await?.bytes().await?;
        if audio.is_empty() {
            return Err(ServiceError::EmptyResponse);
        }
        debug!(
            "🔊 Synthesized {} bytes ({:.2}s) for {} chars",
            audio.len(),
            format.duration_of(audio.len()).as_secs_f32(),
            text.len()
        );
        Ok(audio.to_vec())
    }
}
