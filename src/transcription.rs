//! Speech-to-text client
//!
//! Audio is sent exactly as the carrier delivered it. Recognition failures
//! degrade to an empty transcript so a bad moment on the STT side never
//! ends the call.

use crate::audio::AudioFormat;
use crate::config::SpeechConfig;
use crate::error::{ServiceError, ServiceResult};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Best-effort transcript of `audio`; empty when nothing was recognised.
    async fn transcribe(&self, audio: &[u8], format: AudioFormat) -> String;
}

/// Deepgram pre-recorded transcription over HTTP
pub struct DeepgramTranscriber {
    client: reqwest::Client,
    config: SpeechConfig,
}

#[derive(Deserialize)]
struct ListenResponse {
    results: ListenResults,
}

#[derive(Deserialize)]
struct ListenResults {
    #[serde(default)]
    channels: Vec<ListenChannel>,
}

#[derive(Deserialize)]
struct ListenChannel {
    #[serde(default)]
    alternatives: Vec<ListenAlternative>,
}

#[derive(Deserialize)]
struct ListenAlternative {
    #[serde(default)]
    transcript: String,
    #[serde(default)]
    confidence: f32,
}

impl DeepgramTranscriber {
    pub fn new(client: reqwest::Client, config: SpeechConfig) -> Self {
        Self { client, config }
    }

    /// Same as [`Transcriber::transcribe`] but keeps the failure
    pub async fn try_transcribe(&self, audio: &[u8], format: AudioFormat) -> ServiceResult<String> {
        let url = format!("{}/v1/listen", self.config.base_url.trim_end_matches('/'));
        let query = [
            ("model", self.config.stt_model.clone()),
            ("language", self.config.stt_language.clone()),
            ("encoding", format.encoding.as_str().to_string()),
            ("sample_rate", format.sample_rate.to_string()),
            ("channels", format.channels.to_string()),
            ("punctuate", "true".to_string()),
            ("smart_format", "true".to_string()),
        ];

        let response = self
            .client
            .post(&url)
            .query(&query)
            .header("Authorization", format!("Token {}", self.config.api_key))
            .header("Content-Type", "application/octet-stream")
            .timeout(Duration::from_secs(10))
            .body(audio.to_vec())
            .send()
            .await?;

        let parsed: ListenResponse = ServiceError::check(response).await?.json().await?;
        let best = parsed
            .results
            .channels
            .into_iter()
            .next()
            .and_then(|c| c.alternatives.into_iter().next());

        Ok(match best {
            Some(alt) => {
                debug!("🗣️ Transcript ({:.2}): {}", alt.confidence, alt.transcript);
                alt.transcript.trim().to_string()
            }
            None => String::new(),
        })
    }
}

#[async_trait]
impl Transcriber for DeepgramTranscriber {
    async fn transcribe(&self, audio: &[u8], format: AudioFormat) -> String {
        if audio.is_empty() {
            return String::new();
        }
        match self.try_transcribe(audio, format).await {
            Ok(text) => text,
            Err(e) => {
                warn!("Transcription failed, treating as silence: {}", e);
                String::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn config(base_url: String) -> SpeechConfig {
        SpeechConfig {
            api_key: "dg-key".to_string(),
            base_url,
            stt_model: "nova-2-phonecall".to_string(),
            stt_language: "en".to_string(),
            tts_voice: "aura-asteria-en".to_string(),
        }
    }

    #[tokio::test]
    async fn test_transcribe_passes_audio_through() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/listen")
            .match_header("authorization", "Token dg-key")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("encoding".into(), "mulaw".into()),
                Matcher::UrlEncoded("sample_rate".into(), "8000".into()),
                Matcher::UrlEncoded("channels".into(), "1".into()),
                Matcher::UrlEncoded("model".into(), "nova-2-phonecall".into()),
            ]))
            .match_body(vec![0xFFu8, 0x7F, 0x10])
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"results":{"channels":[{"alternatives":[{"transcript":" yes I confirm ","confidence":0.97}]}]}}"#,
            )
            .create_async()
            .await;

        let stt = DeepgramTranscriber::new(reqwest::Client::new(), config(server.url()));
        let text = stt.transcribe(&[0xFF, 0x7F, 0x10], AudioFormat::TELEPHONY).await;
        assert_eq!(text, "yes I confirm");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_no_speech_is_empty() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/listen")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"results":{"channels":[{"alternatives":[{"transcript":""}]}]}}"#)
            .create_async()
            .await;

        let stt = DeepgramTranscriber::new(reqwest::Client::new(), config(server.url()));
        assert_eq!(stt.transcribe(&[0xFF; 160], AudioFormat::TELEPHONY).await, "");
    }

    #[tokio::test]
    async fn test_failure_degrades_to_empty() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/listen")
            .match_query(Matcher::Any)
            .with_status(502)
            .with_body("bad gateway")
            .create_async()
            .await;

        let stt = DeepgramTranscriber::new(reqwest::Client::new(), config(server.url()));
        let err = stt.try_transcribe(&[0xFF; 160], AudioFormat::TELEPHONY).await.unwrap_err();
        assert!(matches!(err, ServiceError::Status { status: 502, .. }));
        assert_eq!(stt.transcribe(&[0xFF; 160], AudioFormat::TELEPHONY).await, "");
    }

    #[tokio::test]
    async fn test_empty_audio_skips_request() {
        let server = mockito::Server::new_async().await;
        let stt = DeepgramTranscriber::new(reqwest::Client::new(), config(server.url()));
        assert_eq!(stt.transcribe(&[], AudioFormat::TELEPHONY).await, "");
    }
}
