//! Service configuration
//!
//! Everything is read from the environment at start-up (a `.env` file is
//! loaded first when present). Missing required keys and unparsable values
//! fail fast.

use crate::error::ConfigError;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Per-call stream and turn-taking settings
#[derive(Debug, Clone)]
pub struct StreamSettings {
    /// Inbound audio accumulated before a buffer is handed to the turn controller
    pub buffer: Duration,
    /// Added to the computed playback time before listening again
    pub playback_tail: Duration,
    /// Upper bound on transcription + generation + synthesis
    pub turn_timeout: Duration,
    /// Size of each outbound media frame
    pub frame: Duration,
    /// Speak an opening line once the context is loaded
    pub greeting: bool,
    /// Transcript turns kept for the language model
    pub history_turns: usize,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            buffer: Duration::from_millis(3000),
            playback_tail: Duration::from_millis(250),
            turn_timeout: Duration::from_millis(8000),
            frame: Duration::from_millis(20),
            greeting: true,
            history_turns: 10,
        }
    }
}

/// Deepgram speech-to-text and text-to-speech
#[derive(Debug, Clone)]
pub struct SpeechConfig {
    pub api_key: String,
    pub base_url: String,
    pub stt_model: String,
    pub stt_language: String,
    pub tts_voice: String,
}

/// OpenAI-compatible chat completions endpoint
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// Clinic application API serving call context and storing call records
#[derive(Debug, Clone)]
pub struct ClinicApiConfig {
    pub base_url: String,
    pub token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub stream: StreamSettings,
    pub recordings_dir: Option<PathBuf>,
    pub speech: SpeechConfig,
    pub llm: LlmConfig,
    pub clinic: ClinicApiConfig,
}

impl Config {
    /// Load `.env` (if any) and read the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        // A missing .env file is normal in production
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the config from any key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(&lookup);
        let defaults = StreamSettings::default();

        Ok(Self {
            bind_addr: env.parse_or("CLINIVOX_BIND", SocketAddr::from(([0, 0, 0, 0], 8080)))?,
            stream: StreamSettings {
                buffer: env.millis_or("CLINIVOX_BUFFER_MS", defaults.buffer)?,
                playback_tail: env.millis_or("CLINIVOX_PLAYBACK_TAIL_MS", defaults.playback_tail)?,
                turn_timeout: env.millis_or("CLINIVOX_TURN_TIMEOUT_MS", defaults.turn_timeout)?,
                frame: env.millis_or("CLINIVOX_FRAME_MS", defaults.frame)?,
                greeting: env.parse_or("CLINIVOX_GREETING", defaults.greeting)?,
                history_turns: env.parse_or("CLINIVOX_HISTORY_TURNS", defaults.history_turns)?,
            },
            recordings_dir: env.get("CLINIVOX_RECORDINGS_DIR").map(PathBuf::from),
            speech: SpeechConfig {
                api_key: env.require("DEEPGRAM_API_KEY")?,
                base_url: env.or("DEEPGRAM_URL", "https://api.deepgram.com"),
                stt_model: env.or("STT_MODEL", "nova-2-phonecall"),
                stt_language: env.or("STT_LANGUAGE", "en"),
                tts_voice: env.or("TTS_VOICE", "aura-asteria-en"),
            },
            llm: LlmConfig {
                api_key: env.require("LLM_API_KEY")?,
                base_url: env.or("LLM_API_URL", "https://api.openai.com/v1"),
                model: env.or("LLM_MODEL", "gpt-4o-mini"),
                temperature: env.parse_or("LLM_TEMPERATURE", 0.4)?,
                max_tokens: env.parse_or("LLM_MAX_TOKENS", 120)?,
            },
            clinic: ClinicApiConfig {
                base_url: env.require("CLINIC_API_URL")?,
                token: env.get("CLINIC_API_TOKEN"),
            },
        })
    }
}

struct Env<'a, F>(&'a F);

impl<F> Env<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Trimmed, non-empty value
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn or(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    fn require(&self, key: &'static str) -> Result<String, ConfigError> {
        self.get(key).ok_or(ConfigError::Missing(key))
    }

    fn parse_or<T: FromStr>(&self, key: &'static str, default: T) -> Result<T, ConfigError> {
        match self.get(key) {
            Some(value) => value
                .parse()
                .map_err(|_| ConfigError::Invalid { key, value }),
            None => Ok(default),
        }
    }

    fn millis_or(&self, key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
        let millis = self.parse_or(key, default.as_millis() as u64)?;
        Ok(Duration::from_millis(millis))
    }
}
