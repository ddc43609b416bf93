//! Clinivox - real-time voice conversations for clinic calls
//!
//! A telephony carrier streams each call's audio over a WebSocket. Every
//! call gets a session that buffers caller audio, runs it through
//! speech-to-text, a language model and text-to-speech one turn at a time,
//! and streams the reply back on the same socket while recording the
//! transcript and outcome in the clinic application.

#![forbid(unsafe_code)]

pub mod audio;
pub mod clinic_api;
pub mod config;
pub mod context;
pub mod error;
pub mod generator;
pub mod intent;
pub mod media_event;
pub mod recorder;
pub mod records;
pub mod server;
pub mod session;
pub mod synthesis;
pub mod transcription;
pub mod turn_fsm;
pub mod ws_writer;

pub use audio::AudioFormat;
pub use config::{Config, StreamSettings};
pub use context::{ContextLoader, ConversationContext, MemoryContextLoader};
pub use error::{Result, ServerError};
pub use records::{CallRecordSink, MemoryRecordSink};
pub use session::{CallSession, SessionDeps, SessionRegistry};
pub use turn_fsm::{TurnController, TurnServices, TurnState};
