//! Turn controller - half-duplex turn taking for one call
//!
//! ```text
//!   LISTENING --buffer--> THINKING --audio--> SPEAKING --playback done--> LISTENING
//!                            |  empty transcript,
//!                            |  synthesis failure,
//!                            +- timeout ----------------------------------> LISTENING
//!   any state --stream stop or outbound lost--> CLOSED
//! ```
//!
//! The state is a single atomic. A buffer starts a pipeline only if it wins
//! the LISTENING -> THINKING compare-exchange; every buffer that loses is
//! dropped on the floor, never queued. Talking over the assistant is not
//! supported.

use crate::audio::AudioFormat;
use crate::config::StreamSettings;
use crate::context::ConversationContext;
use crate::generator::{ConversationHistory, ResponseGenerator};
use crate::intent::{detect_intent, detect_sentiment};
use crate::media_event::OutboundMessage;
use crate::records::{OutcomeUpdate, RecordWriter, Speaker, TranscriptTurn};
use crate::recorder::CallRecorder;
use crate::synthesis::SpeechSynthesizer;
use crate::transcription::Transcriber;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Listening = 0,
    Thinking = 1,
    Speaking = 2,
    /// Stream stopped or the socket is gone; nothing else happens
    Closed = 3,
}

impl From<u8> for TurnState {
    fn from(v: u8) -> Self {
        match v {
            0 => Self::Listening,
            1 => Self::Thinking,
            2 => Self::Speaking,
            _ => Self::Closed,
        }
    }
}

/// What happened to a buffer handed to [`TurnController::on_buffer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferOutcome {
    Accepted { turn: u64 },
    Discarded(TurnState),
}

/// The three external services a turn runs through. Shared by every call.
#[derive(Clone)]
pub struct TurnServices {
    pub transcriber: Arc<dyn Transcriber>,
    pub generator: Arc<dyn ResponseGenerator>,
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
}

/// Where a call's replies go
#[derive(Clone)]
pub struct CallStream {
    pub call_sid: String,
    pub stream_sid: String,
    pub format: AudioFormat,
    pub outbound: mpsc::UnboundedSender<OutboundMessage>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TurnStats {
    pub accepted: u64,
    pub discarded: u64,
    pub completed: u64,
    pub abandoned: u64,
}

#[derive(Default)]
struct Counters {
    accepted: AtomicU64,
    discarded: AtomicU64,
    completed: AtomicU64,
    abandoned: AtomicU64,
}

/// Time the carrier needs to play `bytes` of audio, plus `tail`.
/// Never shorter than the audio itself.
pub fn playback_duration(format: AudioFormat, bytes: usize, tail: Duration) -> Duration {
    format.duration_of(bytes) + tail
}

struct Shared {
    stream: CallStream,
    settings: StreamSettings,
    context: ConversationContext,
    services: TurnServices,
    records: RecordWriter,
    recorder: Option<CallRecorder>,
    history: Mutex<ConversationHistory>,
    state: AtomicU8,
    counters: Counters,
}

pub struct TurnController {
    shared: Arc<Shared>,
    next_turn: u64,
    in_flight: Option<JoinHandle<()>>,
}

impl TurnController {
    pub fn new(
        stream: CallStream,
        context: ConversationContext,
        services: TurnServices,
        records: RecordWriter,
        settings: StreamSettings,
        recorder: Option<CallRecorder>,
    ) -> Self {
        let history = ConversationHistory::new(settings.history_turns);
        Self {
            shared: Arc::new(Shared {
                stream,
                settings,
                context,
                services,
                records,
                recorder,
                history: Mutex::new(history),
                state: AtomicU8::new(TurnState::Listening as u8),
                counters: Counters::default(),
            }),
            next_turn: 0,
            in_flight: None,
        }
    }

    pub fn state(&self) -> TurnState {
        self.shared.state()
    }

    pub fn stats(&self) -> TurnStats {
        let c = &self.shared.counters;
        TurnStats {
            accepted: c.accepted.load(Ordering::Relaxed),
            discarded: c.discarded.load(Ordering::Relaxed),
            completed: c.completed.load(Ordering::Relaxed),
            abandoned: c.abandoned.load(Ordering::Relaxed),
        }
    }

    /// Hand over one buffer of caller audio. Returns immediately.
    pub fn on_buffer(&mut self, audio: Vec<u8>) -> BufferOutcome {
        if self.shared.outbound_lost(self.next_turn + 1) {
            self.shared.counters.discarded.fetch_add(1, Ordering::Relaxed);
            return BufferOutcome::Discarded(TurnState::Closed);
        }
        let Some(turn) = self.begin() else {
            let state = self.state();
            self.shared.counters.discarded.fetch_add(1, Ordering::Relaxed);
            debug!(call_sid = %self.shared.stream.call_sid, ?state,
                   "🗑️ Dropping {} bytes of caller audio while busy", audio.len());
            return BufferOutcome::Discarded(state);
        };

        let shared = self.shared.clone();
        self.in_flight = Some(tokio::spawn(shared.run_turn(turn, audio)));
        BufferOutcome::Accepted { turn }
    }

    /// Speak `text` without waiting for the caller (the opening line).
    /// Only starts while listening.
    pub fn speak(&mut self, text: String) -> BufferOutcome {
        if self.shared.outbound_lost(self.next_turn + 1) {
            return BufferOutcome::Discarded(TurnState::Closed);
        }
        let Some(turn) = self.begin() else {
            return BufferOutcome::Discarded(self.state());
        };

        let shared = self.shared.clone();
        self.in_flight = Some(tokio::spawn(shared.run_announcement(turn, text)));
        BufferOutcome::Accepted { turn }
    }

    /// Stop for good. Any in-flight pipeline is aborted and its result dropped;
    /// the returned handle resolves once it has actually stopped.
    /// Closing mid-reply tells the carrier to drop the audio it still has queued.
    pub fn close(&mut self) -> Option<JoinHandle<()>> {
        let previous = TurnState::from(self.shared.state.swap(TurnState::Closed as u8, Ordering::AcqRel));
        if previous != TurnState::Closed {
            info!(call_sid = %self.shared.stream.call_sid, ?previous, "🛑 Turn controller closed");
        }
        if previous == TurnState::Speaking {
            let _ = self.shared.stream.outbound.send(OutboundMessage::clear(&self.shared.stream.stream_sid));
        }
        let handle = self.in_flight.take();
        if let Some(handle) = &handle {
            handle.abort();
        }
        handle
    }

    fn begin(&mut self) -> Option<u64> {
        self.shared
            .state
            .compare_exchange(
                TurnState::Listening as u8,
                TurnState::Thinking as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .ok()?;
        self.next_turn += 1;
        self.shared.counters.accepted.fetch_add(1, Ordering::Relaxed);
        Some(self.next_turn)
    }
}

impl Drop for TurnController {
    fn drop(&mut self) {
        if let Some(handle) = self.in_flight.take() {
            handle.abort();
        }
    }
}

impl Shared {
    fn state(&self) -> TurnState {
        TurnState::from(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: TurnState, to: TurnState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Close for good once nobody can hear the reply. No retry.
    fn outbound_lost(&self, turn: u64) -> bool {
        if !self.stream.outbound.is_closed() {
            return false;
        }
        let previous = TurnState::from(self.state.swap(TurnState::Closed as u8, Ordering::AcqRel));
        if previous != TurnState::Closed {
            self.counters.abandoned.fetch_add(1, Ordering::Relaxed);
            warn!(call_sid = %self.stream.call_sid, turn, ?previous, "🔌 Outbound channel closed, stopping turns");
        }
        true
    }

    fn abandon(&self, turn: u64, reason: &str) {
        self.counters.abandoned.fetch_add(1, Ordering::Relaxed);
        warn!(call_sid = %self.stream.call_sid, turn, "Abandoning turn: {}", reason);
        self.transition(TurnState::Thinking, TurnState::Listening);
    }

    async fn run_turn(self: Arc<Self>, turn: u64, audio: Vec<u8>) {
        let started = Instant::now();
        match timeout(self.settings.turn_timeout, self.think(turn, audio)).await {
            Ok(Some(reply)) => {
                debug!(call_sid = %self.stream.call_sid, turn, "Reply ready after {:?}", started.elapsed());
                self.play(turn, reply).await;
            }
            Ok(None) => {}
            Err(_) => self.abandon(turn, "timed out while thinking"),
        }
    }

    async fn run_announcement(self: Arc<Self>, turn: u64, text: String) {
        info!(call_sid = %self.stream.call_sid, turn, "👋 Assistant: {}", text);
        let said = TranscriptTurn::now(Speaker::Assistant, text.clone());
        self.history.lock().await.push(said.clone());
        self.records.append_turn(said);

        match timeout(self.settings.turn_timeout, self.synthesize(turn, &text)).await {
            Ok(Some(audio)) => self.play(turn, audio).await,
            Ok(None) => {}
            Err(_) => self.abandon(turn, "timed out while synthesizing"),
        }
    }

    /// Transcribe, record, generate, synthesize. `None` means back to listening.
    async fn think(&self, turn: u64, audio: Vec<u8>) -> Option<Vec<u8>> {
        let call_sid = &self.stream.call_sid;
        if let Some(recorder) = &self.recorder {
            recorder.record(turn, Speaker::Caller, audio.clone());
        }

        let text = self.services.transcriber.transcribe(&audio, self.stream.format).await;
        let text = text.trim();
        if text.is_empty() {
            debug!(call_sid = %call_sid, turn, "🤫 No speech in buffer");
            self.transition(TurnState::Thinking, TurnState::Listening);
            return None;
        }
        info!(call_sid = %call_sid, turn, "👤 Caller: {}", text);

        let heard = TranscriptTurn::now(Speaker::Caller, text);
        self.records.append_turn(heard.clone());

        let intent = detect_intent(text);
        let sentiment = detect_sentiment(text);
        debug!(call_sid = %call_sid, turn, ?intent, ?sentiment, "Classified utterance");
        if let Some(outcome) = OutcomeUpdate::derive(&self.context, intent, sentiment) {
            self.records.record_outcome(outcome);
        }

        if self.outbound_lost(turn) {
            return None;
        }
        let history = self.history.lock().await.snapshot();
        let reply = self.services.generator.generate(text, &self.context, &history).await;
        info!(call_sid = %call_sid, turn, "🤖 Assistant: {}", reply);

        let said = TranscriptTurn::now(Speaker::Assistant, reply.clone());
        {
            let mut history = self.history.lock().await;
            history.push(heard);
            history.push(said.clone());
        }
        self.records.append_turn(said);

        if self.outbound_lost(turn) {
            return None;
        }
        self.synthesize(turn, &reply).await
    }

    async fn synthesize(&self, turn: u64, text: &str) -> Option<Vec<u8>> {
        match self.services.synthesizer.synthesize(text, self.stream.format).await {
            Ok(audio) if !audio.is_empty() => Some(audio),
            Ok(_) => {
                self.abandon(turn, "synthesizer returned no audio");
                None
            }
            Err(e) => {
                self.abandon(turn, &format!("synthesis failed: {}", e));
                None
            }
        }
    }

    /// Stream the reply to the carrier, then wait out its playback.
    async fn play(&self, turn: u64, audio: Vec<u8>) {
        let call_sid = &self.stream.call_sid;
        if !self.transition(TurnState::Thinking, TurnState::Speaking) {
            debug!(call_sid = %call_sid, turn, "Stream closed before reply, dropping it");
            return;
        }
        if let Some(recorder) = &self.recorder {
            recorder.record(turn, Speaker::Assistant, audio.clone());
        }

        let frame_bytes = self.stream.format.bytes_for(self.settings.frame).max(1);
        let stream_sid = &self.stream.stream_sid;
        for chunk in audio.chunks(frame_bytes) {
            if self.stream.outbound.send(OutboundMessage::media(stream_sid, chunk)).is_err() {
                self.outbound_lost(turn);
                return;
            }
        }
        // Carrier echoes the mark back once playback reaches it
        let _ = self
            .stream
            .outbound
            .send(OutboundMessage::mark(stream_sid, format!("turn-{}", turn)));

        let playback = playback_duration(self.stream.format, audio.len(), self.settings.playback_tail);
        info!(call_sid = %call_sid, turn, "🔈 Speaking {} bytes for {:?}", audio.len(), playback);
        sleep(playback).await;

        if self.transition(TurnState::Speaking, TurnState::Listening) {
            self.counters.completed.fetch_add(1, Ordering::Relaxed);
            debug!(call_sid = %call_sid, turn, "👂 Listening");
        }
    }
}

#[cfg(test)]
pub(crate) mod fakes {
    use super::*;
    use crate::error::{ServiceError, ServiceResult};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    /// Returns a fixed transcript after `delay`, tracking overlap
    pub struct FakeTranscriber {
        pub text: String,
        pub delay: Duration,
        pub calls: AtomicUsize,
        active: AtomicUsize,
        pub max_active: AtomicUsize,
    }

    impl FakeTranscriber {
        pub fn new(text: &str, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                text: text.to_string(),
                delay,
                calls: AtomicUsize::new(0),
                active: AtomicUsize::new(0),
                max_active: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Transcriber for FakeTranscriber {
        async fn transcribe(&self, _audio: &[u8], _format: AudioFormat) -> String {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(active, Ordering::SeqCst);
            sleep(self.delay).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            self.text.clone()
        }
    }

    pub struct FakeGenerator {
        pub reply: String,
        pub calls: AtomicUsize,
    }

    impl FakeGenerator {
        pub fn new(reply: &str) -> Arc<Self> {
            Arc::new(Self {
                reply: reply.to_string(),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ResponseGenerator for FakeGenerator {
        async fn generate(&self, _: &str, _: &ConversationContext, _: &[TranscriptTurn]) -> String {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.reply.clone()
        }
    }

    /// Returns `bytes` of silence per request, or fails when `bytes` is zero
    pub struct FakeSynthesizer {
        pub bytes: usize,
        pub delay: Duration,
        pub texts: std::sync::Mutex<Vec<String>>,
    }

    impl FakeSynthesizer {
        pub fn new(bytes: usize) -> Arc<Self> {
            Self::slow(bytes, Duration::ZERO)
        }

        pub fn slow(bytes: usize, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                bytes,
                delay,
                texts: std::sync::Mutex::new(Vec::new()),
            })
        }

        pub fn texts(&self) -> Vec<String> {
            self.texts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SpeechSynthesizer for FakeSynthesizer {
        async fn synthesize(&self, text: &str, _format: AudioFormat) -> ServiceResult<Vec<u8>> {
            self.texts.lock().unwrap().push(text.to_string());
            if !self.delay.is_zero() {
                sleep(self.delay).await;
            }
            if self.bytes == 0 {
                return Err(ServiceError::Status {
                    status: 500,
                    body: "tts down".to_string(),
                });
            }
            Ok(vec![0xFF; self.bytes])
        }
    }
}
