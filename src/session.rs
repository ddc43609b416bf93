//! Call sessions - one per carrier connection
//!
//! A session owns the inbound audio buffer, the call's turn controller and
//! its record writer. Frames are appended until the buffer holds the
//! configured duration, then the whole buffer is handed to the controller
//! and the buffer starts over, whether or not the controller takes it.

use crate::audio::AudioFormat;
use crate::config::StreamSettings;
use crate::context::{resolve_context, ContextLoader, ContextRef};
use crate::generator::opening_line;
use crate::media_event::{CarrierMessage, MediaPayload, OutboundMessage, StartMetadata};
use crate::records::{CallRecordSink, RecordWriter, StatusUpdate};
use crate::recorder::RecordingRoot;
use crate::turn_fsm::{BufferOutcome, CallStream, TurnController, TurnServices, TurnState};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Everything a session needs from the outside, shared by all calls
#[derive(Clone)]
pub struct SessionDeps {
    pub services: TurnServices,
    pub contexts: Arc<dyn ContextLoader>,
    pub records: Arc<dyn CallRecordSink>,
    pub settings: StreamSettings,
    pub recordings: Option<RecordingRoot>,
    pub registry: SessionRegistry,
}

/// Summary of a live call, as seen from outside its session
#[derive(Debug, Clone)]
pub struct ActiveCall {
    pub session_id: Uuid,
    pub call_sid: String,
    pub context: Option<ContextRef>,
    pub started_at: DateTime<Utc>,
}

/// Live calls keyed by stream id. Inserted on stream start, removed on stop.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    calls: Arc<Mutex<HashMap<String, ActiveCall>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, stream_sid: &str, call: ActiveCall) {
        let mut calls = self.calls.lock().await;
        if calls.insert(stream_sid.to_string(), call).is_some() {
            warn!(stream_sid, "Stream started twice, replacing registry entry");
        }
    }

    pub async fn remove(&self, stream_sid: &str) -> Option<ActiveCall> {
        self.calls.lock().await.remove(stream_sid)
    }

    pub async fn get(&self, stream_sid: &str) -> Option<ActiveCall> {
        self.calls.lock().await.get(stream_sid).cloned()
    }

    pub async fn active_count(&self) -> usize {
        self.calls.lock().await.len()
    }
}

/// Whether the connection should keep reading
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionControl {
    Continue,
    Stop,
}

/// Frame counters for the end-of-call log line
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameStats {
    pub received: u64,
    pub dropped: u64,
    pub buffers: u64,
}

pub struct CallSession {
    id: Uuid,
    deps: SessionDeps,
    outbound: mpsc::UnboundedSender<OutboundMessage>,
    stream_sid: Option<String>,
    call_sid: Option<String>,
    format: AudioFormat,
    threshold: usize,
    buffer: Vec<u8>,
    controller: Option<TurnController>,
    records: Option<RecordWriter>,
    record_task: Option<JoinHandle<()>>,
    started: Option<Instant>,
    stopped: bool,
    frames: FrameStats,
}

impl CallSession {
    /// New connection: no stream, no context yet.
    pub fn on_connection_open(deps: SessionDeps, outbound: mpsc::UnboundedSender<OutboundMessage>) -> Self {
        let id = Uuid::new_v4();
        debug!(session_id = %id, "🔌 Connection opened");
        let format = AudioFormat::TELEPHONY;
        let threshold = format.bytes_for(deps.settings.buffer).max(1);
        Self {
            id,
            deps,
            outbound,
            stream_sid: None,
            call_sid: None,
            format,
            threshold,
            buffer: Vec::with_capacity(threshold),
            controller: None,
            records: None,
            record_task: None,
            started: None,
            stopped: false,
            frames: FrameStats::default(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn call_sid(&self) -> Option<&str> {
        self.call_sid.as_deref()
    }

    pub fn has_context(&self) -> bool {
        self.controller.is_some()
    }

    /// `None` when the session has no context (and so never takes turns)
    pub fn turn_state(&self) -> Option<TurnState> {
        self.controller.as_ref().map(|c| c.state())
    }

    pub fn buffered_bytes(&self) -> usize {
        self.buffer.len()
    }

    pub fn frame_stats(&self) -> FrameStats {
        self.frames
    }

    /// Dispatch one text frame from the carrier
    pub async fn handle_message(&mut self, text: &str) -> SessionControl {
        let message = match CarrierMessage::parse(text) {
            Ok(message) => message,
            Err(e) => {
                self.frames.dropped += 1;
                warn!(session_id = %self.id, "Dropping malformed frame: {}", e);
                return SessionControl::Continue;
            }
        };

        match message {
            CarrierMessage::Connected { protocol } => {
                debug!(session_id = %self.id, ?protocol, "Carrier connected");
            }
            CarrierMessage::Start { stream_sid, start } => {
                self.on_stream_start(stream_sid, start).await;
            }
            CarrierMessage::Media { media, .. } => self.on_audio_frame(&media),
            CarrierMessage::Mark { mark, .. } => {
                debug!(session_id = %self.id, "Carrier played mark {}", mark.name);
            }
            CarrierMessage::Stop { .. } => {
                self.on_stream_stop().await;
                return SessionControl::Stop;
            }
            CarrierMessage::Unknown => {}
        }
        SessionControl::Continue
    }

    /// Stream announced: register it, then load the call's context.
    /// Without a context the session stays silent for the rest of the call.
    pub async fn on_stream_start(&mut self, stream_sid: String, start: StartMetadata) {
        if self.stream_sid.is_some() || self.stopped {
            warn!(session_id = %self.id, %stream_sid, "Ignoring repeated stream start");
            return;
        }

        if let Some(media_format) = &start.media_format {
            match media_format.to_audio_format() {
                Some(format) if format != AudioFormat::TELEPHONY => {
                    warn!(session_id = %self.id, ?format, "Carrier announced a non-default audio format");
                    self.format = format;
                }
                Some(_) => {}
                None => warn!(session_id = %self.id, encoding = %media_format.encoding,
                              "Unknown carrier encoding, assuming 8kHz mu-law"),
            }
        }
        self.threshold = self.format.bytes_for(self.deps.settings.buffer).max(1);

        let call_sid = start.call_sid.trim().to_string();
        let reference = ContextRef::from_parameters(&start.custom_parameters);
        info!(session_id = %self.id, %stream_sid, call_sid = %call_sid, ?reference, "📞 Stream started");

        self.started = Some(Instant::now());
        self.deps
            .registry
            .insert(
                &stream_sid,
                ActiveCall {
                    session_id: self.id,
                    call_sid: call_sid.clone(),
                    context: reference.clone(),
                    started_at: Utc::now(),
                },
            )
            .await;
        self.stream_sid = Some(stream_sid.clone());

        if !call_sid.is_empty() {
            let (writer, task) = RecordWriter::spawn(&call_sid, self.deps.records.clone());
            writer.update_status(StatusUpdate::in_progress());
            self.records = Some(writer);
            self.record_task = Some(task);
        }
        self.call_sid = Some(call_sid.clone());

        let Some(reference) = reference else {
            warn!(session_id = %self.id, call_sid = %call_sid, "No routing parameters, call stays silent");
            return;
        };
        let Some(records) = self.records.clone() else {
            warn!(session_id = %self.id, "Stream start without a call id, call stays silent");
            return;
        };

        let context = match resolve_context(self.deps.contexts.as_ref(), &reference).await {
            Ok(context) => context,
            Err(e) => {
                warn!(session_id = %self.id, call_sid = %call_sid, "Context unavailable, call stays silent: {}", e);
                return;
            }
        };
        if self.stopped {
            return;
        }

        let recorder = self
            .deps
            .recordings
            .as_ref()
            .map(|root| root.for_call(&call_sid, self.format));
        let greeting = self.deps.settings.greeting.then(|| opening_line(&context));

        let mut controller = TurnController::new(
            CallStream {
                call_sid: call_sid.clone(),
                stream_sid,
                format: self.format,
                outbound: self.outbound.clone(),
            },
            context,
            self.deps.services.clone(),
            records,
            self.deps.settings.clone(),
            recorder,
        );
        if let Some(greeting) = greeting {
            controller.speak(greeting);
        }
        self.controller = Some(controller);
        info!(session_id = %self.id, call_sid = %call_sid, "✅ Context loaded, listening");
    }

    /// Append one frame; hand off the buffer once it is full.
    pub fn on_audio_frame(&mut self, media: &MediaPayload) {
        if self.stopped {
            return;
        }
        self.frames.received += 1;
        if !media.is_inbound() {
            return;
        }
        let Some(controller) = self.controller.as_mut() else {
            // Contextless or not started: ignore audio
            return;
        };

        let bytes = match media.decode() {
            Ok(bytes) => bytes,
            Err(e) => {
                self.frames.dropped += 1;
                warn!(session_id = %self.id, "Dropping undecodable media frame: {}", e);
                return;
            }
        };

        self.buffer.extend_from_slice(&bytes);
        if self.buffer.len() < self.threshold {
            return;
        }

        let audio = std::mem::replace(&mut self.buffer, Vec::with_capacity(self.threshold));
        self.frames.buffers += 1;
        match controller.on_buffer(audio) {
            BufferOutcome::Accepted { turn } => {
                debug!(session_id = %self.id, turn, "Buffer handed to turn controller");
            }
            BufferOutcome::Discarded(_) => {}
        }
    }

    /// Stream ended: stop the controller, write the final status, unregister.
    /// Safe to call more than once.
    pub async fn on_stream_stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.buffer.clear();

        if let Some(controller) = self.controller.as_mut() {
            if let Some(handle) = controller.close() {
                // Aborted pipelines must not write records after the final status
                let _ = handle.await;
            }
            let stats = controller.stats();
            info!(session_id = %self.id, ?stats, "Turn summary");
        }
        self.controller = None;

        if let Some(records) = self.records.take() {
            let duration = self.started.map(|s| s.elapsed()).unwrap_or_default();
            records.update_status(StatusUpdate::completed(Utc::now(), duration));
        }
        if let Some(stream_sid) = &self.stream_sid {
            self.deps.registry.remove(stream_sid).await;
        }
        info!(session_id = %self.id, call_sid = ?self.call_sid, frames = ?self.frames, "📴 Stream stopped");
    }

    /// Connection gone. Finishes the stream if the carrier never sent stop,
    /// then waits for outstanding records to be written.
    pub async fn on_connection_close(mut self) {
        self.on_stream_stop().await;
        if let Some(task) = self.record_task.take() {
            if let Err(e) = task.await {
                warn!(session_id = %self.id, "Record writer ended abnormally: {}", e);
            }
        }
        debug!(session_id = %self.id, "🔌 Connection closed");
    }
}
