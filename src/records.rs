//! Call records: transcript turns, outcome updates, final status
//!
//! The record store lives in the clinic application. Each call gets one
//! [`RecordWriter`], a background task that forwards updates in the order
//! they were produced. Producers never wait on the store.

use crate::context::{ContextKind, ContextRef, ConversationContext};
use crate::error::RecordResult;
use crate::intent::{Intent, Sentiment};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    Caller,
    Assistant,
}

/// One utterance in the call transcript. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptTurn {
    pub speaker: Speaker,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl TranscriptTurn {
    pub fn now(speaker: Speaker, text: impl Into<String>) -> Self {
        Self {
            speaker,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    InProgress,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    pub status: CallStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<u64>,
}

impl StatusUpdate {
    pub fn in_progress() -> Self {
        Self {
            status: CallStatus::InProgress,
            ended_at: None,
            duration_secs: None,
        }
    }

    pub fn completed(ended_at: DateTime<Utc>, duration: Duration) -> Self {
        Self {
            status: CallStatus::Completed,
            ended_at: Some(ended_at),
            duration_secs: Some(duration.as_secs()),
        }
    }
}

/// New status for the appointment or follow-up the call is about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetStatus {
    Confirmed,
    Completed,
    RescheduleRequested,
    Cancelled,
}

/// Side effect of one caller utterance on the clinic record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutcomeUpdate {
    pub target: ContextRef,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<TargetStatus>,
    pub intent: Intent,
    pub sentiment: Sentiment,
}

impl OutcomeUpdate {
    /// Derive the record update for an utterance, if it says anything actionable.
    pub fn derive(context: &ConversationContext, intent: Intent, sentiment: Sentiment) -> Option<Self> {
        let status = match (context.kind(), intent) {
            (_, Intent::Unclear) | (ContextKind::Patient, _) => None,
            (ContextKind::Appointment, Intent::Confirm) => Some(TargetStatus::Confirmed),
            (ContextKind::FollowUp, Intent::Confirm) => Some(TargetStatus::Completed),
            (_, Intent::Reschedule) => Some(TargetStatus::RescheduleRequested),
            (_, Intent::Cancel) => Some(TargetStatus::Cancelled),
        };

        if status.is_none() && sentiment == Sentiment::Neutral {
            return None;
        }

        Some(Self {
            target: context.target(),
            status,
            intent,
            sentiment,
        })
    }
}

/// Append/update-only store for call records
#[async_trait]
pub trait CallRecordSink: Send + Sync {
    async fn append_turn(&self, call_id: &str, turn: &TranscriptTurn) -> RecordResult<()>;

    async fn update_status(&self, call_id: &str, update: &StatusUpdate) -> RecordResult<()>;

    async fn record_outcome(&self, call_id: &str, outcome: &OutcomeUpdate) -> RecordResult<()>;
}

#[derive(Debug)]
enum RecordCommand {
    Turn(TranscriptTurn),
    Outcome(OutcomeUpdate),
    Status(StatusUpdate),
}

/// Ordered, non-blocking writer for one call
#[derive(Clone)]
pub struct RecordWriter {
    call_id: Arc<str>,
    tx: mpsc::UnboundedSender<RecordCommand>,
}

impl RecordWriter {
    /// Spawn the writer task. The task ends once every clone of the writer is dropped.
    pub fn spawn(call_id: &str, sink: Arc<dyn CallRecordSink>) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<RecordCommand>();
        let call_id: Arc<str> = Arc::from(call_id);
        let task_call_id = call_id.clone();

        let handle = tokio::spawn(async move {
            debug!(call_sid = %task_call_id, "Record writer started");
            while let Some(command) = rx.recv().await {
                let result = match &command {
                    RecordCommand::Turn(turn) => sink.append_turn(&task_call_id, turn).await,
                    RecordCommand::Outcome(outcome) => sink.record_outcome(&task_call_id, outcome).await,
                    RecordCommand::Status(update) => sink.update_status(&task_call_id, update).await,
                };
                if let Err(e) = result {
                    warn!(call_sid = %task_call_id, "Failed to persist {:?}: {}", command, e);
                }
            }
            debug!(call_sid = %task_call_id, "Record writer finished");
        });

        (Self { call_id, tx }, handle)
    }

    pub fn append_turn(&self, turn: TranscriptTurn) {
        self.submit(RecordCommand::Turn(turn));
    }

    pub fn record_outcome(&self, outcome: OutcomeUpdate) {
        info!(call_sid = %self.call_id, "📝 Outcome {:?} ({:?}) for {} {}",
              outcome.intent, outcome.status, outcome.target.kind, outcome.target.id);
        self.submit(RecordCommand::Outcome(outcome));
    }

    pub fn update_status(&self, update: StatusUpdate) {
        self.submit(RecordCommand::Status(update));
    }

    fn submit(&self, command: RecordCommand) {
        if self.tx.send(command).is_err() {
            warn!(call_sid = %self.call_id, "Record writer already stopped, dropping update");
        }
    }
}

/// Sink that keeps everything in memory, for tests and dry runs
#[derive(Default)]
pub struct MemoryRecordSink {
    turns: Mutex<Vec<(String, TranscriptTurn)>>,
    statuses: Mutex<Vec<(String, StatusUpdate)>>,
    outcomes: Mutex<Vec<(String, OutcomeUpdate)>>,
}

impl MemoryRecordSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn turns(&self, call_id: &str) -> Vec<TranscriptTurn> {
        self.turns
            .lock()
            .await
            .iter()
            .filter(|(id, _)| id == call_id)
            .map(|(_, turn)| turn.clone())
            .collect()
    }

    pub async fn statuses(&self, call_id: &str) -> Vec<StatusUpdate> {
        self.statuses
            .lock()
            .await
            .iter()
            .filter(|(id, _)| id == call_id)
            .map(|(_, s)| s.clone())
            .collect()
    }

    pub async fn outcomes(&self, call_id: &str) -> Vec<OutcomeUpdate> {
        self.outcomes
            .lock()
            .await
            .iter()
            .filter(|(id, _)| id == call_id)
            .map(|(_, o)| o.clone())
            .collect()
    }
}

#[async_trait]
impl CallRecordSink for MemoryRecordSink {
    async fn append_turn(&self, call_id: &str, turn: &TranscriptTurn) -> RecordResult<()> {
        self.turns.lock().await.push((call_id.to_string(), turn.clone()));
        Ok(())
    }

    async fn update_status(&self, call_id: &str, update: &StatusUpdate) -> RecordResult<()> {
        self.statuses.lock().await.push((call_id.to_string(), update.clone()));
        Ok(())
    }

    async fn record_outcome(&self, call_id: &str, outcome: &OutcomeUpdate) -> RecordResult<()> {
        self.outcomes.lock().await.push((call_id.to_string(), outcome.clone()));
        Ok(())
    }
}
