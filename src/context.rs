//! Conversation context for a call
//!
//! The clinic application decides why a call is being made (confirming an
//! appointment, checking in after a visit) and passes the relevant record id
//! as a routing parameter when the stream starts. The context is loaded once
//! per call and never refreshed.

use crate::error::{ContextError, ContextResult};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tokio::sync::Mutex;
use tracing::debug;

/// Which kind of record a call is about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextKind {
    Patient,
    Appointment,
    FollowUp,
}

impl ContextKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Patient => "patient",
            Self::Appointment => "appointment",
            Self::FollowUp => "follow_up",
        }
    }
}

impl fmt::Display for ContextKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A (kind, id) pair pointing at a clinic record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextRef {
    pub kind: ContextKind,
    pub id: String,
}

impl ContextRef {
    pub fn new(kind: ContextKind, id: impl Into<String>) -> Self {
        Self { kind, id: id.into() }
    }

    /// Resolve routing parameters from the stream start message.
    ///
    /// The most specific record wins: a follow-up or appointment id beats a
    /// bare patient id. Keys may be camelCase or snake_case.
    pub fn from_parameters(params: &HashMap<String, String>) -> Option<Self> {
        const KEYS: [(ContextKind, [&str; 2]); 3] = [
            (ContextKind::FollowUp, ["followUpId", "follow_up_id"]),
            (ContextKind::Appointment, ["appointmentId", "appointment_id"]),
            (ContextKind::Patient, ["patientId", "patient_id"]),
        ];

        KEYS.iter().find_map(|(kind, names)| {
            names
                .iter()
                .filter_map(|name| params.get(*name))
                .map(|id| id.trim())
                .find(|id| !id.is_empty())
                .map(|id| Self::new(*kind, id))
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Patient {
    pub id: String,
    pub name: String,
    /// Preferred language, e.g. "en"
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default)]
    pub medical_history: Vec<String>,
}

fn default_language() -> String {
    "en".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Doctor {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub specialization: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Appointment {
    pub id: String,
    pub scheduled_at: DateTime<Utc>,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FollowUp {
    pub id: String,
    pub due_on: NaiveDate,
    pub reason: String,
    #[serde(default)]
    pub notes: Option<String>,
}

/// What the context loader returns: the patient plus whatever else applies
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextRecord {
    pub patient: Patient,
    #[serde(default)]
    pub doctor: Option<Doctor>,
    #[serde(default)]
    pub appointment: Option<Appointment>,
    #[serde(default)]
    pub follow_up: Option<FollowUp>,
}

/// Immutable per-call snapshot, one case per call reason
#[derive(Debug, Clone)]
pub enum ConversationContext {
    Appointment {
        patient: Patient,
        doctor: Option<Doctor>,
        appointment: Appointment,
    },
    FollowUp {
        patient: Patient,
        doctor: Option<Doctor>,
        follow_up: FollowUp,
    },
    /// General check-in with a patient, no specific record attached
    CheckIn { patient: Patient, doctor: Option<Doctor> },
}

impl ConversationContext {
    /// Build the variant the routing kind asks for.
    pub fn from_record(reference: &ContextRef, record: ContextRecord) -> ContextResult<Self> {
        let ContextRecord {
            patient,
            doctor,
            appointment,
            follow_up,
        } = record;

        match reference.kind {
            ContextKind::Appointment => {
                let appointment = appointment.ok_or_else(|| ContextError::Incomplete {
                    kind: reference.kind,
                    id: reference.id.clone(),
                    missing: "appointment",
                })?;
                Ok(Self::Appointment {
                    patient,
                    doctor,
                    appointment,
                })
            }
            ContextKind::FollowUp => {
                let follow_up = follow_up.ok_or_else(|| ContextError::Incomplete {
                    kind: reference.kind,
                    id: reference.id.clone(),
                    missing: "follow-up",
                })?;
                Ok(Self::FollowUp {
                    patient,
                    doctor,
                    follow_up,
                })
            }
            ContextKind::Patient => Ok(Self::CheckIn { patient, doctor }),
        }
    }

    pub fn patient(&self) -> &Patient {
        match self {
            Self::Appointment { patient, .. }
            | Self::FollowUp { patient, .. }
            | Self::CheckIn { patient, .. } => patient,
        }
    }

    pub fn doctor(&self) -> Option<&Doctor> {
        match self {
            Self::Appointment { doctor, .. }
            | Self::FollowUp { doctor, .. }
            | Self::CheckIn { doctor, .. } => doctor.as_ref(),
        }
    }

    pub fn kind(&self) -> ContextKind {
        match self {
            Self::Appointment { .. } => ContextKind::Appointment,
            Self::FollowUp { .. } => ContextKind::FollowUp,
            Self::CheckIn { .. } => ContextKind::Patient,
        }
    }

    /// The record that outcome updates apply to
    pub fn target(&self) -> ContextRef {
        match self {
            Self::Appointment { appointment, .. } => {
                ContextRef::new(ContextKind::Appointment, appointment.id.clone())
            }
            Self::FollowUp { follow_up, .. } => {
                ContextRef::new(ContextKind::FollowUp, follow_up.id.clone())
            }
            Self::CheckIn { patient, .. } => ContextRef::new(ContextKind::Patient, patient.id.clone()),
        }
    }
}

/// Read-only lookup of call metadata
#[async_trait]
pub trait ContextLoader: Send + Sync {
    /// Load the record for `kind`/`id`; `ContextError::NotFound` when it does not resolve.
    async fn load_context(&self, kind: ContextKind, id: &str) -> ContextResult<ContextRecord>;
}

/// Resolve and convert in one step
pub async fn resolve_context(
    loader: &dyn ContextLoader,
    reference: &ContextRef,
) -> ContextResult<ConversationContext> {
    debug!(kind = %reference.kind, id = %reference.id, "Loading conversation context");
    let record = loader.load_context(reference.kind, &reference.id).await?;
    ConversationContext::from_record(reference, record)
}

/// In-memory loader for tests and local runs
#[derive(Default)]
pub struct MemoryContextLoader {
    records: Mutex<HashMap<(ContextKind, String), ContextRecord>>,
}

impl MemoryContextLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, kind: ContextKind, id: impl Into<String>, record: ContextRecord) {
        self.records.lock().await.insert((kind, id.into()), record);
    }
}

#[async_trait]
impl ContextLoader for MemoryContextLoader {
    async fn load_context(&self, kind: ContextKind, id: &str) -> ContextResult<ContextRecord> {
        self.records
            .lock()
            .await
            .get(&(kind, id.to_string()))
            .cloned()
            .ok_or_else(|| ContextError::NotFound {
                kind,
                id: id.to_string(),
            })
    }
}
