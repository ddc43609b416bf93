//! HTTP client for the clinic application
//!
//! The clinic app owns patients, appointments and call records. This client
//! implements both collaborator seams on top of its voice endpoints:
//!
//! - `GET  /voice/context/{kind}/{id}`
//! - `POST /voice/calls/{callSid}/turns`
//! - `PUT  /voice/calls/{callSid}/status`
//! - `POST /voice/calls/{callSid}/outcome`

use crate::config::ClinicApiConfig;
use crate::context::{ContextKind, ContextLoader, ContextRecord};
use crate::error::{ContextError, ContextResult, RecordError, RecordResult};
use crate::records::{CallRecordSink, OutcomeUpdate, StatusUpdate, TranscriptTurn};
use async_trait::async_trait;
use reqwest::{RequestBuilder, StatusCode, Url};
use std::time::Duration;
use tracing::debug;

pub struct ClinicApiClient {
    client: reqwest::Client,
    config: ClinicApiConfig,
}

impl ClinicApiClient {
    pub fn new(client: reqwest::Client, config: ClinicApiConfig) -> Self {
        Self { client, config }
    }

    /// Base URL plus `segments`, each percent-encoded as a single path
    /// segment. `None` for an unusable base or a `.`/`..`/empty segment.
    fn url(&self, segments: &[&str]) -> Option<Url> {
        if segments.iter().any(|s| s.is_empty() || *s == "." || *s == "..") {
            return None;
        }
        let mut url = Url::parse(&self.config.base_url).ok()?;
        url.path_segments_mut().ok()?.pop_if_empty().extend(segments);
        Some(url)
    }

    fn call_url(&self, call_id: &str, leaf: &str) -> RecordResult<Url> {
        self.url(&["voice", "calls", call_id, leaf])
            .ok_or_else(|| RecordError::InvalidUrl(call_id.to_string()))
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        let request = request.timeout(Duration::from_secs(5));
        match &self.config.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send_record(&self, request: RequestBuilder) -> RecordResult<()> {
        let response = self.authorize(request).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RecordError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ContextLoader for ClinicApiClient {
    async fn load_context(&self, kind: ContextKind, id: &str) -> ContextResult<ContextRecord> {
        let Some(url) = self.url(&["voice", "context", kind.as_str(), id]) else {
            return Err(ContextError::NotFound {
                kind,
                id: id.to_string(),
            });
        };
        let response = self
            .authorize(self.client.get(url))
            .send()
            .await
            .map_err(|e| ContextError::Unavailable(e.to_string()))?;

        match response.status() {
            status if status.is_success() => {
                debug!(%kind, id, "Context loaded");
                response
                    .json()
                    .await
                    .map_err(|e| ContextError::Unavailable(format!("invalid context record: {}", e)))
            }
            StatusCode::NOT_FOUND => Err(ContextError::NotFound {
                kind,
                id: id.to_string(),
            }),
            status => Err(ContextError::Unavailable(format!("clinic API returned {}", status))),
        }
    }
}

#[async_trait]
impl CallRecordSink for ClinicApiClient {
    async fn append_turn(&self, call_id: &str, turn: &TranscriptTurn) -> RecordResult<()> {
        let url = self.call_url(call_id, "turns")?;
        self.send_record(self.client.post(url).json(turn)).await
    }

    async fn update_status(&self, call_id: &str, update: &StatusUpdate) -> RecordResult<()> {
        let url = self.call_url(call_id, "status")?;
        self.send_record(self.client.put(url).json(update)).await
    }

    async fn record_outcome(&self, call_id: &str, outcome: &OutcomeUpdate) -> RecordResult<()> {
        let url = self.call_url(call_id, "outcome")?;
        self.send_record(self.client.post(url).json(outcome)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextRef;
    use crate::intent::{Intent, Sentiment};
    use crate::records::{Speaker, TargetStatus};
    use chrono::{TimeZone, Utc};
    use mockito::Matcher;
    use serde_json::json;

    fn client(base_url: String, token: Option<&str>) -> ClinicApiClient {
        ClinicApiClient::new(
            reqwest::Client::new(),
            ClinicApiConfig {
                base_url,
                token: token.map(str::to_string),
            },
        )
    }

    #[tokio::test]
    async fn test_load_context() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/voice/context/follow_up/f-7")
            .match_header("authorization", "Bearer t0k")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "patient": {"id": "p-1", "name": "Maria Lopez", "language": "es"},
                    "doctor": {"id": "d-1", "name": "Dr. Chen"},
                    "followUp": {"id": "f-7", "dueOn": "2026-10-20", "reason": "post-procedure check"}
                })
                .to_string(),
            )
            .create_async()
            .await;

        let api = client(format!("{}/", server.url()), Some("t0k"));
        let record = api.load_context(ContextKind::FollowUp, "f-7").await.unwrap();
        assert_eq!(record.patient.language, "es");
        assert_eq!(record.follow_up.unwrap().reason, "post-procedure check");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_context_not_found_and_unavailable() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/voice/context/patient/nobody")
            .with_status(404)
            .create_async()
            .await;
        server
            .mock("GET", "/voice/context/appointment/a-1")
            .with_status(500)
            .create_async()
            .await;

        let api = client(server.url(), None);
        let err = api.load_context(ContextKind::Patient, "nobody").await.unwrap_err();
        assert!(matches!(err, ContextError::NotFound { kind: ContextKind::Patient, .. }));
        let err = api.load_context(ContextKind::Appointment, "a-1").await.unwrap_err();
        assert!(matches!(err, ContextError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_records_are_posted() {
        let mut server = mockito::Server::new_async().await;
        let turn_mock = server
            .mock("POST", "/voice/calls/CA1/turns")
            .match_body(Matcher::Json(json!({
                "speaker": "caller",
                "text": "yes I confirm",
                "timestamp": "2026-10-17T09:00:00Z"
            })))
            .with_status(201)
            .create_async()
            .await;
        let status_mock = server
            .mock("PUT", "/voice/calls/CA1/status")
            .match_body(Matcher::PartialJson(json!({"status": "completed", "durationSecs": 95})))
            .with_status(204)
            .create_async()
            .await;
        let outcome_mock = server
            .mock("POST", "/voice/calls/CA1/outcome")
            .match_body(Matcher::Json(json!({
                "target": {"kind": "appointment", "id": "a-42"},
                "status": "confirmed",
                "intent": "confirm",
                "sentiment": "neutral"
            })))
            .with_status(200)
            .create_async()
            .await;

        let api = client(server.url(), None);
        let turn = TranscriptTurn {
            speaker: Speaker::Caller,
            text: "yes I confirm".to_string(),
            timestamp: Utc.with_ymd_and_hms(2026, 10, 17, 9, 0, 0).unwrap(),
        };
        api.append_turn("CA1", &turn).await.unwrap();
        api.update_status("CA1", &StatusUpdate::completed(Utc::now(), Duration::from_secs(95)))
            .await
            .unwrap();
        let outcome = OutcomeUpdate {
            target: ContextRef::new(ContextKind::Appointment, "a-42"),
            status: Some(TargetStatus::Confirmed),
            intent: Intent::Confirm,
            sentiment: Sentiment::Neutral,
        };
        api.record_outcome("CA1", &outcome).await.unwrap();

        turn_mock.assert_async().await;
        status_mock.assert_async().await;
        outcome_mock.assert_async().await;
    }

    #[test]
    fn test_ids_stay_inside_their_path_segment() {
        let api = client("http://clinic.test/api/".to_string(), None);
        let url = api.url(&["voice", "context", "appointment", "a/../../admin"]).unwrap();
        assert_eq!(url.as_str(), "http://clinic.test/api/voice/context/appointment/a%2F..%2F..%2Fadmin");

        let url = api.call_url("CA1?x=1#y", "turns").unwrap();
        assert_eq!(url.path(), "/api/voice/calls/CA1%3Fx=1%23y/turns");
        assert!(url.query().is_none());

        assert!(api.url(&["voice", "context", "patient", ".."]).is_none());
        assert!(matches!(api.call_url("", "status"), Err(RecordError::InvalidUrl(_))));
    }

    #[tokio::test]
    async fn test_dot_segments_never_reach_the_api() {
        // No mocks: any request would come back as an unmatched 501
        let server = mockito::Server::new_async().await;
        let api = client(server.url(), None);

        let err = api.load_context(ContextKind::Patient, "..").await.unwrap_err();
        assert!(matches!(err, ContextError::NotFound { kind: ContextKind::Patient, .. }));
        let err = api.update_status(".", &StatusUpdate::in_progress()).await.unwrap_err();
        assert!(matches!(err, RecordError::InvalidUrl(ref id) if id == "."));
    }

    #[tokio::test]
    async fn test_record_failure_is_reported() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("PUT", "/voice/calls/CA1/status")
            .with_status(503)
            .with_body("maintenance")
            .create_async()
            .await;

        let api = client(server.url(), None);
        let err = api.update_status("CA1", &StatusUpdate::in_progress()).await.unwrap_err();
        assert!(matches!(err, RecordError::Status { status: 503, ref body } if body == "maintenance"));
    }
}
