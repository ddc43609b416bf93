//! End-to-end: a fake carrier talks to the real server over localhost.

use async_trait::async_trait;
use base64::engine::general_purpose;
use base64::Engine;
use clinivox::audio::AudioFormat;
use clinivox::context::{ContextKind, ContextRecord};
use clinivox::error::ServiceResult;
use clinivox::generator::ResponseGenerator;
use clinivox::records::{CallStatus, Speaker, TranscriptTurn};
use clinivox::synthesis::SpeechSynthesizer;
use clinivox::transcription::Transcriber;
use clinivox::{
    server, ConversationContext, MemoryContextLoader, MemoryRecordSink, SessionDeps, SessionRegistry,
    StreamSettings, TurnServices,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

struct EchoTranscriber;

#[async_trait]
impl Transcriber for EchoTranscriber {
    async fn transcribe(&self, audio: &[u8], _format: AudioFormat) -> String {
        if audio.iter().all(|b| *b == 0xFF) {
            String::new()
        } else {
            "yes I confirm".to_string()
        }
    }
}

struct CannedGenerator;

#[async_trait]
impl ResponseGenerator for CannedGenerator {
    async fn generate(&self, _: &str, _: &ConversationContext, _: &[TranscriptTurn]) -> String {
        "Thank you, see you on Tuesday.".to_string()
    }
}

struct ToneSynthesizer;

#[async_trait]
impl SpeechSynthesizer for ToneSynthesizer {
    async fn synthesize(&self, _text: &str, _format: AudioFormat) -> ServiceResult<Vec<u8>> {
        // 100ms
        Ok(vec![0x55; 800])
    }
}

type Carrier = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

struct TestServer {
    url: String,
    sink: Arc<MemoryRecordSink>,
    registry: SessionRegistry,
}

async fn start_server() -> TestServer {
    let contexts = MemoryContextLoader::new();
    let record: ContextRecord = serde_json::from_value(json!({
        "patient": {"id": "p-1", "name": "Maria Lopez"},
        "doctor": {"id": "d-1", "name": "Dr. Chen"},
        "appointment": {"id": "a-42", "scheduledAt": "2026-11-03T15:30:00Z"}
    }))
    .unwrap();
    contexts.insert(ContextKind::Appointment, "a-42", record).await;

    let sink = Arc::new(MemoryRecordSink::new());
    let registry = SessionRegistry::new();
    let deps = SessionDeps {
        services: TurnServices {
            transcriber: Arc::new(EchoTranscriber),
            generator: Arc::new(CannedGenerator),
            synthesizer: Arc::new(ToneSynthesizer),
        },
        contexts: Arc::new(contexts),
        records: sink.clone(),
        settings: StreamSettings {
            buffer: Duration::from_millis(200),
            playback_tail: Duration::from_millis(50),
            ..StreamSettings::default()
        },
        recordings: None,
        registry: registry.clone(),
    };

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    tokio::spawn(server::run(listener, deps, std::future::pending()));

    TestServer { url, sink, registry }
}

fn text(value: Value) -> Message {
    Message::Text(value.to_string().into())
}

fn media(byte: u8) -> Message {
    text(json!({
        "event": "media",
        "streamSid": "MZ1",
        "media": {"track": "inbound", "payload": general_purpose::STANDARD.encode([byte; 160])}
    }))
}

/// Read until a mark arrives, returning its name and the audio bytes before it
async fn read_until_mark(carrier: &mut Carrier) -> (String, usize) {
    let mut audio = 0;
    let name = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let msg = carrier.next().await.expect("socket closed").expect("socket error");
            let Message::Text(body) = msg else { continue };
            let value: Value = serde_json::from_str(body.as_str()).unwrap();
            assert_eq!(value["streamSid"], "MZ1");
            match value["event"].as_str() {
                Some("media") => {
                    let payload = value["media"]["payload"].as_str().unwrap();
                    audio += general_purpose::STANDARD.decode(payload).unwrap().len();
                }
                Some("mark") => return value["mark"]["name"].as_str().unwrap().to_string(),
                other => panic!("unexpected event {:?}", other),
            }
        }
    })
    .await
    .expect("no mark within 5s");
    (name, audio)
}

async fn wait_for<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not met within 2s");
}

#[tokio::test]
async fn test_confirmation_call_end_to_end() {
    let server = start_server().await;
    let (mut carrier, _) = connect_async(server.url.as_str()).await.unwrap();

    carrier.send(text(json!({"event": "connected", "protocol": "Call"}))).await.unwrap();
    carrier
        .send(text(json!({
            "event": "start",
            "streamSid": "MZ1",
            "start": {
                "callSid": "CA1",
                "customParameters": {"appointmentId": "a-42"},
                "mediaFormat": {"encoding": "audio/x-mulaw", "sampleRate": 8000, "channels": 1}
            }
        })))
        .await
        .unwrap();

    // Opening line
    assert_eq!(read_until_mark(&mut carrier).await, ("turn-1".to_string(), 800));
    let registry = &server.registry;
    wait_for(|| async move { registry.active_count().await == 1 }).await;
    tokio::time::sleep(Duration::from_millis(400)).await;

    // Silence is not a turn
    for _ in 0..10 {
        carrier.send(media(0xFF)).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(200)).await;
    // 200ms of speech fills one buffer
    for _ in 0..10 {
        carrier.send(media(0x10)).await.unwrap();
    }
    assert_eq!(read_until_mark(&mut carrier).await, ("turn-3".to_string(), 800));

    carrier.send(text(json!({"event": "stop", "streamSid": "MZ1"}))).await.unwrap();
    wait_for(|| async move { registry.active_count().await == 0 }).await;

    let sink = server.sink.clone();
    wait_for(|| {
        let sink = sink.clone();
        async move {
            sink.statuses("CA1")
                .await
                .last()
                .is_some_and(|s| s.status == CallStatus::Completed)
        }
    })
    .await;

    let turns = server.sink.turns("CA1").await;
    let spoken: Vec<_> = turns.iter().map(|t| (t.speaker, t.text.as_str())).collect();
    assert_eq!(spoken.len(), 3);
    assert_eq!(spoken[0].0, Speaker::Assistant);
    assert_eq!(spoken[1], (Speaker::Caller, "yes I confirm"));
    assert_eq!(spoken[2], (Speaker::Assistant, "Thank you, see you on Tuesday."));
    assert_eq!(server.sink.outcomes("CA1").await.len(), 1);
}

#[tokio::test]
async fn test_unknown_appointment_stays_silent() {
    let server = start_server().await;
    let (mut carrier, _) = connect_async(server.url.as_str()).await.unwrap();

    carrier
        .send(text(json!({
            "event": "start",
            "streamSid": "MZ1",
            "start": {"callSid": "CA2", "customParameters": {"appointmentId": "missing"}}
        })))
        .await
        .unwrap();
    carrier.send(text(json!({"event": "bogus"}))).await.unwrap();
    carrier.send(Message::Text("{not json".into())).await.unwrap();
    for _ in 0..30 {
        carrier.send(media(0x10)).await.unwrap();
    }

    let quiet = tokio::time::timeout(Duration::from_millis(500), carrier.next()).await;
    assert!(quiet.is_err(), "server should not send anything");

    carrier.close(None).await.unwrap();
    let registry = &server.registry;
    wait_for(|| async move { registry.active_count().await == 0 }).await;
    assert!(server.sink.turns("CA2").await.is_empty());
}
