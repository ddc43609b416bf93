/// Fake carrier: plays a WAV file into a running clinivox server and saves
/// whatever the assistant says back.
///
/// Usage: stream_replay <input.wav> [--url ws://127.0.0.1:8080]
///        [--param appointmentId=a-42]... [--wait 10] [--out reply.wav]
use anyhow::{bail, Context, Result};
use base64::engine::general_purpose;
use base64::Engine;
use clinivox::audio::{decode_mulaw, encode_mulaw};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{info, warn};

const SAMPLE_RATE: u32 = 8000;
const FRAME_SAMPLES: usize = 160; // 20ms

struct Args {
    input: String,
    url: String,
    params: HashMap<String, String>,
    wait: Duration,
    out: String,
}

fn parse_args() -> Result<Args> {
    let mut args = std::env::args().skip(1);
    let mut input = None;
    let mut url = "ws://127.0.0.1:8080".to_string();
    let mut params = HashMap::new();
    let mut wait = Duration::from_secs(10);
    let mut out = "reply.wav".to_string();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--url" => url = args.next().context("--url needs a value")?,
            "--out" => out = args.next().context("--out needs a value")?,
            "--wait" => {
                let secs: u64 = args.next().context("--wait needs a value")?.parse()?;
                wait = Duration::from_secs(secs);
            }
            "--param" => {
                let pair = args.next().context("--param needs key=value")?;
                let (key, value) = pair.split_once('=').context("--param needs key=value")?;
                params.insert(key.to_string(), value.to_string());
            }
            _ if input.is_none() => input = Some(arg),
            other => bail!("Unexpected argument {}", other),
        }
    }

    Ok(Args {
        input: input.context("usage: stream_replay <input.wav> [--url ..] [--param k=v] [--wait s] [--out f]")?,
        url,
        params,
        wait,
        out,
    })
}

/// Load an 8 kHz mono 16-bit WAV as μ-law
fn load_wav(path: &str) -> Result<Vec<u8>> {
    let mut reader = hound::WavReader::open(path).with_context(|| format!("failed to open {}", path))?;
    let spec = reader.spec();
    if spec.sample_rate != SAMPLE_RATE || spec.channels != 1 || spec.bits_per_sample != 16 {
        bail!(
            "{} must be 8kHz mono 16-bit PCM (got {}Hz, {} channels, {} bits)",
            path,
            spec.sample_rate,
            spec.channels,
            spec.bits_per_sample
        );
    }
    let samples = reader.samples::<i16>().collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(encode_mulaw(&samples))
}

fn save_wav(path: &str, mulaw: &[u8]) -> Result<()> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec)?;
    for sample in decode_mulaw(mulaw) {
        writer.write_sample(sample)?;
    }
    writer.finalize()?;
    Ok(())
}

fn media(stream_sid: &str, chunk: u64, audio: &[u8]) -> Message {
    Message::Text(
        json!({
            "event": "media",
            "streamSid": stream_sid,
            "media": {
                "track": "inbound",
                "chunk": chunk.to_string(),
                "timestamp": (chunk * 20).to_string(),
                "payload": general_purpose::STANDARD.encode(audio)
            }
        })
        .to_string()
        .into(),
    )
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_max_level(tracing::Level::INFO).init();

    let args = parse_args()?;
    let audio = load_wav(&args.input)?;
    info!("🎧 Loaded {} ({:.1}s)", args.input, audio.len() as f32 / SAMPLE_RATE as f32);

    let (ws, _) = connect_async(args.url.as_str())
        .await
        .with_context(|| format!("failed to connect to {}", args.url))?;
    let (mut sink, mut stream) = ws.split();

    let stream_sid = format!("MZ{}", uuid::Uuid::new_v4().simple());
    let call_sid = format!("CA{}", uuid::Uuid::new_v4().simple());
    sink.send(Message::Text(json!({"event": "connected", "protocol": "Call", "version": "1.0.0"}).to_string().into()))
        .await?;
    sink.send(Message::Text(
        json!({
            "event": "start",
            "streamSid": stream_sid,
            "start": {
                "callSid": call_sid,
                "tracks": ["inbound"],
                "customParameters": args.params,
                "mediaFormat": {"encoding": "audio/x-mulaw", "sampleRate": SAMPLE_RATE, "channels": 1}
            }
        })
        .to_string()
        .into(),
    ))
    .await?;
    info!("📞 Started call {} on {}", call_sid, args.url);

    // Collect replies while we stream
    let reader = tokio::spawn(async move {
        let mut reply = Vec::new();
        while let Some(Ok(msg)) = stream.next().await {
            let Message::Text(text) = msg else { continue };
            let Ok(value) = serde_json::from_str::<Value>(text.as_str()) else {
                continue;
            };
            match value["event"].as_str() {
                Some("media") => {
                    if let Some(payload) = value["media"]["payload"].as_str() {
                        match general_purpose::STANDARD.decode(payload) {
                            Ok(bytes) => reply.extend_from_slice(&bytes),
                            Err(e) => warn!("Bad payload from server: {}", e),
                        }
                    }
                }
                Some("mark") => info!("📍 Reply mark {}", value["mark"]["name"]),
                _ => {}
            }
        }
        reply
    });

    // Real-time pacing, then silence while the assistant answers
    let mut ticker = interval(Duration::from_millis(20));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);
    let silence = [0xFFu8; FRAME_SAMPLES];
    let silent_frames = args.wait.as_millis() as usize / 20;
    let frames = audio.chunks(FRAME_SAMPLES).chain(std::iter::repeat(&silence[..]).take(silent_frames));
    for (chunk, frame) in frames.enumerate() {
        ticker.tick().await;
        sink.send(media(&stream_sid, chunk as u64 + 1, frame)).await?;
    }

    sink.send(Message::Text(json!({"event": "stop", "streamSid": stream_sid}).to_string().into()))
        .await?;
    sleep(Duration::from_millis(200)).await;
    let _ = sink.close().await;

    let reply = reader.await?;
    if reply.is_empty() {
        warn!("No reply audio received");
        return Ok(());
    }
    save_wav(&args.out, &reply)?;
    info!("💾 Saved {:.1}s of reply audio to {}", reply.len() as f32 / SAMPLE_RATE as f32, args.out);
    Ok(())
}
