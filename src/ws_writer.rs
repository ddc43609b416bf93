//! WebSocket writer task that serializes and sends all outgoing messages
//! This is the single point where a call's outbound messages are serialized to JSON

use crate::media_event::OutboundMessage;
use futures_util::{Sink, SinkExt};
use std::fmt::Display;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info};

/// What went out over one connection
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WriterStats {
    pub media_frames: u64,
    pub media_bytes: u64,
    pub marks: u64,
    pub clears: u64,
}

impl WriterStats {
    fn count(&mut self, msg: &OutboundMessage) {
        match msg {
            OutboundMessage::Media { media, .. } => {
                self.media_frames += 1;
                // base64 expands 3 bytes to 4 chars
                let padding = media.payload.bytes().rev().take_while(|b| *b == b'=').count();
                self.media_bytes += (media.payload.len() / 4 * 3 - padding) as u64;
            }
            OutboundMessage::Mark { mark, .. } => {
                self.marks += 1;
                debug!("📍 Sending mark {}", mark.name);
            }
            OutboundMessage::Clear { .. } => self.clears += 1,
        }
    }
}

/// Drain `outgoing_rx` into `sink` until every producer is gone or the sink fails.
pub async fn run_writer<S>(mut outgoing_rx: UnboundedReceiver<OutboundMessage>, mut sink: S) -> WriterStats
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    debug!("WebSocket writer task started");

    let mut stats = WriterStats::default();
    let mut last_summary = Instant::now();
    let summary_interval = Duration::from_secs(30);

    while let Some(msg) = outgoing_rx.recv().await {
        let json = match msg.to_json() {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize outbound message: {}", e);
                continue;
            }
        };
        stats.count(&msg);

        if let Err(e) = sink.send(Message::Text(json.into())).await {
            error!("Failed to send to websocket: {}", e);
            break;
        }

        if last_summary.elapsed() >= summary_interval {
            info!("📤 Outbound so far: {} frames ({} bytes), {} marks", stats.media_frames, stats.media_bytes, stats.marks);
            last_summary = Instant::now();
        }
    }

    // Producers may still hold senders; nothing they send now can be delivered
    outgoing_rx.close();
    if let Err(e) = sink.close().await {
        debug!("WebSocket close after writer shutdown: {}", e);
    }
    info!("WebSocket writer task shutting down ({} frames, {} marks)", stats.media_frames, stats.marks);
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_writer_serializes_in_order() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut sent: Vec<Message> = Vec::new();

        tx.send(OutboundMessage::media("MZ1", &[1, 2, 3])).unwrap();
        tx.send(OutboundMessage::mark("MZ1", "turn-1")).unwrap();
        tx.send(OutboundMessage::clear("MZ1")).unwrap();
        drop(tx);

        let stats = run_writer(rx, &mut sent).await;
        assert_eq!(stats.media_frames, 1);
        assert_eq!(stats.media_bytes, 3);
        assert_eq!(stats.marks, 1);
        assert_eq!(stats.clears, 1);

        let events: Vec<String> = sent
            .iter()
            .map(|msg| {
                let value: serde_json::Value = serde_json::from_str(msg.to_text().unwrap()).unwrap();
                value["event"].as_str().unwrap().to_string()
            })
            .collect();
        assert_eq!(events, vec!["media", "mark", "clear"]);
    }

    #[tokio::test]
    async fn test_writer_stops_when_sink_fails() {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = Box::pin(futures_util::sink::unfold((), |_, _msg: Message| async move {
            Err::<(), String>("socket closed".to_string())
        }));

        tx.send(OutboundMessage::mark("MZ1", "turn-1")).unwrap();
        let stats = run_writer(rx, sink).await;
        // Counted before the send that failed
        assert_eq!(stats.marks, 1);
        assert!(tx.send(OutboundMessage::clear("MZ1")).is_err());
    }
}
