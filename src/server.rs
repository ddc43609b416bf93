//! Media stream server
//!
//! Accepts carrier WebSocket connections and runs one [`CallSession`] per
//! connection. The socket is split: this task reads and dispatches frames,
//! a writer task owns the sink.

use crate::error::{FrameError, Result};
use crate::session::{CallSession, SessionControl, SessionDeps};
use crate::ws_writer::run_writer;
use futures_util::StreamExt;
use std::future::Future;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

/// Accept connections until `shutdown` resolves. Live calls keep running
/// on their own tasks after the listener stops.
pub async fn run<F>(listener: TcpListener, deps: SessionDeps, shutdown: F) -> Result<()>
where
    F: Future<Output = ()>,
{
    info!("🚀 Listening for media streams on {}", listener.local_addr()?);
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let deps = deps.clone();
                        tokio::spawn(async move {
                            if let Err(e) = serve_connection(stream, peer, deps).await {
                                warn!(%peer, "Connection ended with error: {}", e);
                            }
                        });
                    }
                    Err(e) => error!("Failed to accept connection: {}", e),
                }
            }
            _ = &mut shutdown => {
                let active = deps.registry.active_count().await;
                info!("🛑 Shutting down listener ({} calls still active)", active);
                break;
            }
        }
    }
    Ok(())
}

/// Run one carrier connection to completion
pub async fn serve_connection(stream: TcpStream, peer: SocketAddr, deps: SessionDeps) -> Result<()> {
    let ws = accept_async(stream).await?;
    info!(%peer, "🔌 Carrier connected");

    let (sink, mut frames) = ws.split();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let mut writer = tokio::spawn(run_writer(out_rx, sink));
    let mut writer_done = None;

    let mut session = CallSession::on_connection_open(deps, out_tx);
    let mut result = Ok(());

    loop {
        let frame = tokio::select! {
            frame = frames.next() => frame,
            // Nothing can reach the carrier any more; end the call
            joined = &mut writer => {
                warn!(%peer, "Outbound writer stopped, tearing down the call");
                writer_done = Some(joined);
                break;
            }
        };
        let frame = match frame {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                result = Err(e.into());
                break;
            }
            None => break,
        };

        match frame {
            Message::Text(text) => {
                if session.handle_message(text.as_str()).await == SessionControl::Stop {
                    break;
                }
            }
            Message::Binary(bytes) => {
                warn!(%peer, "{}", FrameError::Binary(bytes.len()));
            }
            Message::Close(close) => {
                debug!(%peer, ?close, "Carrier closed the socket");
                break;
            }
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
        }
    }

    // Drops the session's outbound sender, which lets the writer finish
    session.on_connection_close().await;
    let joined = match writer_done {
        Some(joined) => joined,
        None => writer.await,
    };
    match joined {
        Ok(stats) => debug!(%peer, ?stats, "Writer finished"),
        Err(e) => warn!(%peer, "Writer task failed: {}", e),
    }
    info!(%peer, "👋 Carrier disconnected");
    result
}
