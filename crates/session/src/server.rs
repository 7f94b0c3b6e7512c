//! WebSocket front door.
//!
//! One session per connection. The read pump parses client envelopes
//! and dispatches them; the write pump drains the session's outbound
//! queue. When the socket closes, everything the session owns is
//! stopped and reclaimed.

use std::future::Future;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::controller::SessionController;
use crate::protocol::ClientEnvelope;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// `HOST:PORT` to listen on.
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:5000".to_string(),
        }
    }
}

/// Serve until `shutdown` resolves. Each accepted connection gets its
/// own session and task.
pub async fn serve(
    config: ServerConfig,
    controller: Arc<SessionController>,
    shutdown: impl Future<Output = ()> + Send,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(&config.listen).await?;
    info!(listen = %config.listen, "listening for clients");

    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                let controller = controller.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, controller).await {
                        debug!(%peer, error = %e, "connection ended with error");
                    }
                });
            }
        }
    }

    info!("server stopped accepting connections");
    Ok(())
}

async fn handle_connection(
    stream: TcpStream,
    controller: Arc<SessionController>,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    let websocket = tokio_tungstenite::accept_async(stream).await?;
    let (mut sink, mut source) = websocket.split();

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
    let mut session = controller.create_session(outbound_tx);
    info!(session = %session.id(), "client connected");

    loop {
        tokio::select! {
            // Write pump: session events out to the client.
            Some(envelope) = outbound_rx.recv() => {
                match serde_json::to_string(&envelope) {
                    Ok(text) => sink.send(Message::Text(text)).await?,
                    Err(e) => warn!(error = %e, "failed to encode envelope"),
                }
            }

            // Read pump: client commands in.
            message = source.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<ClientEnvelope>(&text) {
                        Ok(envelope) => {
                            if !session.handle(envelope).await {
                                break;
                            }
                        }
                        Err(e) => session.reject(format!("malformed envelope: {e}")),
                    }
                }
                Some(Ok(Message::Ping(payload))) => {
                    sink.send(Message::Pong(payload)).await?;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(session = %session.id(), error = %e, "socket error");
                    break;
                }
            }
        }
    }

    // Flush whatever the session queued before teardown.
    while let Ok(envelope) = outbound_rx.try_recv() {
        if let Ok(text) = serde_json::to_string(&envelope) {
            let _ = sink.send(Message::Text(text)).await;
        }
    }

    let id = session.id().to_string();
    info!(session = %id, "client disconnected, stopping its tasks");
    session.shutdown().await;
    info!(session = %id, "session reclaimed");
    Ok(())
}
