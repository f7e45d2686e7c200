//! WebSocket Relay-Server
//!
//! Nimmt TCP-Verbindungen an, macht das WebSocket-Upgrade und verbindet
//! jeden Socket über eine Outbox mit dem Directory.

use super::directory::{Directory, InMemoryDirectory, RelayError};
use super::router;
use crate::config::RelayConfig;
use crate::signaling::{ClientMessage, ConnectionId, ServerMessage, ERROR_MALFORMED_MESSAGE};
use futures::{SinkExt, StreamExt};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_tungstenite::{accept_async, tungstenite::Message};

// ============================================================================
// RELAY SERVER
// ============================================================================

/// Relay-Server mit gebundenem Listener
pub struct RelayServer {
    listener: TcpListener,
    directory: Arc<dyn Directory>,
    outbox_capacity: usize,
}

impl RelayServer {
    /// Bindet den Listener mit einem neuen In-Memory Directory
    pub async fn bind(config: &RelayConfig) -> Result<Self, RelayError> {
        Self::bind_with_directory(config, Arc::new(InMemoryDirectory::new())).await
    }

    /// Bindet den Listener mit einem vorgegebenen Directory
    pub async fn bind_with_directory(
        config: &RelayConfig,
        directory: Arc<dyn Directory>,
    ) -> Result<Self, RelayError> {
        let listener = TcpListener::bind(config.bind_addr)
            .await
            .map_err(|e| RelayError::Bind(format!("{}: {}", config.bind_addr, e)))?;

        Ok(Self {
            listener,
            directory,
            outbox_capacity: config.outbox_capacity,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, RelayError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn directory(&self) -> Arc<dyn Directory> {
        Arc::clone(&self.directory)
    }

    /// Nimmt Verbindungen an bis `shutdown` fertig ist.
    ///
    /// Danach werden alle offenen Verbindungen geschlossen und abgemeldet.
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), RelayError>
    where
        F: Future<Output = ()>,
    {
        tracing::info!("Relay listening on {}", self.local_addr()?);
        tokio::pin!(shutdown);

        let (stop_tx, stop_rx) = watch::channel(false);
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer_addr)) => {
                            connections.spawn(handle_connection(
                                stream,
                                peer_addr,
                                Arc::clone(&self.directory),
                                self.outbox_capacity,
                                stop_rx.clone(),
                            ));
                        }
                        Err(e) => tracing::warn!("Failed to accept connection: {}", e),
                    }
                }
                // Beendete Verbindungen einsammeln
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                _ = &mut shutdown => break,
            }
        }

        tracing::info!("Relay shutting down, closing {} connections", connections.len());
        let _ = stop_tx.send(true);
        while connections.join_next().await.is_some() {}
        Ok(())
    }

    /// Nimmt Verbindungen an, bis der Prozess beendet wird
    pub async fn run(self) -> Result<(), RelayError> {
        self.run_until(futures::future::pending()).await
    }
}

// ============================================================================
// CONNECTION HANDLING
// ============================================================================

async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    directory: Arc<dyn Directory>,
    outbox_capacity: usize,
    mut stop: watch::Receiver<bool>,
) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            tracing::warn!("WebSocket handshake with {} failed: {}", peer_addr, e);
            return;
        }
    };

    let (mut write, mut read) = ws_stream.split();
    let (tx, mut rx) = mpsc::channel::<ServerMessage>(outbox_capacity);

    let id = directory.register(tx.clone());
    tracing::debug!("Connection {} from {}", id, peer_addr);

    // Write-Task: Outbox → Socket
    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let text = match serde_json::to_string(&msg) {
                Ok(text) => text,
                Err(e) => {
                    tracing::error!("Failed to encode relay message: {}", e);
                    continue;
                }
            };
            if let Err(e) = write.send(Message::Text(text)).await {
                tracing::debug!("Failed to write to socket: {}", e);
                break;
            }
        }
        let _ = write.close().await;
    });

    // Read-Loop: Socket → Router, bis der Server stoppt
    loop {
        let msg_result = tokio::select! {
            msg = read.next() => match msg {
                Some(msg) => msg,
                None => break,
            },
            _ = stop.changed() => break,
        };
        match msg_result {
            Ok(Message::Text(text)) => handle_text(&id, &text, directory.as_ref(), &tx),
            Ok(Message::Close(_)) => break,
            Err(e) => {
                tracing::debug!("WebSocket error on {}: {}", id, e);
                break;
            }
            _ => {}
        }
    }

    // Nach dem Entfernen hält niemand mehr die Outbox, der Writer endet
    directory.unregister(&id);
    drop(tx);
    let _ = writer.await;
    tracing::debug!("Connection {} closed", id);
}

fn handle_text(
    id: &ConnectionId,
    text: &str,
    directory: &dyn Directory,
    reply_tx: &mpsc::Sender<ServerMessage>,
) {
    let reply = match serde_json::from_str::<ClientMessage>(text) {
        Ok(msg) => router::route(directory, id, msg),
        Err(e) => {
            tracing::warn!("Unreadable message from {}: {}", id, e);
            Some(ServerMessage::Error {
                code: ERROR_MALFORMED_MESSAGE,
                message: e.to_string(),
            })
        }
    };

    if let Some(reply) = reply {
        if let Err(e) = reply_tx.try_send(reply) {
            tracing::warn!("Could not reply to {}: {}", id, e);
        }
    }
}
