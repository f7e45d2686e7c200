//! WebSocket Client für den Relay-Server
//!
//! Verwaltet die WebSocket-Verbindung zum Relay:
//! - Verbindungsaufbau und Warten auf die eigene Kennung (`me`)
//! - Getrennte Read-/Write-Tasks
//! - Event-basierte Kommunikation über einen Broadcast-Channel

use super::messages::*;
use super::transport::{SignalingError, SignalingEvent, SignalingTransport};
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

/// Größe der Sende-Queue
const OUTBOUND_QUEUE: usize = 100;

/// Größe des Event-Channels
const EVENT_CHANNEL: usize = 100;

// ============================================================================
// CLIENT STATE
// ============================================================================

#[derive(Debug, Clone, Default)]
struct ClientState {
    is_connected: bool,
    id: Option<ConnectionId>,
    /// Zählt Verbindungsaufbauten, damit ein alter Read-Task nichts Neues abräumt
    generation: u64,
}

// ============================================================================
// SIGNALING CLIENT
// ============================================================================

/// WebSocket Client für die Kommunikation mit dem Relay
pub struct SignalingClient {
    server_url: Url,
    register_timeout: Duration,
    state: Arc<RwLock<ClientState>>,
    tx: Arc<RwLock<Option<mpsc::Sender<String>>>>,
    event_tx: broadcast::Sender<SignalingEvent>,
}

impl SignalingClient {
    /// Erstellt einen neuen SignalingClient
    pub fn new(server_url: Url, register_timeout: Duration) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL);

        Self {
            server_url,
            register_timeout,
            state: Arc::new(RwLock::new(ClientState::default())),
            tx: Arc::new(RwLock::new(None)),
            event_tx,
        }
    }

    /// Prüft ob verbunden
    pub fn is_connected(&self) -> bool {
        self.state.read().is_connected
    }

    /// Verbindet mit dem Relay und wartet auf die eigene Kennung
    pub async fn connect(&self) -> Result<ConnectionId, SignalingError> {
        tracing::info!("Connecting to relay server: {}", self.server_url);

        let (ws_stream, _) = connect_async(self.server_url.as_str())
            .await
            .map_err(|e| SignalingError::ConnectionFailed(e.to_string()))?;

        let (mut write, mut read) = ws_stream.split();

        let (tx, mut rx) = mpsc::channel::<String>(OUTBOUND_QUEUE);
        *self.tx.write() = Some(tx);

        let generation = {
            let mut state = self.state.write();
            state.is_connected = true;
            state.id = None;
            state.generation += 1;
            state.generation
        };
        let _ = self.event_tx.send(SignalingEvent::Connected);

        // Channel für die `me`-Nachricht
        let (reg_tx, mut reg_rx) = mpsc::channel::<Result<ConnectionId, SignalingError>>(1);

        // Read-Task starten
        let state_clone = Arc::clone(&self.state);
        let tx_slot = Arc::clone(&self.tx);
        let event_tx = self.event_tx.clone();

        tokio::spawn(async move {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerMessage>(&text) {
                        Ok(server_msg) => {
                            Self::handle_server_message(server_msg, &state_clone, &event_tx, &reg_tx)
                                .await;
                        }
                        Err(e) => tracing::warn!("Ignoring unreadable relay message: {}", e),
                    },
                    Ok(Message::Close(_)) => {
                        tracing::info!("WebSocket closed by server");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }

            // Ohne Relay gibt es weder Kennung noch Sende-Queue
            {
                let mut state = state_clone.write();
                if state.generation == generation {
                    state.is_connected = false;
                    state.id = None;
                    tx_slot.write().take();
                }
            }
            let _ = event_tx.send(SignalingEvent::Disconnected);
        });

        // Write-Task starten
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = write.send(Message::Text(msg)).await {
                    tracing::error!("Failed to send WebSocket message: {}", e);
                    break;
                }
            }
            let _ = write.close().await;
        });

        tokio::select! {
            result = reg_rx.recv() => {
                match result {
                    Some(result) => result,
                    None => Err(SignalingError::RegistrationFailed("No response".to_string())),
                }
            }
            _ = tokio::time::sleep(self.register_timeout) => {
                Err(SignalingError::RegistrationFailed("Timeout".to_string()))
            }
        }
    }

    /// Trennt die Verbindung (der Write-Task schließt den Socket)
    pub fn disconnect(&self) {
        self.tx.write().take();
    }

    /// Verarbeitet eingehende Server-Nachrichten
    async fn handle_server_message(
        msg: ServerMessage,
        state: &Arc<RwLock<ClientState>>,
        event_tx: &broadcast::Sender<SignalingEvent>,
        reg_tx: &mpsc::Sender<Result<ConnectionId, SignalingError>>,
    ) {
        match &msg {
            ServerMessage::Me(id) => {
                tracing::info!("Registered with relay as {}", id);
                state.write().id = Some(id.clone());
                let _ = reg_tx.send(Ok(id.clone())).await;
            }
            ServerMessage::Error { code, message } => {
                tracing::error!("Server error {}: {}", code, message);
                // Vor der Registrierung ist das ein Registrierungsfehler
                if state.read().id.is_none() {
                    let _ = reg_tx
                        .send(Err(SignalingError::ServerError {
                            code: *code,
                            message: message.clone(),
                        }))
                        .await;
                }
            }
            _ => {}
        }

        let _ = event_tx.send(SignalingEvent::from(msg));
    }
}

impl SignalingTransport for SignalingClient {
    fn local_id(&self) -> Option<ConnectionId> {
        self.state.read().id.clone()
    }

    fn send(&self, msg: ClientMessage) -> Result<(), SignalingError> {
        if !self.is_connected() {
            return Err(SignalingError::NotConnected);
        }
        let guard = self.tx.read();
        let tx = guard.as_ref().ok_or(SignalingError::NotConnected)?;

        let text =
            serde_json::to_string(&msg).map_err(|e| SignalingError::SendFailed(e.to_string()))?;

        // try_send ist non-blocking
        tx.try_send(text)
            .map_err(|e| SignalingError::SendFailed(e.to_string()))
    }

    fn subscribe(&self) -> broadcast::Receiver<SignalingEvent> {
        self.event_tx.subscribe()
    }
}

impl std::fmt::Debug for SignalingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingClient")
            .field("server_url", &self.server_url.as_str())
            .field("state", &*self.state.read())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> SignalingClient {
        let url = Url::parse("ws://127.0.0.1:9").unwrap();
        SignalingClient::new(url, Duration::from_millis(100))
    }

    #[test]
    fn test_send_before_connect_fails() {
        let client = client();
        let result = client.end_call("A1".into());
        assert!(matches!(result, Err(SignalingError::NotConnected)));
        assert!(!client.is_connected());
    }

    #[test]
    fn test_call_requires_registration() {
        let client = client();
        let result = client.call_user(
            "A1".into(),
            SignalPayload::session_description("offer", "v=0"),
            "Bob".to_string(),
        );
        assert!(matches!(result, Err(SignalingError::NotConnected)));
        assert_eq!(client.local_id(), None);
    }

    #[test]
    fn test_server_message_to_event() {
        let event = SignalingEvent::from(ServerMessage::PeerUnreachable {
            user_to_call: "A1".into(),
        });
        assert_eq!(
            event,
            SignalingEvent::PeerUnreachable {
                target: "A1".into()
            }
        );
    }
}
