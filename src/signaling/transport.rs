//! Transport-Abstraktion zwischen Session Coordinator und Relay
//!
//! Der Coordinator kennt nur diese Schnittstelle. Implementiert wird sie
//! vom WebSocket-Client und vom In-Process-Relay.

use super::messages::{ClientMessage, ConnectionId, ServerMessage, SignalPayload};
use thiserror::Error;
use tokio::sync::broadcast;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum SignalingError {
    #[error("WebSocket connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected to relay server")]
    NotConnected,

    #[error("Failed to send message: {0}")]
    SendFailed(String),

    #[error("Registration failed: {0}")]
    RegistrationFailed(String),

    #[error("Server error: {code} - {message}")]
    ServerError { code: i32, message: String },
}

// ============================================================================
// SIGNALING EVENTS
// ============================================================================

/// Events die von einem Signaling-Transport ausgelöst werden
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingEvent {
    /// Verbunden mit dem Relay
    Connected,

    /// Verbindung getrennt
    Disconnected,

    /// Eigene Kennung erhalten
    Registered { id: ConnectionId },

    /// Eingehender Anruf
    IncomingCall {
        from: ConnectionId,
        name: String,
        signal: SignalPayload,
    },

    /// Answer vom Angerufenen
    CallAccepted { signal: SignalPayload },

    /// Gegenseite hat aufgelegt
    CallEnded,

    /// Angerufener ist nicht erreichbar
    PeerUnreachable { target: ConnectionId },

    /// Fehler vom Server
    Error { code: i32, message: String },
}

impl From<ServerMessage> for SignalingEvent {
    fn from(msg: ServerMessage) -> Self {
        match msg {
            ServerMessage::Me(id) => SignalingEvent::Registered { id },
            ServerMessage::CallUser { signal, from, name } => {
                SignalingEvent::IncomingCall { from, name, signal }
            }
            ServerMessage::CallAccepted(signal) => SignalingEvent::CallAccepted { signal },
            ServerMessage::CallEnded => SignalingEvent::CallEnded,
            ServerMessage::PeerUnreachable { user_to_call } => SignalingEvent::PeerUnreachable {
                target: user_to_call,
            },
            ServerMessage::Error { code, message } => SignalingEvent::Error { code, message },
        }
    }
}

// ============================================================================
// TRANSPORT TRAIT
// ============================================================================

/// Verbindung eines Clients zum Relay
pub trait SignalingTransport: Send + Sync {
    /// Eigene Kennung (falls bereits registriert)
    fn local_id(&self) -> Option<ConnectionId>;

    /// Sendet eine Nachricht an das Relay (blockiert nicht)
    fn send(&self, msg: ClientMessage) -> Result<(), SignalingError>;

    /// Gibt einen Event-Receiver zurück
    fn subscribe(&self) -> broadcast::Receiver<SignalingEvent>;

    /// Sendet einen Anruf mit Offer (erfordert eine eigene Kennung)
    fn call_user(
        &self,
        user_to_call: ConnectionId,
        signal_data: SignalPayload,
        name: String,
    ) -> Result<(), SignalingError> {
        let from = self.local_id().ok_or(SignalingError::NotConnected)?;
        self.send(ClientMessage::CallUser {
            user_to_call,
            signal_data,
            from,
            name,
        })
    }

    /// Sendet die Answer an den Anrufer
    fn answer_call(&self, to: ConnectionId, signal: SignalPayload) -> Result<(), SignalingError> {
        self.send(ClientMessage::AnswerCall { signal, to })
    }

    /// Beendet einen Anruf bzw. lehnt ihn ab
    fn end_call(&self, to: ConnectionId) -> Result<(), SignalingError> {
        self.send(ClientMessage::EndCall { to })
    }
}
