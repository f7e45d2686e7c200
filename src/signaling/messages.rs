//! Message Types für das Relay-Protokoll
//!
//! Jede Nachricht ist ein JSON-Objekt `{"event": ..., "data": ...}`.
//! Die Event-Namen entsprechen dem Socket-Protokoll der Web-Clients
//! (`me`, `callUser`, `answerCall`, `callAccepted`, `endCall`, `callEnded`).

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ============================================================================
// IDENTIFIERS & PAYLOADS
// ============================================================================

/// Vom Relay vergebene Kennung einer Verbindung
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Erzeugt eine zufällige Kennung (UUID v4)
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Opaker Verbindungsbeschreibungs-Blob der Medien-Aushandlung
///
/// Das Relay und der Coordinator reichen ihn nur weiter. Erzeugt und
/// interpretiert wird er ausschließlich vom Negotiator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SignalPayload(serde_json::Value);

impl SignalPayload {
    /// Session Description im Format `{"type": ..., "sdp": ...}`
    pub fn session_description(kind: &str, sdp: &str) -> Self {
        Self(serde_json::json!({ "type": kind, "sdp": sdp }))
    }

    /// `type`-Feld einer Session Description (falls vorhanden)
    pub fn kind(&self) -> Option<&str> {
        self.0.get("type").and_then(|v| v.as_str())
    }

    /// `sdp`-Feld einer Session Description (falls vorhanden)
    pub fn sdp(&self) -> Option<&str> {
        self.0.get("sdp").and_then(|v| v.as_str())
    }
}

// ============================================================================
// CLIENT → SERVER MESSAGES
// ============================================================================

/// Alle Nachrichten, die ein Client an das Relay schickt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ClientMessage {
    /// Anruf mit Offer an einen anderen Client
    CallUser {
        #[serde(rename = "userToCall")]
        user_to_call: ConnectionId,
        #[serde(rename = "signalData")]
        signal_data: SignalPayload,
        from: ConnectionId,
        name: String,
    },

    /// Answer an den ursprünglichen Anrufer
    AnswerCall { signal: SignalPayload, to: ConnectionId },

    /// Anruf beenden
    EndCall { to: ConnectionId },
}

// ============================================================================
// SERVER → CLIENT MESSAGES
// ============================================================================

/// Alle möglichen Relay-Nachrichten
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ServerMessage {
    /// Eigene Kennung nach dem Verbinden
    Me(ConnectionId),

    /// Eingehender Anruf
    CallUser {
        signal: SignalPayload,
        from: ConnectionId,
        name: String,
    },

    /// Answer des Angerufenen
    CallAccepted(SignalPayload),

    /// Gegenseite hat aufgelegt
    CallEnded,

    /// Angerufener ist nicht (mehr) verbunden
    PeerUnreachable {
        #[serde(rename = "userToCall")]
        user_to_call: ConnectionId,
    },

    /// Fehler
    Error { code: i32, message: String },
}

/// Fehlercode für nicht lesbare Client-Nachrichten
pub const ERROR_MALFORMED_MESSAGE: i32 = 400;

// ============================================================================
// TESTS
// ============================================================================
