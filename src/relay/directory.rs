//! Relay Directory
//!
//! Prozessweite Zuordnung Kennung → Outbox einer Relay-Verbindung.
//! Kennt keine Anruf-Semantik, nur Zustellung.

use crate::signaling::{ConnectionId, ServerMessage};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::mpsc;

/// Sende-Ende der Outbox einer Verbindung
pub type Outbox = mpsc::Sender<ServerMessage>;

/// Quelle für neue Kennungen
pub type IdSource = Box<dyn Fn() -> ConnectionId + Send + Sync>;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("Peer {0} is not connected")]
    PeerUnreachable(ConnectionId),

    #[error("Outbox of {0} is full, message dropped")]
    OutboxFull(ConnectionId),

    #[error("Failed to bind relay listener: {0}")]
    Bind(String),

    #[error("Relay I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for RelayError {
    fn from(e: std::io::Error) -> Self {
        RelayError::Io(e.to_string())
    }
}

// ============================================================================
// DIRECTORY TRAIT
// ============================================================================

/// Verzeichnis der verbundenen Clients
pub trait Directory: Send + Sync {
    /// Registriert eine neue Verbindung und schickt ihr die eigene Kennung
    fn register(&self, outbox: Outbox) -> ConnectionId;

    /// Stellt eine Nachricht an `target` zu
    fn forward(&self, target: &ConnectionId, msg: ServerMessage) -> Result<(), RelayError>;

    /// Entfernt eine Verbindung
    fn unregister(&self, id: &ConnectionId);

    /// Prüft ob eine Kennung verbunden ist
    fn contains(&self, id: &ConnectionId) -> bool;

    /// Anzahl verbundener Clients
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// IN-MEMORY DIRECTORY
// ============================================================================

struct Entry {
    outbox: Outbox,
    connected_at: DateTime<Utc>,
}

/// Verzeichnis im Speicher (Thread-safe durch RwLock)
pub struct InMemoryDirectory {
    entries: RwLock<HashMap<ConnectionId, Entry>>,
    id_source: IdSource,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::with_id_source(Box::new(ConnectionId::generate))
    }

    /// Verzeichnis mit eigener Kennungs-Quelle (z.B. deterministisch in Tests)
    pub fn with_id_source(id_source: IdSource) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            id_source,
        }
    }

    fn fresh_id(&self, entries: &HashMap<ConnectionId, Entry>) -> ConnectionId {
        loop {
            let id = (self.id_source)();
            if !entries.contains_key(&id) {
                return id;
            }
            tracing::warn!("Id source produced duplicate id {}, drawing again", id);
        }
    }
}

impl Default for InMemoryDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl Directory for InMemoryDirectory {
    fn register(&self, outbox: Outbox) -> ConnectionId {
        let id = {
            let mut entries = self.entries.write();
            let id = self.fresh_id(&entries);
            entries.insert(
                id.clone(),
                Entry {
                    outbox: outbox.clone(),
                    connected_at: Utc::now(),
                },
            );
            id
        };

        if let Err(e) = outbox.try_send(ServerMessage::Me(id.clone())) {
            tracing::warn!("Could not hand id {} to its connection: {}", id, e);
        }

        tracing::info!("Registered connection {}", id);
        id
    }

    fn forward(&self, target: &ConnectionId, msg: ServerMessage) -> Result<(), RelayError> {
        let outbox = self
            .entries
            .read()
            .get(target)
            .map(|entry| entry.outbox.clone())
            .ok_or_else(|| RelayError::PeerUnreachable(target.clone()))?;

        outbox.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => RelayError::OutboxFull(target.clone()),
            mpsc::error::TrySendError::Closed(_) => RelayError::PeerUnreachable(target.clone()),
        })
    }

    fn unregister(&self, id: &ConnectionId) {
        if let Some(entry) = self.entries.write().remove(id) {
            let lifetime = Utc::now() - entry.connected_at;
            tracing::info!(
                "Unregistered connection {} after {}s",
                id,
                lifetime.num_seconds()
            );
        }
    }

    fn contains(&self, id: &ConnectionId) -> bool {
        self.entries.read().contains_key(id)
    }

    fn len(&self) -> usize {
        self.entries.read().len()
    }
}

impl std::fmt::Debug for InMemoryDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryDirectory")
            .field("connections", &self.len())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
