//! In-Process Relay
//!
//! Verbindet Clients im selben Prozess direkt mit einem Directory, ohne
//! Sockets. Dieselbe Weiterleitung wie der WebSocket-Server.

use super::directory::{Directory, InMemoryDirectory};
use super::router;
use crate::signaling::{
    ClientMessage, ConnectionId, ServerMessage, SignalingError, SignalingEvent, SignalingTransport,
};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

/// Relay ohne Netzwerk
#[derive(Clone)]
pub struct LocalRelay {
    directory: Arc<dyn Directory>,
    outbox_capacity: usize,
}

impl LocalRelay {
    pub fn new(outbox_capacity: usize) -> Self {
        Self::with_directory(Arc::new(InMemoryDirectory::new()), outbox_capacity)
    }

    pub fn with_directory(directory: Arc<dyn Directory>, outbox_capacity: usize) -> Self {
        Self {
            directory,
            outbox_capacity,
        }
    }

    pub fn directory(&self) -> Arc<dyn Directory> {
        Arc::clone(&self.directory)
    }

    /// Verbindet einen neuen Client (muss innerhalb einer Tokio-Runtime laufen)
    pub fn connect(&self) -> Arc<LocalLink> {
        let (tx, mut rx) = mpsc::channel::<ServerMessage>(self.outbox_capacity);
        let (event_tx, _) = broadcast::channel(self.outbox_capacity.max(1));

        let id = self.directory.register(tx.clone());

        // Outbox → Events
        let pump_events = event_tx.clone();
        let pump = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let _ = pump_events.send(SignalingEvent::from(msg));
            }
        });

        Arc::new(LocalLink {
            id,
            directory: Arc::clone(&self.directory),
            reply_tx: Mutex::new(Some(tx)),
            event_tx,
            pump: Mutex::new(Some(pump)),
        })
    }
}

/// Verbindung eines Clients zum [`LocalRelay`]
pub struct LocalLink {
    id: ConnectionId,
    directory: Arc<dyn Directory>,
    reply_tx: Mutex<Option<mpsc::Sender<ServerMessage>>>,
    event_tx: broadcast::Sender<SignalingEvent>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl LocalLink {
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn is_connected(&self) -> bool {
        self.reply_tx.lock().is_some()
    }

    /// Trennt die Verbindung wie ein geschlossener Socket
    pub fn disconnect(&self) {
        if self.reply_tx.lock().take().is_none() {
            return;
        }
        self.directory.unregister(&self.id);
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
        let _ = self.event_tx.send(SignalingEvent::Disconnected);
    }
}

impl SignalingTransport for LocalLink {
    fn local_id(&self) -> Option<ConnectionId> {
        if self.is_connected() {
            Some(self.id.clone())
        } else {
            None
        }
    }

    fn send(&self, msg: ClientMessage) -> Result<(), SignalingError> {
        let reply_tx = self
            .reply_tx
            .lock()
            .clone()
            .ok_or(SignalingError::NotConnected)?;

        if let Some(reply) = router::route(self.directory.as_ref(), &self.id, msg) {
            reply_tx
                .try_send(reply)
                .map_err(|e| SignalingError::SendFailed(e.to_string()))?;
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<SignalingEvent> {
        self.event_tx.subscribe()
    }
}

impl Drop for LocalLink {
    fn drop(&mut self) {
        self.disconnect();
    }
}

// ============================================================================
// TESTS
// ============================================================================
