//! Schnittstelle zur Medien-Aushandlung
//!
//! Ein Negotiator entspricht einer Peer Connection in einer Rolle
//! (Initiator oder Responder). Er meldet sich über [`NegotiationEvent`]s
//! zurück: fertige Verbindungsbeschreibung, eingehender Stream, Verbindungszustand.

use super::media::{LocalStream, RemoteStream};
use crate::signaling::SignalPayload;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("WebRTC error: {0}")]
    WebRTC(String),

    #[error("Invalid signal payload: {0}")]
    InvalidSignal(String),

    #[error("Unexpected {kind} signal for {role:?}")]
    UnexpectedSignal { role: Role, kind: String },

    #[error("Negotiator already destroyed")]
    Destroyed,
}

// ============================================================================
// TYPES
// ============================================================================

/// Rolle in der Aushandlung
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Erzeugt das Offer
    Initiator,
    /// Erzeugt die Answer
    Responder,
}

/// Rückmeldungen eines Negotiators
#[derive(Debug, Clone, PartialEq)]
pub enum NegotiationEvent {
    /// Verbindungsbeschreibung fertig, muss zur Gegenseite
    Signal(SignalPayload),
    /// Eingehender Stream der Gegenseite
    Stream(RemoteStream),
    /// Medien fließen
    Connected,
    /// Verbindung gescheitert
    Failed(String),
    /// Verbindung geschlossen
    Closed,
}

/// Sender für Negotiator-Events
pub type NegotiationEvents = mpsc::Sender<NegotiationEvent>;

// ============================================================================
// TRAITS
// ============================================================================

/// Laufende Aushandlung
#[async_trait]
pub trait Negotiator: Send + Sync {
    fn role(&self) -> Role;

    /// Übergibt die Verbindungsbeschreibung der Gegenseite
    async fn signal(&self, payload: SignalPayload) -> Result<(), NegotiationError>;

    /// Gibt alle Ressourcen frei, danach kommen keine Events mehr
    async fn destroy(&self);
}

/// Erzeugt Negotiators
#[async_trait]
pub trait NegotiatorFactory: Send + Sync {
    /// Baut einen Negotiator mit dem lokalen Stream.
    ///
    /// Ein Initiator beginnt sofort mit dem Offer und meldet es als
    /// [`NegotiationEvent::Signal`].
    async fn create(
        &self,
        role: Role,
        local: LocalStream,
        events: NegotiationEvents,
    ) -> Result<Arc<dyn Negotiator>, NegotiationError>;
}
