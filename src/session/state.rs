//! Zustand eines Anrufs
//!
//! `CallState` ist ein Schnappschuss für die Oberfläche. Verändert wird er
//! ausschließlich vom [`SessionCoordinator`](super::SessionCoordinator).

use super::media::RemoteStream;
use crate::signaling::{ConnectionId, SignalPayload};

/// Richtung des Klingelns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outgoing,
    Incoming,
}

/// Phase eines Anrufs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallPhase {
    #[default]
    Idle,
    Ringing(Direction),
    /// Angenommen, Medien fließen noch nicht
    Accepted,
    /// Medien fließen
    Connected,
    /// Kurzlebig: wird veröffentlicht, danach folgt `Idle`
    Ended,
}

impl CallPhase {
    pub fn is_idle(&self) -> bool {
        matches!(self, CallPhase::Idle)
    }

    /// Alles außer `Idle` und `Ended`
    pub fn is_active(&self) -> bool {
        !matches!(self, CallPhase::Idle | CallPhase::Ended)
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct CallState {
    pub phase: CallPhase,
    pub receiving_invite: bool,
    pub peer_connection_id: Option<ConnectionId>,
    pub peer_display_name: Option<String>,
    pub pending_invite_offer: Option<SignalPayload>,
    /// Beim ausgehenden Anruf gewähltes Ziel
    pub dialed_target: Option<ConnectionId>,
    pub accepted: bool,
    pub connected: bool,
    pub ended: bool,
    pub muted: bool,
    pub video_off: bool,
    /// Einmalige Warnung, falls keine lokalen Medien verfügbar sind
    pub media_warning: Option<String>,
}

impl CallState {
    /// Gegenseite für `endCall`: Anrufer bzw. Angerufener, sonst das gewählte Ziel
    pub fn end_target(&self) -> Option<&ConnectionId> {
        self.peer_connection_id
            .as_ref()
            .or(self.dialed_target.as_ref())
    }

    /// Zustand nach `reset()`: Anrufdaten weg, Medien-Flags bleiben
    pub(crate) fn cleared(&self) -> CallState {
        CallState {
            muted: self.muted,
            video_off: self.video_off,
            media_warning: self.media_warning.clone(),
            ..CallState::default()
        }
    }
}

/// Hinweise an den Benutzer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// Gegenseite hat aufgelegt
    RemoteEnded,
    /// Angerufener ist nicht mit dem Relay verbunden
    PeerUnreachable(ConnectionId),
    /// Ausgehender Anruf wurde nicht angenommen
    InviteTimedOut,
    /// Eingehender Anruf wurde nicht angenommen
    InviteExpired,
    /// Medien kamen nach der Annahme nicht zustande
    NegotiationTimedOut,
    NegotiationFailed(String),
    /// Verbindung zum Relay verloren
    RelayLost,
    /// Eingehender Anruf abgewiesen, weil besetzt
    BusyRejected { from: ConnectionId, name: String },
}

/// Events des Session Coordinators
#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    StateChanged(CallState),
    RemoteStreamAttached(RemoteStream),
    Notice(Notice),
}

// ============================================================================
// TESTS
// ============================================================================
