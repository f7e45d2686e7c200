//! Session Module - Anrufzustand und Medien-Aushandlung
//!
//! Dieses Modul verwaltet einen Anruf aus Sicht eines Clients:
//! - Zustandsautomat (Idle, Ringing, Accepted, Connected, Ended)
//! - Lokale Medien (Stummschalten, Kamera aus)
//! - Aushandlung über einen austauschbaren Negotiator (WebRTC)
//!

mod coordinator;
mod media;
mod negotiator;
mod rtc;
mod state;

pub use coordinator::{CoordinatorError, SessionCoordinator};
#[cfg(feature = "system-audio")]
pub use media::SystemDevices;
pub use media::{
    LocalStream, LocalTrack, MediaConstraints, MediaDevices, MediaError, MediaKind, RemoteStream,
    VirtualDevices,
};
pub use negotiator::{
    NegotiationError, NegotiationEvent, NegotiationEvents, Negotiator, NegotiatorFactory, Role,
};
pub use rtc::{RtcNegotiator, RtcNegotiatorFactory};
pub use state::{CallEvent, CallPhase, CallState, Direction, Notice};
