//! Signaling Module - Relay-Protokoll und WebSocket Client
//!
//! Dieses Modul verwaltet die Kommunikation mit dem Relay:
//! - Nachrichtenformat (`me`, `callUser`, `answerCall`, ...)
//! - WebSocket-Verbindung aufbauen und halten
//! - Eingehende Nachrichten parsen und als Events weiterleiten
//!

mod client;
mod messages;
mod transport;

pub use client::SignalingClient;
pub use messages::*;
pub use transport::{SignalingError, SignalingEvent, SignalingTransport};
