//! Relay Module - Vermittlung von Signaling-Nachrichten
//!
//! Das Relay vergibt Kennungen und leitet Nachrichten zwischen zwei
//! Clients weiter. Medien laufen nie über das Relay.
//!

mod directory;
mod local;
mod router;
mod server;

pub use directory::{Directory, IdSource, InMemoryDirectory, Outbox, RelayError};
pub use local::{LocalLink, LocalRelay};
pub use router::route;
pub use server::RelayServer;
