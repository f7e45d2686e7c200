//! PeerCall - Zwei-Parteien-Videoanruf mit Signaling-Relay
//!
//! Bestandteile:
//! - Relay-Server, der Kennungen vergibt und Signaling weiterleitet
//! - WebSocket Client für das Relay
//! - Session Coordinator (Anrufzustand pro Client)
//! - WebRTC für die Medien zwischen den beiden Clients

pub mod config;
pub mod relay;
pub mod session;
pub mod signaling;

pub use config::{CallTimeouts, ClientConfig, ConfigError, RelayConfig};
pub use relay::{Directory, InMemoryDirectory, LocalRelay, RelayError, RelayServer};
pub use session::{CallEvent, CallPhase, CallState, CoordinatorError, Notice, SessionCoordinator};
pub use signaling::{ConnectionId, SignalingClient, SignalingEvent, SignalingTransport};

use tracing_subscriber::EnvFilter;

/// Standard-Filter, wenn `RUST_LOG` nicht gesetzt ist
const DEFAULT_LOG_FILTER: &str = "peercall=debug,webrtc=warn";

/// Initialisiert das Logging (mehrfacher Aufruf ist harmlos)
pub fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
