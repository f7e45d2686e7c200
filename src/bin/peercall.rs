//! Headless Client
//!
//! Liest Befehle zeilenweise von stdin:
//!
//! ```text
//! call <id> [name]   Anruf starten
//! accept             Eingehenden Anruf annehmen
//! end                Auflegen
//! mute               Mikrofon an/aus
//! video              Kamera an/aus
//! state              Aktuellen Zustand ausgeben
//! quit               Beenden
//! ```

use anyhow::Context;
use peercall::session::{MediaDevices, RtcNegotiatorFactory};
use peercall::{CallEvent, ClientConfig, ConnectionId, Notice, SessionCoordinator, SignalingClient};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    peercall::init_tracing();

    let config = ClientConfig::from_env().context("invalid client configuration")?;

    let client = Arc::new(SignalingClient::new(
        config.signaling_url.clone(),
        config.register_timeout,
    ));
    let factory = Arc::new(RtcNegotiatorFactory::new(config.ice_servers.clone()));
    let devices = media_devices();

    let coordinator = SessionCoordinator::new(
        Arc::clone(&client) as Arc<dyn peercall::SignalingTransport>,
        factory,
        devices.as_ref(),
        config.timeouts,
    );
    if let Some(warning) = coordinator.state().media_warning {
        println!("warning: no camera/microphone ({}), calls are disabled", warning);
    }

    // Event-Loop vor dem Verbinden, damit `me` nicht verloren geht
    let event_loop = coordinator.spawn_event_loop();
    let printer = spawn_printer(&coordinator);

    let id = client.connect().await.context("failed to register with relay")?;
    println!("your id: {}", id);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let mut parts = line.split_whitespace();
        let Some(command) = parts.next() else {
            continue;
        };

        let result = match command {
            "call" => match parts.next() {
                Some(target) => {
                    let name = parts.next().unwrap_or(config.display_name.as_str()).to_string();
                    coordinator
                        .place_call(ConnectionId::from(target), name)
                        .await
                }
                None => {
                    println!("usage: call <id> [name]");
                    Ok(())
                }
            },
            "accept" => coordinator.accept_call().await,
            "end" => coordinator.end_call().await,
            "mute" => coordinator
                .toggle_mute()
                .map(|muted| println!("muted: {}", muted)),
            "video" => coordinator
                .toggle_video()
                .map(|off| println!("video off: {}", off)),
            "state" => {
                println!("{:#?}", coordinator.state());
                Ok(())
            }
            "quit" => break,
            other => {
                println!("unknown command: {}", other);
                Ok(())
            }
        };

        if let Err(e) = result {
            println!("error: {}", e);
        }
    }

    if coordinator.state().phase.is_active() {
        let _ = coordinator.end_call().await;
    }
    client.disconnect();
    event_loop.abort();
    printer.abort();
    Ok(())
}

#[cfg(feature = "system-audio")]
fn media_devices() -> Box<dyn MediaDevices> {
    Box::new(peercall::session::SystemDevices)
}

#[cfg(not(feature = "system-audio"))]
fn media_devices() -> Box<dyn MediaDevices> {
    Box::new(peercall::session::VirtualDevices::new())
}

/// Gibt Zustandswechsel und Hinweise aus
fn spawn_printer(coordinator: &SessionCoordinator) -> tokio::task::JoinHandle<()> {
    let mut events = coordinator.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(CallEvent::StateChanged(state)) => {
                    if state.receiving_invite {
                        println!(
                            "{} is calling ({}), type `accept` or `end`",
                            state.peer_display_name.as_deref().unwrap_or("unknown"),
                            state
                                .peer_connection_id
                                .as_ref()
                                .map(|id| id.as_str())
                                .unwrap_or("?")
                        );
                    } else {
                        println!("call: {:?}", state.phase);
                    }
                }
                Ok(CallEvent::RemoteStreamAttached(stream)) => {
                    println!("remote stream: {:?}", stream.kinds);
                }
                Ok(CallEvent::Notice(notice)) => println!("{}", describe(&notice)),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn describe(notice: &Notice) -> String {
    match notice {
        Notice::RemoteEnded => "the other side ended the call".to_string(),
        Notice::PeerUnreachable(id) => format!("{} is not connected", id),
        Notice::InviteTimedOut => "nobody answered".to_string(),
        Notice::InviteExpired => "missed call".to_string(),
        Notice::NegotiationTimedOut => "media did not connect in time".to_string(),
        Notice::NegotiationFailed(reason) => format!("connection failed: {}", reason),
        Notice::RelayLost => "lost connection to the relay".to_string(),
        Notice::BusyRejected { name, from } => {
            format!("declined call from {} ({}) while busy", name, from)
        }
    }
}
