//! Weiterleitung von Client-Nachrichten über das Directory

use super::directory::{Directory, RelayError};
use crate::signaling::{ClientMessage, ConnectionId, ServerMessage};

/// Leitet eine Nachricht von `sender` weiter.
///
/// Gibt eine Antwort für den Absender zurück, falls es eine gibt
/// (nur `peerUnreachable` bei nicht zustellbaren Anrufen).
pub fn route(
    directory: &dyn Directory,
    sender: &ConnectionId,
    msg: ClientMessage,
) -> Option<ServerMessage> {
    match msg {
        ClientMessage::CallUser {
            user_to_call,
            signal_data,
            from,
            name,
        } => {
            if from != *sender {
                tracing::debug!("Replacing claimed sender {} with {}", from, sender);
            }

            let delivered = directory.forward(
                &user_to_call,
                ServerMessage::CallUser {
                    signal: signal_data,
                    from: sender.clone(),
                    name,
                },
            );

            match delivered {
                Ok(()) => {
                    tracing::info!("Invite {} -> {}", sender, user_to_call);
                    None
                }
                Err(e) => {
                    tracing::info!("Invite {} -> {} not delivered: {}", sender, user_to_call, e);
                    Some(ServerMessage::PeerUnreachable { user_to_call })
                }
            }
        }

        ClientMessage::AnswerCall { signal, to } => {
            log_dropped(sender, "answer", directory.forward(&to, ServerMessage::CallAccepted(signal)));
            None
        }

        ClientMessage::EndCall { to } => {
            log_dropped(sender, "end", directory.forward(&to, ServerMessage::CallEnded));
            None
        }
    }
}

fn log_dropped(sender: &ConnectionId, what: &str, result: Result<(), RelayError>) {
    if let Err(e) = result {
        tracing::debug!("Dropping {} from {}: {}", what, sender, e);
    }
}

// ============================================================================
// TESTS
// ============================================================================
