//! Relay-Server über echte WebSocket-Verbindungen

mod common;

use common::{eventually, LoopbackFactory};
use futures::{SinkExt, StreamExt};
use peercall::config::{CallTimeouts, RelayConfig};
use peercall::relay::{Directory, RelayServer};
use peercall::session::{
    CallPhase, CoordinatorError, NegotiatorFactory, Notice, SessionCoordinator, VirtualDevices,
};
use peercall::signaling::{
    ConnectionId, ServerMessage, SignalPayload, SignalingClient, SignalingError, SignalingEvent,
    SignalingTransport, ERROR_MALFORMED_MESSAGE,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

struct TestRelay {
    url: Url,
    directory: Arc<dyn Directory>,
    _shutdown: oneshot::Sender<()>,
}

async fn start_relay() -> TestRelay {
    let config = RelayConfig {
        bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        outbox_capacity: 16,
    };
    let server = RelayServer::bind(&config).await.unwrap();
    let addr = server.local_addr().unwrap();
    let directory = server.directory();

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    tokio::spawn(server.run_until(async {
        let _ = shutdown_rx.await;
    }));

    TestRelay {
        url: Url::parse(&format!("ws://{}", addr)).unwrap(),
        directory,
        _shutdown: shutdown_tx,
    }
}

async fn connected_client(relay: &TestRelay) -> (Arc<SignalingClient>, ConnectionId) {
    let client = Arc::new(SignalingClient::new(
        relay.url.clone(),
        Duration::from_secs(2),
    ));
    let id = client.connect().await.unwrap();
    (client, id)
}

async fn expect_event(
    events: &mut broadcast::Receiver<SignalingEvent>,
    matches: impl Fn(&SignalingEvent) -> bool,
) -> SignalingEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.unwrap();
            if matches(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event did not arrive")
}

#[tokio::test]
async fn test_clients_get_distinct_ids() {
    let relay = start_relay().await;
    let (a, a_id) = connected_client(&relay).await;
    let (_b, b_id) = connected_client(&relay).await;

    assert_ne!(a_id, b_id);
    assert_eq!(a.local_id(), Some(a_id));
    assert!(a.is_connected());
    eventually("two connections", || relay.directory.len() == 2).await;
}

#[tokio::test]
async fn test_invite_answer_end_roundtrip() {
    let relay = start_relay().await;
    let (a, a_id) = connected_client(&relay).await;
    let (b, b_id) = connected_client(&relay).await;
    let mut a_events = a.subscribe();
    let mut b_events = b.subscribe();

    let offer = SignalPayload::session_description("offer", "v=0 offer");
    b.call_user(a_id.clone(), offer.clone(), "Bob".to_string())
        .unwrap();

    let event = expect_event(&mut a_events, |e| {
        matches!(e, SignalingEvent::IncomingCall { .. })
    })
    .await;
    assert_eq!(
        event,
        SignalingEvent::IncomingCall {
            from: b_id.clone(),
            name: "Bob".to_string(),
            signal: offer,
        }
    );

    let answer = SignalPayload::session_description("answer", "v=0 answer");
    a.answer_call(b_id.clone(), answer.clone()).unwrap();
    let event = expect_event(&mut b_events, |e| {
        matches!(e, SignalingEvent::CallAccepted { .. })
    })
    .await;
    assert_eq!(event, SignalingEvent::CallAccepted { signal: answer });

    a.end_call(b_id).unwrap();
    expect_event(&mut b_events, |e| *e == SignalingEvent::CallEnded).await;
}

#[tokio::test]
async fn test_invite_to_unknown_id_is_reported() {
    let relay = start_relay().await;
    let (b, _) = connected_client(&relay).await;
    let mut events = b.subscribe();

    b.call_user(
        "nobody".into(),
        SignalPayload::session_description("offer", "v=0"),
        "Bob".to_string(),
    )
    .unwrap();

    let event = expect_event(&mut events, |e| {
        matches!(e, SignalingEvent::PeerUnreachable { .. })
    })
    .await;
    assert_eq!(
        event,
        SignalingEvent::PeerUnreachable {
            target: "nobody".into()
        }
    );
}

async fn next_message<S>(socket: &mut S) -> ServerMessage
where
    S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match socket.next().await {
                Some(Ok(Message::Text(text))) => {
                    return serde_json::from_str::<ServerMessage>(&text).unwrap();
                }
                Some(Ok(_)) => continue,
                other => panic!("socket closed: {:?}", other),
            }
        }
    })
    .await
    .expect("no message from relay")
}

#[tokio::test]
async fn test_malformed_frame_gets_error_reply() {
    let relay = start_relay().await;
    let (mut socket, _) = connect_async(relay.url.as_str()).await.unwrap();

    assert!(matches!(next_message(&mut socket).await, ServerMessage::Me(_)));

    socket
        .send(Message::Text("{\"event\":\"dance\"}".to_string()))
        .await
        .unwrap();

    match next_message(&mut socket).await {
        ServerMessage::Error { code, .. } => assert_eq!(code, ERROR_MALFORMED_MESSAGE),
        other => panic!("expected error, got {:?}", other),
    }

    // Verbindung bleibt offen
    assert_eq!(relay.directory.len(), 1);
}

#[tokio::test]
async fn test_disconnect_unregisters() {
    let relay = start_relay().await;
    let (a, a_id) = connected_client(&relay).await;
    let mut events = a.subscribe();
    eventually("registered", || relay.directory.contains(&a_id)).await;

    a.disconnect();

    eventually("unregistered", || !relay.directory.contains(&a_id)).await;
    expect_event(&mut events, |e| *e == SignalingEvent::Disconnected).await;
    assert!(!a.is_connected());
}

#[tokio::test]
async fn test_coordinators_over_websocket() {
    let relay = start_relay().await;
    let factory = LoopbackFactory::new();

    let (a_client, a_id) = connected_client(&relay).await;
    let (b_client, _) = connected_client(&relay).await;

    let a = SessionCoordinator::new(
        a_client as Arc<dyn SignalingTransport>,
        Arc::clone(&factory) as Arc<dyn NegotiatorFactory>,
        &VirtualDevices::new(),
        CallTimeouts::default(),
    );
    let b = SessionCoordinator::new(
        b_client as Arc<dyn SignalingTransport>,
        Arc::clone(&factory) as Arc<dyn NegotiatorFactory>,
        &VirtualDevices::new(),
        CallTimeouts::default(),
    );
    a.spawn_event_loop();
    b.spawn_event_loop();
    let mut b_events = b.subscribe();

    b.place_call(a_id, "Bob").await.unwrap();
    eventually("invite at A", || a.state().receiving_invite).await;
    assert_eq!(a.state().peer_display_name.as_deref(), Some("Bob"));

    a.accept_call().await.unwrap();
    eventually("both connected", || {
        a.state().phase == CallPhase::Connected && b.state().phase == CallPhase::Connected
    })
    .await;
    assert!(a.remote_stream().is_some());
    assert!(b.remote_stream().is_some());

    a.end_call().await.unwrap();
    eventually("both idle", || {
        a.state().phase.is_idle() && b.state().phase.is_idle()
    })
    .await;
    eventually("negotiators released", || factory.live() == 0).await;

    let mut remote_ended = 0;
    while let Ok(event) = b_events.try_recv() {
        if event == peercall::session::CallEvent::Notice(Notice::RemoteEnded) {
            remote_ended += 1;
        }
    }
    assert_eq!(remote_ended, 1);
}

#[tokio::test]
async fn test_relay_closing_socket_clears_registration() {
    // Relay, das nur die Kennung schickt und dann auflegt
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut socket = tokio_tungstenite::accept_async(stream).await.unwrap();
        let me = serde_json::to_string(&ServerMessage::Me("A1".into())).unwrap();
        socket.send(Message::Text(me)).await.unwrap();
        let _ = socket.close(None).await;
    });

    let url = Url::parse(&format!("ws://{}", addr)).unwrap();
    let client = Arc::new(SignalingClient::new(url, Duration::from_secs(2)));
    let mut events = client.subscribe();
    assert_eq!(client.connect().await.unwrap(), ConnectionId::from("A1"));

    expect_event(&mut events, |e| *e == SignalingEvent::Disconnected).await;
    assert!(!client.is_connected());
    assert_eq!(client.local_id(), None);
    assert!(matches!(
        client.end_call("B1".into()),
        Err(SignalingError::NotConnected)
    ));

    let coordinator = SessionCoordinator::new(
        client as Arc<dyn SignalingTransport>,
        LoopbackFactory::new(),
        &VirtualDevices::new(),
        CallTimeouts::default(),
    );
    assert!(matches!(
        coordinator.place_call("B1".into(), "Bob").await,
        Err(CoordinatorError::NotRegistered)
    ));
    assert!(coordinator.state().phase.is_idle());
}

#[tokio::test]
async fn test_shutdown_closes_open_connections() {
    let relay = start_relay().await;
    let (a, _) = connected_client(&relay).await;
    let (b, _) = connected_client(&relay).await;
    let mut a_events = a.subscribe();
    let mut b_events = b.subscribe();
    eventually("two connections", || relay.directory.len() == 2).await;

    let directory = Arc::clone(&relay.directory);
    drop(relay);

    expect_event(&mut a_events, |e| *e == SignalingEvent::Disconnected).await;
    expect_event(&mut b_events, |e| *e == SignalingEvent::Disconnected).await;
    assert!(!a.is_connected());
    assert_eq!(b.local_id(), None);
    eventually("directory empty", || directory.is_empty()).await;
}
