//! Gemeinsame Helfer für die Integrationstests

#![allow(dead_code)]

use async_trait::async_trait;
use peercall::session::{
    LocalStream, MediaKind, NegotiationError, NegotiationEvent, NegotiationEvents, Negotiator,
    NegotiatorFactory, RemoteStream, Role,
};
use peercall::signaling::SignalPayload;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

// ============================================================================
// LOOPBACK NEGOTIATOR
// ============================================================================

/// Zählt lebende Negotiators
#[derive(Default)]
struct Counters {
    created: AtomicUsize,
    live: AtomicUsize,
}

struct LoopbackNegotiator {
    role: Role,
    events: NegotiationEvents,
    connects: bool,
    counters: Arc<Counters>,
    destroyed: AtomicBool,
}

impl LoopbackNegotiator {
    async fn attach_remote(&self) {
        let stream_id = format!("remote-of-{:?}", self.role);
        for kind in [MediaKind::Audio, MediaKind::Video] {
            let _ = self
                .events
                .send(NegotiationEvent::Stream(RemoteStream::new(stream_id.clone(), kind)))
                .await;
        }
        if self.connects {
            let _ = self.events.send(NegotiationEvent::Connected).await;
        }
    }
}

#[async_trait]
impl Negotiator for LoopbackNegotiator {
    fn role(&self) -> Role {
        self.role
    }

    async fn signal(&self, payload: SignalPayload) -> Result<(), NegotiationError> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(NegotiationError::Destroyed);
        }
        match (self.role, payload.kind()) {
            (Role::Responder, Some("offer")) => {
                let answer = SignalPayload::session_description("answer", "loopback-answer");
                let _ = self.events.send(NegotiationEvent::Signal(answer)).await;
                self.attach_remote().await;
                Ok(())
            }
            (Role::Initiator, Some("answer")) => {
                self.attach_remote().await;
                Ok(())
            }
            (role, kind) => Err(NegotiationError::UnexpectedSignal {
                role,
                kind: kind.unwrap_or("untyped").to_string(),
            }),
        }
    }

    async fn destroy(&self) {
        if !self.destroyed.swap(true, Ordering::SeqCst) {
            self.counters.live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

pub struct LoopbackFactory {
    connects: bool,
    counters: Arc<Counters>,
}

impl LoopbackFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            connects: true,
            counters: Arc::new(Counters::default()),
        })
    }

    /// Medien kommen nie zustande
    pub fn stalling() -> Arc<Self> {
        Arc::new(Self {
            connects: false,
            counters: Arc::new(Counters::default()),
        })
    }

    pub fn live(&self) -> usize {
        self.counters.live.load(Ordering::SeqCst)
    }

    pub fn created(&self) -> usize {
        self.counters.created.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NegotiatorFactory for LoopbackFactory {
    async fn create(
        &self,
        role: Role,
        _local: LocalStream,
        events: NegotiationEvents,
    ) -> Result<Arc<dyn Negotiator>, NegotiationError> {
        self.counters.created.fetch_add(1, Ordering::SeqCst);
        self.counters.live.fetch_add(1, Ordering::SeqCst);

        if role == Role::Initiator {
            let offer = SignalPayload::session_description("offer", "loopback-offer");
            let _ = events.send(NegotiationEvent::Signal(offer)).await;
        }

        Ok(Arc::new(LoopbackNegotiator {
            role,
            events,
            connects: self.connects,
            counters: Arc::clone(&self.counters),
            destroyed: AtomicBool::new(false),
        }))
    }
}

// ============================================================================
// HELPERS
// ============================================================================

/// Pollt, bis `condition` gilt (höchstens 5s)
pub async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        if Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
