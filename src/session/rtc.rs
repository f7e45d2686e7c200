//! WebRTC Negotiator
//!
//! Peer Connection über `webrtc`. Kein Trickle-ICE: die Kandidaten werden
//! vollständig gesammelt und stecken in der SDP, bevor sie gemeldet wird.

use super::media::{LocalStream, LocalTrack, MediaKind, RemoteStream};
use super::negotiator::{
    NegotiationError, NegotiationEvent, NegotiationEvents, Negotiator, NegotiatorFactory, Role,
};
use crate::signaling::SignalPayload;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

/// Sample Rate für Opus (48kHz)
const OPUS_CLOCK_RATE: u32 = 48000;

/// RTP Clock Rate für Video
const VIDEO_CLOCK_RATE: u32 = 90000;

/// Frame-Dauer Audio (20ms, wie beim Capture)
const AUDIO_FRAME: Duration = Duration::from_millis(20);

/// Frame-Dauer Video (~30fps)
const VIDEO_FRAME: Duration = Duration::from_millis(33);

/// Opus-Stilleframe (CELT, 20ms)
const OPUS_SILENCE: [u8; 3] = [0xF8, 0xFF, 0xFE];

/// Opus-Frame mit leisem Rauschen, Inhalt der virtuellen Geräte
const OPUS_NOISE: [u8; 12] = [
    0xFC, 0x83, 0x1E, 0x5A, 0xC4, 0x27, 0x9B, 0x61, 0x0D, 0xB8, 0x4F, 0x72,
];

/// VP8-Keyframe 16x16, schwarz
const VP8_BLACK: [u8; 20] = [
    0x50, 0x01, 0x00, 0x9D, 0x01, 0x2A, 0x10, 0x00, 0x10, 0x00, //
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

/// VP8-Keyframe 16x16, Testbild der virtuellen Kamera
const VP8_PATTERN: [u8; 20] = [
    0x50, 0x01, 0x00, 0x9D, 0x01, 0x2A, 0x10, 0x00, 0x10, 0x00, //
    0x02, 0x47, 0x08, 0x85, 0x85, 0x88, 0x85, 0x84, 0x88, 0x02,
];

fn webrtc_err(e: webrtc::Error) -> NegotiationError {
    NegotiationError::WebRTC(e.to_string())
}

// ============================================================================
// FACTORY
// ============================================================================

/// Baut Negotiators auf Basis von `RTCPeerConnection`
#[derive(Debug, Clone)]
pub struct RtcNegotiatorFactory {
    ice_servers: Vec<String>,
}

impl RtcNegotiatorFactory {
    pub fn new(ice_servers: Vec<String>) -> Self {
        Self { ice_servers }
    }

    fn rtc_ice_servers(&self) -> Vec<RTCIceServer> {
        if self.ice_servers.is_empty() {
            return Vec::new();
        }
        vec![RTCIceServer {
            urls: self.ice_servers.clone(),
            ..Default::default()
        }]
    }

    /// Erstellt eine neue Peer Connection
    async fn create_peer_connection(&self) -> Result<Arc<RTCPeerConnection>, NegotiationError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(webrtc_err)?;

        // Interceptors für RTCP, NACK etc.
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(webrtc_err)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: self.rtc_ice_servers(),
            ..Default::default()
        };

        let pc = api.new_peer_connection(config).await.map_err(webrtc_err)?;
        Ok(Arc::new(pc))
    }
}

#[async_trait]
impl NegotiatorFactory for RtcNegotiatorFactory {
    async fn create(
        &self,
        role: Role,
        local: LocalStream,
        events: NegotiationEvents,
    ) -> Result<Arc<dyn Negotiator>, NegotiationError> {
        let pc = self.create_peer_connection().await?;
        let mut outbound = Vec::new();

        for track in local.tracks() {
            let (mime_type, clock_rate, channels) = match track.kind() {
                MediaKind::Audio => (MIME_TYPE_OPUS, OPUS_CLOCK_RATE, 2),
                MediaKind::Video => (MIME_TYPE_VP8, VIDEO_CLOCK_RATE, 0),
            };
            let sample_track = Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: mime_type.to_string(),
                    clock_rate,
                    channels,
                    ..Default::default()
                },
                track.id().to_string(),
                local.id().to_string(),
            ));

            pc.add_track(Arc::clone(&sample_track) as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(webrtc_err)?;
            outbound.push((track.clone(), sample_track));
        }

        setup_handlers(&pc, &events);

        // Ohne RTP meldet die Gegenseite keinen Track
        let writers = outbound
            .into_iter()
            .map(|(track, sample_track)| spawn_sample_writer(track, sample_track))
            .collect();

        if role == Role::Initiator {
            let pc = Arc::clone(&pc);
            let events = events.clone();
            tokio::spawn(async move {
                let event = match describe_local(&pc, Role::Initiator).await {
                    Ok(offer) => NegotiationEvent::Signal(offer),
                    Err(e) => NegotiationEvent::Failed(e.to_string()),
                };
                let _ = events.send(event).await;
            });
        }

        Ok(Arc::new(RtcNegotiator {
            role,
            pc,
            events,
            writers: Mutex::new(writers),
            destroyed: Mutex::new(false),
        }))
    }
}

/// Registriert Event Handler für die Peer Connection
fn setup_handlers(pc: &Arc<RTCPeerConnection>, events: &NegotiationEvents) {
    let state_events = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
        tracing::info!("Peer connection state: {:?}", s);

        let event = match s {
            RTCPeerConnectionState::Connected => Some(NegotiationEvent::Connected),
            RTCPeerConnectionState::Failed => {
                Some(NegotiationEvent::Failed("peer connection failed".to_string()))
            }
            RTCPeerConnectionState::Closed => Some(NegotiationEvent::Closed),
            _ => None,
        };
        if let Some(event) = event {
            let _ = state_events.try_send(event);
        }

        Box::pin(async {})
    }));

    // Track Handler (eingehende Medien)
    let track_events = events.clone();
    pc.on_track(Box::new(move |track, _, _| {
        let track_events = track_events.clone();
        Box::pin(async move {
            let kind = match track.kind() {
                RTPCodecType::Audio => MediaKind::Audio,
                RTPCodecType::Video => MediaKind::Video,
                _ => return,
            };
            tracing::info!("Received remote {:?} track", kind);
            let stream = RemoteStream::new(track.stream_id(), kind);
            let _ = track_events.send(NegotiationEvent::Stream(stream)).await;

            // Eingehende Pakete abholen, sonst laufen die Puffer voll
            tokio::spawn(async move { while track.read_rtp().await.is_ok() {} });
        })
    }));
}

// ============================================================================
// SAMPLE WRITER
// ============================================================================

/// Nächstes Sample eines lokalen Tracks.
///
/// Ist der Track deaktiviert (stumm bzw. Kamera aus), wird Stille bzw. ein
/// Schwarzbild gesendet, damit die Verbindung bestehen bleibt.
fn next_sample(track: &LocalTrack) -> Sample {
    let (data, duration): (&'static [u8], Duration) = match (track.kind(), track.is_enabled()) {
        (MediaKind::Audio, true) => (&OPUS_NOISE, AUDIO_FRAME),
        (MediaKind::Audio, false) => (&OPUS_SILENCE, AUDIO_FRAME),
        (MediaKind::Video, true) => (&VP8_PATTERN, VIDEO_FRAME),
        (MediaKind::Video, false) => (&VP8_BLACK, VIDEO_FRAME),
    };
    Sample {
        data: data.into(),
        duration,
        timestamp: SystemTime::now(),
        ..Default::default()
    }
}

/// Schreibt im Frame-Takt Samples in den Track, bis der Task abgebrochen wird
fn spawn_sample_writer(
    track: LocalTrack,
    sample_track: Arc<TrackLocalStaticSample>,
) -> JoinHandle<()> {
    let period = match track.kind() {
        MediaKind::Audio => AUDIO_FRAME,
        MediaKind::Video => VIDEO_FRAME,
    };
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if let Err(e) = sample_track.write_sample(&next_sample(&track)).await {
                tracing::debug!("Failed to write {:?} sample: {}", track.kind(), e);
            }
        }
    })
}

/// Erzeugt Offer bzw. Answer und wartet, bis alle ICE-Kandidaten gesammelt sind
async fn describe_local(
    pc: &RTCPeerConnection,
    role: Role,
) -> Result<SignalPayload, NegotiationError> {
    let (description, kind) = match role {
        Role::Initiator => (pc.create_offer(None).await.map_err(webrtc_err)?, "offer"),
        Role::Responder => (pc.create_answer(None).await.map_err(webrtc_err)?, "answer"),
    };

    let mut gather_complete = pc.gathering_complete_promise().await;
    pc.set_local_description(description)
        .await
        .map_err(webrtc_err)?;
    let _ = gather_complete.recv().await;

    let local = pc
        .local_description()
        .await
        .ok_or_else(|| NegotiationError::WebRTC("no local description".to_string()))?;

    Ok(SignalPayload::session_description(kind, &local.sdp))
}

// ============================================================================
// NEGOTIATOR
// ============================================================================

pub struct RtcNegotiator {
    role: Role,
    pc: Arc<RTCPeerConnection>,
    events: NegotiationEvents,
    writers: Mutex<Vec<JoinHandle<()>>>,
    destroyed: Mutex<bool>,
}

#[async_trait]
impl Negotiator for RtcNegotiator {
    fn role(&self) -> Role {
        self.role
    }

    async fn signal(&self, payload: SignalPayload) -> Result<(), NegotiationError> {
        if *self.destroyed.lock() {
            return Err(NegotiationError::Destroyed);
        }

        let sdp = payload
            .sdp()
            .ok_or_else(|| NegotiationError::InvalidSignal("missing sdp".to_string()))?
            .to_string();

        match (self.role, payload.kind()) {
            (Role::Responder, Some("offer")) => {
                let offer = RTCSessionDescription::offer(sdp)
                    .map_err(|e| NegotiationError::InvalidSignal(e.to_string()))?;
                self.pc
                    .set_remote_description(offer)
                    .await
                    .map_err(webrtc_err)?;

                let answer = describe_local(&self.pc, Role::Responder).await?;
                let _ = self.events.send(NegotiationEvent::Signal(answer)).await;
                Ok(())
            }
            (Role::Initiator, Some("answer")) => {
                let answer = RTCSessionDescription::answer(sdp)
                    .map_err(|e| NegotiationError::InvalidSignal(e.to_string()))?;
                self.pc
                    .set_remote_description(answer)
                    .await
                    .map_err(webrtc_err)
            }
            (role, kind) => Err(NegotiationError::UnexpectedSignal {
                role,
                kind: kind.unwrap_or("untyped").to_string(),
            }),
        }
    }

    async fn destroy(&self) {
        {
            let mut destroyed = self.destroyed.lock();
            if *destroyed {
                return;
            }
            *destroyed = true;
        }
        for writer in self.writers.lock().drain(..) {
            writer.abort();
        }
        if let Err(e) = self.pc.close().await {
            tracing::warn!("Failed to close peer connection: {}", e);
        }
    }
}

impl std::fmt::Debug for RtcNegotiator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtcNegotiator")
            .field("role", &self.role)
            .field("destroyed", &*self.destroyed.lock())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::media::{MediaConstraints, MediaDevices, VirtualDevices};
    use std::time::Duration;
    use tokio::sync::mpsc;

    async fn next_signal(rx: &mut mpsc::Receiver<NegotiationEvent>) -> SignalPayload {
        tokio::time::timeout(Duration::from_secs(15), async {
            loop {
                match rx.recv().await {
                    Some(NegotiationEvent::Signal(payload)) => return payload,
                    Some(NegotiationEvent::Failed(reason)) => panic!("negotiation failed: {}", reason),
                    Some(_) => continue,
                    None => panic!("event channel closed"),
                }
            }
        })
        .await
        .expect("no signal in time")
    }

    async fn next_stream(rx: &mut mpsc::Receiver<NegotiationEvent>) -> RemoteStream {
        tokio::time::timeout(Duration::from_secs(15), async {
            loop {
                match rx.recv().await {
                    Some(NegotiationEvent::Stream(stream)) => return stream,
                    Some(NegotiationEvent::Failed(reason)) => panic!("negotiation failed: {}", reason),
                    Some(_) => continue,
                    None => panic!("event channel closed"),
                }
            }
        })
        .await
        .expect("no remote stream in time")
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_offer_answer_exchange() {
        let stream = VirtualDevices::new()
            .acquire(MediaConstraints::default())
            .unwrap();
        let factory = RtcNegotiatorFactory::new(Vec::new());

        let (caller_tx, mut caller_rx) = mpsc::channel(16);
        let caller = factory
            .create(Role::Initiator, stream.clone(), caller_tx)
            .await
            .unwrap();
        let offer = next_signal(&mut caller_rx).await;
        assert_eq!(offer.kind(), Some("offer"));
        let sdp = offer.sdp().unwrap();
        assert!(sdp.contains("m=audio"));
        assert!(sdp.contains("m=video"));

        let (callee_tx, mut callee_rx) = mpsc::channel(16);
        let callee = factory
            .create(Role::Responder, stream, callee_tx)
            .await
            .unwrap();
        callee.signal(offer).await.unwrap();
        let answer = next_signal(&mut callee_rx).await;
        assert_eq!(answer.kind(), Some("answer"));

        caller.signal(answer).await.unwrap();

        // Beide Seiten bekommen einen Remote-Stream
        let caller_stream = next_stream(&mut caller_rx).await;
        let callee_stream = next_stream(&mut callee_rx).await;
        assert!(!caller_stream.kinds.is_empty());
        assert!(!callee_stream.kinds.is_empty());

        caller.destroy().await;
        callee.destroy().await;
    }

    #[test]
    fn test_disabled_tracks_send_blank_frames() {
        let stream = VirtualDevices::new()
            .acquire(MediaConstraints::default())
            .unwrap();
        let audio = stream.tracks_of(MediaKind::Audio).next().unwrap().clone();
        let video = stream.tracks_of(MediaKind::Video).next().unwrap().clone();

        assert_eq!(&next_sample(&audio).data[..], &OPUS_NOISE[..]);
        assert_eq!(&next_sample(&video).data[..], &VP8_PATTERN[..]);

        stream.toggle(MediaKind::Audio);
        stream.toggle(MediaKind::Video);
        let muted = next_sample(&audio);
        assert_eq!(&muted.data[..], &OPUS_SILENCE[..]);
        assert_eq!(muted.duration, AUDIO_FRAME);
        assert_eq!(&next_sample(&video).data[..], &VP8_BLACK[..]);

        stream.toggle(MediaKind::Audio);
        assert_eq!(&next_sample(&audio).data[..], &OPUS_NOISE[..]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_rejects_wrong_signal_kind() {
        let stream = VirtualDevices::new()
            .acquire(MediaConstraints::default())
            .unwrap();
        let factory = RtcNegotiatorFactory::new(Vec::new());
        let (tx, _rx) = mpsc::channel(16);

        let callee = factory.create(Role::Responder, stream, tx).await.unwrap();
        let result = callee
            .signal(SignalPayload::session_description("answer", "v=0"))
            .await;
        assert_eq!(
            result,
            Err(NegotiationError::UnexpectedSignal {
                role: Role::Responder,
                kind: "answer".to_string()
            })
        );

        callee.destroy().await;
        let result = callee
            .signal(SignalPayload::session_description("offer", "v=0"))
            .await;
        assert_eq!(result, Err(NegotiationError::Destroyed));
    }
}
