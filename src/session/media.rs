//! Lokale Medien (Kamera/Mikrofon)
//!
//! Ein [`LocalStream`] wird einmal pro Prozess angefordert und über die
//! ganze Lebensdauer gehalten. Stummschalten und Kamera-Aus setzen das
//! `enabled`-Flag der Tracks; die Sample-Writer des Negotiators senden dann
//! Stille bzw. Schwarzbild.

use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("Media access denied: {0}")]
    PermissionDenied(String),

    #[error("No {0} device found")]
    DeviceUnavailable(String),

    #[error("Nothing requested: neither audio nor video")]
    EmptyConstraints,
}

// ============================================================================
// TRACKS & STREAMS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Audio,
    Video,
}

/// Ausgehender Track mit gemeinsam genutztem `enabled`-Flag
#[derive(Debug, Clone)]
pub struct LocalTrack {
    id: String,
    kind: MediaKind,
    enabled: Arc<Mutex<bool>>,
}

impl LocalTrack {
    pub fn new(kind: MediaKind) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            enabled: Arc::new(Mutex::new(true)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn is_enabled(&self) -> bool {
        *self.enabled.lock()
    }
}

/// Lokaler Kamera-/Mikrofon-Stream
#[derive(Debug, Clone)]
pub struct LocalStream {
    id: String,
    tracks: Arc<Vec<LocalTrack>>,
}

impl LocalStream {
    pub fn new(tracks: Vec<LocalTrack>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            tracks: Arc::new(tracks),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[LocalTrack] {
        &self.tracks
    }

    pub fn tracks_of(&self, kind: MediaKind) -> impl Iterator<Item = &LocalTrack> {
        self.tracks.iter().filter(move |t| t.kind == kind)
    }

    pub fn has(&self, kind: MediaKind) -> bool {
        self.tracks_of(kind).next().is_some()
    }

    /// Kippt das `enabled`-Flag aller Tracks einer Art.
    ///
    /// Gibt den neuen Zustand zurück (`true` = aktiv).
    pub fn toggle(&self, kind: MediaKind) -> bool {
        let mut now_enabled = false;
        for track in self.tracks_of(kind) {
            let mut enabled = track.enabled.lock();
            *enabled = !*enabled;
            now_enabled |= *enabled;
        }
        now_enabled
    }

    /// Aktiv, wenn mindestens ein Track dieser Art aktiv ist
    pub fn is_enabled(&self, kind: MediaKind) -> bool {
        self.tracks_of(kind).any(|t| t.is_enabled())
    }
}

/// Eingehender Stream der Gegenseite
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteStream {
    pub id: String,
    pub kinds: Vec<MediaKind>,
}

impl RemoteStream {
    pub fn new(id: impl Into<String>, kind: MediaKind) -> Self {
        Self {
            id: id.into(),
            kinds: vec![kind],
        }
    }

    /// Übernimmt weitere Tracks desselben Streams
    pub fn merge(&mut self, other: &RemoteStream) {
        for kind in &other.kinds {
            if !self.kinds.contains(kind) {
                self.kinds.push(*kind);
            }
        }
    }

    pub fn has(&self, kind: MediaKind) -> bool {
        self.kinds.contains(&kind)
    }
}

// ============================================================================
// DEVICES
// ============================================================================

/// Welche Medien angefordert werden
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

/// Zugriff auf Aufnahmegeräte
pub trait MediaDevices: Send + Sync {
    fn acquire(&self, constraints: MediaConstraints) -> Result<LocalStream, MediaError>;
}

fn tracks_for(constraints: MediaConstraints) -> Result<Vec<LocalTrack>, MediaError> {
    let mut tracks = Vec::new();
    if constraints.audio {
        tracks.push(LocalTrack::new(MediaKind::Audio));
    }
    if constraints.video {
        tracks.push(LocalTrack::new(MediaKind::Video));
    }
    if tracks.is_empty() {
        return Err(MediaError::EmptyConstraints);
    }
    Ok(tracks)
}

/// Geräte ohne Hardware (Headless-Betrieb)
#[derive(Debug, Clone, Default)]
pub struct VirtualDevices {
    denied: Option<String>,
}

impl VirtualDevices {
    pub fn new() -> Self {
        Self::default()
    }

    /// Geräte, die jeden Zugriff verweigern
    pub fn denied(reason: impl Into<String>) -> Self {
        Self {
            denied: Some(reason.into()),
        }
    }
}

impl MediaDevices for VirtualDevices {
    fn acquire(&self, constraints: MediaConstraints) -> Result<LocalStream, MediaError> {
        if let Some(reason) = &self.denied {
            return Err(MediaError::PermissionDenied(reason.clone()));
        }
        Ok(LocalStream::new(tracks_for(constraints)?))
    }
}

/// Prüft über cpal, ob ein Mikrofon vorhanden ist
#[cfg(feature = "system-audio")]
#[derive(Debug, Clone, Default)]
pub struct SystemDevices;

#[cfg(feature = "system-audio")]
impl MediaDevices for SystemDevices {
    fn acquire(&self, constraints: MediaConstraints) -> Result<LocalStream, MediaError> {
        use cpal::traits::{DeviceTrait, HostTrait};

        if constraints.audio {
            let host = cpal::default_host();
            let device = host
                .default_input_device()
                .ok_or_else(|| MediaError::DeviceUnavailable("audio input".to_string()))?;
            tracing::info!(
                "Using input device: {}",
                device.name().unwrap_or_else(|_| "<unnamed>".to_string())
            );
        }
        Ok(LocalStream::new(tracks_for(constraints)?))
    }
}

// ============================================================================
// TESTS
// ============================================================================
