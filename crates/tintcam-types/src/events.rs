use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// High-level event kinds carried by the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    Lifecycle,
    Fps,
    Recording,
    Clip,
}

/// Immutable event envelope for observers, logging, and telemetry export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemEvent {
    pub id: Uuid,
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventPayload {
    Lifecycle(LifecycleEvent),
    Fps(FpsEvent),
    Recording(RecordingEvent),
    ClipSaved(ClipSavedEvent),
    RecordingFailed(RecordingFailedEvent),
    Unknown(serde_json::Value),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub phase: LifecyclePhase,
    pub details: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum LifecyclePhase {
    ModelLoaded,
    RenderStarted,
    RenderStopped,
    ModelDisposed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct FpsEvent {
    pub fps: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecordingEvent {
    pub state: String,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClipSavedEvent {
    pub path: String,
    pub bytes: u64,
    pub mime_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecordingFailedEvent {
    pub detail: String,
}

impl SystemEvent {
    pub fn new(kind: EventKind, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn lifecycle(phase: LifecyclePhase, details: Option<String>) -> Self {
        Self::new(
            EventKind::Lifecycle,
            EventPayload::Lifecycle(LifecycleEvent { phase, details }),
        )
    }

    pub fn fps(fps: u32) -> Self {
        Self::new(EventKind::Fps, EventPayload::Fps(FpsEvent { fps }))
    }

    pub fn recording(state: impl Into<String>, elapsed_ms: u64) -> Self {
        Self::new(
            EventKind::Recording,
            EventPayload::Recording(RecordingEvent {
                state: state.into(),
                elapsed_ms,
            }),
        )
    }

    pub fn clip_saved(path: impl Into<String>, bytes: u64, mime_type: impl Into<String>) -> Self {
        Self::new(
            EventKind::Clip,
            EventPayload::ClipSaved(ClipSavedEvent {
                path: path.into(),
                bytes,
                mime_type: mime_type.into(),
            }),
        )
    }

    pub fn recording_failed(detail: impl Into<String>) -> Self {
        Self::new(
            EventKind::Clip,
            EventPayload::RecordingFailed(RecordingFailedEvent {
                detail: detail.into(),
            }),
        )
    }
}
