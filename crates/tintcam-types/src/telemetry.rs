use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::events::SystemEvent;

/// Counters the render loop keeps about itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderStats {
    pub fps: u32,
    pub ticks: u64,
    pub not_ready_ticks: u64,
    pub segment_requests: u64,
    pub fresh_masks: u64,
    pub reused_masks: u64,
    pub skipped_composites: u64,
    pub composites: u64,
    pub late_masks: u64,
}

/// Summary of one finished (or failed) recording session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingSummary {
    pub mime_type: Option<String>,
    pub bytes: u64,
    pub duration_ms: u64,
    pub path: Option<String>,
    pub error: Option<String>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionTelemetry {
    pub started_at: Option<DateTime<Utc>>,
    pub events: Vec<SystemEvent>,
    pub fps_samples: Vec<u32>,
    pub recordings: Vec<RecordingSummary>,
    pub notes: Vec<String>,
}
