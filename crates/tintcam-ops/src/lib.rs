//! Operational helpers: logging and session telemetry.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::Utc;
use tintcam_types::{
    config::OpsConfig,
    events::{EventPayload, SystemEvent},
    telemetry::{RecordingSummary, SessionTelemetry},
    Result, TintcamError,
};
use tokio::sync::Mutex;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

/// Keeps at most this many FPS readings; older ones are dropped first.
const MAX_FPS_SAMPLES: usize = 3_600;

pub fn init_tracing(config: &OpsConfig) -> Result<()> {
    let filter = EnvFilter::try_new(config.log_level.clone())
        .or_else(|_| EnvFilter::try_new("info"))
        .map_err(|err| ops_error(format!("failed to create log filter: {err}")))?;

    fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|err| ops_error(format!("tracing init error: {err}")))?;
    Ok(())
}

/// In-memory record of one filtering session.
#[derive(Clone)]
pub struct TelemetryStore {
    session: Arc<Mutex<SessionTelemetry>>,
}

impl Default for TelemetryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetryStore {
    pub fn new() -> Self {
        let session = SessionTelemetry {
            started_at: Some(Utc::now()),
            ..SessionTelemetry::default()
        };
        Self {
            session: Arc::new(Mutex::new(session)),
        }
    }

    /// FPS events are folded into the sample series; everything else is kept verbatim.
    pub async fn record_event(&self, event: SystemEvent) -> Result<()> {
        let mut session = self.session.lock().await;
        match event.payload {
            EventPayload::Fps(fps) => {
                if session.fps_samples.len() == MAX_FPS_SAMPLES {
                    session.fps_samples.remove(0);
                }
                session.fps_samples.push(fps.fps);
            }
            _ => session.events.push(event),
        }
        Ok(())
    }

    pub async fn record_recording(&self, summary: RecordingSummary) -> Result<()> {
        self.session.lock().await.recordings.push(summary);
        Ok(())
    }

    pub async fn add_note(&self, note: impl Into<String>) {
        self.session.lock().await.notes.push(note.into());
    }

    pub async fn snapshot(&self) -> SessionTelemetry {
        self.session.lock().await.clone()
    }

    /// Writes the session as pretty JSON into `dir` and returns the file path.
    pub async fn export_json(&self, dir: &Path) -> Result<PathBuf> {
        let snapshot = self.snapshot().await;
        let body = serde_json::to_vec_pretty(&snapshot)
            .map_err(|err| ops_error(format!("failed to encode telemetry: {err}")))?;
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(format!(
            "session_{}.json",
            Utc::now().format("%Y%m%d_%H%M%S_%3f")
        ));
        tokio::fs::write(&path, body).await?;
        info!("Telemetry exported to {:?}", path);
        Ok(path)
    }
}

pub fn ensure_telemetry_dir(path: &str) -> Result<PathBuf> {
    let dir = PathBuf::from(path);
    std::fs::create_dir_all(&dir)
        .map_err(|err| ops_error(format!("failed to create telemetry dir: {err}")))?;
    info!("Telemetry directory ready at {:?}", dir);
    Ok(dir)
}

pub fn ops_error(message: impl Into<String>) -> TintcamError {
    TintcamError::Ops(message.into())
}
