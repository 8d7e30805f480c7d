use std::time::Duration;

use async_trait::async_trait;
use tintcam_types::{config::RecorderConfig, Result};
use tokio::sync::mpsc;

use crate::{capture::CaptureStream, format::ClipFormat};

/// Messages an encoder sends back to the recorder that owns it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncoderEvent {
    DataAvailable(Vec<u8>),
    /// Finalisation finished; no further data follows.
    Stopped,
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncoderSettings {
    pub video_bits_per_second: u64,
    pub frame_rate: u32,
}

impl From<&RecorderConfig> for EncoderSettings {
    fn from(config: &RecorderConfig) -> Self {
        Self {
            video_bits_per_second: config.video_bits_per_second,
            frame_rate: config.capture_fps,
        }
    }
}

/// Factory for encoders, plus the capability probe used during negotiation.
#[async_trait]
pub trait EncoderBackend: Send + Sync {
    async fn is_type_supported(&self, mime_type: &str) -> bool;

    /// Binds an encoder to `stream`. Events for every session it runs are sent
    /// on `events`.
    async fn create(
        &self,
        stream: &CaptureStream,
        format: &ClipFormat,
        settings: &EncoderSettings,
        events: mpsc::UnboundedSender<EncoderEvent>,
    ) -> Result<Box<dyn MediaEncoder>>;
}

/// A bound encoder. `stop` only requests finalisation; completion is reported
/// with [`EncoderEvent::Stopped`].
#[async_trait]
pub trait MediaEncoder: Send {
    async fn start(&mut self, timeslice: Duration) -> Result<()>;
    fn pause(&mut self);
    fn resume(&mut self);
    async fn stop(&mut self) -> Result<()>;
    /// Tears the session down without finalising; no `Stopped` event is sent.
    fn abort(&mut self);
}
