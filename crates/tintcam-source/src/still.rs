use std::path::PathBuf;

use async_trait::async_trait;
use tintcam_types::{frame::VideoFrame, Result};
use tracing::info;

use crate::{source_error, FrameSource, SourceMetrics};

/// Serves one decoded image as a never-changing camera feed.
pub struct StillImageSource {
    path: PathBuf,
    frame: Option<VideoFrame>,
}

impl StillImageSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            frame: None,
        }
    }

    pub fn from_frame(frame: VideoFrame) -> Self {
        Self {
            path: PathBuf::new(),
            frame: Some(frame),
        }
    }
}

#[async_trait]
impl FrameSource for StillImageSource {
    async fn open(&mut self) -> Result<()> {
        if self.frame.is_some() {
            return Ok(());
        }
        let path = self.path.clone();
        let decoded = tokio::task::spawn_blocking(move || image::open(&path))
            .await
            .map_err(|err| source_error(format!("image decode task failed: {err}")))?
            .map_err(|err| {
                source_error(format!("failed to decode {}: {err}", self.path.display()))
            })?;
        let rgba = decoded.to_rgba8();
        let (width, height) = rgba.dimensions();
        info!("Loaded still frame {:?} ({}x{})", self.path, width, height);
        self.frame = Some(VideoFrame::from_rgba(width, height, rgba.into_raw())?);
        Ok(())
    }

    fn current_frame(&self) -> Option<VideoFrame> {
        self.frame.clone()
    }

    fn resolution(&self) -> (u32, u32) {
        self.frame
            .as_ref()
            .map(VideoFrame::dimensions)
            .unwrap_or((0, 0))
    }

    fn metrics(&self) -> SourceMetrics {
        SourceMetrics::default()
    }
}
