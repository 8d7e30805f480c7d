//! Camera source abstraction layer.

use std::{
    sync::{Arc, Mutex},
    time::Instant,
};

use async_trait::async_trait;
use tintcam_types::{config::CameraConfig, frame::VideoFrame, Result, TintcamError};
use tracing::info;

mod still;

pub use still::StillImageSource;

/// Aggregated frame delivery counters.
#[derive(Debug, Default, Clone)]
pub struct SourceMetrics {
    pub frames_served: u64,
    pub frames_not_ready: u64,
}

#[async_trait]
pub trait FrameSource: Send + Sync {
    async fn open(&mut self) -> Result<()>;
    /// Latest decoded frame, if the source has produced one.
    fn current_frame(&self) -> Option<VideoFrame>;
    fn resolution(&self) -> (u32, u32);
    fn metrics(&self) -> SourceMetrics;
}

const SUBJECT_RGBA: [u8; 4] = [224, 172, 105, 255];

struct SyntheticState {
    width: u32,
    height: u32,
    backdrop: Vec<u8>,
    metrics: SourceMetrics,
}

/// Synthetic camera: a static gradient backdrop with a round subject
/// sweeping left and right across it.
pub struct SyntheticCamera {
    config: CameraConfig,
    opened_at: Option<Instant>,
    state: Arc<Mutex<SyntheticState>>,
}

impl SyntheticCamera {
    pub fn new(config: CameraConfig) -> Self {
        let state = SyntheticState {
            width: config.width,
            height: config.height,
            backdrop: render_backdrop(config.width, config.height),
            metrics: SourceMetrics::default(),
        };
        Self {
            config,
            opened_at: None,
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Switches the delivered resolution, as when the user flips cameras.
    pub fn set_resolution(&self, width: u32, height: u32) -> Result<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| source_error("failed to lock synthetic camera state"))?;
        if (state.width, state.height) != (width, height) {
            info!("Synthetic camera switching to {}x{}", width, height);
            state.width = width;
            state.height = height;
            state.backdrop = render_backdrop(width, height);
        }
        Ok(())
    }
}

#[async_trait]
impl FrameSource for SyntheticCamera {
    async fn open(&mut self) -> Result<()> {
        info!(
            "Opening synthetic camera {}x{} @ {}fps",
            self.config.width, self.config.height, self.config.frame_rate
        );
        self.opened_at = Some(Instant::now());
        Ok(())
    }

    fn current_frame(&self) -> Option<VideoFrame> {
        let opened_at = self.opened_at?;
        let mut state = self.state.lock().ok()?;
        let served = state.metrics.frames_served + state.metrics.frames_not_ready;
        let ready = served >= u64::from(self.config.warmup_frames);
        if ready {
            state.metrics.frames_served += 1;
        } else {
            state.metrics.frames_not_ready += 1;
        }

        let (width, height) = (state.width, state.height);
        let mut data = state.backdrop.clone();
        let phase = opened_at.elapsed().as_secs_f32();
        let cx = width as f32 * (0.5 + 0.25 * phase.sin());
        let cy = height as f32 * 0.55;
        let radius = height as f32 * 0.25;
        draw_disc(&mut data, (width, height), (cx, cy), radius, SUBJECT_RGBA);

        VideoFrame::from_rgba(width, height, data)
            .ok()
            .map(|frame| frame.with_ready(ready))
    }

    fn resolution(&self) -> (u32, u32) {
        self.state
            .lock()
            .map(|s| (s.width, s.height))
            .unwrap_or((self.config.width, self.config.height))
    }

    fn metrics(&self) -> SourceMetrics {
        self.state
            .lock()
            .map(|s| s.metrics.clone())
            .unwrap_or_default()
    }
}

fn render_backdrop(width: u32, height: u32) -> Vec<u8> {
    let mut data = Vec::with_capacity(width as usize * height as usize * 4);
    for y in 0..height {
        for x in 0..width {
            let r = (x * 255 / width.max(1)) as u8;
            let g = (y * 255 / height.max(1)) as u8;
            data.extend_from_slice(&[r, g, 96, 255]);
        }
    }
    data
}

fn draw_disc(data: &mut [u8], size: (u32, u32), center: (f32, f32), radius: f32, rgba: [u8; 4]) {
    let (width, height) = size;
    let (cx, cy) = center;
    let r2 = radius * radius;
    let x0 = (cx - radius).max(0.0) as u32;
    let x1 = ((cx + radius).ceil() as u32).min(width);
    let y0 = (cy - radius).max(0.0) as u32;
    let y1 = ((cy + radius).ceil() as u32).min(height);
    for y in y0..y1 {
        for x in x0..x1 {
            let dx = x as f32 - cx;
            let dy = y as f32 - cy;
            if dx * dx + dy * dy <= r2 {
                let idx = (y as usize * width as usize + x as usize) * 4;
                data[idx..idx + 4].copy_from_slice(&rgba);
            }
        }
    }
}

/// Generate an error aligned with frame source semantics.
pub fn source_error(message: impl Into<String>) -> TintcamError {
    TintcamError::Source(message.into())
}
