//! Records the filtered surface into a single downloadable clip.

use std::{
    mem,
    time::{Duration, Instant},
};

use tintcam_types::{config::RecorderConfig, frame::SurfaceHandle, Result, TintcamError};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

mod capture;
mod encoder;
mod ffmpeg;
mod format;

pub use capture::{CaptureStream, CapturedFrame, FrameFeed};
pub use encoder::{EncoderBackend, EncoderEvent, EncoderSettings, MediaEncoder};
pub use ffmpeg::FfmpegEncoder;
pub use format::{
    clip_file_name, format_recording_time, negotiate_format, save_clip, Clip, ClipFormat,
};

/// Recording lifecycle. `Error` carries the failure detail until `cleanup`.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum RecordingState {
    #[default]
    Idle,
    Initializing,
    Recording {
        started_at: Instant,
        paused_total: Duration,
    },
    Paused {
        started_at: Instant,
        paused_at: Instant,
        paused_total: Duration,
    },
    Stopping,
    Stopped,
    Error(String),
}

impl RecordingState {
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            RecordingState::Recording { .. } | RecordingState::Paused { .. }
        )
    }

    /// Recorded time so far, excluding paused spans.
    pub fn elapsed(&self) -> Duration {
        match self {
            RecordingState::Recording {
                started_at,
                paused_total,
            } => started_at.elapsed().saturating_sub(*paused_total),
            RecordingState::Paused {
                started_at,
                paused_at,
                paused_total,
            } => paused_at
                .saturating_duration_since(*started_at)
                .saturating_sub(*paused_total),
            _ => Duration::ZERO,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            RecordingState::Idle => "idle",
            RecordingState::Initializing => "initializing",
            RecordingState::Recording { .. } => "recording",
            RecordingState::Paused { .. } => "paused",
            RecordingState::Stopping => "stopping",
            RecordingState::Stopped => "stopped",
            RecordingState::Error(_) => "error",
        }
    }
}

/// Captures the filtered surface and encodes it into one [`Clip`] per session.
pub struct ClipRecorder<B: EncoderBackend> {
    backend: B,
    config: RecorderConfig,
    state: RecordingState,
    stream: Option<CaptureStream>,
    format: Option<ClipFormat>,
    encoder: Option<Box<dyn MediaEncoder>>,
    events: Option<mpsc::UnboundedReceiver<EncoderEvent>>,
    chunks: Vec<Vec<u8>>,
    /// Encoder failure seen outside `stop`, reported by the next `stop`.
    failure: Option<String>,
}

impl<B: EncoderBackend> ClipRecorder<B> {
    pub fn new(backend: B, config: RecorderConfig) -> Self {
        Self {
            backend,
            config,
            state: RecordingState::Idle,
            stream: None,
            format: None,
            encoder: None,
            events: None,
            chunks: Vec::new(),
            failure: None,
        }
    }

    pub fn state(&self) -> &RecordingState {
        &self.state
    }

    pub fn elapsed(&self) -> Duration {
        self.state.elapsed()
    }

    pub fn format(&self) -> Option<&ClipFormat> {
        self.format.as_ref()
    }

    pub fn is_initialized(&self) -> bool {
        self.encoder.is_some()
    }

    /// Bytes received from the encoder for the current session.
    pub fn buffered_bytes(&mut self) -> usize {
        self.drain_events();
        self.chunks.iter().map(Vec::len).sum()
    }

    /// Starts capturing `surface` and negotiates a container the backend supports.
    /// Calling it again on an initialized recorder does nothing.
    pub async fn initialize(&mut self, surface: SurfaceHandle) -> Result<()> {
        if self.is_initialized() {
            debug!("Recorder already initialized");
            return Ok(());
        }
        self.state = RecordingState::Initializing;

        let format = match negotiate_format(
            &self.backend,
            self.config.preferred_type(),
            &self.config.fallback_mimes,
        )
        .await
        {
            Ok(format) => format,
            Err(err) => return Err(self.fail(err)),
        };

        let stream = CaptureStream::capture(surface, self.config.capture_fps);
        let (tx, rx) = mpsc::unbounded_channel();
        let settings = EncoderSettings::from(&self.config);
        let encoder = match self.backend.create(&stream, &format, &settings, tx).await {
            Ok(encoder) => encoder,
            Err(err) => return Err(self.fail(err)),
        };

        info!(
            "Recorder ready: {} at {} fps",
            format,
            stream.frame_rate()
        );
        self.stream = Some(stream);
        self.format = Some(format);
        self.encoder = Some(encoder);
        self.events = Some(rx);
        self.state = RecordingState::Idle;
        Ok(())
    }

    pub async fn start(&mut self) -> Result<()> {
        let Some(encoder) = self.encoder.as_mut() else {
            return Err(TintcamError::NotInitialized);
        };
        if !matches!(self.state, RecordingState::Idle | RecordingState::Stopped) {
            return Err(TintcamError::AlreadyRecording);
        }

        self.chunks.clear();
        self.failure = None;
        if let Some(events) = self.events.as_mut() {
            while events.try_recv().is_ok() {}
        }
        let timeslice = Duration::from_millis(self.config.timeslice_ms);
        if let Err(err) = encoder.start(timeslice).await {
            return Err(self.fail(err));
        }
        self.state = RecordingState::Recording {
            started_at: Instant::now(),
            paused_total: Duration::ZERO,
        };
        info!("Recording started");
        Ok(())
    }

    /// Finalises the session and returns every chunk as one clip.
    ///
    /// A session that produced no data is an error, not an empty clip.
    pub async fn stop(&mut self) -> Result<Clip> {
        self.drain_events();
        if let Some(detail) = self.failure.take() {
            return Err(TintcamError::Encoder(detail));
        }
        if !self.state.is_active() {
            return Err(TintcamError::NotRecording);
        }
        let (Some(encoder), Some(events), Some(format)) = (
            self.encoder.as_mut(),
            self.events.as_mut(),
            self.format.clone(),
        ) else {
            return Err(TintcamError::NotInitialized);
        };
        let elapsed = self.state.elapsed();
        self.state = RecordingState::Stopping;

        if let Err(err) = encoder.stop().await {
            return Err(self.fail(err));
        }
        loop {
            match events.recv().await {
                Some(EncoderEvent::DataAvailable(chunk)) => {
                    if !chunk.is_empty() {
                        self.chunks.push(chunk);
                    }
                }
                Some(EncoderEvent::Stopped) => break,
                Some(EncoderEvent::Failed(detail)) => {
                    return Err(self.fail(TintcamError::Encoder(detail)));
                }
                None => {
                    return Err(self.fail(TintcamError::Encoder(
                        "encoder went away before finishing".into(),
                    )));
                }
            }
        }

        let data = mem::take(&mut self.chunks).concat();
        if data.is_empty() {
            return Err(self.fail(recorder_error("no frames captured")));
        }
        self.state = RecordingState::Stopped;
        info!(
            "Recording stopped after {:.1}s: {} bytes of {}",
            elapsed.as_secs_f32(),
            data.len(),
            format
        );
        Ok(Clip::new(data, format))
    }

    pub fn pause(&mut self) {
        self.drain_events();
        if let RecordingState::Recording {
            started_at,
            paused_total,
        } = self.state
        {
            if let Some(encoder) = self.encoder.as_mut() {
                encoder.pause();
            }
            self.state = RecordingState::Paused {
                started_at,
                paused_at: Instant::now(),
                paused_total,
            };
            debug!("Recording paused");
        }
    }

    pub fn resume(&mut self) {
        self.drain_events();
        if let RecordingState::Paused {
            started_at,
            paused_at,
            paused_total,
        } = self.state
        {
            if let Some(encoder) = self.encoder.as_mut() {
                encoder.resume();
            }
            self.state = RecordingState::Recording {
                started_at,
                paused_total: paused_total + paused_at.elapsed(),
            };
            debug!("Recording resumed");
        }
    }

    /// Releases everything and returns to an uninitialized `Idle`. Safe from any state.
    pub fn cleanup(&mut self) {
        if let Some(mut encoder) = self.encoder.take() {
            if matches!(
                self.state,
                RecordingState::Recording { .. }
                    | RecordingState::Paused { .. }
                    | RecordingState::Stopping
            ) {
                encoder.abort();
                debug!("Aborted in-progress recording");
            }
        }
        if let Some(mut stream) = self.stream.take() {
            stream.stop_tracks();
        }
        self.events = None;
        self.format = None;
        self.chunks.clear();
        self.failure = None;
        self.state = RecordingState::Idle;
    }

    /// Moves collected encoder events into the chunk buffer.
    fn drain_events(&mut self) {
        let Some(events) = self.events.as_mut() else {
            return;
        };
        let mut failure = None;
        while let Ok(event) = events.try_recv() {
            match event {
                EncoderEvent::DataAvailable(chunk) if !chunk.is_empty() => self.chunks.push(chunk),
                EncoderEvent::DataAvailable(_) | EncoderEvent::Stopped => {}
                EncoderEvent::Failed(detail) => failure = Some(detail),
            }
        }
        if let Some(detail) = failure {
            self.fail(TintcamError::Encoder(detail.clone()));
            self.failure = Some(detail);
        }
    }

    fn fail(&mut self, err: TintcamError) -> TintcamError {
        warn!("Recorder error: {err}");
        self.chunks.clear();
        self.state = RecordingState::Error(err.to_string());
        err
    }
}

impl<B: EncoderBackend> Drop for ClipRecorder<B> {
    fn drop(&mut self) {
        self.cleanup();
    }
}

pub fn recorder_error(message: impl Into<String>) -> TintcamError {
    TintcamError::Encoder(message.into())
}
