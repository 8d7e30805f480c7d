use std::{
    borrow::Cow,
    collections::HashSet,
    mem,
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use async_trait::async_trait;
use image::{
    imageops::{self, FilterType},
    ImageBuffer, Rgba,
};
use tintcam_types::{config::RecorderConfig, frame::BYTES_PER_PIXEL, Result};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
    process::{Child, Command},
    sync::{
        broadcast::{self, error::RecvError},
        mpsc, watch, OnceCell,
    },
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::{
    capture::{CaptureStream, CapturedFrame, FrameFeed},
    encoder::{EncoderBackend, EncoderEvent, EncoderSettings, MediaEncoder},
    format::ClipFormat,
    recorder_error,
};

const DEFAULT_FFMPEG: &str = "ffmpeg";
const READ_BUFFER: usize = 64 * 1024;

/// Encodes clips by piping raw RGBA frames through an `ffmpeg` child process.
pub struct FfmpegEncoder {
    ffmpeg_path: PathBuf,
    encoders: OnceCell<HashSet<String>>,
}

impl FfmpegEncoder {
    pub fn new(config: &RecorderConfig) -> Self {
        let ffmpeg_path = config
            .ffmpeg_path
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_FFMPEG));
        Self {
            ffmpeg_path,
            encoders: OnceCell::new(),
        }
    }

    /// Encoder names reported by `ffmpeg -encoders`, probed once.
    pub async fn available_encoders(&self) -> &HashSet<String> {
        self.encoders
            .get_or_init(|| probe_encoders(&self.ffmpeg_path))
            .await
    }
}

#[async_trait]
impl EncoderBackend for FfmpegEncoder {
    async fn is_type_supported(&self, mime_type: &str) -> bool {
        select_encoder(&ClipFormat::new(mime_type), self.available_encoders().await).is_some()
    }

    async fn create(
        &self,
        stream: &CaptureStream,
        format: &ClipFormat,
        settings: &EncoderSettings,
        events: mpsc::UnboundedSender<EncoderEvent>,
    ) -> Result<Box<dyn MediaEncoder>> {
        let codec = select_encoder(format, self.available_encoders().await)
            .ok_or_else(|| recorder_error(format!("ffmpeg cannot encode {format}")))?;
        info!("Encoding {} with ffmpeg {}", format, codec);
        Ok(Box::new(FfmpegSession {
            command: FfmpegCommand {
                ffmpeg_path: self.ffmpeg_path.clone(),
                codec,
                container: format.extension(),
                settings: *settings,
            },
            frames: stream.feed(),
            events,
            control: None,
            pipeline: None,
        }))
    }
}

async fn probe_encoders(ffmpeg_path: &Path) -> HashSet<String> {
    let output = Command::new(ffmpeg_path)
        .args(["-hide_banner", "-encoders"])
        .output()
        .await;
    match output {
        Ok(output) if output.status.success() => {
            let encoders = parse_encoder_list(&String::from_utf8_lossy(&output.stdout));
            debug!("ffmpeg reports {} encoders", encoders.len());
            encoders
        }
        Ok(output) => {
            warn!(
                "ffmpeg -encoders failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
            HashSet::new()
        }
        Err(err) => {
            warn!("Unable to run {}: {err}", ffmpeg_path.display());
            HashSet::new()
        }
    }
}

/// Extracts encoder names from the table printed after the `------` rule.
fn parse_encoder_list(listing: &str) -> HashSet<String> {
    listing
        .lines()
        .skip_while(|line| !line.trim_start().starts_with("---"))
        .skip(1)
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(str::to_string)
        .collect()
}

fn encoder_candidates(format: &ClipFormat) -> &'static [&'static str] {
    match (format.container(), format.codec()) {
        ("webm", Some(codec)) if codec.starts_with("vp9") => &["libvpx-vp9"],
        ("webm", Some(codec)) if codec.starts_with("vp8") => &["libvpx"],
        ("webm", None) => &["libvpx"],
        ("mp4", _) => &["libx264", "mpeg4"],
        _ => &[],
    }
}

fn select_encoder(format: &ClipFormat, available: &HashSet<String>) -> Option<&'static str> {
    encoder_candidates(format)
        .iter()
        .copied()
        .find(|name| available.contains(*name))
}

#[derive(Debug, Clone)]
struct FfmpegCommand {
    ffmpeg_path: PathBuf,
    codec: &'static str,
    container: &'static str,
    settings: EncoderSettings,
}

impl FfmpegCommand {
    fn args(&self, width: u32, height: u32) -> Vec<String> {
        let mut args: Vec<String> = [
            "-hide_banner",
            "-loglevel",
            "error",
            "-f",
            "rawvideo",
            "-pix_fmt",
            "rgba",
            "-s",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        args.push(format!("{width}x{height}"));
        args.extend(["-r".into(), self.settings.frame_rate.max(1).to_string()]);
        args.extend(["-i", "pipe:0", "-an", "-c:v", self.codec].map(String::from));
        args.extend(["-b:v".into(), self.settings.video_bits_per_second.to_string()]);
        if self.codec.starts_with("libvpx") {
            args.extend(["-deadline", "realtime", "-cpu-used", "8"].map(String::from));
        }
        args.extend(
            [
                "-vf",
                "pad=ceil(iw/2)*2:ceil(ih/2)*2",
                "-pix_fmt",
                "yuv420p",
            ]
            .map(String::from),
        );
        if self.container == "mp4" {
            args.extend(["-movflags", "frag_keyframe+empty_moov"].map(String::from));
        }
        args.extend(["-f".into(), self.container.to_string(), "pipe:1".into()]);
        args
    }

    fn spawn(&self, width: u32, height: u32) -> std::io::Result<Child> {
        Command::new(&self.ffmpeg_path)
            .args(self.args(width, height))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    Running,
    Paused,
    Stopping,
    Aborted,
}

struct FfmpegSession {
    command: FfmpegCommand,
    /// Subscribed per session, so an idle encoder keeps capture sampling off.
    frames: FrameFeed,
    events: mpsc::UnboundedSender<EncoderEvent>,
    control: Option<watch::Sender<Control>>,
    pipeline: Option<JoinHandle<()>>,
}

impl FfmpegSession {
    fn is_active(&self) -> bool {
        self.control
            .as_ref()
            .is_some_and(|c| matches!(*c.borrow(), Control::Running | Control::Paused))
    }
}

#[async_trait]
impl MediaEncoder for FfmpegSession {
    async fn start(&mut self, timeslice: Duration) -> Result<()> {
        if self.is_active() {
            return Err(recorder_error("ffmpeg session already running"));
        }
        let (control_tx, control_rx) = watch::channel(Control::Running);
        let pipeline = Pipeline {
            command: self.command.clone(),
            frames: self.frames.subscribe(),
            control: control_rx,
            events: self.events.clone(),
            timeslice,
        };
        self.pipeline = Some(tokio::spawn(pipeline.run()));
        self.control = Some(control_tx);
        Ok(())
    }

    fn pause(&mut self) {
        if let Some(control) = &self.control {
            control.send_if_modified(|state| {
                let running = *state == Control::Running;
                if running {
                    *state = Control::Paused;
                }
                running
            });
        }
    }

    fn resume(&mut self) {
        if let Some(control) = &self.control {
            control.send_if_modified(|state| {
                let paused = *state == Control::Paused;
                if paused {
                    *state = Control::Running;
                }
                paused
            });
        }
    }

    async fn stop(&mut self) -> Result<()> {
        if !self.is_active() {
            return Err(recorder_error("ffmpeg session is not running"));
        }
        if let Some(control) = &self.control {
            control.send_replace(Control::Stopping);
        }
        Ok(())
    }

    fn abort(&mut self) {
        if let Some(control) = self.control.take() {
            control.send_replace(Control::Aborted);
        }
        if let Some(pipeline) = self.pipeline.take() {
            pipeline.abort();
        }
    }
}

impl Drop for FfmpegSession {
    fn drop(&mut self) {
        self.abort();
    }
}

enum Outcome {
    Finish,
    WriteFailed(String),
    Abort,
}

struct Pipeline {
    command: FfmpegCommand,
    frames: broadcast::Receiver<CapturedFrame>,
    control: watch::Receiver<Control>,
    events: mpsc::UnboundedSender<EncoderEvent>,
    timeslice: Duration,
}

impl Pipeline {
    async fn run(mut self) {
        // The child is sized from the first frame.
        let Some(first) = self.first_frame().await else {
            return;
        };
        let (width, height) = (first.width, first.height);

        let mut child = match self.command.spawn(width, height) {
            Ok(child) => child,
            Err(err) => {
                self.fail(format!("failed to start ffmpeg: {err}"));
                return;
            }
        };
        let (Some(mut stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            self.fail("ffmpeg pipes unavailable");
            return;
        };
        let stderr = child.stderr.take();
        let reader = tokio::spawn(forward_output(stdout, self.events.clone(), self.timeslice));
        let stderr_task = tokio::spawn(async move {
            let mut text = String::new();
            if let Some(mut stderr) = stderr {
                let _ = stderr.read_to_string(&mut text).await;
            }
            text
        });
        debug!("ffmpeg started at {}x{}", width, height);

        let mut pending = Some(first);
        let outcome = loop {
            if let Some(frame) = pending.take() {
                let bytes = fit_frame(&frame, width, height);
                if let Err(err) = stdin.write_all(&bytes).await {
                    break Outcome::WriteFailed(err.to_string());
                }
            }
            tokio::select! {
                frame = self.frames.recv() => match frame {
                    Ok(frame) => {
                        if *self.control.borrow() == Control::Running {
                            pending = Some(frame);
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => debug!("Encoder skipped {} frames", skipped),
                    Err(RecvError::Closed) => break Outcome::Finish,
                },
                changed = self.control.changed() => {
                    if changed.is_err() {
                        break Outcome::Abort;
                    }
                    let state = *self.control.borrow();
                    match state {
                        Control::Stopping => break Outcome::Finish,
                        Control::Aborted => break Outcome::Abort,
                        Control::Running | Control::Paused => {}
                    }
                }
            }
        };

        if let Outcome::Abort = outcome {
            let _ = child.start_kill();
            reader.abort();
            debug!("ffmpeg session aborted");
            return;
        }

        // closing stdin lets ffmpeg flush the container trailer
        drop(stdin);
        let status = child.wait().await;
        let _ = reader.await;
        let stderr = stderr_task.await.unwrap_or_default();

        match (status, outcome) {
            (Ok(status), Outcome::Finish) if status.success() => {
                debug!("ffmpeg finished cleanly");
                let _ = self.events.send(EncoderEvent::Stopped);
            }
            (Ok(status), Outcome::WriteFailed(err)) => {
                self.fail(format!("ffmpeg input closed ({err}), exit {status}: {}", stderr.trim()))
            }
            (Ok(status), _) => self.fail(format!("ffmpeg exited with {status}: {}", stderr.trim())),
            (Err(err), _) => self.fail(format!("failed to wait for ffmpeg: {err}")),
        }
    }

    /// Waits for the first frame to arrive while running.
    ///
    /// A stop before any frame still finalises the session, with no data.
    async fn first_frame(&mut self) -> Option<CapturedFrame> {
        loop {
            tokio::select! {
                frame = self.frames.recv() => match frame {
                    Ok(frame) => {
                        if *self.control.borrow() == Control::Running {
                            return Some(frame);
                        }
                    }
                    Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => {
                        let _ = self.events.send(EncoderEvent::Stopped);
                        return None;
                    }
                },
                changed = self.control.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                    let state = *self.control.borrow();
                    match state {
                        Control::Stopping => {
                            let _ = self.events.send(EncoderEvent::Stopped);
                            return None;
                        }
                        Control::Aborted => return None,
                        Control::Running | Control::Paused => {}
                    }
                }
            }
        }
    }

    fn fail(&self, detail: impl Into<String>) {
        let detail = detail.into();
        warn!("Encoding failed: {}", detail);
        let _ = self.events.send(EncoderEvent::Failed(detail));
    }
}

/// Emits whatever ffmpeg wrote since the last slice, once per `timeslice`.
async fn forward_output<R>(
    mut stdout: R,
    events: mpsc::UnboundedSender<EncoderEvent>,
    timeslice: Duration,
) where
    R: AsyncRead + Unpin,
{
    let mut ticker = time::interval(timeslice.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await;

    let mut buf = vec![0u8; READ_BUFFER];
    let mut pending = Vec::new();
    loop {
        tokio::select! {
            read = stdout.read(&mut buf) => match read {
                Ok(0) => break,
                Ok(n) => pending.extend_from_slice(&buf[..n]),
                Err(err) => {
                    warn!("Reading ffmpeg output failed: {err}");
                    break;
                }
            },
            _ = ticker.tick() => flush(&mut pending, &events),
        }
    }
    flush(&mut pending, &events);
}

fn flush(pending: &mut Vec<u8>, events: &mpsc::UnboundedSender<EncoderEvent>) {
    if !pending.is_empty() {
        let _ = events.send(EncoderEvent::DataAvailable(mem::take(pending)));
    }
}

/// Frames captured after the surface was resized are scaled to the session size.
fn fit_frame(frame: &CapturedFrame, width: u32, height: u32) -> Cow<'_, [u8]> {
    if (frame.width, frame.height) == (width, height) {
        return Cow::Borrowed(&frame.data[..]);
    }
    match ImageBuffer::<Rgba<u8>, _>::from_raw(frame.width, frame.height, frame.data.to_vec()) {
        Some(image) => {
            Cow::Owned(imageops::resize(&image, width, height, FilterType::Triangle).into_raw())
        }
        None => Cow::Owned(vec![0; width as usize * height as usize * BYTES_PER_PIXEL]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, time::Instant};
    use tintcam_types::{
        config::{MP4, WEBM, WEBM_VP8, WEBM_VP9},
        frame::SurfaceHandle,
    };

    const LISTING: &str = "Encoders:
 V..... = Video
 A..... = Audio
 ------
 V....D libx264              libx264 H.264 / AVC / MPEG-4 AVC (codec h264)
 V....D libvpx               libvpx VP8 (codec vp8)
 V....D mpeg4                MPEG-4 part 2
";

    fn encoders(names: &[&str]) -> HashSet<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    fn command(codec: &'static str, container: &'static str) -> FfmpegCommand {
        FfmpegCommand {
            ffmpeg_path: PathBuf::from("ffmpeg"),
            codec,
            container,
            settings: EncoderSettings {
                video_bits_per_second: 2_500_000,
                frame_rate: 30,
            },
        }
    }

    #[test]
    fn encoder_listing_is_parsed_after_the_rule() {
        let parsed = parse_encoder_list(LISTING);
        assert_eq!(parsed, encoders(&["libx264", "libvpx", "mpeg4"]));
        assert!(parse_encoder_list("").is_empty());
    }

    #[test]
    fn mime_types_map_to_ffmpeg_encoders() {
        let all = encoders(&["libvpx-vp9", "libvpx", "libx264", "mpeg4"]);
        assert_eq!(select_encoder(&ClipFormat::new(WEBM_VP9), &all), Some("libvpx-vp9"));
        assert_eq!(select_encoder(&ClipFormat::new(WEBM_VP8), &all), Some("libvpx"));
        assert_eq!(select_encoder(&ClipFormat::new(WEBM), &all), Some("libvpx"));
        assert_eq!(select_encoder(&ClipFormat::new(MP4), &all), Some("libx264"));
        assert_eq!(select_encoder(&ClipFormat::new("video/ogg"), &all), None);

        let minimal = encoders(&["mpeg4"]);
        assert_eq!(select_encoder(&ClipFormat::new(MP4), &minimal), Some("mpeg4"));
        assert_eq!(select_encoder(&ClipFormat::new(WEBM_VP9), &minimal), None);
    }

    #[test]
    fn mp4_output_is_fragmented_for_piping() {
        let args = command("libx264", "mp4").args(640, 360);
        let joined = args.join(" ");
        assert!(joined.contains("-s 640x360"));
        assert!(joined.contains("-c:v libx264"));
        assert!(joined.contains("-b:v 2500000"));
        assert!(joined.contains("-movflags frag_keyframe+empty_moov"));
        assert!(joined.ends_with("-f mp4 pipe:1"));

        let webm = command("libvpx-vp9", "webm").args(640, 360).join(" ");
        assert!(webm.contains("-deadline realtime"));
        assert!(!webm.contains("-movflags"));
        assert!(webm.ends_with("-f webm pipe:1"));
    }

    #[test]
    fn mismatched_frames_are_scaled_to_session_size() {
        let frame = CapturedFrame {
            width: 2,
            height: 2,
            data: Arc::from(vec![200u8; 16]),
            captured_at: Instant::now(),
        };
        assert!(matches!(fit_frame(&frame, 2, 2), Cow::Borrowed(_)));
        let scaled = fit_frame(&frame, 4, 4);
        assert_eq!(scaled.len(), 64);
        assert!(scaled.iter().all(|&b| b == 200));
    }

    #[tokio::test]
    async fn missing_ffmpeg_supports_nothing() {
        let config = RecorderConfig {
            ffmpeg_path: Some("/nonexistent/tintcam-ffmpeg".into()),
            ..RecorderConfig::default()
        };
        let backend = FfmpegEncoder::new(&config);
        assert!(!backend.is_type_supported(WEBM_VP9).await);
        assert!(backend.available_encoders().await.is_empty());
    }

    #[tokio::test]
    async fn capture_is_only_subscribed_while_a_session_runs() {
        let stream = CaptureStream::capture(SurfaceHandle::default(), 30);
        let (events, mut rx) = mpsc::unbounded_channel();
        let mut session = FfmpegSession {
            command: command("libvpx-vp9", "webm"),
            frames: stream.feed(),
            events,
            control: None,
            pipeline: None,
        };
        assert_eq!(stream.subscriber_count(), 0);

        session.start(Duration::from_millis(100)).await.expect("start");
        assert_eq!(stream.subscriber_count(), 1);

        // stopped before any frame was captured
        session.stop().await.expect("stop");
        let pipeline = session.pipeline.take().expect("pipeline");
        pipeline.await.expect("pipeline task");
        assert_eq!(rx.recv().await, Some(EncoderEvent::Stopped));
        assert_eq!(stream.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn output_is_flushed_in_slices() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let data: &[u8] = &[1, 2, 3, 4, 5];
        forward_output(data, tx, Duration::from_millis(100)).await;
        assert_eq!(rx.recv().await, Some(EncoderEvent::DataAvailable(vec![1, 2, 3, 4, 5])));
        assert_eq!(rx.recv().await, None);
    }
}
