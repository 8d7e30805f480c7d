use std::{
    env,
    path::{Path, PathBuf},
    sync::{mpsc, Arc},
    thread,
};

use anyhow::Result;
use chrono::Utc;
use clap::Parser;
use futures::StreamExt;
use tintcam_hub::{EventHub, LocalHub};
use tintcam_ops::{ensure_telemetry_dir, init_tracing, TelemetryStore};
use tintcam_recorder::{save_clip, ClipRecorder, FfmpegEncoder};
use tintcam_render::RenderScheduler;
use tintcam_source::{FrameSource, StillImageSource, SyntheticCamera};
use tintcam_types::{
    config::TintcamConfig,
    events::{LifecyclePhase, SystemEvent},
    frame::FilterColor,
    telemetry::RecordingSummary,
};
use tintcam_vision::{
    save_snapshot, BackgroundDifferenceModel, MaskProvider, ModelMaskProvider,
    SegmentationOptions,
};
use tokio::time::{self, Duration, Instant};
use tracing::{info, warn};

mod ui;

use ui::UiMessage;

const CONFIG_ENV: &str = "TINTCAM_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "configs/dev.toml";

#[derive(Debug, Parser)]
#[command(name = "tintcam", about = "Live color filter that keeps people in silhouette")]
struct Args {
    /// Config file; falls back to $TINTCAM_CONFIG, then configs/dev.toml.
    #[arg(long)]
    config: Option<PathBuf>,
    /// How long to run the filter.
    #[arg(long, default_value_t = 5)]
    seconds: u64,
    /// Record the filtered output for the whole run.
    #[arg(long)]
    record: bool,
    /// Background filter color as #RRGGBB.
    #[arg(long)]
    filter: Option<FilterColor>,
    /// `synthetic` or the path of a PNG/JPEG to use as a still camera.
    #[arg(long, default_value = "synthetic")]
    source: String,
    /// Show the terminal dashboard.
    #[arg(long)]
    tui: bool,
    /// Save the last filtered frame as a PNG into the telemetry directory.
    #[arg(long)]
    snapshot: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(args.config.as_deref());

    // the dashboard owns the terminal, so log lines would corrupt it
    if !args.tui {
        init_tracing(&config.ops)?;
    }
    ensure_telemetry_dir(&config.ops.telemetry_dir)?;

    if args.source == "synthetic" {
        let source = SyntheticCamera::new(config.camera.clone());
        run_session(source, &config, &args).await
    } else {
        let source = StillImageSource::new(&args.source);
        run_session(source, &config, &args).await
    }
}

async fn run_session<S>(mut source: S, config: &TintcamConfig, args: &Args) -> Result<()>
where
    S: FrameSource + 'static,
{
    let hub = LocalHub::new(256);
    let telemetry = TelemetryStore::new();
    telemetry.add_note(format!("source: {}", args.source)).await;

    let (ui_tx, ui_thread) = if args.tui {
        let (tx, rx) = mpsc::channel();
        let summary = format!(
            "{}x{} @ {}fps, segment 1/{}",
            config.camera.width,
            config.camera.height,
            config.camera.frame_rate,
            config.render.segment_every
        );
        let handle = thread::spawn(move || ui::run(rx, summary));
        (Some(tx), Some(handle))
    } else {
        (None, None)
    };

    let forwarder = {
        let mut events = hub.subscribe();
        let telemetry = telemetry.clone();
        let ui_tx = ui_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if let Some(tx) = &ui_tx {
                    let _ = tx.send(UiMessage::Event(event.clone()));
                }
                if let Err(err) = telemetry.record_event(event).await {
                    warn!("Failed to record telemetry: {err}");
                }
            }
        })
    };

    source.open().await?;
    let provider: Arc<dyn MaskProvider> = Arc::new(ModelMaskProvider::new(
        BackgroundDifferenceModel::new(config.vision.calibration_frames),
        SegmentationOptions::from(&config.vision),
    ));
    provider.load().await?;
    hub.publish(SystemEvent::lifecycle(LifecyclePhase::ModelLoaded, None))
        .await?;

    let scheduler = RenderScheduler::new(
        &config.render,
        &config.vision,
        source,
        Arc::clone(&provider),
        hub.clone(),
    )
    .spawn();
    if let Some(color) = args.filter {
        scheduler.set_filter(color);
    }
    info!("Filtering with {}", scheduler.filter());

    let mut recorder = if args.record {
        let mut recorder = ClipRecorder::new(
            FfmpegEncoder::new(&config.recorder),
            config.recorder.clone(),
        );
        match recorder.initialize(scheduler.surface()).await {
            Ok(()) => match recorder.start().await {
                Ok(()) => Some(recorder),
                Err(err) => {
                    hub.publish(SystemEvent::recording_failed(err.to_string()))
                        .await?;
                    None
                }
            },
            Err(err) => {
                warn!("Recording unavailable: {err}");
                hub.publish(SystemEvent::recording_failed(err.to_string()))
                    .await?;
                None
            }
        }
    } else {
        None
    };

    let deadline = Instant::now() + Duration::from_secs(args.seconds);
    let mut ticker = time::interval(Duration::from_secs(1));
    while Instant::now() < deadline {
        ticker.tick().await;
        if ui_thread.as_ref().is_some_and(|t| t.is_finished()) {
            info!("Dashboard closed; ending session");
            break;
        }
        if let Some(recorder) = recorder.as_ref() {
            let elapsed = recorder.elapsed();
            hub.publish(SystemEvent::recording(
                recorder.state().label(),
                elapsed.as_millis() as u64,
            ))
            .await?;
        }
    }

    if let Some(mut recorder) = recorder.take() {
        let summary = finish_recording(&mut recorder, config, &hub).await;
        telemetry.record_recording(summary).await?;
        recorder.cleanup();
    }

    let surface = scheduler.surface();
    let stats = scheduler.stop().await?;
    info!(
        "Rendered {} ticks: {} composites, {} fresh masks, {} reused, {} late",
        stats.ticks, stats.composites, stats.fresh_masks, stats.reused_masks, stats.late_masks
    );
    telemetry
        .add_note(format!("render stats: {:?}", stats))
        .await;

    if args.snapshot {
        match save_snapshot(&surface.snapshot()?, Path::new(&config.ops.telemetry_dir)) {
            Ok(path) => info!("Snapshot written to {:?}", path),
            Err(err) => warn!("Snapshot skipped: {err}"),
        }
    }

    provider.dispose();
    hub.publish(SystemEvent::lifecycle(LifecyclePhase::ModelDisposed, None))
        .await?;

    // closing the hub ends the forwarder, which releases its UI sender
    drop(hub);
    if let Err(err) = forwarder.await {
        warn!("Event forwarder failed: {err}");
    }
    telemetry
        .export_json(Path::new(&config.ops.telemetry_dir))
        .await?;

    if let Some(tx) = ui_tx {
        let _ = tx.send(UiMessage::Shutdown);
    }
    if let Some(handle) = ui_thread {
        match handle.join() {
            Ok(result) => result?,
            Err(_) => warn!("Dashboard thread panicked"),
        }
    }
    Ok(())
}

/// Stops the recorder, saves the clip and reports the result on the hub.
async fn finish_recording(
    recorder: &mut ClipRecorder<FfmpegEncoder>,
    config: &TintcamConfig,
    hub: &LocalHub,
) -> RecordingSummary {
    let duration_ms = recorder.elapsed().as_millis() as u64;
    let mime_type = recorder.format().map(|f| f.mime_type().to_string());
    let mut summary = RecordingSummary {
        mime_type,
        bytes: 0,
        duration_ms,
        path: None,
        error: None,
        finished_at: Utc::now(),
    };

    let saved = match recorder.stop().await {
        Ok(clip) => {
            summary.bytes = clip.size() as u64;
            save_clip(&clip, Path::new(&config.recorder.output_dir))
                .await
                .map(|path| (path, clip))
        }
        Err(err) => Err(err),
    };
    let event = match saved {
        Ok((path, clip)) => {
            let path = path.display().to_string();
            summary.path = Some(path.clone());
            SystemEvent::clip_saved(path, clip.size() as u64, clip.mime_type())
        }
        Err(err) => {
            warn!("Recording failed: {err}");
            summary.error = Some(err.to_string());
            SystemEvent::recording_failed(err.to_string())
        }
    };
    if let Err(err) = hub.publish(event).await {
        warn!("Failed to publish recording result: {err}");
    }
    summary
}

fn load_config(from_args: Option<&Path>) -> TintcamConfig {
    let path = from_args
        .map(Path::to_path_buf)
        .or_else(|| env::var(CONFIG_ENV).ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    match TintcamConfig::from_file(&path) {
        Ok(cfg) => {
            if let Err(err) = cfg.validate() {
                eprintln!(
                    "Invalid config in '{}': {err}. Falling back to internal defaults.",
                    path.display()
                );
                TintcamConfig::default()
            } else {
                cfg
            }
        }
        Err(err) => {
            eprintln!(
                "Failed to load config from '{}': {err}. Falling back to internal defaults.",
                path.display()
            );
            TintcamConfig::default()
        }
    }
}
