use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use tintcam_types::frame::SurfaceHandle;
use tokio::{
    sync::broadcast,
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use tracing::{debug, warn};

const FRAME_BUFFER: usize = 8;

/// One RGBA sample of the filtered surface.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    pub width: u32,
    pub height: u32,
    pub data: Arc<[u8]>,
    pub captured_at: Instant,
}

/// Hands out subscriptions to a [`CaptureStream`] without holding one itself.
#[derive(Debug, Clone)]
pub struct FrameFeed {
    tx: broadcast::Sender<CapturedFrame>,
}

impl FrameFeed {
    pub fn subscribe(&self) -> broadcast::Receiver<CapturedFrame> {
        self.tx.subscribe()
    }
}

/// Live feed of the filtered surface sampled at a fixed rate.
///
/// Samples are only taken while somebody is subscribed, and an empty surface
/// produces nothing.
pub struct CaptureStream {
    tx: broadcast::Sender<CapturedFrame>,
    frame_rate: u32,
    task: Option<JoinHandle<()>>,
}

impl CaptureStream {
    /// Must be called from within a tokio runtime.
    pub fn capture(surface: SurfaceHandle, frame_rate: u32) -> Self {
        let frame_rate = frame_rate.max(1);
        let (tx, _) = broadcast::channel(FRAME_BUFFER);
        let sender = tx.clone();
        let period = Duration::from_secs_f64(1.0 / f64::from(frame_rate));
        let task = tokio::spawn(async move {
            let mut interval = time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                if sender.receiver_count() == 0 {
                    continue;
                }
                let frame = match surface.read() {
                    Ok(surface) if !surface.is_empty() => CapturedFrame {
                        width: surface.width(),
                        height: surface.height(),
                        data: surface.pixels().into(),
                        captured_at: Instant::now(),
                    },
                    Ok(_) => continue,
                    Err(err) => {
                        warn!("Capture stopped: {err}");
                        break;
                    }
                };
                // every receiver may have gone away since the check above
                let _ = sender.send(frame);
            }
        });
        debug!("Capturing filtered surface at {} fps", frame_rate);
        Self {
            tx,
            frame_rate,
            task: Some(task),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CapturedFrame> {
        self.tx.subscribe()
    }

    pub fn feed(&self) -> FrameFeed {
        FrameFeed {
            tx: self.tx.clone(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn frame_rate(&self) -> u32 {
        self.frame_rate
    }

    pub fn is_live(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Ends sampling; subscribers stop receiving frames.
    pub fn stop_tracks(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            debug!("Capture tracks stopped");
        }
    }
}

impl Drop for CaptureStream {
    fn drop(&mut self) {
        self.stop_tracks();
    }
}
