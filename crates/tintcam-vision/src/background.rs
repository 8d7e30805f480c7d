use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tintcam_types::{frame::VideoFrame, Result, TintcamError};
use tracing::{debug, info};

use crate::{vision_error, PersonSegmentation, SegmentationModel, SegmentationOptions};

/// Colour distance (as a fraction of the RGB cube diagonal) that counts as a
/// fully confident person pixel.
const FULL_CONFIDENCE_DISTANCE: f32 = 0.25;

struct Backdrop {
    width: u32,
    height: u32,
    rgb: Vec<u8>,
}

enum Calibration {
    Idle,
    Collecting(Vec<VideoFrame>),
    Ready(Arc<Backdrop>),
}

enum Step {
    Skip,
    Classify(Arc<Backdrop>),
    Calibrate(Vec<VideoFrame>),
}

/// Background subtraction for a static camera.
///
/// After `load`, the first `calibration_frames` frames are collected (each
/// call is a soft miss) and merged into a per-channel median backdrop. Pixels
/// that drift far enough from the backdrop are classified as person.
pub struct BackgroundDifferenceModel {
    calibration_frames: usize,
    state: Mutex<Calibration>,
}

impl BackgroundDifferenceModel {
    pub fn new(calibration_frames: usize) -> Self {
        Self {
            calibration_frames,
            state: Mutex::new(Calibration::Idle),
        }
    }

    pub fn is_calibrated(&self) -> bool {
        matches!(
            self.state.lock().as_deref(),
            Ok(Calibration::Ready(_))
        )
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Calibration>> {
        self.state
            .lock()
            .map_err(|_| vision_error("failed to lock calibration state"))
    }
}

#[async_trait]
impl SegmentationModel for BackgroundDifferenceModel {
    async fn load(&self) -> Result<()> {
        if self.calibration_frames == 0 {
            return Err(TintcamError::ModelLoad(
                "calibration_frames must be greater than zero".into(),
            ));
        }
        *self.lock()? = Calibration::Collecting(Vec::with_capacity(self.calibration_frames));
        info!(
            "Background model calibrating over {} frames",
            self.calibration_frames
        );
        Ok(())
    }

    async fn segment_person(
        &self,
        frame: &VideoFrame,
        options: &SegmentationOptions,
    ) -> Result<Option<PersonSegmentation>> {
        let step = {
            let mut state = self.lock()?;
            let current = std::mem::replace(&mut *state, Calibration::Idle);
            let (next, step) = match current {
                Calibration::Idle => (Calibration::Idle, Step::Skip),
                Calibration::Ready(backdrop)
                    if (backdrop.width, backdrop.height) == frame.dimensions() =>
                {
                    let step = Step::Classify(Arc::clone(&backdrop));
                    (Calibration::Ready(backdrop), step)
                }
                Calibration::Ready(_) => {
                    debug!("Frame size changed; recalibrating background");
                    (Calibration::Collecting(vec![frame.clone()]), Step::Skip)
                }
                Calibration::Collecting(mut frames) => {
                    if frames
                        .first()
                        .is_some_and(|first| first.dimensions() != frame.dimensions())
                    {
                        frames.clear();
                    }
                    frames.push(frame.clone());
                    if frames.len() < self.calibration_frames {
                        (Calibration::Collecting(frames), Step::Skip)
                    } else {
                        (Calibration::Collecting(Vec::new()), Step::Calibrate(frames))
                    }
                }
            };
            *state = next;
            step
        };

        match step {
            Step::Skip => Ok(None),
            Step::Classify(backdrop) => {
                let frame = frame.clone();
                let options = *options;
                let segmentation =
                    tokio::task::spawn_blocking(move || classify(&backdrop, &frame, &options))
                        .await
                        .map_err(|err| vision_error(format!("inference task failed: {err}")))?;
                Ok(Some(segmentation))
            }
            Step::Calibrate(frames) => {
                let backdrop = tokio::task::spawn_blocking(move || median_backdrop(&frames))
                    .await
                    .map_err(|err| vision_error(format!("calibration task failed: {err}")))??;
                let mut state = self.lock()?;
                if matches!(*state, Calibration::Collecting(_)) {
                    info!(
                        "Background calibrated at {}x{}",
                        backdrop.width, backdrop.height
                    );
                    *state = Calibration::Ready(Arc::new(backdrop));
                }
                Ok(None)
            }
        }
    }

    fn dispose(&self) {
        if let Ok(mut state) = self.state.lock() {
            *state = Calibration::Idle;
        }
    }
}

/// Per-pixel, per-channel median across frames of identical size.
fn median_backdrop(frames: &[VideoFrame]) -> Result<Backdrop> {
    let Some(first) = frames.first() else {
        return Err(vision_error("median backdrop: no frames"));
    };
    let (width, height) = first.dimensions();
    if frames.iter().any(|f| f.dimensions() != (width, height)) {
        return Err(vision_error(
            "median backdrop: frames must share identical dimensions",
        ));
    }

    let k = frames.len();
    let mid = k / 2;
    let mut channel = vec![0u8; k];
    let mut rgb = Vec::with_capacity(first.pixel_count() * 3);
    for idx in 0..first.pixel_count() {
        for c in 0..3 {
            for (slot, frame) in channel.iter_mut().zip(frames) {
                *slot = frame.data()[idx * 4 + c];
            }
            channel.sort_unstable();
            rgb.push(channel[mid]);
        }
    }
    Ok(Backdrop { width, height, rgb })
}

fn classify(backdrop: &Backdrop, frame: &VideoFrame, options: &SegmentationOptions) -> PersonSegmentation {
    let (width, height) = frame.dimensions();
    let stride = options.internal_resolution.stride().max(1);
    let max_distance = (3.0f32 * 255.0 * 255.0).sqrt();
    let pixels = frame.data();
    let mut data = vec![0u8; frame.pixel_count()];

    for by in (0..height).step_by(stride as usize) {
        for bx in (0..width).step_by(stride as usize) {
            let idx = by as usize * width as usize + bx as usize;
            let distance: f32 = (0..3)
                .map(|c| {
                    let d = pixels[idx * 4 + c] as f32 - backdrop.rgb[idx * 3 + c] as f32;
                    d * d
                })
                .sum::<f32>()
                .sqrt()
                / max_distance;
            let confidence = (distance / FULL_CONFIDENCE_DISTANCE).min(1.0);
            if confidence <= options.segmentation_threshold {
                continue;
            }
            for y in by..(by + stride).min(height) {
                let row = y as usize * width as usize;
                for x in bx..(bx + stride).min(width) {
                    data[row + x as usize] = 1;
                }
            }
        }
    }

    if options.flip_horizontal && width > 0 {
        for row in data.chunks_exact_mut(width as usize) {
            row.reverse();
        }
    }

    PersonSegmentation {
        width,
        height,
        data,
    }
}
