//! Person segmentation and mask compositing.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Mutex,
};

use async_trait::async_trait;
use chrono::Utc;
use image::{ImageBuffer, Rgba};
use tintcam_types::{
    config::{InternalResolution, VisionConfig},
    frame::{FilteredSurface, SegmentationMask, VideoFrame},
    Result, TintcamError,
};
use tracing::{debug, info, warn};

mod background;
mod compositor;

pub use background::BackgroundDifferenceModel;
pub use compositor::FrameCompositor;

/// Knobs passed to the model on every inference call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SegmentationOptions {
    pub flip_horizontal: bool,
    pub internal_resolution: InternalResolution,
    pub segmentation_threshold: f32,
}

impl Default for SegmentationOptions {
    fn default() -> Self {
        Self {
            flip_horizontal: false,
            internal_resolution: InternalResolution::Medium,
            segmentation_threshold: 0.5,
        }
    }
}

impl From<&VisionConfig> for SegmentationOptions {
    fn from(config: &VisionConfig) -> Self {
        Self {
            flip_horizontal: config.flip_horizontal,
            internal_resolution: config.internal_resolution,
            segmentation_threshold: config.segmentation_threshold,
        }
    }
}

/// Raw model output: `1` for person pixels, `0` for background.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersonSegmentation {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

/// Backend that classifies person pixels. Implementations keep their own
/// interior state so a single instance can serve concurrent calls.
#[async_trait]
pub trait SegmentationModel: Send + Sync {
    async fn load(&self) -> Result<()>;
    async fn segment_person(
        &self,
        frame: &VideoFrame,
        options: &SegmentationOptions,
    ) -> Result<Option<PersonSegmentation>>;
    fn dispose(&self);
}

/// Produces foreground/background masks for the render loop.
#[async_trait]
pub trait MaskProvider: Send + Sync {
    /// Acquires the model. Must resolve before `segment` is used.
    async fn load(&self) -> Result<()>;
    /// `Ok(None)` is a soft miss: the model is disposed or inference failed.
    async fn segment(&self, frame: &VideoFrame) -> Result<Option<SegmentationMask>>;
    fn dispose(&self);
    fn is_ready(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ModelState {
    Unloaded,
    Loaded,
    Disposed,
}

/// Adapts a [`SegmentationModel`] to the [`MaskProvider`] contract.
pub struct ModelMaskProvider<M: SegmentationModel> {
    model: M,
    options: SegmentationOptions,
    state: Mutex<ModelState>,
}

impl<M: SegmentationModel> ModelMaskProvider<M> {
    pub fn new(model: M, options: SegmentationOptions) -> Self {
        Self {
            model,
            options,
            state: Mutex::new(ModelState::Unloaded),
        }
    }

    pub fn options(&self) -> &SegmentationOptions {
        &self.options
    }

    fn state(&self) -> Result<ModelState> {
        self.state
            .lock()
            .map(|state| *state)
            .map_err(|_| vision_error("failed to lock model state"))
    }

    fn set_state(&self, next: ModelState) {
        if let Ok(mut state) = self.state.lock() {
            *state = next;
        }
    }
}

#[async_trait]
impl<M: SegmentationModel> MaskProvider for ModelMaskProvider<M> {
    async fn load(&self) -> Result<()> {
        if self.state()? == ModelState::Loaded {
            return Ok(());
        }
        self.model.load().await.map_err(|err| match err {
            TintcamError::ModelLoad(_) => err,
            other => TintcamError::ModelLoad(other.to_string()),
        })?;
        self.set_state(ModelState::Loaded);
        info!("Segmentation model loaded");
        Ok(())
    }

    async fn segment(&self, frame: &VideoFrame) -> Result<Option<SegmentationMask>> {
        match self.state()? {
            ModelState::Unloaded => return Err(TintcamError::ModelNotLoaded),
            ModelState::Disposed => return Ok(None),
            ModelState::Loaded => {}
        }

        let segmentation = match self.model.segment_person(frame, &self.options).await {
            Ok(Some(segmentation)) => segmentation,
            Ok(None) => return Ok(None),
            Err(err) => {
                warn!("Segmentation failed: {err}");
                return Ok(None);
            }
        };

        // A dispose that raced the inference wins.
        if self.state()? != ModelState::Loaded {
            debug!("Discarding mask produced after dispose");
            return Ok(None);
        }

        let PersonSegmentation {
            width,
            height,
            data,
        } = segmentation;
        let samples = data
            .into_iter()
            .map(|v| {
                if v == 1 {
                    SegmentationMask::FOREGROUND
                } else {
                    SegmentationMask::BACKGROUND
                }
            })
            .collect();
        match SegmentationMask::from_samples(width, height, samples) {
            Ok(mask) => Ok(Some(mask)),
            Err(err) => {
                warn!("Model returned a malformed mask: {err}");
                Ok(None)
            }
        }
    }

    fn dispose(&self) {
        if self.state().ok() == Some(ModelState::Loaded) {
            self.model.dispose();
            info!("Segmentation model disposed");
        }
        self.set_state(ModelState::Disposed);
    }

    fn is_ready(&self) -> bool {
        self.state().ok() == Some(ModelState::Loaded)
    }
}

/// Writes the filtered surface to `dir` as a timestamped PNG.
pub fn save_snapshot(surface: &FilteredSurface, dir: &Path) -> Result<PathBuf> {
    if surface.is_empty() {
        return Err(vision_error("surface has not been drawn yet"));
    }
    fs::create_dir_all(dir)
        .map_err(|err| vision_error(format!("failed to create snapshot dir {:?}: {err}", dir)))?;
    let timestamp = Utc::now().format("%Y%m%d_%H%M%S_%3f");
    let path = dir.join(format!("snapshot_{}.png", timestamp));
    let Some(buffer) = ImageBuffer::<Rgba<u8>, _>::from_raw(
        surface.width(),
        surface.height(),
        surface.pixels().to_vec(),
    ) else {
        return Err(vision_error("failed to build image buffer from surface"));
    };
    buffer
        .save(&path)
        .map_err(|err| vision_error(format!("failed to save snapshot: {err}")))?;
    Ok(path)
}

pub fn vision_error(message: impl Into<String>) -> TintcamError {
    TintcamError::Vision(message.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Marks the left half of every frame as person.
    #[derive(Default)]
    struct HalfModel {
        loads: AtomicUsize,
        disposals: AtomicUsize,
        fail_load: bool,
        fail_inference: bool,
    }

    #[async_trait]
    impl SegmentationModel for HalfModel {
        async fn load(&self) -> Result<()> {
            if self.fail_load {
                return Err(vision_error("weights unavailable"));
            }
            self.loads.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn segment_person(
            &self,
            frame: &VideoFrame,
            _options: &SegmentationOptions,
        ) -> Result<Option<PersonSegmentation>> {
            if self.fail_inference {
                return Err(vision_error("backend lost"));
            }
            let (w, h) = frame.dimensions();
            let data = (0..h)
                .flat_map(|_| (0..w).map(move |x| u8::from(x < w / 2)))
                .collect();
            Ok(Some(PersonSegmentation {
                width: w,
                height: h,
                data,
            }))
        }

        fn dispose(&self) {
            self.disposals.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn frame() -> VideoFrame {
        VideoFrame::solid(4, 2, [9, 9, 9, 255])
    }

    #[tokio::test]
    async fn segment_before_load_is_a_usage_error() {
        let provider = ModelMaskProvider::new(HalfModel::default(), SegmentationOptions::default());
        let err = provider.segment(&frame()).await.expect_err("not loaded");
        assert!(matches!(err, TintcamError::ModelNotLoaded));
        assert!(!provider.is_ready());
    }

    #[tokio::test]
    async fn loaded_provider_converts_classification_to_mask() {
        let provider = ModelMaskProvider::new(HalfModel::default(), SegmentationOptions::default());
        provider.load().await.expect("load");
        provider.load().await.expect("second load is a no-op");
        assert_eq!(provider.model.loads.load(Ordering::SeqCst), 1);

        let mask = provider
            .segment(&frame())
            .await
            .expect("segment")
            .expect("mask");
        assert_eq!(mask.dimensions(), (4, 2));
        assert_eq!(mask.samples(), &[255, 255, 0, 0, 255, 255, 0, 0]);
    }

    #[tokio::test]
    async fn dispose_turns_segment_into_soft_miss_until_reload() {
        let provider = ModelMaskProvider::new(HalfModel::default(), SegmentationOptions::default());
        provider.load().await.expect("load");
        provider.dispose();
        provider.dispose();
        assert_eq!(provider.model.disposals.load(Ordering::SeqCst), 1);
        assert!(provider.segment(&frame()).await.expect("soft miss").is_none());

        provider.load().await.expect("reload");
        assert!(provider.segment(&frame()).await.expect("segment").is_some());
    }

    #[tokio::test]
    async fn load_failure_surfaces_as_model_load_error() {
        let model = HalfModel {
            fail_load: true,
            ..HalfModel::default()
        };
        let provider = ModelMaskProvider::new(model, SegmentationOptions::default());
        let err = provider.load().await.expect_err("load fails");
        assert!(matches!(err, TintcamError::ModelLoad(_)));
        assert!(!provider.is_ready());
    }

    #[tokio::test]
    async fn inference_failure_is_a_soft_miss() {
        let model = HalfModel {
            fail_inference: true,
            ..HalfModel::default()
        };
        let provider = ModelMaskProvider::new(model, SegmentationOptions::default());
        provider.load().await.expect("load");
        assert!(provider.segment(&frame()).await.expect("soft miss").is_none());
    }

    #[test]
    fn snapshot_writes_png() {
        let dir = std::env::temp_dir().join("tintcam-snapshot-test");
        let surface = FilteredSurface::new(3, 2);
        let path = save_snapshot(&surface, &dir).expect("save snapshot");
        assert!(path.exists());
        fs::remove_file(&path).expect("cleanup snapshot");
        assert!(save_snapshot(&FilteredSurface::default(), &dir).is_err());
    }
}
