use thiserror::Error;

pub type Result<T, E = TintcamError> = std::result::Result<T, E>;

/// Unified error type covering the filtering pipeline and the clip recorder.
#[derive(Debug, Error)]
pub enum TintcamError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("frame source error: {0}")]
    Source(String),
    #[error("model load error: {0}")]
    ModelLoad(String),
    #[error("segmentation requested before the model was loaded")]
    ModelNotLoaded,
    #[error("vision error: {0}")]
    Vision(String),
    #[error("mask {mask_width}x{mask_height} does not match frame {frame_width}x{frame_height}")]
    MaskMismatch {
        mask_width: u32,
        mask_height: u32,
        frame_width: u32,
        frame_height: u32,
    },
    #[error("render error: {0}")]
    Render(String),
    #[error("no supported video format found (tried {tried:?})")]
    UnsupportedFormat { tried: Vec<String> },
    #[error("recorder not initialized")]
    NotInitialized,
    #[error("recording already in progress")]
    AlreadyRecording,
    #[error("recording not in progress")]
    NotRecording,
    #[error("encoder error: {0}")]
    Encoder(String),
    #[error("capture error: {0}")]
    Capture(String),
    #[error("operational error: {0}")]
    Ops(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TintcamError {
    /// Usage errors are raised by calling recorder operations out of order.
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            TintcamError::NotInitialized
                | TintcamError::AlreadyRecording
                | TintcamError::NotRecording
                | TintcamError::ModelNotLoaded
        )
    }
}
