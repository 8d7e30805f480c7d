use tintcam_types::{
    config::VisionConfig,
    frame::{FilterColor, FilteredSurface, SegmentationMask, VideoFrame, BYTES_PER_PIXEL},
    Result, TintcamError,
};

/// Paints foreground pixels in a solid color and background pixels in the
/// filter color, keeping the camera frame's alpha.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCompositor {
    threshold: u8,
    foreground: FilterColor,
}

impl Default for FrameCompositor {
    fn default() -> Self {
        Self::new(128, FilterColor::BLACK)
    }
}

impl From<&VisionConfig> for FrameCompositor {
    fn from(config: &VisionConfig) -> Self {
        Self::new(config.foreground_threshold, config.foreground_color)
    }
}

impl FrameCompositor {
    /// Samples strictly greater than `threshold` are foreground; a sample
    /// equal to the threshold is background.
    pub fn new(threshold: u8, foreground: FilterColor) -> Self {
        Self {
            threshold,
            foreground,
        }
    }

    pub fn threshold(&self) -> u8 {
        self.threshold
    }

    pub fn composite(
        &self,
        surface: &mut FilteredSurface,
        frame: &VideoFrame,
        mask: &SegmentationMask,
        filter: FilterColor,
    ) -> Result<()> {
        if !mask.matches(frame) {
            return Err(TintcamError::MaskMismatch {
                mask_width: mask.width(),
                mask_height: mask.height(),
                frame_width: frame.width(),
                frame_height: frame.height(),
            });
        }

        paint_frame(surface, frame);

        let pixels = surface.pixels_mut();
        for (px, &sample) in pixels
            .chunks_exact_mut(BYTES_PER_PIXEL)
            .zip(mask.samples())
        {
            let color = if sample > self.threshold {
                self.foreground
            } else {
                filter
            };
            px[0] = color.r;
            px[1] = color.g;
            px[2] = color.b;
        }
        Ok(())
    }
}

/// Sizes the surface to the frame and copies the raw camera pixels into it.
pub(crate) fn paint_frame(surface: &mut FilteredSurface, frame: &VideoFrame) {
    surface.resize(frame.width(), frame.height());
    surface.pixels_mut().copy_from_slice(frame.data());
}
