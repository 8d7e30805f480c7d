use tintcam_types::frame::SegmentationMask;
use tracing::debug;

/// Holds the most recent mask and decides which ticks request a fresh one.
///
/// The cadence is a plain tick counter: with `modulus == 2` every other
/// advanced tick segments, whatever the wall-clock timing looks like.
#[derive(Debug, Clone)]
pub struct FrameSkipCache {
    modulus: u32,
    phase: u32,
    ticks: u64,
    mask: Option<SegmentationMask>,
    max_reuse_ticks: Option<u32>,
    reuse_streak: u32,
}

impl Default for FrameSkipCache {
    fn default() -> Self {
        Self::new(2, None)
    }
}

impl FrameSkipCache {
    pub fn new(modulus: u32, max_reuse_ticks: Option<u32>) -> Self {
        let modulus = modulus.max(1);
        Self {
            modulus,
            // first advance lands on phase 0
            phase: modulus - 1,
            ticks: 0,
            mask: None,
            max_reuse_ticks,
            reuse_streak: 0,
        }
    }

    pub fn modulus(&self) -> u32 {
        self.modulus
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn advance(&mut self) {
        self.phase = (self.phase + 1) % self.modulus;
        self.ticks = self.ticks.wrapping_add(1);
    }

    pub fn should_segment_this_tick(&self) -> bool {
        self.phase == 0
    }

    pub fn record_mask(&mut self, mask: SegmentationMask) {
        self.mask = Some(mask);
        self.reuse_streak = 0;
    }

    pub fn latest_mask(&self) -> Option<&SegmentationMask> {
        self.mask.as_ref()
    }

    /// Hands out the cached mask for a tick that is not presenting a fresh one.
    ///
    /// With `max_reuse_ticks` set, a mask reused more than that many times in a
    /// row is dropped and `None` is returned.
    pub fn reuse(&mut self) -> Option<SegmentationMask> {
        let mask = self.mask.clone()?;
        self.reuse_streak = self.reuse_streak.saturating_add(1);
        if let Some(limit) = self.max_reuse_ticks {
            if self.reuse_streak > limit {
                debug!("Cached mask reused {} ticks; dropping it", limit);
                self.discard();
                return None;
            }
        }
        Some(mask)
    }

    pub fn discard(&mut self) {
        self.mask = None;
        self.reuse_streak = 0;
    }
}
