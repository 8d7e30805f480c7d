use std::{
    fmt,
    str::FromStr,
    sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Result, TintcamError};

/// Every pixel buffer in the pipeline is tightly packed RGBA8.
pub const BYTES_PER_PIXEL: usize = 4;

fn rgba_len(width: u32, height: u32) -> usize {
    width as usize * height as usize * BYTES_PER_PIXEL
}

/// Decoded camera image handed to the pipeline by a frame source.
///
/// The pixel buffer is shared, so cloning a frame to hand it to an inference
/// task does not copy pixels.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    width: u32,
    height: u32,
    data: Arc<[u8]>,
    ready: bool,
    captured_at: DateTime<Utc>,
}

impl VideoFrame {
    pub fn from_rgba(width: u32, height: u32, data: Vec<u8>) -> Result<Self> {
        if data.len() != rgba_len(width, height) {
            return Err(TintcamError::Source(format!(
                "frame buffer holds {} bytes, expected {} for {}x{} RGBA",
                data.len(),
                rgba_len(width, height),
                width,
                height
            )));
        }
        Ok(Self {
            width,
            height,
            data: data.into(),
            ready: true,
            captured_at: Utc::now(),
        })
    }

    pub fn solid(width: u32, height: u32, rgba: [u8; 4]) -> Self {
        let data: Vec<u8> = rgba
            .iter()
            .copied()
            .cycle()
            .take(rgba_len(width, height))
            .collect();
        Self {
            width,
            height,
            data: data.into(),
            ready: true,
            captured_at: Utc::now(),
        }
    }

    /// Marks whether the source has buffered enough data for pixels to be read.
    pub fn with_ready(mut self, ready: bool) -> Self {
        self.ready = ready;
        self
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn is_ready(&self) -> bool {
        self.ready && self.width > 0 && self.height > 0
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }
}

/// Per-pixel person classification, one sample per pixel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentationMask {
    width: u32,
    height: u32,
    samples: Arc<[u8]>,
}

impl SegmentationMask {
    pub const FOREGROUND: u8 = 255;
    pub const BACKGROUND: u8 = 0;

    pub fn from_samples(width: u32, height: u32, samples: Vec<u8>) -> Result<Self> {
        let expected = width as usize * height as usize;
        if samples.len() != expected {
            return Err(TintcamError::Vision(format!(
                "mask holds {} samples, expected {} for {}x{}",
                samples.len(),
                expected,
                width,
                height
            )));
        }
        Ok(Self {
            width,
            height,
            samples: samples.into(),
        })
    }

    pub fn filled(width: u32, height: u32, value: u8) -> Self {
        Self {
            width,
            height,
            samples: vec![value; width as usize * height as usize].into(),
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn samples(&self) -> &[u8] {
        &self.samples
    }

    pub fn sample(&self, x: u32, y: u32) -> Option<u8> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.samples
            .get(y as usize * self.width as usize + x as usize)
            .copied()
    }

    /// A mask may only be composited against a frame of identical size.
    pub fn matches(&self, frame: &VideoFrame) -> bool {
        self.dimensions() == frame.dimensions()
    }

    pub fn foreground_count(&self, threshold: u8) -> usize {
        self.samples.iter().filter(|&&s| s > threshold).count()
    }
}

/// RGB color chosen by the user as the background filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FilterColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl FilterColor {
    pub const BLACK: FilterColor = FilterColor::new(0, 0, 0);

    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }
}

impl Default for FilterColor {
    /// Light gold, the first swatch of the stock palette.
    fn default() -> Self {
        FilterColor::new(0xA8, 0x79, 0x32)
    }
}

impl FromStr for FilterColor {
    type Err = TintcamError;

    fn from_str(value: &str) -> Result<Self> {
        let hex = value.trim().trim_start_matches('#');
        if hex.len() != 6 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(TintcamError::Configuration(format!(
                "invalid color '{value}', expected #RRGGBB"
            )));
        }
        let channel = |range: std::ops::Range<usize>| {
            u8::from_str_radix(&hex[range], 16).map_err(|err| {
                TintcamError::Configuration(format!("invalid color '{value}': {err}"))
            })
        };
        Ok(Self {
            r: channel(0..2)?,
            g: channel(2..4)?,
            b: channel(4..6)?,
        })
    }
}

impl TryFrom<String> for FilterColor {
    type Error = TintcamError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<FilterColor> for String {
    fn from(color: FilterColor) -> Self {
        color.to_string()
    }
}

impl fmt::Display for FilterColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:02X}{:02X}{:02X}", self.r, self.g, self.b)
    }
}

/// Output buffer the compositor draws into and the recorder captures from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilteredSurface {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
    resizes: u64,
}

impl FilteredSurface {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            pixels: vec![0; rgba_len(width, height)],
            resizes: 0,
        }
    }

    /// Resizes the backing buffer when the dimensions change.
    ///
    /// Returns `false` (and leaves the pixels alone) when the size already
    /// matches, so the resize counter only tracks real changes.
    pub fn resize(&mut self, width: u32, height: u32) -> bool {
        if self.width == width && self.height == height {
            return false;
        }
        self.width = width;
        self.height = height;
        self.pixels.clear();
        self.pixels.resize(rgba_len(width, height), 0);
        self.resizes += 1;
        true
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn is_empty(&self) -> bool {
        self.pixels.is_empty()
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn pixels_mut(&mut self) -> &mut [u8] {
        &mut self.pixels
    }

    pub fn resize_count(&self) -> u64 {
        self.resizes
    }
}

/// Shared handle to the filtered surface.
///
/// The render scheduler is the only writer; capture streams read through the
/// same handle and therefore see resizes without any extra protocol.
#[derive(Debug, Clone, Default)]
pub struct SurfaceHandle {
    inner: Arc<RwLock<FilteredSurface>>,
}

impl SurfaceHandle {
    pub fn new(surface: FilteredSurface) -> Self {
        Self {
            inner: Arc::new(RwLock::new(surface)),
        }
    }

    pub fn read(&self) -> Result<RwLockReadGuard<'_, FilteredSurface>> {
        self.inner
            .read()
            .map_err(|_| TintcamError::Capture("surface lock poisoned".into()))
    }

    pub fn write(&self) -> Result<RwLockWriteGuard<'_, FilteredSurface>> {
        self.inner
            .write()
            .map_err(|_| TintcamError::Capture("surface lock poisoned".into()))
    }

    pub fn snapshot(&self) -> Result<FilteredSurface> {
        Ok(self.read()?.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_format_filter_color() {
        let color: FilterColor = "#004D40".parse().expect("parse color");
        assert_eq!(color, FilterColor::new(0x00, 0x4D, 0x40));
        assert_eq!(color.to_string(), "#004D40");
        assert_eq!(
            "a87932".parse::<FilterColor>().expect("parse bare hex"),
            FilterColor::default()
        );
        assert!("#12345".parse::<FilterColor>().is_err());
        assert!("#GG0000".parse::<FilterColor>().is_err());
    }

    #[test]
    fn frame_rejects_wrong_buffer_length() {
        assert!(VideoFrame::from_rgba(2, 2, vec![0; 16]).is_ok());
        assert!(VideoFrame::from_rgba(2, 2, vec![0; 15]).is_err());
    }

    #[test]
    fn zero_sized_frame_is_never_ready() {
        let frame = VideoFrame::solid(0, 0, [0, 0, 0, 255]);
        assert!(!frame.is_ready());
        let frame = VideoFrame::solid(4, 4, [0, 0, 0, 255]).with_ready(false);
        assert!(!frame.is_ready());
    }

    #[test]
    fn mask_matches_frame_dimensions() {
        let frame = VideoFrame::solid(4, 3, [1, 2, 3, 255]);
        let mask = SegmentationMask::filled(4, 3, SegmentationMask::FOREGROUND);
        assert!(mask.matches(&frame));
        let other = SegmentationMask::filled(3, 4, SegmentationMask::FOREGROUND);
        assert!(!other.matches(&frame));
        assert_eq!(mask.sample(3, 2), Some(255));
        assert_eq!(mask.sample(4, 0), None);
    }

    #[test]
    fn surface_resize_counts_only_changes() {
        let mut surface = FilteredSurface::default();
        assert!(surface.resize(8, 6));
        assert!(!surface.resize(8, 6));
        assert_eq!(surface.pixels().len(), 8 * 6 * BYTES_PER_PIXEL);
        assert!(surface.resize(4, 4));
        assert_eq!(surface.resize_count(), 2);
    }
}
