use std::{
    fmt,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Local, TimeZone};
use tintcam_types::{Result, TintcamError};
use tracing::info;

use crate::{recorder_error, EncoderBackend};

/// Container and codec the recording session settled on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClipFormat {
    mime_type: String,
}

impl ClipFormat {
    pub fn new(mime_type: impl Into<String>) -> Self {
        Self {
            mime_type: mime_type.into(),
        }
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    /// `webm` for `video/webm;codecs=vp9`.
    pub fn container(&self) -> &str {
        let essence = self.mime_type.split(';').next().unwrap_or_default().trim();
        essence.rsplit('/').next().unwrap_or(essence)
    }

    /// Codec named in the `codecs=` parameter, if any.
    pub fn codec(&self) -> Option<&str> {
        self.mime_type
            .split(';')
            .skip(1)
            .filter_map(|param| param.trim().strip_prefix("codecs="))
            .map(|codecs| codecs.trim_matches('"'))
            .find_map(|codecs| codecs.split(',').next())
            .map(str::trim)
    }

    /// File extension for saved clips: `mp4` for any MP4 type, otherwise `webm`.
    pub fn extension(&self) -> &'static str {
        if self.mime_type.contains("mp4") {
            "mp4"
        } else {
            "webm"
        }
    }
}

impl fmt::Display for ClipFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.mime_type)
    }
}

/// Probes `preferred` and then each fallback in order, returning the first
/// type the backend can encode.
pub async fn negotiate_format<B>(
    backend: &B,
    preferred: &str,
    fallbacks: &[String],
) -> Result<ClipFormat>
where
    B: EncoderBackend + ?Sized,
{
    let mut tried: Vec<String> = Vec::with_capacity(fallbacks.len() + 1);
    for candidate in std::iter::once(preferred).chain(fallbacks.iter().map(String::as_str)) {
        if tried.iter().any(|t| t == candidate) {
            continue;
        }
        if backend.is_type_supported(candidate).await {
            if !tried.is_empty() {
                info!("Falling back to {} (unsupported: {:?})", candidate, tried);
            }
            return Ok(ClipFormat::new(candidate));
        }
        tried.push(candidate.to_string());
    }
    Err(TintcamError::UnsupportedFormat { tried })
}

/// Finished recording: every chunk concatenated in arrival order.
#[derive(Debug, Clone)]
pub struct Clip {
    data: Vec<u8>,
    format: ClipFormat,
    created_at: DateTime<Local>,
}

impl Clip {
    pub fn new(data: Vec<u8>, format: ClipFormat) -> Self {
        Self {
            data,
            format,
            created_at: Local::now(),
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn format(&self) -> &ClipFormat {
        &self.format
    }

    pub fn mime_type(&self) -> &str {
        self.format.mime_type()
    }

    pub fn created_at(&self) -> DateTime<Local> {
        self.created_at
    }

    pub fn file_name(&self) -> String {
        clip_file_name(&self.created_at, &self.format)
    }
}

/// `filter_video_YYYYMMDD_HHMMSS.<ext>` for a clip created at `now`.
pub fn clip_file_name<Tz>(now: &DateTime<Tz>, format: &ClipFormat) -> String
where
    Tz: TimeZone,
    Tz::Offset: fmt::Display,
{
    format!(
        "filter_video_{}.{}",
        now.format("%Y%m%d_%H%M%S"),
        format.extension()
    )
}

/// Writes the clip into `dir` under its generated file name. Empty clips are
/// refused so no unplayable file is left behind.
pub async fn save_clip(clip: &Clip, dir: &Path) -> Result<PathBuf> {
    if clip.is_empty() {
        return Err(recorder_error("refusing to save an empty clip"));
    }
    tokio::fs::create_dir_all(dir).await.map_err(|err| {
        recorder_error(format!("failed to create output dir {}: {err}", dir.display()))
    })?;
    let path = dir.join(clip.file_name());
    tokio::fs::write(&path, clip.data()).await?;
    info!(
        "Saved {} byte {} clip to {}",
        clip.size(),
        clip.mime_type(),
        path.display()
    );
    Ok(path)
}

/// Renders whole seconds as `MM:SS`.
pub fn format_recording_time(seconds: u64) -> String {
    format!("{:02}:{:02}", seconds / 60, seconds % 60)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tintcam_types::config::{MP4, WEBM, WEBM_VP8, WEBM_VP9};

    #[test]
    fn mime_type_parts() {
        let vp9 = ClipFormat::new(WEBM_VP9);
        assert_eq!(vp9.container(), "webm");
        assert_eq!(vp9.codec(), Some("vp9"));
        assert_eq!(vp9.extension(), "webm");

        let mp4 = ClipFormat::new(MP4);
        assert_eq!(mp4.container(), "mp4");
        assert_eq!(mp4.codec(), None);
        assert_eq!(mp4.extension(), "mp4");

        let quoted = ClipFormat::new("video/mp4; codecs=\"avc1.42E01E, mp4a.40.2\"");
        assert_eq!(quoted.codec(), Some("avc1.42E01E"));
        assert_eq!(ClipFormat::new(WEBM_VP8).to_string(), WEBM_VP8);
        assert_eq!(ClipFormat::new(WEBM).codec(), None);
    }

    #[test]
    fn clip_file_name_uses_timestamp_and_extension() {
        let now = Utc.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).single().expect("timestamp");
        assert_eq!(
            clip_file_name(&now, &ClipFormat::new(WEBM_VP9)),
            "filter_video_20240309_070501.webm"
        );
        assert_eq!(
            clip_file_name(&now, &ClipFormat::new(MP4)),
            "filter_video_20240309_070501.mp4"
        );
    }

    #[test]
    fn recording_time_is_zero_padded() {
        assert_eq!(format_recording_time(0), "00:00");
        assert_eq!(format_recording_time(65), "01:05");
        assert_eq!(format_recording_time(600), "10:00");
        assert_eq!(format_recording_time(6_000), "100:00");
    }

    #[tokio::test]
    async fn save_clip_writes_bytes() {
        let dir = std::env::temp_dir().join("tintcam-save-clip-test");
        let clip = Clip::new(vec![1, 2, 3], ClipFormat::new(WEBM));
        let path = save_clip(&clip, &dir).await.expect("save clip");
        assert_eq!(tokio::fs::read(&path).await.expect("read clip"), vec![1, 2, 3]);
        assert!(path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with("filter_video_") && n.ends_with(".webm")));
        tokio::fs::remove_file(&path).await.expect("cleanup clip");
    }

    #[tokio::test]
    async fn empty_clip_is_not_written() {
        let dir = std::env::temp_dir().join("tintcam-empty-clip-test");
        let clip = Clip::new(Vec::new(), ClipFormat::new(WEBM));
        assert!(save_clip(&clip, &dir).await.is_err());
        assert!(!dir.join(clip.file_name()).exists());
    }
}
