use std::{fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::{frame::FilterColor, Result, TintcamError};

pub const WEBM_VP9: &str = "video/webm;codecs=vp9";
pub const WEBM_VP8: &str = "video/webm;codecs=vp8";
pub const WEBM: &str = "video/webm";
pub const MP4: &str = "video/mp4";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CameraConfig {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    /// Frames reported as not ready before the source starts delivering.
    pub warmup_frames: u32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            frame_rate: 30,
            warmup_frames: 3,
        }
    }
}

/// Resolution the model runs inference at, relative to the input frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InternalResolution {
    Low,
    #[default]
    Medium,
    High,
    Full,
}

impl InternalResolution {
    /// Pixel stride used when sampling the input frame.
    pub fn stride(self) -> u32 {
        match self {
            InternalResolution::Full => 1,
            InternalResolution::High => 2,
            InternalResolution::Medium => 4,
            InternalResolution::Low => 8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VisionConfig {
    pub segmentation_threshold: f32,
    pub internal_resolution: InternalResolution,
    pub flip_horizontal: bool,
    /// Mask samples strictly above this value are composited as foreground.
    pub foreground_threshold: u8,
    pub foreground_color: FilterColor,
    pub calibration_frames: usize,
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            segmentation_threshold: 0.5,
            internal_resolution: InternalResolution::Medium,
            flip_horizontal: false,
            foreground_threshold: 128,
            foreground_color: FilterColor::BLACK,
            calibration_frames: 15,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RenderConfig {
    pub tick_rate_hz: u32,
    /// Fresh inference is requested on one of every `segment_every` ticks.
    pub segment_every: u32,
    pub fps_window: usize,
    /// Longest a tick waits for inference before presenting with the cached mask.
    pub inference_budget_ms: Option<u64>,
    /// Drop a cached mask after this many consecutive reuses.
    pub max_reuse_ticks: Option<u32>,
    pub filter_color: FilterColor,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            tick_rate_hz: 60,
            segment_every: 2,
            fps_window: 60,
            inference_budget_ms: None,
            max_reuse_ticks: None,
            filter_color: FilterColor::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RecorderConfig {
    pub capture_fps: u32,
    pub timeslice_ms: u64,
    pub preferred_mime: String,
    /// Probed in order when the preferred type is unsupported.
    pub fallback_mimes: Vec<String>,
    /// Prefer MP4 over WebM, for players that cannot open WebM.
    pub prefer_mp4: bool,
    pub video_bits_per_second: u64,
    pub output_dir: String,
    pub ffmpeg_path: Option<String>,
}

impl RecorderConfig {
    pub fn preferred_type(&self) -> &str {
        if self.prefer_mp4 {
            MP4
        } else {
            &self.preferred_mime
        }
    }
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            capture_fps: 30,
            timeslice_ms: 100,
            preferred_mime: WEBM_VP9.into(),
            fallback_mimes: vec![WEBM_VP8.into(), WEBM.into(), MP4.into()],
            prefer_mp4: false,
            video_bits_per_second: 2_500_000,
            output_dir: "recordings".into(),
            ffmpeg_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OpsConfig {
    pub log_level: String,
    pub telemetry_dir: String,
}

impl Default for OpsConfig {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            telemetry_dir: "telemetry".into(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TintcamConfig {
    pub camera: CameraConfig,
    pub vision: VisionConfig,
    pub render: RenderConfig,
    pub recorder: RecorderConfig,
    pub ops: OpsConfig,
}

impl TintcamConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        let contents = fs::read_to_string(path_ref).map_err(|err| {
            TintcamError::Configuration(format!(
                "unable to read config file {}: {err}",
                path_ref.display()
            ))
        })?;
        toml::from_str(&contents).map_err(|err| {
            TintcamError::Configuration(format!(
                "failed to parse config file {}: {err}",
                path_ref.display()
            ))
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.camera.width == 0 || self.camera.height == 0 {
            return Err(TintcamError::Configuration(
                "camera.width and camera.height must be greater than zero".into(),
            ));
        }
        if self.camera.frame_rate == 0 {
            return Err(TintcamError::Configuration(
                "camera.frame_rate must be greater than zero".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.vision.segmentation_threshold) {
            return Err(TintcamError::Configuration(
                "vision.segmentation_threshold must be between 0.0 and 1.0".into(),
            ));
        }
        if self.vision.calibration_frames == 0 {
            return Err(TintcamError::Configuration(
                "vision.calibration_frames must be greater than zero".into(),
            ));
        }
        if self.render.tick_rate_hz == 0 {
            return Err(TintcamError::Configuration(
                "render.tick_rate_hz must be greater than zero".into(),
            ));
        }
        if self.render.segment_every == 0 {
            return Err(TintcamError::Configuration(
                "render.segment_every must be greater than zero".into(),
            ));
        }
        if self.render.fps_window == 0 {
            return Err(TintcamError::Configuration(
                "render.fps_window must be greater than zero".into(),
            ));
        }
        if self.recorder.capture_fps == 0 {
            return Err(TintcamError::Configuration(
                "recorder.capture_fps must be greater than zero".into(),
            ));
        }
        if self.recorder.timeslice_ms == 0 {
            return Err(TintcamError::Configuration(
                "recorder.timeslice_ms must be greater than zero".into(),
            ));
        }
        if self.recorder.preferred_mime.trim().is_empty() {
            return Err(TintcamError::Configuration(
                "recorder.preferred_mime must not be empty".into(),
            ));
        }
        if self.recorder.output_dir.trim().is_empty() {
            return Err(TintcamError::Configuration(
                "recorder.output_dir must not be empty".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn load_tintcam_config_from_file() {
        let temp_path = std::env::temp_dir().join("tintcam-config-test.toml");
        let config = TintcamConfig {
            camera: CameraConfig {
                width: 640,
                height: 480,
                frame_rate: 24,
                warmup_frames: 0,
            },
            vision: VisionConfig {
                internal_resolution: InternalResolution::High,
                ..VisionConfig::default()
            },
            render: RenderConfig {
                segment_every: 3,
                inference_budget_ms: Some(16),
                filter_color: FilterColor::new(0x19, 0x19, 0x70),
                ..RenderConfig::default()
            },
            recorder: RecorderConfig {
                prefer_mp4: true,
                ..RecorderConfig::default()
            },
            ops: OpsConfig {
                log_level: "debug".into(),
                telemetry_dir: "telemetry".into(),
            },
        };

        let doc = toml::to_string(&config).expect("serialize config");
        fs::write(&temp_path, doc).expect("write temp config");

        let loaded = TintcamConfig::from_file(&temp_path).expect("load config");
        assert_eq!(loaded, config);
        assert_eq!(loaded.recorder.preferred_type(), MP4);
        fs::remove_file(&temp_path).expect("cleanup temp config");
    }

    #[test]
    fn partial_file_falls_back_to_section_defaults() {
        let doc = r##"
            [render]
            filter_color = "#228B22"
        "##;
        let config: TintcamConfig = toml::from_str(doc).expect("parse partial config");
        assert_eq!(config.render.filter_color, FilterColor::new(0x22, 0x8B, 0x22));
        assert_eq!(config.render.segment_every, 2);
        assert_eq!(config.recorder.preferred_type(), WEBM_VP9);
        assert_eq!(config.recorder.fallback_mimes, vec![WEBM_VP8, WEBM, MP4]);
    }

    #[test]
    fn validate_configuration_rules() {
        let mut config = TintcamConfig::default();
        assert!(config.validate().is_ok());

        config.camera.width = 0;
        assert!(config.validate().is_err());
        config.camera.width = 1280;
        config.vision.segmentation_threshold = 1.5;
        assert!(config.validate().is_err());
        config.vision.segmentation_threshold = 0.5;
        config.render.segment_every = 0;
        assert!(config.validate().is_err());
        config.render.segment_every = 2;
        config.render.fps_window = 0;
        assert!(config.validate().is_err());
        config.render.fps_window = 60;
        config.recorder.timeslice_ms = 0;
        assert!(config.validate().is_err());
        config.recorder.timeslice_ms = 100;
        config.recorder.preferred_mime = " ".into();
        assert!(config.validate().is_err());
        config.recorder.preferred_mime = WEBM_VP9.into();
        assert!(config.validate().is_ok());
    }
}
