use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::meta::DEFAULT_BATCH_SIZE;
use crate::policy::RedactionPolicy;

/// Prefix selecting the in-process simulated graph instead of real media.
pub const STUB_SCHEME: &str = "stub://";

const DEFAULT_CAPTURE_DEVICE: &str = "/dev/video0";
const DEFAULT_CAPTURE_CAPS: &str = "video/x-raw, framerate=30/1";
const DEFAULT_MUX_WIDTH: u32 = 1280;
const DEFAULT_MUX_HEIGHT: u32 = 720;
const DEFAULT_BATCHED_PUSH_TIMEOUT_US: u32 = 40_000;
const DEFAULT_OSD_FONT_SIZE: u32 = 15;
const DEFAULT_ENCODER_BITRATE: u32 = 2_000_000;
const DEFAULT_SYNTHETIC_FRAMES: u64 = 30;
const DEFAULT_CLASS_LABELS: [&str; 4] = ["face", "license_plate", "make", "model"];

// -------------------- Run configuration (command line) --------------------

/// Where frames come from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InputSource {
    /// Recorded container file, decoded through a dynamically linked decoder.
    File(PathBuf),
    /// Live capture device, statically linked.
    Capture(String),
}

impl InputSource {
    pub fn is_live(&self) -> bool {
        matches!(self, InputSource::Capture(_))
    }

    /// True for `stub://` inputs served by the simulated graph.
    pub fn is_synthetic(&self) -> bool {
        match self {
            InputSource::File(path) => path.to_string_lossy().starts_with(STUB_SCHEME),
            InputSource::Capture(device) => device.starts_with(STUB_SCHEME),
        }
    }
}

/// Where redacted frames go.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OutputSink {
    Display,
    File(PathBuf),
}

/// One run of the redaction graph.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Configuration {
    pub input: InputSource,
    pub output: OutputSink,
    pub detector_config: PathBuf,
    pub annotation_dir: Option<PathBuf>,
}

// -------------------- Pipeline settings (file + env) --------------------

#[derive(Debug, Deserialize, Default)]
struct SettingsFile {
    capture: Option<CaptureFile>,
    mux: Option<MuxFile>,
    osd_font_size: Option<u32>,
    encoder_bitrate: Option<u32>,
    policy: Option<PathBuf>,
    class_labels: Option<Vec<String>>,
    synthetic_frames: Option<u64>,
    factories: Option<FactoriesFile>,
}

#[derive(Debug, Deserialize, Default)]
struct CaptureFile {
    device: Option<String>,
    caps: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct MuxFile {
    width: Option<u32>,
    height: Option<u32>,
    batch_size: Option<u32>,
    batched_push_timeout_us: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct FactoriesFile {
    file_source: Option<String>,
    decoder: Option<String>,
    capture_source: Option<String>,
    capture_convert: Option<String>,
    converter: Option<String>,
    caps_filter: Option<String>,
    stream_mux: Option<String>,
    detector: Option<String>,
    draw: Option<String>,
    display_sink: Option<String>,
    encoder: Option<String>,
    muxer: Option<String>,
    file_sink: Option<String>,
}

/// Element factory names for every stage role.
///
/// Defaults are the DeepStream plugin names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageFactories {
    pub file_source: String,
    pub decoder: String,
    pub capture_source: String,
    pub capture_convert: String,
    /// Hardware converter used for uploads and format changes around the core.
    pub converter: String,
    pub caps_filter: String,
    pub stream_mux: String,
    pub detector: String,
    pub draw: String,
    pub display_sink: String,
    pub encoder: String,
    pub muxer: String,
    pub file_sink: String,
}

impl Default for StageFactories {
    fn default() -> Self {
        Self {
            file_source: "filesrc".to_string(),
            decoder: "decodebin".to_string(),
            capture_source: "v4l2src".to_string(),
            capture_convert: "videoconvert".to_string(),
            converter: "nvvideoconvert".to_string(),
            caps_filter: "capsfilter".to_string(),
            stream_mux: "nvstreammux".to_string(),
            detector: "nvinfer".to_string(),
            draw: "nvdsosd".to_string(),
            display_sink: "nveglglessink".to_string(),
            encoder: "avenc_mpeg4".to_string(),
            muxer: "qtmux".to_string(),
            file_sink: "filesink".to_string(),
        }
    }
}

impl StageFactories {
    fn from_file(file: FactoriesFile) -> Self {
        let d = Self::default();
        Self {
            file_source: file.file_source.unwrap_or(d.file_source),
            decoder: file.decoder.unwrap_or(d.decoder),
            capture_source: file.capture_source.unwrap_or(d.capture_source),
            capture_convert: file.capture_convert.unwrap_or(d.capture_convert),
            converter: file.converter.unwrap_or(d.converter),
            caps_filter: file.caps_filter.unwrap_or(d.caps_filter),
            stream_mux: file.stream_mux.unwrap_or(d.stream_mux),
            detector: file.detector.unwrap_or(d.detector),
            draw: file.draw.unwrap_or(d.draw),
            display_sink: file.display_sink.unwrap_or(d.display_sink),
            encoder: file.encoder.unwrap_or(d.encoder),
            muxer: file.muxer.unwrap_or(d.muxer),
            file_sink: file.file_sink.unwrap_or(d.file_sink),
        }
    }

    /// Every factory name, for registering a complete simulated backend.
    pub fn all(&self) -> Vec<&str> {
        vec![
            self.file_source.as_str(),
            self.decoder.as_str(),
            self.capture_source.as_str(),
            self.capture_convert.as_str(),
            self.converter.as_str(),
            self.caps_filter.as_str(),
            self.stream_mux.as_str(),
            self.detector.as_str(),
            self.draw.as_str(),
            self.display_sink.as_str(),
            self.encoder.as_str(),
            self.muxer.as_str(),
            self.file_sink.as_str(),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuxSettings {
    pub width: u32,
    pub height: u32,
    pub batch_size: u32,
    pub batched_push_timeout_us: u32,
}

/// Tunables that are not part of the command line.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub capture_device: String,
    pub capture_caps: String,
    pub mux: MuxSettings,
    pub osd_font_size: u32,
    pub encoder_bitrate: u32,
    pub policy_path: Option<PathBuf>,
    pub class_labels: Vec<String>,
    pub synthetic_frames: u64,
    pub factories: StageFactories,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::from_file(SettingsFile::default())
    }
}

impl PipelineSettings {
    /// Load settings from `REDACTD_CONFIG` (JSON, optional), then apply env overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("REDACTD_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_settings_file(Path::new(path))?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: SettingsFile) -> Self {
        let capture = file.capture.unwrap_or_default();
        let mux = file.mux.unwrap_or_default();
        Self {
            capture_device: capture
                .device
                .unwrap_or_else(|| DEFAULT_CAPTURE_DEVICE.to_string()),
            capture_caps: capture
                .caps
                .unwrap_or_else(|| DEFAULT_CAPTURE_CAPS.to_string()),
            mux: MuxSettings {
                width: mux.width.unwrap_or(DEFAULT_MUX_WIDTH),
                height: mux.height.unwrap_or(DEFAULT_MUX_HEIGHT),
                batch_size: mux.batch_size.unwrap_or(DEFAULT_BATCH_SIZE),
                batched_push_timeout_us: mux
                    .batched_push_timeout_us
                    .unwrap_or(DEFAULT_BATCHED_PUSH_TIMEOUT_US),
            },
            osd_font_size: file.osd_font_size.unwrap_or(DEFAULT_OSD_FONT_SIZE),
            encoder_bitrate: file.encoder_bitrate.unwrap_or(DEFAULT_ENCODER_BITRATE),
            policy_path: file.policy,
            class_labels: file.class_labels.unwrap_or_else(|| {
                DEFAULT_CLASS_LABELS
                    .iter()
                    .map(|label| label.to_string())
                    .collect()
            }),
            synthetic_frames: file.synthetic_frames.unwrap_or(DEFAULT_SYNTHETIC_FRAMES),
            factories: StageFactories::from_file(file.factories.unwrap_or_default()),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(device) = std::env::var("REDACTD_CAPTURE_DEVICE") {
            if !device.trim().is_empty() {
                self.capture_device = device;
            }
        }
        if let Ok(path) = std::env::var("REDACTD_POLICY") {
            if !path.trim().is_empty() {
                self.policy_path = Some(PathBuf::from(path));
            }
        }
        if let Ok(width) = std::env::var("REDACTD_MUX_WIDTH") {
            self.mux.width = width
                .parse()
                .map_err(|_| anyhow!("REDACTD_MUX_WIDTH must be an integer pixel count"))?;
        }
        if let Ok(height) = std::env::var("REDACTD_MUX_HEIGHT") {
            self.mux.height = height
                .parse()
                .map_err(|_| anyhow!("REDACTD_MUX_HEIGHT must be an integer pixel count"))?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.mux.width == 0 || self.mux.height == 0 {
            return Err(anyhow!("mux width and height must be greater than zero"));
        }
        if self.mux.batch_size == 0 {
            return Err(anyhow!("mux batch size must be at least 1"));
        }
        if self.mux.batch_size > DEFAULT_BATCH_SIZE {
            log::warn!(
                "mux batch size {} > 1: the frame counter advances once per batch, not per frame",
                self.mux.batch_size
            );
        }
        if self.capture_device.trim().is_empty() {
            return Err(anyhow!("capture device must not be empty"));
        }
        Ok(())
    }

    /// Policy from `policy_path`, or the compiled defaults.
    pub fn load_policy(&self) -> Result<RedactionPolicy> {
        match &self.policy_path {
            Some(path) => Ok(RedactionPolicy::load(path)?),
            None => Ok(RedactionPolicy::default()),
        }
    }
}

fn read_settings_file(path: &Path) -> Result<SettingsFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}
