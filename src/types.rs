use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub video: VideoConfig,
    pub detector: DetectorConfig,
    pub ocr: OcrConfig,
    pub analysis: AnalysisConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoConfig {
    pub input_dir: String,
    pub output_dir: String,
    /// Frames wider than this are scaled down before encoding.
    pub max_output_width: i32,
    /// Ordered fourcc fallback chain for the output writer.
    pub codec_chain: Vec<String>,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            input_dir: "videos".to_string(),
            output_dir: "output".to_string(),
            max_output_width: 1920,
            codec_chain: vec!["vp09".to_string(), "vp80".to_string(), "mp4v".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    pub model_path: String,
    pub confidence_threshold: f32,
    pub nms_iou_threshold: f32,
    /// Minimum IoU to keep an identity across analyzed frames.
    pub match_iou_threshold: f32,
    /// Analyzed frames an identity survives without a detection.
    pub max_coast_frames: u32,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            model_path: "models/yolov8s.onnx".to_string(),
            confidence_threshold: 0.30,
            nms_iou_threshold: 0.45,
            match_iou_threshold: 0.20,
            max_coast_frames: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OcrConfig {
    pub model_path: String,
    /// Minimum recognition confidence for a read to enter the vote.
    pub accept_threshold: f32,
    /// OCR attempts per track before sampling stops.
    pub max_attempts: u32,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            model_path: "models/plate_rec.onnx".to_string(),
            accept_threshold: 0.30,
            max_attempts: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Only every Nth raw frame is analyzed.
    pub frame_skip: u64,
    /// Analyzed-frame observations required before a track is counted.
    pub lock_threshold: u32,
    /// OCR is sampled every this-many analyzed observations of a track.
    pub ocr_interval: u32,
    /// Raw frames of absence before a locked track is finalized.
    pub stale_after_frames: u64,
    /// Raw-frame cadence of periodic progress pushes.
    pub progress_interval: u64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            frame_skip: 5,
            lock_threshold: 5,
            ocr_interval: 5,
            stale_after_frames: 15,
            progress_interval: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "traffic_census=info,ort=warn".to_string(),
        }
    }
}

/// Vehicle categories the pipeline counts. COCO ids 2/3/7 map onto these;
/// everything else is dropped at the detector boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VehicleClass {
    Car,
    Bike,
    Truck,
}

impl VehicleClass {
    pub fn from_coco_id(id: usize) -> Option<Self> {
        match id {
            2 => Some(Self::Car),
            3 => Some(Self::Bike),
            7 => Some(Self::Truck),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Car => "Car",
            Self::Bike => "Bike",
            Self::Truck => "Truck",
        }
    }
}

/// Discrete color palette for vehicle classification. `Blue` doubles as the
/// default label when no range clears the coverage bar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VehicleColor {
    White,
    Black,
    Red,
    Blue,
    Gray,
}

impl VehicleColor {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::White => "White",
            Self::Black => "Black",
            Self::Red => "Red",
            Self::Blue => "Blue",
            Self::Gray => "Gray",
        }
    }
}

/// One tracked detection from an analyzed frame. `track_id` is opaque and
/// owned by the tracker; it persists only while the tracker can maintain
/// correspondence across analyzed frames.
#[derive(Debug, Clone)]
pub struct Observation {
    pub track_id: i64,
    pub class: VehicleClass,
    /// [x1, y1, x2, y2] in output-frame pixels.
    pub bbox: [f32; 4],
    pub confidence: f32,
}

/// A single accepted OCR result.
#[derive(Debug, Clone, PartialEq)]
pub struct PlateRead {
    pub text: String,
    pub confidence: f32,
}

pub const PLATE_NOT_DETECTED: &str = "Not Detected";
