//! Runtime configuration
//!
//! All tunable constants of the pipeline live here with their defaults.
//! Configuration files are plain JSON; missing fields fall back to defaults.

use crate::error::PostureError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Lowest accepted sensitivity percentage
pub const MIN_SENSITIVITY: u8 = 5;
/// Highest accepted sensitivity percentage
pub const MAX_SENSITIVITY: u8 = 30;
/// Sensitivity used until the user picks one
pub const DEFAULT_SENSITIVITY: u8 = 15;

/// Default versioned location of the pose landmarker model
pub const DEFAULT_MODEL_ASSET_PATH: &str =
    "https://storage.googleapis.com/mediapipe-models/pose_landmarker/pose_landmarker_lite/float16/1/pose_landmarker_lite.task";

/// Clamp a requested sensitivity into the supported range
pub fn clamp_sensitivity(percent: u8) -> u8 {
    percent.clamp(MIN_SENSITIVITY, MAX_SENSITIVITY)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PostureConfig {
    /// Interval between frame submissions to the detector
    pub poll_interval_ms: u64,
    /// How long to wait for the video sink to report dimensions
    pub camera_ready_timeout_ms: u64,
    /// Landmarks below this visibility are treated as missing
    pub visibility_cutoff: f32,
    pub calibration: CalibrationConfig,
    pub stability: StabilityConfig,
    pub detector: DetectorOptions,
}

impl Default for PostureConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 200,
            camera_ready_timeout_ms: 10_000,
            visibility_cutoff: 0.5,
            calibration: CalibrationConfig::default(),
            stability: StabilityConfig::default(),
            detector: DetectorOptions::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Countdown start value, decremented once per step
    pub countdown_from: u8,
    pub step_ms: u64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            countdown_from: 3,
            step_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StabilityConfig {
    /// A good/bad flip must be observed this long before it is shown
    pub confirm_ms: u64,
    /// Minimum spacing between message-only updates
    pub message_dwell_ms: u64,
}

impl Default for StabilityConfig {
    fn default() -> Self {
        Self {
            confirm_ms: 1_500,
            message_dwell_ms: 1_000,
        }
    }
}

/// Options handed to the pose model when it is loaded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorOptions {
    pub model_asset_path: String,
    pub num_poses: u8,
    pub min_pose_detection_confidence: f32,
    pub min_pose_presence_confidence: f32,
    pub min_tracking_confidence: f32,
    pub use_gpu: bool,
}

impl Default for DetectorOptions {
    fn default() -> Self {
        Self {
            model_asset_path: DEFAULT_MODEL_ASSET_PATH.to_string(),
            num_poses: 1,
            min_pose_detection_confidence: 0.5,
            min_pose_presence_confidence: 0.5,
            min_tracking_confidence: 0.5,
            use_gpu: true,
        }
    }
}

impl PostureConfig {
    /// Load and validate a JSON configuration file
    pub fn load(path: &Path) -> Result<Self, PostureError> {
        let content = fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn from_json(json: &str) -> Result<Self, PostureError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String, PostureError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), PostureError> {
        if !(50..=1_000).contains(&self.poll_interval_ms) {
            return Err(PostureError::InvalidConfig(format!(
                "poll_interval_ms must be within 50..=1000, got {}",
                self.poll_interval_ms
            )));
        }
        if !(0.0..=1.0).contains(&self.visibility_cutoff) {
            return Err(PostureError::InvalidConfig(format!(
                "visibility_cutoff must be within 0..=1, got {}",
                self.visibility_cutoff
            )));
        }
        if self.calibration.countdown_from == 0 || self.calibration.step_ms == 0 {
            return Err(PostureError::InvalidConfig(
                "calibration countdown and step must be non-zero".to_string(),
            ));
        }
        if self.camera_ready_timeout_ms == 0 {
            return Err(PostureError::InvalidConfig(
                "camera_ready_timeout_ms must be non-zero".to_string(),
            ));
        }
        if self.detector.model_asset_path.is_empty() {
            return Err(PostureError::InvalidConfig(
                "detector.model_asset_path is empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn camera_ready_timeout(&self) -> Duration {
        Duration::from_millis(self.camera_ready_timeout_ms)
    }
}
