//! Core types for the posture pipeline
//!
//! This module defines the data structures that flow through each stage of the
//! pipeline: landmark sets from the detector, calibrated baseline metrics, the
//! per-frame evaluation, and the status published to consumers.

use crate::error::PostureError;
use serde::{Deserialize, Serialize};
use std::ops::Index;
use std::sync::Arc;

/// Number of keypoints in a BlazePose landmark set
pub const LANDMARK_COUNT: usize = 33;

pub const NOSE: usize = 0;
pub const LEFT_EAR: usize = 7;
pub const RIGHT_EAR: usize = 8;
pub const LEFT_SHOULDER: usize = 11;
pub const RIGHT_SHOULDER: usize = 12;

/// A single tracked body keypoint
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Landmark {
    /// Horizontal position, normalized to the frame width (0-1)
    pub x: f32,
    /// Vertical position, normalized to the frame height (0-1)
    pub y: f32,
    /// Relative depth (model specific, unused by the evaluator)
    #[serde(default)]
    pub z: f32,
    /// Detection confidence (0-1)
    #[serde(default = "full_visibility")]
    pub visibility: f32,
}

fn full_visibility() -> f32 {
    1.0
}

impl Landmark {
    pub fn new(x: f32, y: f32, visibility: f32) -> Self {
        Self {
            x,
            y,
            z: 0.0,
            visibility,
        }
    }

    pub fn is_visible(&self, cutoff: f32) -> bool {
        self.visibility >= cutoff && self.x.is_finite() && self.y.is_finite()
    }
}

/// One frame's worth of landmarks.
///
/// The set is immutable once built and cheap to clone; each detector result
/// replaces the previous set wholesale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Landmark>", into = "Vec<Landmark>")]
pub struct LandmarkSet {
    points: Arc<[Landmark]>,
}

impl LandmarkSet {
    /// Build a landmark set, rejecting anything that is not a full skeleton
    pub fn new(points: Vec<Landmark>) -> Result<Self, PostureError> {
        if points.len() != LANDMARK_COUNT {
            return Err(PostureError::InvalidLandmarks(format!(
                "expected {} landmarks, got {}",
                LANDMARK_COUNT,
                points.len()
            )));
        }
        Ok(Self {
            points: points.into(),
        })
    }

    /// Return the landmark at `index` if it clears the visibility cutoff
    pub fn visible(&self, index: usize, cutoff: f32) -> Option<&Landmark> {
        self.points.get(index).filter(|l| l.is_visible(cutoff))
    }

    pub fn points(&self) -> &[Landmark] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

impl Index<usize> for LandmarkSet {
    type Output = Landmark;

    fn index(&self, index: usize) -> &Self::Output {
        &self.points[index]
    }
}

impl TryFrom<Vec<Landmark>> for LandmarkSet {
    type Error = PostureError;

    fn try_from(points: Vec<Landmark>) -> Result<Self, Self::Error> {
        Self::new(points)
    }
}

impl From<LandmarkSet> for Vec<Landmark> {
    fn from(set: LandmarkSet) -> Self {
        set.points.to_vec()
    }
}

/// Snapshot of a "good" resting posture captured at calibration time.
///
/// Always replaced as a whole; there are no partial updates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BaselineMetrics {
    /// Nose vertical position (0-1)
    pub nose_y: f32,
    /// Nose horizontal position (0-1)
    pub nose_x: f32,
    /// Horizontal ear-to-shoulder distance, averaged over visible sides
    pub ear_shoulder_distance: f32,
}

/// Status shown to consumers. The message always says why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostureStatus {
    pub is_good: bool,
    pub message: String,
}

impl PostureStatus {
    pub fn good(message: impl Into<String>) -> Self {
        Self {
            is_good: true,
            message: message.into(),
        }
    }

    pub fn bad(message: impl Into<String>) -> Self {
        Self {
            is_good: false,
            message: message.into(),
        }
    }
}

impl Default for PostureStatus {
    fn default() -> Self {
        Self::good(messages::IDLE)
    }
}

/// Angles derived from the landmark deviation against the baseline (degrees)
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostureAngles {
    /// Positive when the head drops below the calibrated position
    pub neck_pitch: f32,
    /// Magnitude of the lean away from the calibrated alignment
    pub torso_angle: f32,
}

/// Raw, per-frame verdict produced by the evaluator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Evaluation {
    pub status: PostureStatus,
    pub angles: PostureAngles,
}

/// Messages shared by the pipeline stages
pub mod messages {
    pub const IDLE: &str = "Posture detection is off";
    pub const STARTING: &str = "Starting camera...";
    pub const LOADING_DETECTOR: &str = "Loading pose model...";
    pub const DETECTING: &str = "Detecting posture...";
    pub const STOPPED: &str = "Detection stopped";
    pub const PAUSED: &str = "Detection paused while the window is hidden";
    pub const CAMERA_UNAVAILABLE: &str = "Camera unavailable";
    pub const NO_PERSON: &str = "No person detected";
    pub const NO_BASELINE: &str = "Calibrate to start posture tracking";
    pub const POSTURE_OK: &str = "Posture OK";
    pub const CALIBRATED: &str = "Calibration complete. Posture tracking active";
    pub const CALIBRATION_CLEARED: &str = "Calibration cleared. Calibrate to track posture";
    pub const CALIBRATION_NO_PERSON: &str =
        "Calibration failed: sit in view of the camera and try again";
    pub const CALIBRATION_NOT_DETECTING: &str = "Start detection before calibrating";

    pub fn calibrating(remaining: u8) -> String {
        format!("Calibrating... {}", remaining)
    }
}
