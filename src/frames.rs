//! posture.frame.v1 recorded frames
//!
//! One record per detector result, as NDJSON or a JSON array. Recordings
//! drive offline evaluation and calibration through the same frame pipeline
//! the live controller uses.

use crate::error::PostureError;
use crate::types::{Landmark, LandmarkSet, LANDMARK_COUNT};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Current frame schema version
pub const FRAME_SCHEMA_VERSION: &str = "posture.frame.v1";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameRecord {
    pub schema_version: String,
    /// Optional caller-supplied id, echoed in validation reports
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_id: Option<String>,
    /// Wall-clock capture time (UTC)
    pub captured_at: DateTime<Utc>,
    /// Monotonic detector timestamp in milliseconds
    pub timestamp_ms: f64,
    /// Landmarks reported by the detector; absent when nobody was seen
    #[serde(default)]
    pub landmarks: Option<Vec<Landmark>>,
}

impl FrameRecord {
    pub fn new(
        captured_at: DateTime<Utc>,
        timestamp_ms: f64,
        landmarks: Option<&LandmarkSet>,
    ) -> Self {
        Self {
            schema_version: FRAME_SCHEMA_VERSION.to_string(),
            frame_id: None,
            captured_at,
            timestamp_ms,
            landmarks: landmarks.map(|set| set.points().to_vec()),
        }
    }

    pub fn validate(&self) -> Result<(), FrameValidationError> {
        if self.schema_version != FRAME_SCHEMA_VERSION {
            return Err(FrameValidationError::InvalidSchemaVersion {
                expected: FRAME_SCHEMA_VERSION.to_string(),
                actual: self.schema_version.clone(),
            });
        }
        if !self.timestamp_ms.is_finite() || self.timestamp_ms < 0.0 {
            return Err(FrameValidationError::InvalidTimestamp(self.timestamp_ms));
        }
        if let Some(landmarks) = &self.landmarks {
            if landmarks.len() != LANDMARK_COUNT {
                return Err(FrameValidationError::LandmarkCount {
                    expected: LANDMARK_COUNT,
                    actual: landmarks.len(),
                });
            }
            if let Some(index) = landmarks
                .iter()
                .position(|l| !(l.x.is_finite() && l.y.is_finite() && l.visibility.is_finite()))
            {
                return Err(FrameValidationError::NonFiniteLandmark(index));
            }
        }
        Ok(())
    }

    /// The record's landmarks as a pipeline input
    pub fn landmark_set(&self) -> Result<Option<LandmarkSet>, PostureError> {
        self.landmarks
            .as_ref()
            .map(|points| LandmarkSet::new(points.clone()))
            .transpose()
    }

    /// Parse a JSON string containing an array of frame records
    pub fn parse_array(json: &str) -> Result<Vec<FrameRecord>, PostureError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Parse NDJSON (newline-delimited JSON) frame records
    pub fn parse_ndjson(ndjson: &str) -> Result<Vec<FrameRecord>, PostureError> {
        let mut records = Vec::new();
        for (line_num, line) in ndjson.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let record = serde_json::from_str::<FrameRecord>(trimmed).map_err(|e| {
                PostureError::ParseError(format!("Failed to parse line {}: {}", line_num + 1, e))
            })?;
            records.push(record);
        }
        Ok(records)
    }

    /// Validate a batch, including timestamp ordering across records.
    /// Only failing records are reported.
    pub fn validate_batch(records: &[FrameRecord]) -> Vec<FrameValidation> {
        let mut previous: Option<f64> = None;
        records
            .iter()
            .enumerate()
            .filter_map(|(index, record)| {
                let mut result = record.validate();
                if result.is_ok() {
                    if let Some(previous) = previous.filter(|p| record.timestamp_ms < *p) {
                        result = Err(FrameValidationError::NonMonotonicTimestamp {
                            previous,
                            actual: record.timestamp_ms,
                        });
                    }
                    previous = Some(record.timestamp_ms);
                }
                result.err().map(|error| FrameValidation {
                    index,
                    frame_id: record.frame_id.clone(),
                    error,
                })
            })
            .collect()
    }
}

/// A record that failed validation
#[derive(Debug, Clone)]
pub struct FrameValidation {
    pub index: usize,
    pub frame_id: Option<String>,
    pub error: FrameValidationError,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FrameValidationError {
    #[error("Invalid schema version: expected {expected}, got {actual}")]
    InvalidSchemaVersion { expected: String, actual: String },

    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(f64),

    #[error("Expected {expected} landmarks, got {actual}")]
    LandmarkCount { expected: usize, actual: usize },

    #[error("Landmark {0} has a non-finite coordinate")]
    NonFiniteLandmark(usize),

    #[error("Timestamp {actual} goes backwards from {previous}")]
    NonMonotonicTimestamp { previous: f64, actual: f64 },
}
