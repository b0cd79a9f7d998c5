//! Error types for the posture pipeline

use thiserror::Error;

/// Errors that can occur while acquiring devices, loading the model,
/// calibrating, or reading persisted state
#[derive(Debug, Error)]
pub enum PostureError {
    #[error("Camera access failed: {0}")]
    CameraAccess(String),

    #[error("Pose detector failed to initialize: {0}")]
    DetectorInit(String),

    #[error("Pose detector is already initialized")]
    AlreadyInitialized,

    #[error("Calibration failed: {0}")]
    CalibrationFailed(String),

    #[error("Invalid landmark set: {0}")]
    InvalidLandmarks(String),

    #[error("Inference failed: {0}")]
    Inference(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Invalid JSON: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PostureError {
    /// Device and model failures the user can recover from by starting again
    pub fn is_camera_error(&self) -> bool {
        matches!(
            self,
            PostureError::CameraAccess(_) | PostureError::DetectorInit(_)
        )
    }
}
