//! Posture Guard - webcam posture monitoring core
//!
//! Posture Guard turns pose landmarks from a camera into a stable good/bad
//! posture status through a fixed pipeline: camera polling → landmark
//! detection → geometric evaluation against a calibrated baseline →
//! stabilization → shared store.
//!
//! ## Modules
//!
//! - **Monitor**: the command surface (`start_detection`, `calibrate`, ...)
//! - **Controller / Calibration**: camera lifecycle and baseline capture
//! - **Evaluator / Stability**: per-frame verdicts and flicker suppression
//! - **Store**: observable state with partial persistence
//! - **Frames**: recorded landmark frames for offline evaluation

pub mod baseline;
pub mod calibration;
pub mod config;
pub mod controller;
pub mod detector;
pub mod error;
pub mod evaluator;
pub mod frames;
pub mod monitor;
pub mod pipeline;
pub mod platform;
pub mod stability;
pub mod storage;
pub mod store;
pub mod types;

#[cfg(feature = "cli")]
pub mod logging;

#[cfg(test)]
pub(crate) mod testing;

pub use config::PostureConfig;
pub use error::PostureError;
pub use evaluator::{angle_threshold_deg, evaluate, PostureEvaluator};
pub use monitor::PostureMonitor;
pub use pipeline::FrameProcessor;
pub use store::{Field, FieldSet, PostureState, PostureStore, Subscription};
pub use types::{BaselineMetrics, Landmark, LandmarkSet, PostureStatus};

// Schema exports
pub use frames::{FrameRecord, FRAME_SCHEMA_VERSION};

/// Crate version recorded in exported frame batches and CLI output
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Producer name for exported records
pub const PRODUCER_NAME: &str = "posture-guard";

/// Lock a mutex, recovering the data if a panicking holder poisoned it
pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
