//! Platform interfaces
//!
//! The pipeline never touches devices directly. Camera acquisition, video
//! frames, timestamps and page visibility come in through these traits so a
//! host (or a test) can supply its own implementation.

use crate::error::PostureError;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::time::Instant;

/// Pixel dimensions reported by the video sink once it is ready
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameDimensions {
    pub width: u32,
    pub height: u32,
}

/// One decoded video frame.
///
/// `sequence` increases every time the sink presents a new frame; the poller
/// uses it to avoid feeding the same frame to the detector twice.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub sequence: u64,
    pub dimensions: FrameDimensions,
    pub pixels: Arc<[u8]>,
}

/// Source of camera streams
#[async_trait]
pub trait Camera: Send + Sync {
    /// Request camera access. Permission denial or a missing device must be
    /// reported as `PostureError::CameraAccess`.
    async fn acquire(&self) -> Result<Arc<dyn VideoStream>, PostureError>;
}

/// A live camera stream bound to a video sink
#[async_trait]
pub trait VideoStream: Send + Sync {
    /// Resolve once the sink knows its dimensions
    async fn ready(&self) -> Result<FrameDimensions, PostureError>;

    /// Most recent frame presented by the sink, if any
    fn latest_frame(&self) -> Option<VideoFrame>;

    /// Stop every track and release the sink binding. Must be idempotent.
    fn stop(&self);
}

/// Millisecond timestamps for detector submissions and stability timing
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> f64;
}

/// Monotonic clock backed by the tokio timer, so paused test time applies
#[derive(Debug, Clone, Copy)]
pub struct TokioClock {
    origin: Instant,
}

impl TokioClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now_ms(&self) -> f64 {
        self.origin.elapsed().as_secs_f64() * 1_000.0
    }
}

/// Visibility of the hosting document or window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Visible,
    Hidden,
}
