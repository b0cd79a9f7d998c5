//! Test fixtures: landmark sets and fake platform/model implementations

use crate::config::DetectorOptions;
use crate::error::PostureError;
use crate::lock;
use crate::platform::{Camera, FrameDimensions, VideoFrame, VideoStream};
use crate::types::{
    Landmark, LandmarkSet, LANDMARK_COUNT, LEFT_EAR, LEFT_SHOULDER, NOSE, RIGHT_EAR,
    RIGHT_SHOULDER,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;

/// Someone sitting straight in the middle of the frame
pub(crate) fn upright_landmarks() -> LandmarkSet {
    let mut points: Vec<Landmark> = (0..LANDMARK_COUNT)
        .map(|i| Landmark::new(0.5, 0.3 + i as f32 * 0.015, 0.9))
        .collect();

    points[NOSE] = Landmark::new(0.50, 0.40, 0.99);
    points[LEFT_EAR] = Landmark::new(0.55, 0.38, 0.95);
    points[RIGHT_EAR] = Landmark::new(0.45, 0.38, 0.95);
    points[LEFT_SHOULDER] = Landmark::new(0.58, 0.60, 0.98);
    points[RIGHT_SHOULDER] = Landmark::new(0.42, 0.60, 0.98);

    LandmarkSet::new(points).unwrap()
}

/// The upright pose with every point moved by `(dx, dy)`
pub(crate) fn shifted_landmarks(dx: f32, dy: f32) -> LandmarkSet {
    let points = upright_landmarks()
        .points()
        .iter()
        .map(|p| Landmark {
            x: p.x + dx,
            y: p.y + dy,
            ..*p
        })
        .collect();
    LandmarkSet::new(points).unwrap()
}

pub(crate) fn test_frame(sequence: u64) -> VideoFrame {
    VideoFrame {
        sequence,
        dimensions: FrameDimensions {
            width: 640,
            height: 480,
        },
        pixels: Arc::from(vec![0u8; 16]),
    }
}

/// Pose model returning a configurable landmark set
pub(crate) struct FakePoseModel {
    result: Mutex<Option<LandmarkSet>>,
    fail_next_load: AtomicBool,
    load_delay: Mutex<Duration>,
    infer_delay: Mutex<Duration>,
    gate: Mutex<Option<Arc<Semaphore>>>,
    loads: AtomicUsize,
    closes: AtomicUsize,
    inferences: AtomicUsize,
}

impl FakePoseModel {
    pub(crate) fn new(result: Option<LandmarkSet>) -> Self {
        Self {
            result: Mutex::new(result),
            fail_next_load: AtomicBool::new(false),
            load_delay: Mutex::new(Duration::ZERO),
            infer_delay: Mutex::new(Duration::ZERO),
            gate: Mutex::new(None),
            loads: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            inferences: AtomicUsize::new(0),
        }
    }

    pub(crate) fn set_result(&self, result: Option<LandmarkSet>) {
        *lock(&self.result) = result;
    }

    pub(crate) fn fail_next_load(&self) {
        self.fail_next_load.store(true, Ordering::SeqCst);
    }

    pub(crate) fn set_load_delay(&self, delay: Duration) {
        *lock(&self.load_delay) = delay;
    }

    pub(crate) fn set_infer_delay(&self, delay: Duration) {
        *lock(&self.infer_delay) = delay;
    }

    /// Make every inference wait for a permit on the returned semaphore
    pub(crate) fn gate_inference(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *lock(&self.gate) = Some(Arc::clone(&gate));
        gate
    }

    pub(crate) fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub(crate) fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub(crate) fn inferences(&self) -> usize {
        self.inferences.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl crate::detector::PoseModel for FakePoseModel {
    async fn load(&self, _options: &DetectorOptions) -> Result<(), PostureError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        let delay = *lock(&self.load_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail_next_load.swap(false, Ordering::SeqCst) {
            return Err(PostureError::DetectorInit("model download failed".to_string()));
        }
        Ok(())
    }

    async fn infer(
        &self,
        _frame: &VideoFrame,
        _timestamp_ms: f64,
    ) -> Result<Option<LandmarkSet>, PostureError> {
        self.inferences.fetch_add(1, Ordering::SeqCst);

        let gate = lock(&self.gate).clone();
        if let Some(gate) = gate {
            let _permit = gate.acquire().await.ok();
        }
        let delay = *lock(&self.infer_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(lock(&self.result).clone())
    }

    fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Camera handing out `FakeStream`s
pub(crate) struct FakeCamera {
    deny: AtomicBool,
    fail_ready: AtomicBool,
    acquire_delay: Mutex<Duration>,
    ready_delay: Mutex<Duration>,
    acquisitions: AtomicUsize,
    streams: Mutex<Vec<Arc<FakeStream>>>,
}

impl FakeCamera {
    pub(crate) fn new() -> Self {
        Self {
            deny: AtomicBool::new(false),
            fail_ready: AtomicBool::new(false),
            acquire_delay: Mutex::new(Duration::ZERO),
            ready_delay: Mutex::new(Duration::ZERO),
            acquisitions: AtomicUsize::new(0),
            streams: Mutex::new(Vec::new()),
        }
    }

    /// Reject every following acquisition as a permission denial
    pub(crate) fn deny(&self) {
        self.deny.store(true, Ordering::SeqCst);
    }

    pub(crate) fn allow(&self) {
        self.deny.store(false, Ordering::SeqCst);
    }

    pub(crate) fn fail_ready(&self) {
        self.fail_ready.store(true, Ordering::SeqCst);
    }

    pub(crate) fn set_acquire_delay(&self, delay: Duration) {
        *lock(&self.acquire_delay) = delay;
    }

    pub(crate) fn set_ready_delay(&self, delay: Duration) {
        *lock(&self.ready_delay) = delay;
    }

    pub(crate) fn acquisitions(&self) -> usize {
        self.acquisitions.load(Ordering::SeqCst)
    }

    pub(crate) fn streams(&self) -> Vec<Arc<FakeStream>> {
        lock(&self.streams).clone()
    }

    pub(crate) fn all_stopped(&self) -> bool {
        lock(&self.streams).iter().all(|s| s.is_stopped())
    }
}

#[async_trait]
impl Camera for FakeCamera {
    async fn acquire(&self) -> Result<Arc<dyn VideoStream>, PostureError> {
        self.acquisitions.fetch_add(1, Ordering::SeqCst);
        let delay = *lock(&self.acquire_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.deny.load(Ordering::SeqCst) {
            return Err(PostureError::CameraAccess("Permission denied".to_string()));
        }

        let stream = Arc::new(FakeStream::new(
            *lock(&self.ready_delay),
            self.fail_ready.load(Ordering::SeqCst),
        ));
        lock(&self.streams).push(Arc::clone(&stream));
        Ok(stream)
    }
}

/// Stream presenting a new frame every 33ms of tokio time
pub(crate) struct FakeStream {
    started: Instant,
    ready_delay: Duration,
    fail_ready: bool,
    frozen_at: Mutex<Option<u64>>,
    stopped: AtomicBool,
    stop_calls: AtomicUsize,
}

impl FakeStream {
    const FRAME_PERIOD_MS: u128 = 33;

    fn new(ready_delay: Duration, fail_ready: bool) -> Self {
        Self {
            started: Instant::now(),
            ready_delay,
            fail_ready,
            frozen_at: Mutex::new(None),
            stopped: AtomicBool::new(false),
            stop_calls: AtomicUsize::new(0),
        }
    }

    fn current_sequence(&self) -> u64 {
        (self.started.elapsed().as_millis() / Self::FRAME_PERIOD_MS) as u64 + 1
    }

    /// Keep presenting the current frame from now on
    pub(crate) fn freeze(&self) {
        *lock(&self.frozen_at) = Some(self.current_sequence());
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub(crate) fn stop_calls(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VideoStream for FakeStream {
    async fn ready(&self) -> Result<FrameDimensions, PostureError> {
        if !self.ready_delay.is_zero() {
            tokio::time::sleep(self.ready_delay).await;
        }
        if self.fail_ready {
            return Err(PostureError::CameraAccess("video sink failed".to_string()));
        }
        Ok(FrameDimensions {
            width: 640,
            height: 480,
        })
    }

    fn latest_frame(&self) -> Option<VideoFrame> {
        if self.is_stopped() {
            return None;
        }
        let sequence = lock(&self.frozen_at).unwrap_or_else(|| self.current_sequence());
        Some(test_frame(sequence))
    }

    fn stop(&self) {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        self.stopped.store(true, Ordering::SeqCst);
    }
}
