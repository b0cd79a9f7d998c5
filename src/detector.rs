//! Landmark detector adapter
//!
//! Wraps a third-party pose model behind a small lifecycle:
//! `initialize` once, `detect` at a fixed cadence, `close` when done.
//!
//! At most one inference is in flight. Submissions made while the model is
//! busy are dropped rather than queued, and results are always delivered from
//! a spawned task, never from inside `detect`. `cancel_pending` bumps an epoch
//! so that an inference finishing after a stop cannot reach the callback.
//! Only `close` abandons a model load; a stop lets it finish for the next run.

use crate::config::DetectorOptions;
use crate::error::PostureError;
use crate::lock;
use crate::platform::VideoFrame;
use crate::types::LandmarkSet;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Receives `(landmarks, timestamp_ms)` for each completed inference.
/// `None` means the model saw no person in the frame.
pub type ResultCallback = Arc<dyn Fn(Option<LandmarkSet>, f64) + Send + Sync>;

/// The underlying pose landmark model
#[async_trait]
pub trait PoseModel: Send + Sync {
    /// Fetch and prepare the model (may download assets)
    async fn load(&self, options: &DetectorOptions) -> Result<(), PostureError>;

    /// Run inference on one frame
    async fn infer(
        &self,
        frame: &VideoFrame,
        timestamp_ms: f64,
    ) -> Result<Option<LandmarkSet>, PostureError>;

    /// Release native resources
    fn close(&self);
}

/// What happened to a `detect` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectOutcome {
    Submitted,
    /// Previous inference still running; frame dropped
    Busy,
    /// `initialize` has not completed
    NotReady,
}

enum DetectorState {
    Uninitialized,
    Initializing,
    Ready(ResultCallback),
}

pub struct LandmarkDetector {
    model: Arc<dyn PoseModel>,
    state: Mutex<DetectorState>,
    in_flight: Arc<AtomicBool>,
    epoch: Arc<AtomicU64>,
    pending: Mutex<Option<JoinHandle<()>>>,
    close_epoch: AtomicU64,
    /// Bumped whenever a load attempt settles, successful or not
    loads_settled: watch::Sender<u64>,
}

impl LandmarkDetector {
    pub fn new(model: Arc<dyn PoseModel>) -> Self {
        Self {
            model,
            state: Mutex::new(DetectorState::Uninitialized),
            in_flight: Arc::new(AtomicBool::new(false)),
            epoch: Arc::new(AtomicU64::new(0)),
            pending: Mutex::new(None),
            close_epoch: AtomicU64::new(0),
            loads_settled: watch::channel(0).0,
        }
    }

    pub fn is_initialized(&self) -> bool {
        matches!(*lock(&self.state), DetectorState::Ready(_))
    }

    /// Load the model and register the result callback.
    ///
    /// Fails with `AlreadyInitialized` until `close` is called. A load failure
    /// leaves the adapter uninitialized so the call can be retried.
    pub async fn initialize(
        &self,
        options: &DetectorOptions,
        on_result: ResultCallback,
    ) -> Result<(), PostureError> {
        {
            let mut state = lock(&self.state);
            if !matches!(*state, DetectorState::Uninitialized) {
                return Err(PostureError::AlreadyInitialized);
            }
            *state = DetectorState::Initializing;
        }

        let close_epoch = self.close_epoch.load(Ordering::SeqCst);
        let loaded = self.model.load(options).await;

        let result = {
            let mut state = lock(&self.state);
            match loaded {
                Ok(()) if self.close_epoch.load(Ordering::SeqCst) != close_epoch => {
                    // close() ran while the model was loading
                    self.model.close();
                    *state = DetectorState::Uninitialized;
                    Err(PostureError::DetectorInit(
                        "detector closed during initialization".to_string(),
                    ))
                }
                Ok(()) => {
                    *state = DetectorState::Ready(on_result);
                    info!(model = %options.model_asset_path, "pose detector initialized");
                    Ok(())
                }
                Err(e) => {
                    *state = DetectorState::Uninitialized;
                    warn!(error = %e, "pose detector failed to initialize");
                    Err(match e {
                        PostureError::DetectorInit(_) => e,
                        other => PostureError::DetectorInit(other.to_string()),
                    })
                }
            }
        };
        self.loads_settled.send_modify(|settled| *settled += 1);
        result
    }

    /// Initialize, or wait out a load another caller already started.
    ///
    /// Returns once the model is ready. If the other load fails, this call
    /// makes its own attempt.
    pub async fn ensure_initialized(
        &self,
        options: &DetectorOptions,
        on_result: ResultCallback,
    ) -> Result<(), PostureError> {
        let mut settled = self.loads_settled.subscribe();
        loop {
            match self.initialize(options, Arc::clone(&on_result)).await {
                Err(PostureError::AlreadyInitialized) if !self.is_initialized() => {
                    if settled.changed().await.is_err() {
                        return Err(PostureError::DetectorInit("detector dropped".to_string()));
                    }
                }
                Ok(()) | Err(PostureError::AlreadyInitialized) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }

    /// Submit one frame for asynchronous inference
    pub fn detect(&self, frame: VideoFrame, timestamp_ms: f64) -> DetectOutcome {
        let callback = match &*lock(&self.state) {
            DetectorState::Ready(callback) => Arc::clone(callback),
            _ => return DetectOutcome::NotReady,
        };

        if self.in_flight.swap(true, Ordering::AcqRel) {
            debug!(sequence = frame.sequence, "detector busy, frame dropped");
            return DetectOutcome::Busy;
        }

        let model = Arc::clone(&self.model);
        let in_flight = Arc::clone(&self.in_flight);
        let epoch = Arc::clone(&self.epoch);
        let submitted_epoch = epoch.load(Ordering::SeqCst);

        let handle = tokio::spawn(async move {
            let result = model.infer(&frame, timestamp_ms).await;

            if epoch.load(Ordering::SeqCst) != submitted_epoch {
                debug!(sequence = frame.sequence, "discarding stale inference");
                return;
            }
            in_flight.store(false, Ordering::Release);

            match result {
                Ok(landmarks) => callback(landmarks, timestamp_ms),
                Err(e) => warn!(error = %e, sequence = frame.sequence, "inference failed"),
            }
        });

        *lock(&self.pending) = Some(handle);
        DetectOutcome::Submitted
    }

    /// Invalidate and abort the in-flight inference, if any
    pub fn cancel_pending(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        if let Some(handle) = lock(&self.pending).take() {
            handle.abort();
        }
        self.in_flight.store(false, Ordering::Release);
    }

    /// Release the model. Safe to call any number of times.
    pub fn close(&self) {
        self.close_epoch.fetch_add(1, Ordering::SeqCst);
        self.cancel_pending();
        let previous = std::mem::replace(&mut *lock(&self.state), DetectorState::Uninitialized);
        if matches!(previous, DetectorState::Ready(_)) {
            self.model.close();
            info!("pose detector closed");
        }
    }
}

impl Drop for LandmarkDetector {
    fn drop(&mut self) {
        self.close();
    }
}
