//! Camera and detection lifecycle
//!
//! `DetectionController` owns the camera stream, the polling task and the
//! landmark detector. A run goes `Stopped -> Starting -> Running -> Stopped`.
//!
//! Every run is tagged with a generation number. `stop` bumps it, so a
//! `start` suspended on the camera, the video sink, or the model load notices
//! on resumption that it was cancelled and releases what it acquired. The
//! detector's own epoch guarantees that any result it delivers was submitted
//! after the last stop, i.e. during the current run.
//!
//! Lock order is `transition`, then `run`, then `processor`. Store writes
//! happen under `transition` (or `processor`) but never under `run`, so store
//! listeners may query the controller phase.

use crate::calibration::CalibrationManager;
use crate::config::PostureConfig;
use crate::detector::{DetectOutcome, LandmarkDetector, PoseModel, ResultCallback};
use crate::error::PostureError;
use crate::lock;
use crate::pipeline::FrameProcessor;
use crate::platform::{Camera, Clock, VideoStream, Visibility};
use crate::store::PostureStore;
use crate::types::{messages, LandmarkSet, PostureStatus};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerPhase {
    Stopped,
    Starting,
    Running,
}

struct RunState {
    phase: ControllerPhase,
    session_id: Option<Uuid>,
    stream: Option<Arc<dyn VideoStream>>,
    poller: Option<JoinHandle<()>>,
}

struct Inner {
    camera: Arc<dyn Camera>,
    detector: LandmarkDetector,
    store: Arc<PostureStore>,
    calibration: Arc<CalibrationManager>,
    clock: Arc<dyn Clock>,
    config: PostureConfig,
    generation: AtomicU64,
    /// Serializes state transitions together with their store updates
    transition: Mutex<()>,
    run: Mutex<RunState>,
    /// Set while detector results should reach the pipeline
    running: AtomicBool,
    processor: Mutex<FrameProcessor>,
    resume_on_visible: AtomicBool,
}

/// Cheap to clone; clones share the same run
#[derive(Clone)]
pub struct DetectionController {
    inner: Arc<Inner>,
}

impl DetectionController {
    /// Fails with `InvalidConfig` if the configuration does not validate
    pub fn new(
        camera: Arc<dyn Camera>,
        model: Arc<dyn PoseModel>,
        store: Arc<PostureStore>,
        calibration: Arc<CalibrationManager>,
        clock: Arc<dyn Clock>,
        config: PostureConfig,
    ) -> Result<Self, PostureError> {
        config.validate()?;
        let processor = FrameProcessor::new(&config);
        Ok(Self {
            inner: Arc::new(Inner {
                camera,
                detector: LandmarkDetector::new(model),
                store,
                calibration,
                clock,
                config,
                generation: AtomicU64::new(0),
                transition: Mutex::new(()),
                run: Mutex::new(RunState {
                    phase: ControllerPhase::Stopped,
                    session_id: None,
                    stream: None,
                    poller: None,
                }),
                running: AtomicBool::new(false),
                processor: Mutex::new(processor),
                resume_on_visible: AtomicBool::new(false),
            }),
        })
    }

    pub fn phase(&self) -> ControllerPhase {
        lock(&self.inner.run).phase
    }

    pub fn is_active(&self) -> bool {
        self.phase() != ControllerPhase::Stopped
    }

    /// Id of the current run, for correlating log output
    pub fn session_id(&self) -> Option<Uuid> {
        lock(&self.inner.run).session_id
    }

    /// Acquire the camera and start polling frames into the detector.
    ///
    /// Does nothing unless stopped. Failures are also recorded in the store
    /// as `camera_error`, leaving the controller stopped with nothing held.
    pub async fn start(&self) -> Result<(), PostureError> {
        let inner = &self.inner;
        let (generation, session_id) = {
            let mut run = lock(&inner.run);
            if run.phase != ControllerPhase::Stopped {
                debug!(phase = ?run.phase, "start ignored");
                return Ok(());
            }
            let generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
            let session_id = Uuid::new_v4();
            run.phase = ControllerPhase::Starting;
            run.session_id = Some(session_id);
            (generation, session_id)
        };

        info!(session = %session_id, "starting detection");
        inner.store.set_status(PostureStatus::good(messages::STARTING));

        match inner.start_run(generation).await {
            Ok(true) => {
                info!(session = %session_id, "detection running");
                Ok(())
            }
            Ok(false) => {
                debug!(session = %session_id, "start cancelled by stop");
                Ok(())
            }
            Err(e) => {
                inner.fail_start(generation, &e);
                Err(e)
            }
        }
    }

    /// Stop detection. Idempotent; safe to call at any point, including
    /// while `start` is suspended.
    pub fn stop(&self) {
        self.inner.resume_on_visible.store(false, Ordering::SeqCst);
        self.inner.halt(messages::STOPPED);
    }

    /// Pause on hide, resume on show if the pause was ours
    pub async fn handle_visibility(&self, visibility: Visibility) -> Result<(), PostureError> {
        match visibility {
            Visibility::Hidden => {
                if self.inner.halt(messages::PAUSED) {
                    self.inner.resume_on_visible.store(true, Ordering::SeqCst);
                    info!("detection paused while hidden");
                }
                Ok(())
            }
            Visibility::Visible => {
                if self.inner.resume_on_visible.swap(false, Ordering::SeqCst) {
                    info!("resuming detection");
                    self.start().await
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Follow a visibility channel until its sender goes away
    pub fn spawn_visibility_watcher(
        &self,
        mut visibility: watch::Receiver<Visibility>,
    ) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            while visibility.changed().await.is_ok() {
                let current = *visibility.borrow_and_update();
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let controller = DetectionController { inner };
                if let Err(e) = controller.handle_visibility(current).await {
                    warn!(error = %e, "failed to resume detection");
                }
            }
        })
    }

    /// Stop and release the pose model
    pub fn shutdown(&self) {
        self.stop();
        self.inner.detector.close();
    }
}

impl Inner {
    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    /// The body of `start`. `Ok(false)` means a stop cancelled it.
    async fn start_run(self: &Arc<Self>, generation: u64) -> Result<bool, PostureError> {
        let stream = self.camera.acquire().await?;
        {
            let mut run = lock(&self.run);
            if !self.is_current(generation) {
                drop(run);
                stream.stop();
                return Ok(false);
            }
            run.stream = Some(Arc::clone(&stream));
        }

        let timeout = self.config.camera_ready_timeout();
        let dimensions = match tokio::time::timeout(timeout, stream.ready()).await {
            Ok(ready) => ready?,
            Err(_) => {
                return Err(PostureError::CameraAccess(format!(
                    "video did not become ready within {}ms",
                    timeout.as_millis()
                )))
            }
        };
        if !self.is_current(generation) {
            return Ok(false);
        }
        debug!(width = dimensions.width, height = dimensions.height, "video ready");

        if !self.detector.is_initialized() {
            self.store.set_loading_detector(true);
            self.store
                .set_status(PostureStatus::good(messages::LOADING_DETECTOR));

            // A load left over from a cancelled start is awaited, not skipped
            let callback = result_callback(Arc::downgrade(self));
            match self
                .detector
                .ensure_initialized(&self.config.detector, callback)
                .await
            {
                Ok(()) => {}
                Err(e) if self.is_current(generation) => return Err(e),
                Err(_) => return Ok(false),
            }
        }

        let _transition = lock(&self.transition);
        {
            let mut run = lock(&self.run);
            if !self.is_current(generation) {
                drop(run);
                stream.stop();
                return Ok(false);
            }

            lock(&self.processor).reset();
            run.phase = ControllerPhase::Running;
            self.running.store(true, Ordering::SeqCst);
            run.poller = Some(tokio::spawn(poll_frames(
                Arc::downgrade(self),
                stream,
                generation,
                self.config.poll_interval(),
            )));
        }
        self.store.begin_detection();
        Ok(true)
    }

    fn fail_start(&self, generation: u64, error: &PostureError) {
        let transition = lock(&self.transition);
        let stream = {
            let mut run = lock(&self.run);
            if !self.is_current(generation) {
                return;
            }
            self.generation.fetch_add(1, Ordering::SeqCst);
            run.phase = ControllerPhase::Stopped;
            run.session_id = None;
            run.stream.take()
        };
        self.store.record_camera_error(error.to_string());
        drop(transition);

        if let Some(stream) = stream {
            stream.stop();
        }
        warn!(error = %error, "detection failed to start");
    }

    /// Tear the current run down. Returns false if there was nothing to stop.
    fn halt(&self, message: &str) -> bool {
        let transition = lock(&self.transition);
        let (stream, poller, session_id) = {
            let mut run = lock(&self.run);
            if run.phase == ControllerPhase::Stopped {
                return false;
            }
            self.generation.fetch_add(1, Ordering::SeqCst);
            run.phase = ControllerPhase::Stopped;
            self.running.store(false, Ordering::SeqCst);
            (run.stream.take(), run.poller.take(), run.session_id.take())
        };

        self.detector.cancel_pending();
        self.calibration.cancel();
        // Waits out a result that is mid-pipeline
        lock(&self.processor).reset();
        self.store.end_detection(PostureStatus::good(message));
        drop(transition);

        if let Some(poller) = poller {
            poller.abort();
        }
        if let Some(stream) = stream {
            stream.stop();
        }
        if let Some(session_id) = session_id {
            info!(session = %session_id, "detection stopped");
        }
        true
    }

    fn on_result(&self, landmarks: Option<LandmarkSet>, timestamp_ms: f64) {
        let mut processor = lock(&self.processor);
        if !self.running.load(Ordering::SeqCst) {
            debug!("discarding detector result outside a run");
            return;
        }
        processor.process(&self.store, landmarks, timestamp_ms);
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let run = lock(&self.run);
        if let Some(poller) = &run.poller {
            poller.abort();
        }
        if let Some(stream) = &run.stream {
            stream.stop();
        }
    }
}

fn result_callback(inner: Weak<Inner>) -> ResultCallback {
    Arc::new(move |landmarks, timestamp_ms| {
        if let Some(inner) = inner.upgrade() {
            inner.on_result(landmarks, timestamp_ms);
        }
    })
}

/// Submit each new frame to the detector at a fixed cadence
async fn poll_frames(
    weak: Weak<Inner>,
    stream: Arc<dyn VideoStream>,
    generation: u64,
    period: Duration,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut last_sequence: Option<u64> = None;

    loop {
        ticker.tick().await;
        let Some(inner) = weak.upgrade() else {
            return;
        };
        if !inner.is_current(generation) {
            return;
        }

        let Some(frame) = stream.latest_frame() else {
            continue;
        };
        if last_sequence.is_some_and(|last| frame.sequence <= last) {
            continue;
        }

        let sequence = frame.sequence;
        match inner.detector.detect(frame, inner.clock.now_ms()) {
            DetectOutcome::Submitted => last_sequence = Some(sequence),
            DetectOutcome::Busy => {}
            DetectOutcome::NotReady => warn!("detector not ready, frame skipped"),
        }
    }
}
