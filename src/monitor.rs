//! Command surface for the UI layer
//!
//! `PostureMonitor` wires the store, the calibration manager and the detection
//! controller together and exposes the handful of commands a front end needs.
//! Everything the UI displays is read from the store.
//!
//! Store listeners run synchronously inside pipeline stages. They may read
//! the store and query phases, but must not issue monitor commands directly.
//! Forward commands to a task instead.

use crate::calibration::{CalibrationManager, CalibrationPhase, CalibrationStart};
use crate::config::PostureConfig;
use crate::controller::{ControllerPhase, DetectionController};
use crate::detector::PoseModel;
use crate::error::PostureError;
use crate::platform::{Camera, Clock, TokioClock, Visibility};
use crate::store::{FieldSet, PostureState, PostureStore, Subscription};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

pub struct PostureMonitor {
    store: Arc<PostureStore>,
    calibration: Arc<CalibrationManager>,
    controller: DetectionController,
}

impl PostureMonitor {
    /// Fails with `InvalidConfig` if the configuration does not validate
    pub fn new(
        camera: Arc<dyn Camera>,
        model: Arc<dyn PoseModel>,
        store: Arc<PostureStore>,
        config: PostureConfig,
    ) -> Result<Self, PostureError> {
        Self::with_clock(camera, model, store, Arc::new(TokioClock::new()), config)
    }

    pub fn with_clock(
        camera: Arc<dyn Camera>,
        model: Arc<dyn PoseModel>,
        store: Arc<PostureStore>,
        clock: Arc<dyn Clock>,
        config: PostureConfig,
    ) -> Result<Self, PostureError> {
        config.validate()?;
        let calibration = Arc::new(CalibrationManager::new(Arc::clone(&store), &config));
        let controller = DetectionController::new(
            camera,
            model,
            Arc::clone(&store),
            Arc::clone(&calibration),
            clock,
            config,
        )?;
        Ok(Self {
            store,
            calibration,
            controller,
        })
    }

    pub fn store(&self) -> &Arc<PostureStore> {
        &self.store
    }

    pub fn snapshot(&self) -> PostureState {
        self.store.snapshot()
    }

    pub fn subscribe(
        &self,
        fields: impl Into<FieldSet>,
        listener: impl Fn(&PostureState) + Send + Sync + 'static,
    ) -> Subscription {
        self.store.subscribe(fields, listener)
    }

    pub async fn start_detection(&self) -> Result<(), PostureError> {
        self.controller.start().await
    }

    pub fn stop_detection(&self) {
        self.controller.stop();
    }

    /// Start or stop detection. Returns whether detection is now active.
    pub async fn toggle_active(&self) -> Result<bool, PostureError> {
        if self.controller.is_active() {
            self.controller.stop();
            Ok(false)
        } else {
            self.controller.start().await?;
            Ok(self.controller.is_active())
        }
    }

    pub fn calibrate(&self) -> CalibrationStart {
        self.calibration.start()
    }

    pub fn clear_calibration(&self) {
        self.calibration.clear();
    }

    /// Returns the stored (clamped) value
    pub fn set_sensitivity(&self, percent: u8) -> u8 {
        let stored = self.store.set_sensitivity(percent);
        info!(sensitivity = stored, "sensitivity updated");
        stored
    }

    pub async fn handle_visibility(&self, visibility: Visibility) -> Result<(), PostureError> {
        self.controller.handle_visibility(visibility).await
    }

    pub fn spawn_visibility_watcher(&self, visibility: watch::Receiver<Visibility>) -> JoinHandle<()> {
        self.controller.spawn_visibility_watcher(visibility)
    }

    pub fn calibration_phase(&self) -> CalibrationPhase {
        self.calibration.phase()
    }

    pub fn controller_phase(&self) -> ControllerPhase {
        self.controller.phase()
    }

    /// Stop everything and release the pose model
    pub fn shutdown(&self) {
        self.controller.shutdown();
    }
}

impl Drop for PostureMonitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}
