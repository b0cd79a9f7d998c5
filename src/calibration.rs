//! Calibration and baseline management
//!
//! Calibration is a short countdown followed by a single capture:
//! `Idle -> Countdown(n) -> Capturing -> Calibrated`, or `Failed` when no
//! usable landmark set is available at capture time. A failed capture never
//! touches the previous baseline.
//!
//! The countdown runs on a spawned task guarded by a generation number, so a
//! cancelled or superseded countdown can never commit a baseline.

use crate::config::PostureConfig;
use crate::lock;
use crate::store::PostureStore;
use crate::types::{messages, BaselineMetrics, PostureStatus};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationPhase {
    Idle,
    /// Seconds (steps) left before capture
    Countdown(u8),
    Capturing,
    Calibrated,
    Failed,
}

impl CalibrationPhase {
    pub fn is_running(self) -> bool {
        matches!(self, CalibrationPhase::Countdown(_) | CalibrationPhase::Capturing)
    }
}

/// Result of a calibration request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationStart {
    Started,
    /// A countdown is already running; the request was ignored
    AlreadyCalibrating,
    NotDetecting,
    /// No landmark set to calibrate against; failed without a countdown
    NoLandmarks,
}

pub struct CalibrationManager {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<PostureStore>,
    countdown_from: u8,
    step: Duration,
    visibility_cutoff: f32,
    generation: AtomicU64,
    phase: Mutex<CalibrationPhase>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl CalibrationManager {
    pub fn new(store: Arc<PostureStore>, config: &PostureConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                countdown_from: config.calibration.countdown_from,
                step: Duration::from_millis(config.calibration.step_ms),
                visibility_cutoff: config.visibility_cutoff,
                generation: AtomicU64::new(0),
                phase: Mutex::new(CalibrationPhase::Idle),
                task: Mutex::new(None),
            }),
        }
    }

    pub fn phase(&self) -> CalibrationPhase {
        *lock(&self.inner.phase)
    }

    /// Begin a calibration sequence. Must be called from within a tokio
    /// runtime; the countdown runs on a spawned task.
    pub fn start(&self) -> CalibrationStart {
        let inner = &self.inner;
        let mut phase = lock(&inner.phase);
        if phase.is_running() {
            debug!("calibration already running, request ignored");
            return CalibrationStart::AlreadyCalibrating;
        }

        let (detecting, has_landmarks) = inner
            .store
            .read(|s| (s.is_detecting, s.raw_landmarks.is_some()));
        if !detecting {
            inner
                .store
                .set_status(PostureStatus::good(messages::CALIBRATION_NOT_DETECTING));
            return CalibrationStart::NotDetecting;
        }
        if !has_landmarks {
            *phase = CalibrationPhase::Failed;
            inner.store.fail_calibration(messages::CALIBRATION_NO_PERSON);
            warn!("calibration refused: no landmarks detected");
            return CalibrationStart::NoLandmarks;
        }

        if !inner.store.begin_calibration(inner.countdown_from) {
            // The store saw a concurrent start or a stop
            return if inner.store.read(|s| s.is_detecting) {
                CalibrationStart::AlreadyCalibrating
            } else {
                CalibrationStart::NotDetecting
            };
        }

        let generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *phase = CalibrationPhase::Countdown(inner.countdown_from);
        drop(phase);
        info!(countdown = inner.countdown_from, "calibration started");

        let task_inner = Arc::clone(inner);
        let handle = tokio::spawn(async move {
            task_inner.run_countdown(generation).await;
        });
        if let Some(previous) = lock(&inner.task).replace(handle) {
            previous.abort();
        }
        CalibrationStart::Started
    }

    /// Abandon a running countdown. The stored baseline is kept.
    pub fn cancel(&self) {
        if self.inner.invalidate() {
            self.inner.store.set_calibrating(false);
            debug!("calibration cancelled");
        }
    }

    /// Cancel any countdown and discard the stored baseline
    pub fn clear(&self) {
        self.inner.invalidate();
        self.inner.store.clear_calibration();
        info!("calibration cleared");
    }
}

impl Inner {
    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    /// Bump the generation and stop the countdown task. Returns whether a
    /// sequence was running.
    fn invalidate(&self) -> bool {
        let was_running = {
            let mut phase = lock(&self.phase);
            self.generation.fetch_add(1, Ordering::SeqCst);
            let was_running = phase.is_running();
            if was_running {
                *phase = CalibrationPhase::Idle;
            }
            was_running
        };
        if let Some(handle) = lock(&self.task).take() {
            handle.abort();
        }
        was_running
    }

    async fn run_countdown(&self, generation: u64) {
        let mut remaining = self.countdown_from;
        while remaining > 0 {
            tokio::time::sleep(self.step).await;
            remaining -= 1;

            let mut phase = lock(&self.phase);
            if !self.is_current(generation) {
                return;
            }
            if remaining == 0 {
                *phase = CalibrationPhase::Capturing;
                break;
            }
            if !self.store.update_countdown(remaining) {
                // Calibration was dropped from the store underneath us
                *phase = CalibrationPhase::Idle;
                return;
            }
            *phase = CalibrationPhase::Countdown(remaining);
        }
        self.capture(generation);
    }

    fn capture(&self, generation: u64) {
        let mut phase = lock(&self.phase);
        if !self.is_current(generation) {
            return;
        }
        if !self.store.read(|s| s.is_calibrating) {
            *phase = CalibrationPhase::Idle;
            return;
        }

        let baseline = self
            .store
            .read(|s| s.raw_landmarks.clone())
            .and_then(|landmarks| BaselineMetrics::from_landmarks(&landmarks, self.visibility_cutoff));

        match baseline {
            Some(baseline) => {
                self.store.complete_calibration(baseline);
                *phase = CalibrationPhase::Calibrated;
                info!(
                    nose_y = baseline.nose_y,
                    nose_x = baseline.nose_x,
                    ear_shoulder_distance = baseline.ear_shoulder_distance,
                    "baseline captured"
                );
            }
            None => {
                self.store.fail_calibration(messages::CALIBRATION_NO_PERSON);
                *phase = CalibrationPhase::Failed;
                warn!("calibration failed: no usable landmarks at capture");
            }
        }
    }
}

impl Drop for CalibrationManager {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.inner.task).take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{shifted_landmarks, upright_landmarks};
    use pretty_assertions::assert_eq;

    fn detecting_store() -> Arc<PostureStore> {
        let store = Arc::new(PostureStore::new());
        store.begin_detection();
        store
    }

    async fn sleep_ms(ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_landmarks_fails_without_countdown() {
        let store = detecting_store();
        let manager = CalibrationManager::new(Arc::clone(&store), &PostureConfig::default());

        assert_eq!(manager.start(), CalibrationStart::NoLandmarks);
        assert_eq!(manager.phase(), CalibrationPhase::Failed);

        let state = store.snapshot();
        assert!(!state.is_calibrating);
        assert_eq!(state.countdown, None);
        assert_eq!(state.posture_status.message, messages::CALIBRATION_NO_PERSON);
        assert_eq!(state.baseline_metrics, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refuses_when_not_detecting() {
        let store = Arc::new(PostureStore::new());
        store.set_raw_landmarks(Some(upright_landmarks()));
        let manager = CalibrationManager::new(Arc::clone(&store), &PostureConfig::default());

        assert_eq!(manager.start(), CalibrationStart::NotDetecting);
        assert_eq!(manager.phase(), CalibrationPhase::Idle);
        assert!(!store.snapshot().is_calibrating);
    }

    #[tokio::test(start_paused = true)]
    async fn test_countdown_then_capture() {
        let store = detecting_store();
        store.set_raw_landmarks(Some(upright_landmarks()));
        let manager = CalibrationManager::new(Arc::clone(&store), &PostureConfig::default());

        assert_eq!(manager.start(), CalibrationStart::Started);
        assert_eq!(store.snapshot().countdown, Some(3));

        sleep_ms(1_100).await;
        assert_eq!(manager.phase(), CalibrationPhase::Countdown(2));
        assert_eq!(store.snapshot().posture_status.message, "Calibrating... 2");

        sleep_ms(1_000).await;
        assert_eq!(store.snapshot().countdown, Some(1));

        sleep_ms(1_000).await;
        assert_eq!(manager.phase(), CalibrationPhase::Calibrated);
        let state = store.snapshot();
        assert!(state.is_calibrated);
        assert!(!state.is_calibrating);
        assert_eq!(state.countdown, None);
        assert_eq!(
            state.baseline_metrics,
            BaselineMetrics::from_landmarks(&upright_landmarks(), 0.5)
        );
        assert_eq!(state.posture_status.message, messages::CALIBRATED);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_while_running_is_ignored() {
        let store = detecting_store();
        store.set_raw_landmarks(Some(upright_landmarks()));
        let manager = CalibrationManager::new(Arc::clone(&store), &PostureConfig::default());

        assert_eq!(manager.start(), CalibrationStart::Started);
        sleep_ms(1_500).await;
        assert_eq!(manager.start(), CalibrationStart::AlreadyCalibrating);

        // The first countdown keeps its schedule
        sleep_ms(1_600).await;
        assert_eq!(manager.phase(), CalibrationPhase::Calibrated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capture_uses_freshest_landmarks() {
        let store = detecting_store();
        store.set_raw_landmarks(Some(upright_landmarks()));
        let manager = CalibrationManager::new(Arc::clone(&store), &PostureConfig::default());
        manager.start();

        sleep_ms(2_500).await;
        let latest = shifted_landmarks(0.02, 0.05);
        store.set_raw_landmarks(Some(latest.clone()));
        sleep_ms(1_000).await;

        assert_eq!(
            store.snapshot().baseline_metrics,
            BaselineMetrics::from_landmarks(&latest, 0.5)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_capture_keeps_previous_baseline() {
        let store = detecting_store();
        let previous = BaselineMetrics::from_landmarks(&shifted_landmarks(0.1, 0.0), 0.5).unwrap();
        store.complete_calibration(previous);
        store.set_raw_landmarks(Some(upright_landmarks()));

        let manager = CalibrationManager::new(Arc::clone(&store), &PostureConfig::default());
        manager.start();
        sleep_ms(2_500).await;
        store.set_raw_landmarks(None);
        sleep_ms(1_000).await;

        assert_eq!(manager.phase(), CalibrationPhase::Failed);
        let state = store.snapshot();
        assert_eq!(state.baseline_metrics, Some(previous));
        assert!(state.is_calibrated);
        assert_eq!(state.posture_status.message, messages::CALIBRATION_NO_PERSON);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_never_commits() {
        let store = detecting_store();
        store.set_raw_landmarks(Some(upright_landmarks()));
        let manager = CalibrationManager::new(Arc::clone(&store), &PostureConfig::default());

        manager.start();
        sleep_ms(1_500).await;
        manager.cancel();
        sleep_ms(5_000).await;

        assert_eq!(manager.phase(), CalibrationPhase::Idle);
        let state = store.snapshot();
        assert_eq!(state.baseline_metrics, None);
        assert!(!state.is_calibrating);
        assert_eq!(state.countdown, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_discards_baseline_and_countdown() {
        let store = detecting_store();
        store.set_raw_landmarks(Some(upright_landmarks()));
        store.complete_calibration(BaselineMetrics::from_landmarks(&upright_landmarks(), 0.5).unwrap());
        let manager = CalibrationManager::new(Arc::clone(&store), &PostureConfig::default());

        manager.start();
        sleep_ms(500).await;
        manager.clear();
        sleep_ms(5_000).await;

        let state = store.snapshot();
        assert_eq!(state.baseline_metrics, None);
        assert!(!state.is_calibrated);
        assert!(!state.is_calibrating);
        assert_eq!(state.posture_status.message, messages::CALIBRATION_CLEARED);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopping_detection_abandons_countdown() {
        let store = detecting_store();
        store.set_raw_landmarks(Some(upright_landmarks()));
        let manager = CalibrationManager::new(Arc::clone(&store), &PostureConfig::default());

        manager.start();
        sleep_ms(500).await;
        store.end_detection(PostureStatus::good(messages::STOPPED));
        sleep_ms(5_000).await;

        assert_eq!(manager.phase(), CalibrationPhase::Idle);
        assert_eq!(store.snapshot().baseline_metrics, None);
    }
}
