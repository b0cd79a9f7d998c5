//! Shared posture state
//!
//! `PostureStore` is the single source of truth read by consumers and written
//! by the pipeline. Every write goes through a setter (or one of the compound
//! transitions), is applied under one lock, and then notifies only the
//! listeners subscribed to a field that actually changed.
//!
//! Only the baseline, the sensitivity, and the calibration flag are persisted.
//! Landmarks, camera state and errors live for the session only.

use crate::config::{clamp_sensitivity, DEFAULT_SENSITIVITY};
use crate::error::PostureError;
use crate::lock;
use crate::storage::KeyValueStorage;
use crate::types::{messages, BaselineMetrics, LandmarkSet, PostureStatus};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use tracing::{debug, warn};

/// Storage key holding the persisted document
pub const STORAGE_KEY: &str = "posture-storage";

/// Individually observable fields of the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    IsDetecting,
    IsCalibrating,
    IsLoadingDetector,
    CameraError,
    Countdown,
    PostureStatus,
    BaselineMetrics,
    RawLandmarks,
    Sensitivity,
    IsCalibrated,
}

impl Field {
    pub const ALL: [Field; 10] = [
        Field::IsDetecting,
        Field::IsCalibrating,
        Field::IsLoadingDetector,
        Field::CameraError,
        Field::Countdown,
        Field::PostureStatus,
        Field::BaselineMetrics,
        Field::RawLandmarks,
        Field::Sensitivity,
        Field::IsCalibrated,
    ];

    fn bit(self) -> u16 {
        1 << (self as u16)
    }
}

/// Set of fields, used for subscriptions and change reports
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FieldSet(u16);

impl FieldSet {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn all() -> Self {
        Field::ALL.into_iter().collect()
    }

    pub fn with(self, field: Field) -> Self {
        Self(self.0 | field.bit())
    }

    pub fn contains(self, field: Field) -> bool {
        self.0 & field.bit() != 0
    }

    pub fn intersects(self, other: FieldSet) -> bool {
        self.0 & other.0 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl FromIterator<Field> for FieldSet {
    fn from_iter<I: IntoIterator<Item = Field>>(iter: I) -> Self {
        iter.into_iter().fold(FieldSet::empty(), FieldSet::with)
    }
}

impl From<&[Field]> for FieldSet {
    fn from(fields: &[Field]) -> Self {
        fields.iter().copied().collect()
    }
}

impl<const N: usize> From<[Field; N]> for FieldSet {
    fn from(fields: [Field; N]) -> Self {
        fields.into_iter().collect()
    }
}

impl From<Field> for FieldSet {
    fn from(field: Field) -> Self {
        FieldSet::empty().with(field)
    }
}

fn persisted_fields() -> FieldSet {
    FieldSet::from([Field::BaselineMetrics, Field::Sensitivity, Field::IsCalibrated])
}

/// Snapshot of everything the store holds
#[derive(Debug, Clone, PartialEq)]
pub struct PostureState {
    pub is_detecting: bool,
    pub is_calibrating: bool,
    pub is_loading_detector: bool,
    pub camera_error: Option<String>,
    pub countdown: Option<u8>,
    pub posture_status: PostureStatus,
    pub baseline_metrics: Option<BaselineMetrics>,
    pub raw_landmarks: Option<LandmarkSet>,
    pub sensitivity: u8,
    pub is_calibrated: bool,
}

impl Default for PostureState {
    fn default() -> Self {
        Self {
            is_detecting: false,
            is_calibrating: false,
            is_loading_detector: false,
            camera_error: None,
            countdown: None,
            posture_status: PostureStatus::default(),
            baseline_metrics: None,
            raw_landmarks: None,
            sensitivity: DEFAULT_SENSITIVITY,
            is_calibrated: false,
        }
    }
}

impl PostureState {
    fn changed_fields(&self, other: &PostureState) -> FieldSet {
        let mut changed = FieldSet::empty();
        let mut mark = |differs: bool, field: Field| {
            if differs {
                changed = changed.with(field);
            }
        };
        mark(self.is_detecting != other.is_detecting, Field::IsDetecting);
        mark(self.is_calibrating != other.is_calibrating, Field::IsCalibrating);
        mark(
            self.is_loading_detector != other.is_loading_detector,
            Field::IsLoadingDetector,
        );
        mark(self.camera_error != other.camera_error, Field::CameraError);
        mark(self.countdown != other.countdown, Field::Countdown);
        mark(self.posture_status != other.posture_status, Field::PostureStatus);
        mark(
            self.baseline_metrics != other.baseline_metrics,
            Field::BaselineMetrics,
        );
        mark(self.raw_landmarks != other.raw_landmarks, Field::RawLandmarks);
        mark(self.sensitivity != other.sensitivity, Field::Sensitivity);
        mark(self.is_calibrated != other.is_calibrated, Field::IsCalibrated);
        changed
    }
}

/// The persisted subset of the state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedPosture {
    #[serde(default)]
    pub baseline_metrics: Option<BaselineMetrics>,
    #[serde(default = "default_sensitivity")]
    pub sensitivity_percentage: u8,
    #[serde(default)]
    pub is_calibrated: bool,
}

fn default_sensitivity() -> u8 {
    DEFAULT_SENSITIVITY
}

impl Default for PersistedPosture {
    fn default() -> Self {
        Self {
            baseline_metrics: None,
            sensitivity_percentage: DEFAULT_SENSITIVITY,
            is_calibrated: false,
        }
    }
}

impl PersistedPosture {
    fn from_state(state: &PostureState) -> Self {
        Self {
            baseline_metrics: state.baseline_metrics,
            sensitivity_percentage: state.sensitivity,
            is_calibrated: state.is_calibrated,
        }
    }

    /// Parse a persisted document, repairing inconsistent values
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let mut persisted: Self = serde_json::from_str(json)?;
        persisted.sensitivity_percentage = clamp_sensitivity(persisted.sensitivity_percentage);
        persisted.is_calibrated = persisted.is_calibrated && persisted.baseline_metrics.is_some();
        Ok(persisted)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Read the persisted document from storage, falling back to defaults
    pub fn load(storage: &dyn KeyValueStorage) -> Self {
        match storage.get(STORAGE_KEY) {
            Ok(Some(json)) => Self::from_json(&json).unwrap_or_else(|e| {
                warn!(error = %e, "discarding unreadable persisted posture state");
                Self::default()
            }),
            Ok(None) => Self::default(),
            Err(e) => {
                warn!(error = %e, "failed to read persisted posture state");
                Self::default()
            }
        }
    }
}

/// Called with the post-change snapshot
pub type Listener = Arc<dyn Fn(&PostureState) + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    listeners: Vec<(u64, FieldSet, Listener)>,
}

/// Keeps a listener registered; dropping it unsubscribes
pub struct Subscription {
    id: u64,
    registry: Weak<Mutex<Registry>>,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            lock(&registry).listeners.retain(|(id, _, _)| *id != self.id);
        }
    }
}

pub struct PostureStore {
    state: RwLock<PostureState>,
    registry: Arc<Mutex<Registry>>,
    storage: Option<Arc<dyn KeyValueStorage>>,
}

impl Default for PostureStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PostureStore {
    /// In-memory store without persistence
    pub fn new() -> Self {
        Self {
            state: RwLock::new(PostureState::default()),
            registry: Arc::new(Mutex::new(Registry::default())),
            storage: None,
        }
    }

    /// Store that rehydrates from, and writes back to, `storage`
    pub fn with_storage(storage: Arc<dyn KeyValueStorage>) -> Self {
        let persisted = PersistedPosture::load(storage.as_ref());
        let state = PostureState {
            baseline_metrics: persisted.baseline_metrics,
            sensitivity: persisted.sensitivity_percentage,
            is_calibrated: persisted.is_calibrated,
            ..PostureState::default()
        };

        Self {
            state: RwLock::new(state),
            registry: Arc::new(Mutex::new(Registry::default())),
            storage: Some(storage),
        }
    }

    /// Copy of the current state
    pub fn snapshot(&self) -> PostureState {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Read a projection of the state without cloning all of it
    pub fn read<R>(&self, f: impl FnOnce(&PostureState) -> R) -> R {
        f(&self.state.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Register `listener` for changes to any of `fields`
    pub fn subscribe(
        &self,
        fields: impl Into<FieldSet>,
        listener: impl Fn(&PostureState) + Send + Sync + 'static,
    ) -> Subscription {
        let mut registry = lock(&self.registry);
        let id = registry.next_id;
        registry.next_id += 1;
        registry
            .listeners
            .push((id, fields.into(), Arc::new(listener)));

        Subscription {
            id,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Write the persisted subset now and report a failed write.
    ///
    /// Setters only log storage failures. Callers whose job is to persist
    /// flush afterwards. Without storage this does nothing.
    pub fn flush(&self) -> Result<(), PostureError> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        self.write_persisted(&state)
    }

    pub fn set_detecting(&self, detecting: bool) -> FieldSet {
        self.mutate(|state| {
            state.is_detecting = detecting;
            if !detecting {
                state.is_calibrating = false;
                state.countdown = None;
            }
        })
    }

    /// Calibration requires detection; the flag is refused otherwise
    pub fn set_calibrating(&self, calibrating: bool) -> FieldSet {
        self.mutate(|state| {
            state.is_calibrating = calibrating && state.is_detecting;
            if !state.is_calibrating {
                state.countdown = None;
            }
        })
    }

    pub fn set_loading_detector(&self, loading: bool) -> FieldSet {
        self.mutate(|state| state.is_loading_detector = loading)
    }

    /// Setting an error also marks detection as not running
    pub fn set_camera_error(&self, error: Option<String>) -> FieldSet {
        self.mutate(|state| {
            if error.is_some() {
                state.is_detecting = false;
                state.is_calibrating = false;
                state.countdown = None;
            }
            state.camera_error = error;
        })
    }

    pub fn set_countdown(&self, countdown: Option<u8>) -> FieldSet {
        self.mutate(|state| state.countdown = countdown)
    }

    pub fn set_status(&self, status: PostureStatus) -> FieldSet {
        self.mutate(|state| state.posture_status = status)
    }

    pub fn set_raw_landmarks(&self, landmarks: Option<LandmarkSet>) -> FieldSet {
        self.mutate(|state| state.raw_landmarks = landmarks)
    }

    /// Store a sensitivity, clamped to the supported range. Returns the
    /// value actually stored.
    pub fn set_sensitivity(&self, percent: u8) -> u8 {
        let percent = clamp_sensitivity(percent);
        self.mutate(|state| state.sensitivity = percent);
        percent
    }

    /// Detection is running: clear errors and announce it
    pub fn begin_detection(&self) -> FieldSet {
        self.mutate(|state| {
            state.is_detecting = true;
            state.is_loading_detector = false;
            state.camera_error = None;
            state.posture_status = PostureStatus::good(messages::DETECTING);
        })
    }

    /// Detection is over: drop every transient field
    pub fn end_detection(&self, status: PostureStatus) -> FieldSet {
        self.mutate(|state| {
            state.is_detecting = false;
            state.is_calibrating = false;
            state.is_loading_detector = false;
            state.countdown = None;
            state.raw_landmarks = None;
            state.posture_status = status;
        })
    }

    /// Record a camera or detector failure and leave everything inert
    pub fn record_camera_error(&self, message: String) -> FieldSet {
        self.mutate(|state| {
            state.is_detecting = false;
            state.is_calibrating = false;
            state.is_loading_detector = false;
            state.countdown = None;
            state.raw_landmarks = None;
            state.posture_status = PostureStatus::good(messages::CAMERA_UNAVAILABLE);
            state.camera_error = Some(message);
        })
    }

    /// Enter the calibration countdown. Returns false (and changes nothing)
    /// when detection is not running or a calibration is already underway.
    pub fn begin_calibration(&self, countdown: u8) -> bool {
        let mut started = false;
        self.mutate(|state| {
            if state.is_detecting && !state.is_calibrating {
                state.is_calibrating = true;
                state.countdown = Some(countdown);
                state.posture_status = PostureStatus::good(messages::calibrating(countdown));
                started = true;
            }
        });
        started
    }

    /// Advance a running countdown. Returns false if calibration is no
    /// longer in progress.
    pub fn update_countdown(&self, remaining: u8) -> bool {
        let mut running = false;
        self.mutate(|state| {
            if state.is_calibrating {
                state.countdown = Some(remaining);
                state.posture_status = PostureStatus::good(messages::calibrating(remaining));
                running = true;
            }
        });
        running
    }

    /// Install a new baseline in one step
    pub fn complete_calibration(&self, baseline: BaselineMetrics) -> FieldSet {
        self.mutate(|state| {
            state.baseline_metrics = Some(baseline);
            state.is_calibrated = true;
            state.is_calibrating = false;
            state.countdown = None;
            state.posture_status = PostureStatus::good(messages::CALIBRATED);
        })
    }

    /// Leave calibration without touching the stored baseline
    pub fn fail_calibration(&self, message: &str) -> FieldSet {
        self.mutate(|state| {
            state.is_calibrating = false;
            state.countdown = None;
            state.posture_status = PostureStatus::good(message);
        })
    }

    /// Discard the baseline
    pub fn clear_calibration(&self) -> FieldSet {
        self.mutate(|state| {
            state.baseline_metrics = None;
            state.is_calibrated = false;
            state.is_calibrating = false;
            state.countdown = None;
            state.posture_status = PostureStatus::good(messages::CALIBRATION_CLEARED);
        })
    }

    /// Apply `f` under the write lock, persist if needed, then notify
    fn mutate(&self, f: impl FnOnce(&mut PostureState)) -> FieldSet {
        let (changed, snapshot) = {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            let before = state.clone();
            f(&mut state);

            let changed = before.changed_fields(&state);
            if changed.is_empty() {
                return changed;
            }
            if changed.intersects(persisted_fields()) {
                self.persist(&state);
            }
            (changed, state.clone())
        };

        self.notify(changed, &snapshot);
        changed
    }

    fn persist(&self, state: &PostureState) {
        if let Err(e) = self.write_persisted(state) {
            warn!(error = %e, "failed to persist posture state");
        }
    }

    fn write_persisted(&self, state: &PostureState) -> Result<(), PostureError> {
        let Some(storage) = &self.storage else {
            return Ok(());
        };
        let json = PersistedPosture::from_state(state).to_json()?;
        storage.set(STORAGE_KEY, &json)
    }

    fn notify(&self, changed: FieldSet, snapshot: &PostureState) {
        let listeners: Vec<Listener> = lock(&self.registry)
            .listeners
            .iter()
            .filter(|(_, fields, _)| fields.intersects(changed))
            .map(|(_, _, listener)| Arc::clone(listener))
            .collect();

        if !listeners.is_empty() {
            debug!(?changed, listeners = listeners.len(), "notifying store listeners");
        }
        for listener in listeners {
            listener(snapshot);
        }
    }
}
