//! Frame pipeline
//!
//! Carries one detector result through the per-frame stages:
//! 1. Store the raw landmark set (calibration reads the freshest one)
//! 2. Evaluate it against the baseline and sensitivity
//! 3. Stabilize the verdict
//! 4. Publish whatever the stability layer lets through
//!
//! While a calibration countdown runs the countdown owns the status, so the
//! pipeline keeps landmarks flowing but publishes nothing.

use crate::config::PostureConfig;
use crate::evaluator::PostureEvaluator;
use crate::stability::StabilityFilter;
use crate::store::PostureStore;
use crate::types::{BaselineMetrics, Evaluation, LandmarkSet, PostureStatus};
use tracing::debug;

/// Stateful per-run processor. One instance per detection run.
pub struct FrameProcessor {
    evaluator: PostureEvaluator,
    stability: StabilityFilter,
    last_baseline: Option<BaselineMetrics>,
    was_calibrating: bool,
    last_evaluation: Option<Evaluation>,
}

impl Default for FrameProcessor {
    fn default() -> Self {
        Self::new(&PostureConfig::default())
    }
}

impl FrameProcessor {
    pub fn new(config: &PostureConfig) -> Self {
        Self {
            evaluator: PostureEvaluator::from_config(config),
            stability: StabilityFilter::new(config.stability.clone()),
            last_baseline: None,
            was_calibrating: false,
            last_evaluation: None,
        }
    }

    /// Process one detector result observed at `now_ms`.
    ///
    /// Returns the status written to the store, if any.
    pub fn process(
        &mut self,
        store: &PostureStore,
        landmarks: Option<LandmarkSet>,
        now_ms: f64,
    ) -> Option<PostureStatus> {
        // Stage 1: raw landmarks
        store.set_raw_landmarks(landmarks.clone());

        let (baseline, sensitivity, calibrating) =
            store.read(|s| (s.baseline_metrics, s.sensitivity, s.is_calibrating));

        if calibrating {
            self.was_calibrating = true;
            return None;
        }

        // A new baseline or a finished calibration invalidates what is shown
        if self.was_calibrating || baseline != self.last_baseline {
            self.stability.reset();
            self.was_calibrating = false;
            self.last_baseline = baseline;
        }

        // Stage 2: evaluate
        let evaluation = self
            .evaluator
            .evaluate(landmarks.as_ref(), baseline.as_ref(), sensitivity);
        debug!(
            is_good = evaluation.status.is_good,
            neck_pitch = evaluation.angles.neck_pitch,
            torso_angle = evaluation.angles.torso_angle,
            "frame evaluated"
        );

        // Stage 3: stabilize
        let published = self.stability.observe(&evaluation.status, now_ms);
        self.last_evaluation = Some(evaluation);

        // Stage 4: publish
        let published = published?;
        store.set_status(published.clone());
        Some(published)
    }

    /// Latest raw evaluation, before stabilization
    pub fn last_evaluation(&self) -> Option<&Evaluation> {
        self.last_evaluation.as_ref()
    }

    /// Forget all per-run state
    pub fn reset(&mut self) {
        self.stability.reset();
        self.last_baseline = None;
        self.was_calibrating = false;
        self.last_evaluation = None;
    }
}
