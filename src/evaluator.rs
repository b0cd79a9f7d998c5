//! Geometric posture evaluation
//!
//! Compares the current landmark set against the calibrated baseline and turns
//! the deviation into two angles:
//! - Neck pitch: vertical nose displacement over a nominal neck length
//! - Torso angle: horizontal ear/shoulder or nose displacement over a nominal
//!   torso length
//!
//! Both angles are checked against a single threshold derived from the
//! sensitivity setting. Missing or low-confidence landmarks fail open.

use crate::config::{clamp_sensitivity, PostureConfig};
use crate::types::{messages, BaselineMetrics, Evaluation, LandmarkSet, PostureAngles, PostureStatus};

/// Nominal neck length in normalized frame units
pub const NECK_REFERENCE: f32 = 0.2;
/// Nominal torso length in normalized frame units
pub const TORSO_REFERENCE: f32 = 0.25;

/// Threshold at 0% sensitivity (degrees)
pub const THRESHOLD_BASE_DEG: f32 = 3.0;
/// Threshold increase per sensitivity percent (degrees)
pub const THRESHOLD_DEG_PER_PERCENT: f32 = 0.6;

/// Allowed angular deviation for a sensitivity setting.
///
/// `3.0 + 0.6 * percent`, with the percentage clamped to the supported range:
/// 5% allows 6 degrees, 15% allows 12 degrees, 30% allows 21 degrees. Higher
/// sensitivity means more tolerance. Displayed thresholds must come from here.
pub fn angle_threshold_deg(sensitivity_percent: u8) -> f32 {
    let percent = clamp_sensitivity(sensitivity_percent) as f32;
    THRESHOLD_BASE_DEG + THRESHOLD_DEG_PER_PERCENT * percent
}

/// Evaluator bound to a visibility cutoff
#[derive(Debug, Clone, Copy)]
pub struct PostureEvaluator {
    visibility_cutoff: f32,
}

impl Default for PostureEvaluator {
    fn default() -> Self {
        Self::new(PostureConfig::default().visibility_cutoff)
    }
}

impl PostureEvaluator {
    pub fn new(visibility_cutoff: f32) -> Self {
        Self { visibility_cutoff }
    }

    pub fn from_config(config: &PostureConfig) -> Self {
        Self::new(config.visibility_cutoff)
    }

    /// Evaluate one frame. Pure: inputs are only read.
    pub fn evaluate(
        &self,
        landmarks: Option<&LandmarkSet>,
        baseline: Option<&BaselineMetrics>,
        sensitivity_percent: u8,
    ) -> Evaluation {
        let current =
            landmarks.and_then(|set| BaselineMetrics::from_landmarks(set, self.visibility_cutoff));

        let Some(current) = current else {
            return Evaluation {
                status: PostureStatus::good(messages::NO_PERSON),
                angles: PostureAngles::default(),
            };
        };

        let Some(baseline) = baseline else {
            return Evaluation {
                status: PostureStatus::good(messages::NO_BASELINE),
                angles: PostureAngles::default(),
            };
        };

        let angles = compute_angles(&current, baseline);
        let threshold = angle_threshold_deg(sensitivity_percent);

        let mut complaints = Vec::new();
        if angles.neck_pitch > threshold {
            complaints.push(format!(
                "Head dropping: neck pitch {:.0}° (limit {:.0}°)",
                angles.neck_pitch, threshold
            ));
        } else if angles.neck_pitch < -threshold {
            complaints.push(format!(
                "Head tilted back: neck pitch {:.0}° (limit {:.0}°)",
                angles.neck_pitch.abs(),
                threshold
            ));
        }
        if angles.torso_angle > threshold {
            complaints.push(format!(
                "Leaning: torso angle {:.0}° (limit {:.0}°)",
                angles.torso_angle, threshold
            ));
        }

        let status = if complaints.is_empty() {
            PostureStatus::good(messages::POSTURE_OK)
        } else {
            PostureStatus::bad(complaints.join("; "))
        };

        Evaluation { status, angles }
    }
}

/// Evaluate with the default visibility cutoff
pub fn evaluate(
    landmarks: Option<&LandmarkSet>,
    baseline: Option<&BaselineMetrics>,
    sensitivity_percent: u8,
) -> Evaluation {
    PostureEvaluator::default().evaluate(landmarks, baseline, sensitivity_percent)
}

/// Angles of the current measurement relative to the baseline
fn compute_angles(current: &BaselineMetrics, baseline: &BaselineMetrics) -> PostureAngles {
    let nose_drop = current.nose_y - baseline.nose_y;
    let neck_pitch = nose_drop.atan2(NECK_REFERENCE).to_degrees();

    let shoulder_shift = (current.ear_shoulder_distance - baseline.ear_shoulder_distance).abs();
    let nose_shift = (current.nose_x - baseline.nose_x).abs();
    let torso_angle = shoulder_shift.max(nose_shift).atan2(TORSO_REFERENCE).to_degrees();

    PostureAngles {
        neck_pitch,
        torso_angle,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DEFAULT_SENSITIVITY, MAX_SENSITIVITY, MIN_SENSITIVITY};
    use crate::testing::{shifted_landmarks, upright_landmarks};
    use crate::types::{Landmark, LEFT_EAR, NOSE, RIGHT_EAR};

    fn baseline() -> BaselineMetrics {
        BaselineMetrics::from_landmarks(&upright_landmarks(), 0.5).unwrap()
    }

    #[test]
    fn test_no_baseline_is_good() {
        let landmarks = upright_landmarks();
        let result = evaluate(Some(&landmarks), None, DEFAULT_SENSITIVITY);

        assert!(result.status.is_good);
        assert_eq!(result.status.message, messages::NO_BASELINE);
    }

    #[test]
    fn test_identical_to_baseline_is_good() {
        let landmarks = upright_landmarks();
        let result = evaluate(Some(&landmarks), Some(&baseline()), DEFAULT_SENSITIVITY);

        assert!(result.status.is_good);
        assert_eq!(result.status.message, messages::POSTURE_OK);
        assert!(result.angles.neck_pitch.abs() < 1e-3);
        assert!(result.angles.torso_angle.abs() < 1e-3);
    }

    #[test]
    fn test_nose_drop_beyond_threshold_is_bad() {
        // atan(0.1 / 0.2) is about 26.6 degrees, well over the 12 degree default
        let landmarks = shifted_landmarks(0.0, 0.1);
        let result = evaluate(Some(&landmarks), Some(&baseline()), DEFAULT_SENSITIVITY);

        assert!(!result.status.is_good);
        assert!(result.status.message.contains("neck pitch"));
        assert!((result.angles.neck_pitch - 26.565).abs() < 0.01);
    }

    #[test]
    fn test_head_raised_is_reported() {
        let landmarks = shifted_landmarks(0.0, -0.1);
        let result = evaluate(Some(&landmarks), Some(&baseline()), DEFAULT_SENSITIVITY);

        assert!(!result.status.is_good);
        assert!(result.status.message.starts_with("Head tilted back"));
    }

    #[test]
    fn test_sideways_lean_reports_torso() {
        let landmarks = shifted_landmarks(0.1, 0.0);
        let result = evaluate(Some(&landmarks), Some(&baseline()), DEFAULT_SENSITIVITY);

        assert!(!result.status.is_good);
        assert!(result.status.message.contains("torso angle"));
        assert!(result.angles.torso_angle > angle_threshold_deg(DEFAULT_SENSITIVITY));
    }

    #[test]
    fn test_small_jitter_is_tolerated() {
        let landmarks = shifted_landmarks(0.005, 0.01);
        let result = evaluate(Some(&landmarks), Some(&baseline()), MIN_SENSITIVITY);
        assert!(result.status.is_good);
    }

    #[test]
    fn test_missing_landmarks_fail_open() {
        let mut points = upright_landmarks().points().to_vec();
        points[NOSE] = Landmark::new(0.5, 0.9, 0.1);
        let hidden_nose = LandmarkSet::new(points).unwrap();

        let mut points = shifted_landmarks(0.2, 0.3).points().to_vec();
        points[LEFT_EAR].visibility = 0.0;
        points[RIGHT_EAR].visibility = 0.0;
        let hidden_ears = LandmarkSet::new(points).unwrap();

        for landmarks in [Some(&hidden_nose), Some(&hidden_ears), None] {
            for sensitivity in [MIN_SENSITIVITY, DEFAULT_SENSITIVITY, MAX_SENSITIVITY] {
                let result = evaluate(landmarks, Some(&baseline()), sensitivity);
                assert!(result.status.is_good);
                assert_eq!(result.status.message, messages::NO_PERSON);
            }
        }
    }

    #[test]
    fn test_threshold_mapping_is_monotonic() {
        assert!((angle_threshold_deg(5) - 6.0).abs() < 1e-4);
        assert!((angle_threshold_deg(15) - 12.0).abs() < 1e-4);
        assert!((angle_threshold_deg(30) - 21.0).abs() < 1e-4);

        let mut previous = angle_threshold_deg(0);
        for percent in 1..=u8::MAX {
            let current = angle_threshold_deg(percent);
            assert!(current >= previous);
            previous = current;
        }
    }

    #[test]
    fn test_higher_sensitivity_never_turns_good_into_bad() {
        let baseline = baseline();
        for step in 0..40 {
            let offset = step as f32 * 0.005;
            for landmarks in [
                shifted_landmarks(0.0, offset),
                shifted_landmarks(offset, 0.0),
                shifted_landmarks(offset, -offset),
            ] {
                let mut was_good = false;
                for sensitivity in MIN_SENSITIVITY..=MAX_SENSITIVITY {
                    let good = evaluate(Some(&landmarks), Some(&baseline), sensitivity)
                        .status
                        .is_good;
                    assert!(!(was_good && !good), "offset {} flipped at {}%", offset, sensitivity);
                    was_good = good;
                }
            }
        }
    }

    #[test]
    fn test_inputs_are_not_mutated() {
        let landmarks = shifted_landmarks(0.05, 0.05);
        let before = landmarks.clone();
        let baseline = baseline();
        let _ = evaluate(Some(&landmarks), Some(&baseline), DEFAULT_SENSITIVITY);
        assert_eq!(landmarks, before);
        assert_eq!(baseline, self::baseline());
    }
}
