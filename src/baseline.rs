//! Baseline derivation
//!
//! A baseline is measured from a single landmark set. The same measurement is
//! applied to every live frame so the evaluator always compares like with like.

use crate::types::{
    BaselineMetrics, LandmarkSet, LEFT_EAR, LEFT_SHOULDER, NOSE, RIGHT_EAR, RIGHT_SHOULDER,
};

/// Ear/shoulder pairs, one per side of the body
const SIDES: [(usize, usize); 2] = [(LEFT_EAR, LEFT_SHOULDER), (RIGHT_EAR, RIGHT_SHOULDER)];

impl BaselineMetrics {
    /// Measure baseline metrics from a landmark set.
    ///
    /// Requires a visible nose and at least one side with both ear and
    /// shoulder visible. Returns `None` when the person is not trackable.
    pub fn from_landmarks(landmarks: &LandmarkSet, cutoff: f32) -> Option<Self> {
        let nose = landmarks.visible(NOSE, cutoff)?;
        let ear_shoulder_distance = ear_shoulder_distance(landmarks, cutoff)?;

        Some(Self {
            nose_y: nose.y,
            nose_x: nose.x,
            ear_shoulder_distance,
        })
    }
}

/// Mean horizontal ear-to-shoulder distance over the visible sides
fn ear_shoulder_distance(landmarks: &LandmarkSet, cutoff: f32) -> Option<f32> {
    let distances: Vec<f32> = SIDES
        .iter()
        .filter_map(|&(ear, shoulder)| {
            let ear = landmarks.visible(ear, cutoff)?;
            let shoulder = landmarks.visible(shoulder, cutoff)?;
            Some((ear.x - shoulder.x).abs())
        })
        .collect();

    if distances.is_empty() {
        return None;
    }
    Some(distances.iter().sum::<f32>() / distances.len() as f32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::upright_landmarks;
    use crate::types::Landmark;

    #[test]
    fn test_measures_upright_pose() {
        let landmarks = upright_landmarks();
        let baseline = BaselineMetrics::from_landmarks(&landmarks, 0.5).unwrap();

        assert!((baseline.nose_y - 0.40).abs() < 1e-6);
        assert!((baseline.nose_x - 0.50).abs() < 1e-6);
        // Both sides are 0.03 apart horizontally
        assert!((baseline.ear_shoulder_distance - 0.03).abs() < 1e-6);
    }

    #[test]
    fn test_single_visible_side_is_enough() {
        let mut points = upright_landmarks().points().to_vec();
        points[RIGHT_EAR].visibility = 0.1;
        let landmarks = LandmarkSet::new(points).unwrap();

        let baseline = BaselineMetrics::from_landmarks(&landmarks, 0.5);
        assert!(baseline.is_some());
    }

    #[test]
    fn test_missing_nose_yields_none() {
        let mut points = upright_landmarks().points().to_vec();
        points[NOSE] = Landmark::new(0.5, 0.4, 0.0);
        let landmarks = LandmarkSet::new(points).unwrap();

        assert!(BaselineMetrics::from_landmarks(&landmarks, 0.5).is_none());
    }

    #[test]
    fn test_no_complete_side_yields_none() {
        let mut points = upright_landmarks().points().to_vec();
        points[LEFT_EAR].visibility = 0.1;
        points[RIGHT_SHOULDER].visibility = 0.1;
        let landmarks = LandmarkSet::new(points).unwrap();

        assert!(BaselineMetrics::from_landmarks(&landmarks, 0.5).is_none());
    }
}
