//! Velocity-based motion model for pose prediction.

use crate::geometry::SE3;

/// Constant velocity motion model.
///
/// Keeps the relative motion `T_cl = T_cw(current) · T_wc(last)` between the
/// last two tracked frames and replays it on the last pose.
pub struct MotionModel {
    /// Last tracked pose (T_wc).
    prev_pose: Option<SE3>,
    /// Relative motion last -> current in camera coordinates.
    velocity: Option<SE3>,
}

impl MotionModel {
    pub fn new() -> Self {
        Self {
            prev_pose: None,
            velocity: None,
        }
    }

    /// Update the model with a newly tracked pose (T_wc).
    pub fn update(&mut self, pose: &SE3) {
        if let Some(prev) = &self.prev_pose {
            self.velocity = Some(pose.inverse().compose(prev));
        }
        self.prev_pose = Some(*pose);
    }

    /// Predict the next pose (T_wc) under constant velocity.
    pub fn predict(&self) -> Option<SE3> {
        let prev = self.prev_pose?;
        let velocity = self.velocity?;
        // T_cw(next) = velocity · T_cw(prev)
        Some(velocity.compose(&prev.inverse()).inverse())
    }

    pub fn has_velocity(&self) -> bool {
        self.velocity.is_some()
    }

    /// Forget the velocity but keep the last pose, e.g. after the map moved.
    pub fn clear_velocity(&mut self) {
        self.velocity = None;
    }

    /// Move the stored pose with the map after a correction.
    pub fn set_last_pose(&mut self, pose: &SE3) {
        self.prev_pose = Some(*pose);
    }

    /// Reset the motion model.
    pub fn reset(&mut self) {
        self.prev_pose = None;
        self.velocity = None;
    }
}

impl Default for MotionModel {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::{UnitQuaternion, Vector3};

    #[test]
    fn test_constant_velocity_prediction() {
        let mut model = MotionModel::new();
        let step = SE3::new(UnitQuaternion::from_euler_angles(0.0, 0.05, 0.0), Vector3::new(0.1, 0.0, 0.02));
        let p0 = SE3::identity();
        let p1 = p0.compose(&step);
        let p2 = p1.compose(&step);

        model.update(&p0);
        assert!(model.predict().is_none());
        model.update(&p1);
        let predicted = model.predict().unwrap();
        assert_relative_eq!(predicted.translation, p2.translation, epsilon = 1e-12);
        assert!(predicted.rotation.angle_to(&p2.rotation) < 1e-12);
    }

    #[test]
    fn test_reset_clears_state() {
        let mut model = MotionModel::new();
        model.update(&SE3::identity());
        model.update(&SE3::identity());
        assert!(model.has_velocity());
        model.reset();
        assert!(model.predict().is_none());
    }
}
