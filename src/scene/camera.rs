//! Camera Vectors
//!
//! The backend does not project rays itself, but it owns the camera
//! vector fix-up applied when render options override the parsed camera:
//! a changed look-at point re-derives the orientation while preserving
//! the direction, up and right lengths and the original handedness.

use glam::DVec3;

const EPSILON: f64 = 1e-10;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Camera {
    pub location: DVec3,
    pub direction: DVec3,
    pub up: DVec3,
    pub right: DVec3,
    pub sky: DVec3,
    pub look_at: DVec3,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            location: DVec3::ZERO,
            direction: DVec3::new(0.0, 0.0, 1.0),
            up: DVec3::new(0.0, 1.0, 0.0),
            right: DVec3::new(4.0 / 3.0, 0.0, 0.0),
            sky: DVec3::new(0.0, 1.0, 0.0),
            look_at: DVec3::new(0.0, 0.0, 1.0),
        }
    }
}

/// Outcome of the look-at reorientation, used to surface warnings.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LookAtOutcome {
    Applied,
    /// Location and look-at coincide; orientation left unchanged.
    DegenerateDirection,
    /// Sky and view direction were parallel; the previous right vector
    /// was kept.
    RightRestored,
}

impl Camera {
    /// Re-derives direction/right/up from the look-at point.
    ///
    /// Preserves |direction|, |up| and |right|, and keeps the coordinate
    /// handedness implied by the original basis.
    pub fn apply_look_at(&mut self) -> LookAtOutcome {
        let direction_length = self.direction.length();
        let up_length = self.up.length();
        let right_length = self.right.length();
        let handedness = self.up.cross(self.direction).dot(self.right);

        let new_direction = self.look_at - self.location;
        if new_direction.length_squared() < EPSILON {
            return LookAtOutcome::DegenerateDirection;
        }
        self.direction = new_direction.normalize();

        let saved_right = self.right;
        self.right = self.sky.cross(self.direction);

        let mut outcome = LookAtOutcome::Applied;
        if self.right.x.abs() < EPSILON
            && self.right.y.abs() < EPSILON
            && self.right.z.abs() < EPSILON
        {
            self.right = saved_right;
            outcome = LookAtOutcome::RightRestored;
        }

        self.right = self.right.normalize();
        self.up = self.direction.cross(self.right);
        self.direction *= direction_length;

        if handedness > 0.0 {
            self.right *= right_length;
        } else {
            self.right *= -right_length;
        }

        self.up *= up_length;
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn look_at_preserves_lengths_and_handedness() {
        let mut camera = Camera {
            location: DVec3::new(0.0, 0.0, -20.0),
            look_at: DVec3::new(1.0, 0.0, 0.0),
            ..Camera::default()
        };
        let dir_len = camera.direction.length();
        let up_len = camera.up.length();
        let right_len = camera.right.length();
        let handedness = camera.up.cross(camera.direction).dot(camera.right);

        assert_eq!(camera.apply_look_at(), LookAtOutcome::Applied);

        assert!(close(camera.direction.length(), dir_len));
        assert!(close(camera.up.length(), up_len));
        assert!(close(camera.right.length(), right_len));
        let new_handedness = camera.up.cross(camera.direction).dot(camera.right);
        assert_eq!(handedness > 0.0, new_handedness > 0.0);

        // Direction points from the location toward the look-at point.
        let expected = (camera.look_at - camera.location).normalize();
        let actual = camera.direction.normalize();
        assert!(close(expected.dot(actual), 1.0));
    }

    #[test]
    fn degenerate_look_at_is_rejected() {
        let mut camera = Camera::default();
        camera.look_at = camera.location;
        let before = camera;
        assert_eq!(camera.apply_look_at(), LookAtOutcome::DegenerateDirection);
        assert_eq!(camera.direction, before.direction);
    }

    #[test]
    fn collapsed_right_falls_back_to_previous_vector() {
        // Sky parallel to the view direction collapses sky x direction.
        let mut camera = Camera {
            location: DVec3::ZERO,
            look_at: DVec3::new(0.0, 5.0, 0.0),
            sky: DVec3::new(0.0, 1.0, 0.0),
            ..Camera::default()
        };
        assert_eq!(camera.apply_look_at(), LookAtOutcome::RightRestored);
        // The restored right keeps its original length.
        assert!(close(camera.right.length(), 4.0 / 3.0));
    }
}
