use nalgebra as na;
use serde::{Deserialize, Serialize};

/// Convert degrees to radians
pub fn deg_to_rad(deg: f64) -> f64 {
    deg.to_radians()
}

/// Convert radians to degrees
pub fn rad_to_deg(rad: f64) -> f64 {
    rad.to_degrees()
}

/// Wrap an angle in degrees to [0, 360)
pub fn wrap_degrees(angle: f64) -> f64 {
    let wrapped = angle.rem_euclid(360.0);
    // rem_euclid can round up to exactly 360 for tiny negative inputs
    if wrapped >= 360.0 {
        0.0
    } else {
        wrapped
    }
}

/// Roll, pitch and yaw in degrees (ZYX convention)
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct EulerAngles {
    pub roll_deg: f64,
    pub pitch_deg: f64,
    pub yaw_deg: f64,
}

impl EulerAngles {
    pub fn new(roll_deg: f64, pitch_deg: f64, yaw_deg: f64) -> Self {
        Self {
            roll_deg,
            pitch_deg,
            yaw_deg,
        }
    }

    pub fn from_quaternion(q: &na::UnitQuaternion<f64>) -> Self {
        let (roll, pitch, yaw) = q.euler_angles();
        Self::new(rad_to_deg(roll), rad_to_deg(pitch), rad_to_deg(yaw))
    }

    pub fn to_quaternion(&self) -> na::UnitQuaternion<f64> {
        na::UnitQuaternion::from_euler_angles(
            deg_to_rad(self.roll_deg),
            deg_to_rad(self.pitch_deg),
            deg_to_rad(self.yaw_deg),
        )
    }
}

/// Roll and pitch in radians implied by a gravity reading
pub fn tilt_from_accel(accel: &na::Vector3<f64>) -> (f64, f64) {
    let roll = accel.y.atan2(accel.z);
    let pitch = (-accel.x).atan2(accel.y.hypot(accel.z));
    (roll, pitch)
}

/// Attitude with zero yaw that explains a gravity reading
pub fn tilt_quaternion(accel: &na::Vector3<f64>) -> na::UnitQuaternion<f64> {
    let (roll, pitch) = tilt_from_accel(accel);
    na::UnitQuaternion::from_euler_angles(roll, pitch, 0.0)
}

/// Angular extent in degrees covered by a set of angles on the circle.
///
/// Computed as 360 minus the largest gap between neighbouring angles, so a
/// cluster straddling the +/-180 seam is measured correctly.
pub fn circular_span<I>(angles: I) -> f64
where
    I: IntoIterator<Item = f64>,
{
    let mut wrapped: Vec<f64> = angles.into_iter().map(wrap_degrees).collect();
    if wrapped.len() < 2 {
        return 0.0;
    }
    wrapped.sort_by(|a, b| a.total_cmp(b));

    let first = wrapped[0];
    let last = wrapped[wrapped.len() - 1];
    let mut largest_gap = 360.0 - last + first;
    for pair in wrapped.windows(2) {
        largest_gap = largest_gap.max(pair[1] - pair[0]);
    }
    (360.0 - largest_gap).max(0.0)
}

/// Rotation spans (roll, pitch, yaw) in degrees over a set of attitudes
pub fn rotation_spans<'a, I>(attitudes: I) -> EulerAngles
where
    I: IntoIterator<Item = &'a EulerAngles> + Clone,
{
    EulerAngles::new(
        circular_span(attitudes.clone().into_iter().map(|e| e.roll_deg)),
        circular_span(attitudes.clone().into_iter().map(|e| e.pitch_deg)),
        circular_span(attitudes.into_iter().map(|e| e.yaw_deg)),
    )
}

/// Smallest of the three rotation spans
pub fn min_span(spans: &EulerAngles) -> f64 {
    spans.roll_deg.min(spans.pitch_deg).min(spans.yaw_deg)
}

/// Angle in degrees between two vectors, 180 if either is zero
pub fn angle_between_deg(a: &na::Vector3<f64>, b: &na::Vector3<f64>) -> f64 {
    let norms = a.norm() * b.norm();
    if norms <= f64::EPSILON {
        return 180.0;
    }
    rad_to_deg((a.dot(b) / norms).clamp(-1.0, 1.0).acos())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn span_handles_wraparound() {
        let span = circular_span([170.0, 179.0, -179.0, -170.0]);
        assert!((span - 20.0).abs() < 1e-9, "span was {}", span);
    }

    #[test]
    fn span_of_full_sweep_is_nearly_full_circle() {
        let span = circular_span((0..36).map(|i| i as f64 * 10.0));
        assert!((span - 350.0).abs() < 1e-9);
        assert_eq!(circular_span([42.0]), 0.0);
        assert_eq!(circular_span(Vec::<f64>::new()), 0.0);
    }

    #[test]
    fn tilt_matches_gravity_direction() {
        let q = na::UnitQuaternion::from_euler_angles(0.4, -0.3, 1.2);
        let accel = q.inverse() * na::Vector3::z();
        let (roll, pitch) = tilt_from_accel(&accel);
        assert!((roll - 0.4).abs() < 1e-9);
        assert!((pitch + 0.3).abs() < 1e-9);

        let tilt = tilt_quaternion(&accel);
        let up = tilt * accel;
        assert!((up - na::Vector3::z()).norm() < 1e-9);
    }

    #[test]
    fn euler_round_trip_through_quaternion() {
        let angles = EulerAngles::new(12.0, -34.0, 101.0);
        let back = EulerAngles::from_quaternion(&angles.to_quaternion());
        assert!((back.roll_deg - 12.0).abs() < 1e-9);
        assert!((back.pitch_deg + 34.0).abs() < 1e-9);
        assert!((back.yaw_deg - 101.0).abs() < 1e-9);
    }

    #[test]
    fn angle_between_vectors() {
        let a = na::Vector3::new(1.0, 0.0, 0.0);
        let b = na::Vector3::new(0.0, 2.0, 0.0);
        assert!((angle_between_deg(&a, &b) - 90.0).abs() < 1e-9);
        assert_eq!(angle_between_deg(&a, &na::Vector3::zeros()), 180.0);
    }
}
