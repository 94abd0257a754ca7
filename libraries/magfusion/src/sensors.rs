use nalgebra as na;

use crate::error::{helpers, PipelineResult, SensorType};

/// One synchronized reading of the 9-axis wrist unit
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImuSample {
    /// Accelerometer measurement in sensor frame (x, y, z) in g
    pub accel_g: na::Vector3<f64>,

    /// Gyroscope measurement in sensor frame (x, y, z) in degrees per second
    pub gyro_dps: na::Vector3<f64>,

    /// Raw magnetometer measurement in sensor frame (x, y, z) in microtesla
    pub mag_ut: na::Vector3<f64>,

    /// Sample timestamp in milliseconds
    pub timestamp_ms: f64,
}

impl ImuSample {
    /// Build a sample from the ten scalars of the wire format
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ax: f64,
        ay: f64,
        az: f64,
        gx: f64,
        gy: f64,
        gz: f64,
        mx: f64,
        my: f64,
        mz: f64,
        timestamp_ms: f64,
    ) -> Self {
        Self {
            accel_g: na::Vector3::new(ax, ay, az),
            gyro_dps: na::Vector3::new(gx, gy, gz),
            mag_ut: na::Vector3::new(mx, my, mz),
            timestamp_ms,
        }
    }

    /// Reject readings with NaN or infinite components
    pub fn validate(&self) -> PipelineResult<()> {
        helpers::check_sensor_vector(&self.accel_g, SensorType::Accelerometer)?;
        helpers::check_sensor_vector(&self.gyro_dps, SensorType::Gyroscope)?;
        helpers::check_sensor_vector(&self.mag_ut, SensorType::Magnetometer)?;
        if !self.timestamp_ms.is_finite() {
            return Err(helpers::timing_error(
                "Timestamp is not finite",
                Some(self.timestamp_ms),
            ));
        }
        Ok(())
    }
}

/// Local geomagnetic field, supplied by the caller.
///
/// The world frame used throughout the crate has x pointing to magnetic north,
/// y to the west and z up, so the reference vector is `(H, 0, -V)` with `V`
/// positive when the field dips downward (northern hemisphere).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeomagneticReference {
    /// Horizontal intensity in microtesla
    pub horizontal_ut: f64,

    /// Vertical intensity in microtesla, positive downward
    pub vertical_ut: f64,
}

impl GeomagneticReference {
    pub fn new(horizontal_ut: f64, vertical_ut: f64) -> PipelineResult<Self> {
        let reference = Self {
            horizontal_ut,
            vertical_ut,
        };
        reference.validate()?;
        Ok(reference)
    }

    pub fn validate(&self) -> PipelineResult<()> {
        if !self.horizontal_ut.is_finite() || self.horizontal_ut <= 0.0 {
            return Err(helpers::config_error(
                format!(
                    "Horizontal field must be positive, got {} uT",
                    self.horizontal_ut
                ),
                Some("horizontal_ut"),
            ));
        }
        if !self.vertical_ut.is_finite() || self.vertical_ut == 0.0 {
            return Err(helpers::config_error(
                format!("Vertical field must be non-zero, got {} uT", self.vertical_ut),
                Some("vertical_ut"),
            ));
        }
        Ok(())
    }

    /// Total field intensity in microtesla
    pub fn magnitude(&self) -> f64 {
        self.horizontal_ut.hypot(self.vertical_ut)
    }

    /// Ratio of horizontal to vertical intensity
    pub fn hv_ratio(&self) -> f64 {
        self.horizontal_ut / self.vertical_ut.abs()
    }

    /// Peak-to-peak span a perfectly calibrated axis sees over a full rotation
    pub fn expected_range(&self) -> f64 {
        2.0 * self.magnitude()
    }

    /// Reference field in the world frame
    pub fn world_vector(&self) -> na::Vector3<f64> {
        na::Vector3::new(self.horizontal_ut, 0.0, -self.vertical_ut)
    }
}

impl Default for GeomagneticReference {
    /// Mid-latitude field, roughly that of central Europe
    fn default() -> Self {
        Self {
            horizontal_ut: 20.0,
            vertical_ut: 45.0,
        }
    }
}

/// Rotate a sensor-frame vector into the world frame
pub fn sensor_to_world(
    vec: &na::Vector3<f64>,
    attitude: &na::UnitQuaternion<f64>,
) -> na::Vector3<f64> {
    attitude * vec
}

/// Rotate a world-frame vector into the sensor frame
pub fn world_to_sensor(
    vec: &na::Vector3<f64>,
    attitude: &na::UnitQuaternion<f64>,
) -> na::Vector3<f64> {
    attitude.inverse() * vec
}
