//! Quaternion attitude estimation.
//!
//! Gyroscope integration followed by a gradient-descent correction toward the
//! gravity direction and, when a calibrated magnetometer is available, toward
//! the measured field's horizontal heading. The magnetometer objective uses the
//! field's own world-frame inclination, so its pull is confined to yaw.

use log::{debug, warn};
use nalgebra as na;

use crate::config::AttitudeConfig;
use crate::error::{helpers, PipelineResult, SensorType};
use crate::sensors::{self, GeomagneticReference};
use crate::utils::{self, EulerAngles};

/// Gradient norms below this are treated as already converged
const MIN_GRADIENT_NORM: f64 = 1e-9;

/// Quaternion norms below this are treated as collapsed
const MIN_QUATERNION_NORM: f64 = 1e-9;

/// Which sensors drove the last correction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FusionMode {
    /// Gyroscope and accelerometer only; yaw is free-running
    SixDof,
    /// Gyroscope, accelerometer and calibrated magnetometer
    NineDof,
}

#[derive(Debug, Clone)]
pub struct AttitudeEstimator {
    config: AttitudeConfig,
    reference: GeomagneticReference,
    /// Sensor to world rotation
    attitude: na::UnitQuaternion<f64>,
    initialized: bool,
    mode: FusionMode,
    last_accel: Option<na::Vector3<f64>>,
    mag_innovation: Option<na::Vector3<f64>>,
    recoveries: u32,
}

impl AttitudeEstimator {
    pub fn new(config: AttitudeConfig, reference: GeomagneticReference) -> Self {
        Self {
            config,
            reference,
            attitude: na::UnitQuaternion::identity(),
            initialized: false,
            mode: FusionMode::SixDof,
            last_accel: None,
            mag_innovation: None,
            recoveries: 0,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Level the estimate from a gravity reading, with zero yaw
    pub fn initialize(&mut self, accel_g: &na::Vector3<f64>) -> PipelineResult<()> {
        if accel_g.norm() < 1e-6 {
            return Err(helpers::sensor_error(
                "Cannot initialize attitude from a zero accelerometer reading",
                SensorType::Accelerometer,
                None::<String>,
            ));
        }
        self.attitude = utils::tilt_quaternion(accel_g);
        self.last_accel = Some(*accel_g);
        self.initialized = true;
        debug!(target: "magfusion::attitude",
            "Attitude initialized from gravity: {:?}",
            EulerAngles::from_quaternion(&self.attitude)
        );
        Ok(())
    }

    /// Integrate a bias-corrected angular rate over `dt_s`
    pub fn predict(&mut self, gyro_dps: &na::Vector3<f64>, dt_s: f64) -> PipelineResult<()> {
        helpers::check_time_delta(dt_s)?;
        if !self.initialized {
            return Ok(());
        }
        let rotation = gyro_dps.map(utils::deg_to_rad) * dt_s;
        let raw = (self.attitude * na::UnitQuaternion::from_scaled_axis(rotation)).into_inner();
        self.renormalize(raw);
        Ok(())
    }

    /// Effective magnetometer weight for this tick
    pub fn effective_mag_trust(&self, is_moving: bool, magnetic_anomaly: bool) -> f64 {
        if magnetic_anomaly {
            return 0.0;
        }
        let attenuation = if is_moving {
            self.config.moving_mag_attenuation
        } else {
            1.0
        };
        self.config.mag_trust * attenuation
    }

    /// Gradient-descent step toward gravity and, if given, the corrected field.
    ///
    /// Each objective's gradient is normalized before weighting, so the largest
    /// possible step is `beta * (1 + mag_weight) * dt`.
    pub fn correct(
        &mut self,
        accel_g: &na::Vector3<f64>,
        mag_ut: Option<&na::Vector3<f64>>,
        mag_weight: f64,
        dt_s: f64,
    ) -> PipelineResult<FusionMode> {
        helpers::check_time_delta(dt_s)?;
        if !self.initialized {
            self.initialize(accel_g)?;
        }
        self.last_accel = Some(*accel_g);

        let q = *self.attitude.quaternion();
        let mut step = na::Vector4::zeros();

        if let Some(gradient) = gravity_gradient(&q, accel_g) {
            step += gradient * self.config.beta;
        }

        let mut mode = FusionMode::SixDof;
        if let Some(mag) = mag_ut.filter(|_| mag_weight > 0.0) {
            if let Some(gradient) = heading_gradient(&q, &self.attitude, mag) {
                step += gradient * (self.config.beta * mag_weight);
            }
            mode = FusionMode::NineDof;
        }

        let delta = na::Quaternion::new(step[0], step[1], step[2], step[3]);
        self.renormalize(q - delta * dt_s);

        if mode != self.mode {
            debug!(target: "magfusion::attitude", "Fusion mode changed to {:?}", mode);
        }
        self.mode = mode;
        self.mag_innovation = mag_ut.map(|m| m - self.expected_field());
        Ok(mode)
    }

    /// Rotate the estimate about world z so the corrected field reads as magnetic north.
    ///
    /// Roll and pitch are preserved. Returns the world-frame rotation applied,
    /// identity if nothing changed, so world-frame state kept elsewhere can follow.
    pub fn align_heading(&mut self, mag_ut: &na::Vector3<f64>) -> na::UnitQuaternion<f64> {
        if !self.initialized {
            return na::UnitQuaternion::identity();
        }
        let horizontal = sensors::sensor_to_world(mag_ut, &self.attitude);
        if horizontal.x.hypot(horizontal.y) < 1e-6 {
            return na::UnitQuaternion::identity();
        }
        let heading = horizontal.y.atan2(horizontal.x);
        let rotation = na::UnitQuaternion::from_axis_angle(&na::Vector3::z_axis(), -heading);
        self.attitude = rotation * self.attitude;
        debug!(target: "magfusion::attitude",
            "Heading aligned to magnetic north, yaw moved by {:.2} deg",
            utils::rad_to_deg(-heading)
        );
        rotation
    }

    /// Sensor to world rotation
    pub fn attitude(&self) -> na::UnitQuaternion<f64> {
        self.attitude
    }

    pub fn euler(&self) -> EulerAngles {
        EulerAngles::from_quaternion(&self.attitude)
    }

    pub fn mode(&self) -> FusionMode {
        self.mode
    }

    /// Reference field as the sensor should currently see it
    pub fn expected_field(&self) -> na::Vector3<f64> {
        sensors::world_to_sensor(&self.reference.world_vector(), &self.attitude)
    }

    /// Measured minus expected field from the last magnetometer correction
    pub fn mag_innovation(&self) -> Option<na::Vector3<f64>> {
        self.mag_innovation
    }

    /// Times the quaternion collapsed and was rebuilt from gravity
    pub fn recoveries(&self) -> u32 {
        self.recoveries
    }

    pub fn reset(&mut self) {
        self.attitude = na::UnitQuaternion::identity();
        self.initialized = false;
        self.mode = FusionMode::SixDof;
        self.last_accel = None;
        self.mag_innovation = None;
        self.recoveries = 0;
    }

    fn renormalize(&mut self, raw: na::Quaternion<f64>) {
        let norm = raw.norm();
        if !norm.is_finite() || norm < MIN_QUATERNION_NORM {
            self.recover();
            return;
        }
        self.attitude = na::UnitQuaternion::new_unchecked(raw / norm);
    }

    fn recover(&mut self) {
        self.recoveries += 1;
        self.attitude = match self.last_accel {
            Some(accel) if accel.norm() > 1e-6 => utils::tilt_quaternion(&accel),
            _ => na::UnitQuaternion::identity(),
        };
        warn!(target: "magfusion::attitude",
            "Attitude quaternion collapsed, re-initialized from gravity (recovery #{})",
            self.recoveries
        );
    }
}

/// Normalized gradient of `|q* (0,0,1) q - a|^2`, components ordered (w, i, j, k)
fn gravity_gradient(q: &na::Quaternion<f64>, accel_g: &na::Vector3<f64>) -> Option<na::Vector4<f64>> {
    let a = accel_g.try_normalize(1e-9)?;
    let (q0, q1, q2, q3) = (q.w, q.i, q.j, q.k);

    let f = na::Vector3::new(
        2.0 * (q1 * q3 - q0 * q2) - a.x,
        2.0 * (q0 * q1 + q2 * q3) - a.y,
        2.0 * (0.5 - q1 * q1 - q2 * q2) - a.z,
    );
    #[rustfmt::skip]
    let jacobian = na::Matrix3x4::new(
        -2.0 * q2,  2.0 * q3, -2.0 * q0, 2.0 * q1,
         2.0 * q1,  2.0 * q0,  2.0 * q3, 2.0 * q2,
         0.0,      -4.0 * q1, -4.0 * q2, 0.0,
    );
    normalized(jacobian.transpose() * f)
}

/// Normalized gradient of the magnetometer objective against the field's own
/// inclination `(bx, 0, bz)`, components ordered (w, i, j, k)
fn heading_gradient(
    q: &na::Quaternion<f64>,
    attitude: &na::UnitQuaternion<f64>,
    mag_ut: &na::Vector3<f64>,
) -> Option<na::Vector4<f64>> {
    let m = mag_ut.try_normalize(1e-9)?;
    let h = attitude * m;
    let bx = h.x.hypot(h.y);
    let bz = h.z;
    let (q0, q1, q2, q3) = (q.w, q.i, q.j, q.k);

    let f = na::Vector3::new(
        2.0 * bx * (0.5 - q2 * q2 - q3 * q3) + 2.0 * bz * (q1 * q3 - q0 * q2) - m.x,
        2.0 * bx * (q1 * q2 - q0 * q3) + 2.0 * bz * (q0 * q1 + q2 * q3) - m.y,
        2.0 * bx * (q0 * q2 + q1 * q3) + 2.0 * bz * (0.5 - q1 * q1 - q2 * q2) - m.z,
    );
    #[rustfmt::skip]
    let jacobian = na::Matrix3x4::new(
        -2.0 * bz * q2,                  2.0 * bz * q3,                  -4.0 * bx * q2 - 2.0 * bz * q0, -4.0 * bx * q3 + 2.0 * bz * q1,
        -2.0 * bx * q3 + 2.0 * bz * q1,  2.0 * bx * q2 + 2.0 * bz * q0,   2.0 * bx * q1 + 2.0 * bz * q3, -2.0 * bx * q0 + 2.0 * bz * q2,
         2.0 * bx * q2,                  2.0 * bx * q3 - 4.0 * bz * q1,   2.0 * bx * q0 - 4.0 * bz * q2,  2.0 * bx * q1,
    );
    normalized(jacobian.transpose() * f)
}

fn normalized(gradient: na::Vector4<f64>) -> Option<na::Vector4<f64>> {
    let norm = gradient.norm();
    if norm < MIN_GRADIENT_NORM || !norm.is_finite() {
        None
    } else {
        Some(gradient / norm)
    }
}
