use nalgebra as na;

use crate::calibration::CalibrationPhase;
use crate::config::ResidualConfig;
use crate::sensors::{self, GeomagneticReference};

/// Sensor-frame field left after removing the Earth estimate
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Residual {
    /// Residual vector in sensor frame, microtesla
    pub vector_ut: na::Vector3<f64>,
    /// Iron confidence times Earth-estimate confidence
    pub confidence: f64,
    /// Refined calibration, ready Earth estimate and confidence above threshold
    pub confident: bool,
}

impl Residual {
    pub fn magnitude_ut(&self) -> f64 {
        self.vector_ut.norm()
    }
}

/// Inputs the residual depends on, gathered from the other stages for one tick
#[derive(Debug, Clone, Copy)]
pub struct ResidualInputs<'a> {
    /// Iron-corrected reading, if a correction is available
    pub corrected_ut: Option<&'a na::Vector3<f64>>,
    /// Sensor to world rotation
    pub attitude: &'a na::UnitQuaternion<f64>,
    /// Window mean of the world field, ready or not
    pub earth_world_ut: Option<&'a na::Vector3<f64>>,
    pub earth_ready: bool,
    pub earth_confidence: f64,
    pub calibration_phase: CalibrationPhase,
    pub calibration_confidence: f64,
}

#[derive(Debug, Clone)]
pub struct ResidualComputer {
    config: ResidualConfig,
    reference: GeomagneticReference,
}

impl ResidualComputer {
    pub fn new(config: ResidualConfig, reference: GeomagneticReference) -> Self {
        Self { config, reference }
    }

    /// `corrected - q⁻¹ · earth_world`, or None until both inputs exist
    pub fn compute(&self, inputs: &ResidualInputs<'_>) -> Option<Residual> {
        let corrected = inputs.corrected_ut?;
        let earth = inputs.earth_world_ut?;
        let vector_ut = corrected - sensors::world_to_sensor(earth, inputs.attitude);
        let confidence = (inputs.calibration_confidence * inputs.earth_confidence).clamp(0.0, 1.0);
        let confident = inputs.calibration_phase == CalibrationPhase::Refined
            && inputs.earth_ready
            && confidence >= self.config.min_confidence;
        Some(Residual {
            vector_ut,
            confidence,
            confident,
        })
    }

    /// Whether a corrected reading looks disturbed by a nearby magnetic source.
    ///
    /// Flags a magnitude far from the reference field, and once the Earth
    /// estimate is ready, any large departure from it.
    pub fn is_anomalous(
        &self,
        corrected_ut: &na::Vector3<f64>,
        attitude: &na::UnitQuaternion<f64>,
        ready_earth_world_ut: Option<&na::Vector3<f64>>,
    ) -> bool {
        if (corrected_ut.norm() - self.reference.magnitude()).abs() > self.config.magnitude_tolerance_ut {
            return true;
        }
        match ready_earth_world_ut {
            Some(earth) => {
                (corrected_ut - sensors::world_to_sensor(earth, attitude)).norm()
                    > self.config.anomaly_threshold_ut
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn computer() -> ResidualComputer {
        ResidualComputer::new(ResidualConfig::default(), GeomagneticReference::default())
    }

    fn inputs<'a>(
        corrected: &'a na::Vector3<f64>,
        attitude: &'a na::UnitQuaternion<f64>,
        earth: &'a na::Vector3<f64>,
    ) -> ResidualInputs<'a> {
        ResidualInputs {
            corrected_ut: Some(corrected),
            attitude,
            earth_world_ut: Some(earth),
            earth_ready: true,
            earth_confidence: 1.0,
            calibration_phase: CalibrationPhase::Refined,
            calibration_confidence: 0.9,
        }
    }

    #[test]
    fn residual_isolates_local_source() {
        let attitude = na::UnitQuaternion::from_euler_angles(0.2, -0.1, 0.8);
        let earth = GeomagneticReference::default().world_vector();
        let magnet = na::Vector3::new(35.0, -25.0, 30.0);
        let corrected = attitude.inverse() * earth + magnet;

        let residual = computer().compute(&inputs(&corrected, &attitude, &earth)).unwrap();
        assert!((residual.vector_ut - magnet).norm() < 1e-9);
        assert!((residual.confidence - 0.9).abs() < 1e-12);
        assert!(residual.confident);
    }

    #[test]
    fn only_confident_when_refined_and_ready() {
        let attitude = na::UnitQuaternion::identity();
        let earth = GeomagneticReference::default().world_vector();
        let corrected = earth;

        let mut bootstrap = inputs(&corrected, &attitude, &earth);
        bootstrap.calibration_phase = CalibrationPhase::Bootstrap;
        assert!(!computer().compute(&bootstrap).unwrap().confident);

        let mut warming = inputs(&corrected, &attitude, &earth);
        warming.earth_ready = false;
        warming.earth_confidence = 0.4;
        let residual = computer().compute(&warming).unwrap();
        assert!(!residual.confident);
        assert!((residual.confidence - 0.36).abs() < 1e-12);

        let mut missing = inputs(&corrected, &attitude, &earth);
        missing.earth_world_ut = None;
        assert!(computer().compute(&missing).is_none());
    }

    #[test]
    fn anomaly_on_magnitude_or_residual() {
        let computer = computer();
        let attitude = na::UnitQuaternion::identity();
        let earth = GeomagneticReference::default().world_vector();

        assert!(!computer.is_anomalous(&earth, &attitude, None));
        assert!(computer.is_anomalous(&(earth * 1.5), &attitude, None));

        // Same magnitude, wrong direction: only caught against a ready estimate
        let rotated = na::UnitQuaternion::from_euler_angles(0.0, 0.0, 1.2) * earth;
        assert!(!computer.is_anomalous(&rotated, &attitude, None));
        assert!(computer.is_anomalous(&rotated, &attitude, Some(&earth)));
    }
}
