//! # magfusion - wrist IMU orientation and magnetometer calibration
//!
//! Fuses a wrist-mounted 9-axis IMU into an attitude quaternion while learning
//! the device's magnetic distortion, then subtracts the Earth field to leave a
//! clean sensor-frame residual in which small finger magnets become visible.
//!
//! ## Pipeline
//!
//! Each sample runs through the stages in a fixed order:
//!
//! - [`motion::MotionClassifier`]: rolling variance of accelerometer and gyroscope
//! - [`gyro_bias::GyroBiasTracker`]: EMA of the gyroscope while stationary
//! - [`attitude::AttitudeEstimator`]: gyro prediction and a Madgwick-style gradient correction
//! - [`calibration::IronCalibrator`]: min/max bootstrap, then Levenberg-Marquardt refinement
//! - [`earth_field::EarthFieldEstimator`]: world-frame sliding average of the corrected field
//! - [`residual::ResidualComputer`]: corrected field minus the rotated Earth estimate
//!
//! The attitude and calibration stages feed each other. The magnetometer only
//! steers heading once a calibration measured this session exists, its weight
//! drops while moving or during a magnetic anomaly, and every change of
//! calibration re-aligns heading. The Earth-field window keeps raw readings,
//! so a new calibration re-corrects it in place rather than starting over.
//!
//! ## Features
//!
//! - **desktop**: standard library support for nalgebra (default)
//! - **simulation**: deterministic synthetic wrist sensor for replay and tests (default)

use log::{debug, info, warn};
use nalgebra as na;
use std::time::Duration;

pub mod attitude;
pub mod calibration;
pub mod config;
pub mod earth_field;
pub mod error;
pub mod gyro_bias;
pub mod motion;
pub mod residual;
pub mod sensors;
#[cfg(feature = "simulation")]
pub mod simulation;
pub mod utils;

pub use attitude::{AttitudeEstimator, FusionMode};
pub use calibration::{
    CalibrationEvent, CalibrationPhase, CalibrationSnapshot, CalibrationState, IronCalibrator,
    IronCorrection, QualityMetrics, RefinementFailure,
};
pub use config::{PipelineConfig, RefinementMode};
pub use earth_field::{EarthEstimate, EarthFieldEstimator};
pub use error::{PipelineError, PipelineResult};
pub use gyro_bias::GyroBiasTracker;
pub use motion::{MotionClassifier, MotionState};
pub use residual::{Residual, ResidualComputer};
pub use sensors::{GeomagneticReference, ImuSample};
pub use utils::EulerAngles;

use error::{helpers, SensorType};
use residual::ResidualInputs;

/// Calibration status carried on every output sample
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationSummary {
    pub phase: CalibrationPhase,
    pub confidence: f64,
    /// H/V ratio of the accepted refinement
    pub hv_ratio: Option<f64>,
    /// Fitted ellipsoid sphericity after refinement, observed span ratio before
    pub sphericity: f64,
    /// Bootstrap progress in [0, 1]
    pub progress: f64,
    /// The most recent refinement attempt was rejected
    pub refinement_failed: bool,
}

/// One input sample decorated with everything the pipeline knows about it
#[derive(Debug, Clone, PartialEq)]
pub struct DecoratedSample {
    pub timestamp_ms: f64,

    /// Sensor to world rotation (world: x magnetic north, y west, z up)
    pub orientation: na::UnitQuaternion<f64>,

    pub euler: EulerAngles,

    pub fusion_mode: FusionMode,

    pub motion: MotionState,

    /// Gyroscope bias estimate in deg/s
    pub gyro_bias_dps: na::Vector3<f64>,

    /// Iron-corrected magnetometer reading in microtesla
    pub corrected_mag_ut: Option<na::Vector3<f64>>,

    /// Sensor-frame field left after removing the Earth estimate, in microtesla
    pub residual_ut: Option<na::Vector3<f64>>,

    pub residual_magnitude_ut: Option<f64>,

    /// Iron confidence times Earth-estimate confidence
    pub confidence: f64,

    /// Residual is backed by a refined calibration and a ready Earth estimate
    pub confident: bool,

    /// Corrected field disagrees with the reference or the Earth estimate
    pub magnetic_anomaly: bool,

    /// Measured minus expected field seen by the attitude correction, in microtesla
    pub mag_innovation_ut: Option<na::Vector3<f64>>,

    pub calibration: CalibrationSummary,

    /// Calibration transition that happened on this sample
    pub calibration_event: Option<CalibrationEvent>,

    pub earth_field_ready: bool,

    /// Window mean of the world-frame Earth field in microtesla
    pub earth_field_ut: Option<na::Vector3<f64>>,
}

/// The full orientation and calibration pipeline for one device session
#[derive(Debug)]
pub struct Pipeline {
    /// System configuration
    config: PipelineConfig,

    reference: GeomagneticReference,

    motion: MotionClassifier,

    gyro_bias: GyroBiasTracker,

    attitude: AttitudeEstimator,

    calibrator: IronCalibrator,

    earth: EarthFieldEstimator,

    residual: ResidualComputer,

    /// Timestamp of the last accepted sample in milliseconds
    last_timestamp_ms: Option<f64>,

    /// Heading has been snapped to the current calibration's frame
    heading_aligned: bool,

    /// Number of samples accepted since construction or reset
    samples_processed: u64,
}

impl Pipeline {
    /// Create a new pipeline with the given configuration
    pub fn new(config: PipelineConfig, reference: GeomagneticReference) -> PipelineResult<Self> {
        config.validate()?;
        reference.validate()?;
        info!(target: "magfusion::pipeline",
            "Pipeline created at {} Hz, reference H={} uT V={} uT, refinement {:?}",
            config.sample_rate_hz, reference.horizontal_ut, reference.vertical_ut,
            config.calibration.mode
        );
        Ok(Self {
            motion: MotionClassifier::new(config.motion.clone()),
            gyro_bias: GyroBiasTracker::new(&config.gyro_bias),
            attitude: AttitudeEstimator::new(config.attitude.clone(), reference),
            calibrator: IronCalibrator::new(config.calibration.clone(), reference),
            earth: EarthFieldEstimator::new(config.earth_field.clone(), reference),
            residual: ResidualComputer::new(config.residual.clone(), reference),
            config,
            reference,
            last_timestamp_ms: None,
            heading_aligned: false,
            samples_processed: 0,
        })
    }

    /// Create a pipeline whose bootstrap starts from a previous session's calibration
    pub fn with_calibration_seed(
        config: PipelineConfig,
        reference: GeomagneticReference,
        seed: &CalibrationSnapshot,
    ) -> PipelineResult<Self> {
        let mut pipeline = Self::new(config, reference)?;
        pipeline.calibrator.seed(seed)?;
        Ok(pipeline)
    }

    /// Process one sample. Invalid input is rejected without touching any state.
    pub fn process(&mut self, sample: &ImuSample) -> PipelineResult<DecoratedSample> {
        sample.validate()?;
        let dt_s = self.time_step(sample.timestamp_ms)?;
        if !self.attitude.is_initialized() && sample.accel_g.norm() < 1e-6 {
            return Err(helpers::sensor_error(
                "First sample has a zero accelerometer reading",
                SensorType::Accelerometer,
                None::<String>,
            ));
        }
        self.last_timestamp_ms = Some(sample.timestamp_ms);
        self.samples_processed += 1;

        let motion = self.motion.update(&sample.accel_g, &sample.gyro_dps);
        let gyro_bias_dps = self.gyro_bias.update(&sample.gyro_dps, motion.is_moving);
        if self.attitude.is_initialized() {
            self.attitude
                .predict(&self.gyro_bias.correct(&sample.gyro_dps), dt_s)?;
        } else {
            self.attitude.initialize(&sample.accel_g)?;
        }

        let mut calibration_event = self.calibrator.poll();

        // Anomaly is judged against the calibration and Earth estimate from before this sample
        let predicted = self.attitude.attitude();
        let ready_earth = self.earth.world_field();
        let magnetic_anomaly = self
            .calibrator
            .correct(&sample.mag_ut)
            .map(|corrected| {
                self.residual
                    .is_anomalous(&corrected, &predicted, ready_earth.as_ref())
            })
            .unwrap_or(false);

        let euler = self.attitude.euler();
        if let Some(event) = self.calibrator.update(&sample.mag_ut, &sample.accel_g, &euler) {
            calibration_event = Some(event);
        }
        if let Some(event) = &calibration_event {
            self.on_calibration_event(event);
        }
        self.sync_earth_correction();

        let corrected = self.calibrator.correct(&sample.mag_ut);
        let usable_mag = corrected.filter(|_| self.calibrator.has_iron_calibration() && !magnetic_anomaly);
        let mag_weight = match usable_mag {
            Some(_) => self
                .attitude
                .effective_mag_trust(motion.is_moving, magnetic_anomaly),
            None => 0.0,
        };
        if let Some(mag) = &usable_mag {
            if !self.heading_aligned {
                let rotation = self.attitude.align_heading(mag);
                self.earth.rotate(&rotation);
                self.heading_aligned = true;
            }
        }
        let fusion_mode = self
            .attitude
            .correct(&sample.accel_g, usable_mag.as_ref(), mag_weight, dt_s)?;

        let orientation = self.attitude.attitude();
        if !magnetic_anomaly {
            self.earth.update(&sample.mag_ut, &orientation);
        }

        let earth_mean = self.earth.mean();
        let earth_ready = self.earth.is_ready();
        let residual = self.residual.compute(&ResidualInputs {
            corrected_ut: corrected.as_ref(),
            attitude: &orientation,
            earth_world_ut: earth_mean.as_ref(),
            earth_ready,
            earth_confidence: self.earth.confidence(),
            calibration_phase: self.calibrator.phase(),
            calibration_confidence: self.calibrator.confidence(),
        });

        Ok(DecoratedSample {
            timestamp_ms: sample.timestamp_ms,
            orientation,
            euler: EulerAngles::from_quaternion(&orientation),
            fusion_mode,
            motion,
            gyro_bias_dps,
            corrected_mag_ut: corrected,
            residual_ut: residual.map(|r| r.vector_ut),
            residual_magnitude_ut: residual.map(|r| r.magnitude_ut()),
            confidence: residual.map(|r| r.confidence).unwrap_or(0.0),
            confident: residual.map(|r| r.confident).unwrap_or(false),
            magnetic_anomaly,
            mag_innovation_ut: self.attitude.mag_innovation(),
            calibration: self.calibration_summary(),
            calibration_event,
            earth_field_ready: earth_ready,
            earth_field_ut: earth_mean,
        })
    }

    /// Time step for a new sample; the first sample uses the nominal rate
    fn time_step(&self, timestamp_ms: f64) -> PipelineResult<f64> {
        let Some(last) = self.last_timestamp_ms else {
            return Ok(1.0 / self.config.sample_rate_hz);
        };
        let dt_s = (timestamp_ms - last) / 1000.0;
        if dt_s <= 0.0 {
            return Err(helpers::timing_error(
                format!(
                    "Timestamp {} ms does not advance past {} ms",
                    timestamp_ms, last
                ),
                Some(timestamp_ms),
            ));
        }
        helpers::check_time_delta(dt_s)?;
        if dt_s > self.config.max_dt_s {
            warn!(target: "magfusion::pipeline",
                "Sample gap of {:.3} s clamped to {:.3} s", dt_s, self.config.max_dt_s
            );
            return Ok(self.config.max_dt_s);
        }
        Ok(dt_s)
    }

    fn on_calibration_event(&mut self, event: &CalibrationEvent) {
        if event.changes_correction() {
            // Heading snaps to the new correction; the Earth window follows the same rotation
            self.heading_aligned = false;
            debug!(target: "magfusion::pipeline",
                "Calibration changed ({:?}), heading will be re-aligned", event
            );
        }
    }

    /// Hand the Earth window the correction measured this session, if any
    fn sync_earth_correction(&mut self) {
        let iron = self
            .calibrator
            .correction()
            .filter(|_| self.calibrator.has_iron_calibration());
        self.earth.set_correction(iron.as_ref());
    }

    fn calibration_summary(&self) -> CalibrationSummary {
        CalibrationSummary {
            phase: self.calibrator.phase(),
            confidence: self.calibrator.confidence(),
            hv_ratio: self.calibrator.quality().map(|q| q.hv_ratio),
            sphericity: self.calibrator.sphericity(),
            progress: self.calibrator.bootstrap_progress(),
            refinement_failed: self.calibrator.last_failure().is_some(),
        }
    }

    /// Block until a pending background refinement reports or `timeout` passes
    pub fn wait_for_refinement(&mut self, timeout: Duration) -> Option<CalibrationEvent> {
        let event = self.calibrator.wait_for_refinement(timeout)?;
        self.on_calibration_event(&event);
        self.sync_earth_correction();
        Some(event)
    }

    /// Export the active calibration for a later session
    pub fn export_calibration(&self) -> CalibrationSnapshot {
        self.calibrator.export()
    }

    /// Discard the current calibration and bootstrap again from `snapshot`
    pub fn import_calibration(&mut self, snapshot: &CalibrationSnapshot) -> PipelineResult<()> {
        snapshot.validate()?;
        self.calibrator.reset();
        self.calibrator.seed(snapshot)?;
        self.earth.reset();
        self.heading_aligned = false;
        Ok(())
    }

    /// Restore every stage to its freshly constructed state
    pub fn reset(&mut self) {
        self.motion.reset();
        self.gyro_bias.reset();
        self.attitude.reset();
        self.calibrator.reset();
        self.earth.reset();
        self.last_timestamp_ms = None;
        self.heading_aligned = false;
        self.samples_processed = 0;
        info!(target: "magfusion::pipeline", "Pipeline reset");
    }

    pub fn calibration_state(&self) -> CalibrationState {
        self.calibrator.state()
    }

    pub fn attitude(&self) -> na::UnitQuaternion<f64> {
        self.attitude.attitude()
    }

    pub fn earth_estimate(&self) -> Option<EarthEstimate> {
        self.earth.estimate()
    }

    pub fn gyro_bias(&self) -> na::Vector3<f64> {
        self.gyro_bias.bias()
    }

    pub fn reference(&self) -> GeomagneticReference {
        self.reference
    }

    pub fn samples_processed(&self) -> u64 {
        self.samples_processed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn still_sample(t_ms: f64) -> ImuSample {
        ImuSample::new(0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 48.0, -17.0, -3.0, t_ms)
    }

    fn pipeline() -> Pipeline {
        Pipeline::new(PipelineConfig::default(), GeomagneticReference::default()).unwrap()
    }

    #[test]
    fn rejects_invalid_configuration() {
        let mut config = PipelineConfig::default();
        config.gyro_bias.alpha = 0.001;
        assert!(Pipeline::new(config, GeomagneticReference::default()).is_err());
    }

    #[test]
    fn first_samples_are_six_dof_without_residual() {
        let mut pipeline = pipeline();
        let out = pipeline.process(&still_sample(0.0)).unwrap();
        assert_eq!(out.fusion_mode, FusionMode::SixDof);
        assert!(out.residual_ut.is_none());
        assert!(!out.confident);
        assert_eq!(out.calibration.phase, CalibrationPhase::Bootstrap);
        assert!(out.motion.is_moving);
    }

    #[test]
    fn rejects_bad_samples_without_mutating() {
        let mut pipeline = pipeline();
        pipeline.process(&still_sample(0.0)).unwrap();
        pipeline.process(&still_sample(20.0)).unwrap();

        let mut broken = still_sample(40.0);
        broken.mag_ut.x = f64::NAN;
        assert!(matches!(
            pipeline.process(&broken),
            Err(PipelineError::SensorError { .. })
        ));
        assert!(matches!(
            pipeline.process(&still_sample(20.0)),
            Err(PipelineError::TimingError { .. })
        ));
        assert_eq!(pipeline.samples_processed(), 2);
        assert!(pipeline.process(&still_sample(40.0)).is_ok());
    }

    #[test]
    fn zero_gravity_first_sample_is_rejected() {
        let mut pipeline = pipeline();
        let sample = ImuSample::new(0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 20.0, 0.0, -45.0, 0.0);
        assert!(pipeline.process(&sample).is_err());
        assert_eq!(pipeline.samples_processed(), 0);
    }

    #[test]
    fn quaternion_stays_unit() {
        let mut pipeline = pipeline();
        for i in 0..300 {
            let t = i as f64 * 0.02;
            let sample = ImuSample::new(
                0.2 * t.sin(),
                0.1,
                0.97,
                40.0 * (3.0 * t).sin(),
                -25.0,
                60.0 * t.cos(),
                30.0 + 40.0 * t.sin(),
                -10.0 + 35.0 * (0.7 * t).cos(),
                20.0 * (1.3 * t).sin(),
                i as f64 * 20.0,
            );
            let out = pipeline.process(&sample).unwrap();
            assert!((out.orientation.quaternion().norm() - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn reset_restores_initial_state() {
        let mut pipeline = pipeline();
        for i in 0..40 {
            let mut sample = still_sample(i as f64 * 20.0);
            sample.gyro_dps = na::Vector3::new(0.5, 0.0, 0.0);
            pipeline.process(&sample).unwrap();
        }
        assert!(pipeline.gyro_bias().norm() > 0.1);
        pipeline.reset();
        assert_eq!(pipeline.gyro_bias(), na::Vector3::zeros());
        assert_eq!(pipeline.calibration_state().phase, CalibrationPhase::Uninitialized);
        assert!(pipeline.earth_estimate().is_none());
        // Timestamps may start over after a reset
        assert!(pipeline.process(&still_sample(0.0)).is_ok());
    }

    #[test]
    fn import_rejects_invalid_snapshot() {
        let mut pipeline = pipeline();
        let snapshot = CalibrationSnapshot {
            hard_iron_ut: [0.0, f64::NAN, 0.0],
            soft_iron: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
            phase: CalibrationPhase::Refined,
        };
        assert!(pipeline.import_calibration(&snapshot).is_err());
    }
}
