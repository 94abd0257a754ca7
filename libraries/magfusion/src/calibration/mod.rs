//! Two-phase hard/soft iron calibration.
//!
//! Phase A tracks per-axis extremes of the raw field and produces a diagonal
//! correction as soon as every axis has swept half the expected span. Phase B
//! fits a full 3x3 soft-iron matrix with Levenberg-Marquardt against the
//! orientation-implied Earth field and only replaces Phase A after passing
//! every quality gate. A refined calibration is frozen until `reset`.

mod bootstrap;
pub mod quality;
pub mod refine;
mod snapshot;
mod worker;

use log::{debug, info, warn};
use nalgebra as na;
use std::collections::VecDeque;
use std::time::Duration;
use thiserror::Error;

use crate::config::{CalibrationConfig, RefinementMode};
use crate::error::{helpers, PipelineResult};
use crate::sensors::GeomagneticReference;
use crate::utils::{self, EulerAngles};
use bootstrap::{Bootstrap, Observation};
use worker::{RefinementWorker, WorkerPoll};

pub use refine::{expected_sensor_field, levenberg_marquardt, LmOutcome};
pub use snapshot::CalibrationSnapshot;

/// Calibration lifecycle. Only moves forward, except `Refining -> Bootstrap` on a rejected fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum CalibrationPhase {
    Uninitialized,
    Bootstrap,
    Refining,
    Refined,
}

/// `corrected = soft_iron * (raw - hard_iron)`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IronCorrection {
    /// Hard-iron offset in microtesla
    pub hard_iron_ut: na::Vector3<f64>,
    /// Soft-iron correction matrix
    pub soft_iron: na::Matrix3<f64>,
}

impl IronCorrection {
    pub fn identity() -> Self {
        Self {
            hard_iron_ut: na::Vector3::zeros(),
            soft_iron: na::Matrix3::identity(),
        }
    }

    pub fn apply(&self, raw_ut: &na::Vector3<f64>) -> na::Vector3<f64> {
        self.soft_iron * (raw_ut - self.hard_iron_ut)
    }
}

/// Quality of a refined calibration
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityMetrics {
    /// RMS of corrected minus expected field over the fitted samples, in microtesla
    pub residual_rms_ut: f64,
    /// Smallest over largest semi-axis of the fitted raw ellipsoid
    pub sphericity: f64,
    /// Mean horizontal over mean vertical corrected magnitude
    pub hv_ratio: f64,
    /// Combined score in [0, 1]
    pub confidence: f64,
    /// Smallest of the roll, pitch and yaw spans over the fitted samples, in degrees
    pub coverage_deg: f64,
    /// Smallest per-axis span of the raw readings that were fitted, in microtesla
    pub field_span_ut: f64,
}

/// Why a refinement attempt was not accepted
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RefinementFailure {
    #[error("Only {available} calibration samples, {required} needed")]
    InsufficientSamples { available: usize, required: usize },

    #[error("Levenberg-Marquardt made no progress after {iterations} iterations")]
    Diverged { iterations: usize },

    #[error("Orientation coverage {coverage_deg:.1} deg is below {required_deg:.1} deg")]
    InsufficientCoverage { coverage_deg: f64, required_deg: f64 },

    #[error("Raw field spans only {span_ut:.1} uT on its narrowest axis, {required_ut:.1} uT needed")]
    NarrowFieldSpan { span_ut: f64, required_ut: f64 },

    #[error("H/V ratio {measured:.3} is on the wrong side of 1 (reference {expected:.3})")]
    HvRatioInverted { measured: f64, expected: f64 },

    #[error("H/V ratio {measured:.3} is too far from reference {expected:.3}")]
    HvRatioMismatch { measured: f64, expected: f64 },

    #[error("Residual RMS {rms_ut:.2} uT exceeds {limit_ut:.2} uT")]
    ResidualTooLarge { rms_ut: f64, limit_ut: f64 },

    #[error("Confidence {confidence:.2} is below {required:.2}")]
    LowConfidence { confidence: f64, required: f64 },

    #[error("Refinement worker exited without a result")]
    WorkerLost,
}

/// One sample kept for Phase B
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationSample {
    /// Raw magnetometer reading in microtesla
    pub mag_ut: na::Vector3<f64>,
    /// Accelerometer reading in g
    pub accel_g: na::Vector3<f64>,
    /// Estimated attitude when the sample was taken
    pub attitude: EulerAngles,
}

/// Result of one Phase B attempt
#[derive(Debug, Clone)]
pub struct RefinementReport {
    pub outcome: Result<(IronCorrection, QualityMetrics), RefinementFailure>,
    pub sample_count: usize,
    pub iterations: usize,
    pub initial_rms_ut: f64,
    pub final_rms_ut: f64,
}

/// Transitions callers may need to react to
#[derive(Debug, Clone, PartialEq)]
pub enum CalibrationEvent {
    /// Phase A reached full coverage; the correction changed frame
    BootstrapComplete,
    /// A background refinement was started
    RefinementStarted,
    /// Phase B passed every gate and replaced Phase A
    Refined(QualityMetrics),
    /// Phase B was rejected; Phase A stays authoritative
    RefinementRejected(RefinementFailure),
}

impl CalibrationEvent {
    /// Whether the active correction was replaced, which re-aligns heading
    pub fn changes_correction(&self) -> bool {
        matches!(self, CalibrationEvent::BootstrapComplete | CalibrationEvent::Refined(_))
    }
}

/// Externally visible calibration state
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationState {
    pub hard_iron_ut: na::Vector3<f64>,
    pub soft_iron: na::Matrix3<f64>,
    pub phase: CalibrationPhase,
    /// Raw samples offered to the calibrator
    pub sample_count: u64,
    /// Metrics of the accepted Phase B fit, if any
    pub quality: Option<QualityMetrics>,
    /// Phase A progress in [0, 1]
    pub bootstrap_progress: f64,
    pub confidence: f64,
    /// Reason the most recent refinement attempt was rejected
    pub last_failure: Option<RefinementFailure>,
}

#[derive(Debug)]
pub struct IronCalibrator {
    config: CalibrationConfig,
    reference: GeomagneticReference,
    phase: CalibrationPhase,
    bootstrap: Bootstrap,
    samples: VecDeque<CalibrationSample>,
    last_stored_mag: Option<na::Vector3<f64>>,
    /// Samples stored since the last refinement attempt
    stored_since_attempt: usize,
    /// Samples to wait for before the next attempt
    retry_wait: usize,
    /// Coverage of the buffer, cleared whenever the buffer changes
    coverage: Option<f64>,
    refined: Option<(IronCorrection, QualityMetrics)>,
    worker: Option<RefinementWorker>,
    last_failure: Option<RefinementFailure>,
    sample_count: u64,
    attempts: u32,
}

impl IronCalibrator {
    pub fn new(config: CalibrationConfig, reference: GeomagneticReference) -> Self {
        let bootstrap = Bootstrap::new(
            reference.expected_range(),
            config.bootstrap_range_fraction,
            config.outlier_threshold_ut,
        );
        Self {
            samples: VecDeque::with_capacity(config.buffer_capacity),
            config,
            reference,
            phase: CalibrationPhase::Uninitialized,
            bootstrap,
            last_stored_mag: None,
            stored_since_attempt: 0,
            retry_wait: 0,
            coverage: None,
            refined: None,
            worker: None,
            last_failure: None,
            sample_count: 0,
            attempts: 0,
        }
    }

    /// Start from a previous session's calibration as a Phase A prior
    pub fn with_seed(
        config: CalibrationConfig,
        reference: GeomagneticReference,
        seed: &CalibrationSnapshot,
    ) -> PipelineResult<Self> {
        let mut calibrator = Self::new(config, reference);
        calibrator.seed(seed)?;
        Ok(calibrator)
    }

    /// Replace the Phase A prior. Progress is not affected.
    pub fn seed(&mut self, seed: &CalibrationSnapshot) -> PipelineResult<()> {
        seed.validate()?;
        if self.phase == CalibrationPhase::Refined {
            return Err(helpers::calibration_error(
                "Cannot seed a refined calibration; reset it first",
                None::<String>,
            ));
        }
        self.bootstrap.seed_from(&seed.correction());
        info!(target: "magfusion::calibration",
            "Bootstrap seeded from {:?} calibration, offset {:?} uT",
            seed.phase, seed.hard_iron_ut
        );
        Ok(())
    }

    /// Feed one raw reading with the accelerometer and the current attitude estimate
    pub fn update(
        &mut self,
        mag_ut: &na::Vector3<f64>,
        accel_g: &na::Vector3<f64>,
        attitude: &EulerAngles,
    ) -> Option<CalibrationEvent> {
        self.sample_count += 1;
        if self.phase == CalibrationPhase::Refined {
            return None;
        }
        if self.phase == CalibrationPhase::Uninitialized {
            self.phase = CalibrationPhase::Bootstrap;
        }

        let was_complete = self.bootstrap.is_complete();
        match self.bootstrap.observe(mag_ut) {
            Observation::Accepted => {}
            Observation::Pending => return None,
            Observation::Rejected => {
                debug!(target: "magfusion::calibration",
                    "Raw sample {:?} rejected as outlier ({} so far)",
                    mag_ut, self.bootstrap.outliers()
                );
                return None;
            }
            Observation::Restarted => {
                warn!(target: "magfusion::calibration",
                    "Bootstrap restarted after {} consecutive outliers, {} buffered samples dropped",
                    bootstrap::REANCHOR_AFTER, self.samples.len()
                );
                self.samples.clear();
                self.last_stored_mag = None;
                self.stored_since_attempt = 0;
                self.coverage = None;
                return None;
            }
        }

        let mut event = None;
        if !was_complete && self.bootstrap.is_complete() {
            info!(target: "magfusion::calibration",
                "Bootstrap complete after {} samples, sphericity {:.2}",
                self.bootstrap.observed(), self.bootstrap.observed_sphericity()
            );
            event = Some(CalibrationEvent::BootstrapComplete);
        }

        self.store(CalibrationSample {
            mag_ut: *mag_ut,
            accel_g: *accel_g,
            attitude: *attitude,
        });

        if self.should_refine() {
            if let Some(refinement) = self.start_refinement() {
                event = Some(refinement);
            }
        }
        event
    }

    fn store(&mut self, sample: CalibrationSample) {
        let novel = match self.last_stored_mag {
            Some(last) => {
                utils::angle_between_deg(&last, &sample.mag_ut) >= self.config.min_sample_separation_deg
            }
            None => true,
        };
        if !novel {
            return;
        }
        if self.samples.len() == self.config.buffer_capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
        self.last_stored_mag = Some(sample.mag_ut);
        self.stored_since_attempt += 1;
        self.coverage = None;
    }

    /// Orientation coverage of the buffered samples, in degrees
    pub fn coverage_deg(&self) -> f64 {
        self.coverage.unwrap_or_else(|| buffer_coverage(&self.samples))
    }

    fn should_refine(&mut self) -> bool {
        if self.phase != CalibrationPhase::Bootstrap
            || !self.bootstrap.is_complete()
            || self.samples.len() < self.config.min_refine_samples
            || self.stored_since_attempt < self.retry_wait
        {
            return false;
        }
        if self.samples.len() >= self.config.buffer_capacity {
            return true;
        }
        let coverage = *self
            .coverage
            .get_or_insert_with(|| buffer_coverage(&self.samples));
        coverage >= self.config.quality.min_coverage_deg
    }

    fn start_refinement(&mut self) -> Option<CalibrationEvent> {
        let initial = self.bootstrap.correction()?;
        let samples: Vec<CalibrationSample> = self.samples.iter().copied().collect();
        self.attempts += 1;
        self.stored_since_attempt = 0;
        info!(target: "magfusion::calibration",
            "Starting refinement #{} on {} samples ({:?})",
            self.attempts, samples.len(), self.config.mode
        );

        match self.config.mode {
            RefinementMode::Inline => {
                self.phase = CalibrationPhase::Refining;
                let report = refine::run(&samples, &initial, &self.reference, &self.config);
                Some(self.apply_report(report))
            }
            RefinementMode::Background => {
                self.phase = CalibrationPhase::Refining;
                self.worker = Some(RefinementWorker::spawn(
                    samples,
                    initial,
                    self.reference,
                    self.config.clone(),
                ));
                Some(CalibrationEvent::RefinementStarted)
            }
        }
    }

    fn apply_report(&mut self, report: RefinementReport) -> CalibrationEvent {
        match report.outcome {
            Ok((correction, metrics)) => {
                info!(target: "magfusion::calibration",
                    "Refinement accepted after {} iterations: rms {:.2} -> {:.2} uT, hv {:.3}, confidence {:.2}",
                    report.iterations, report.initial_rms_ut, report.final_rms_ut,
                    metrics.hv_ratio, metrics.confidence
                );
                self.refined = Some((correction, metrics));
                self.phase = CalibrationPhase::Refined;
                self.last_failure = None;
                CalibrationEvent::Refined(metrics)
            }
            Err(failure) => {
                warn!(target: "magfusion::calibration",
                    "Refinement rejected on {} samples: {}", report.sample_count, failure
                );
                self.phase = CalibrationPhase::Bootstrap;
                self.retry_wait = self.config.retry_interval;
                self.last_failure = Some(failure.clone());
                CalibrationEvent::RefinementRejected(failure)
            }
        }
    }

    /// Collect a background refinement result if one is ready
    pub fn poll(&mut self) -> Option<CalibrationEvent> {
        let poll = self.worker.as_mut()?.poll();
        self.handle_poll(poll)
    }

    /// Block until a pending background refinement reports or `timeout` passes
    pub fn wait_for_refinement(&mut self, timeout: Duration) -> Option<CalibrationEvent> {
        let poll = self.worker.as_mut()?.wait(timeout);
        self.handle_poll(poll)
    }

    fn handle_poll(&mut self, poll: WorkerPoll) -> Option<CalibrationEvent> {
        match poll {
            WorkerPoll::Pending => None,
            WorkerPoll::Finished(report) => {
                self.worker = None;
                Some(self.apply_report(report))
            }
            WorkerPoll::Lost => {
                self.worker = None;
                let report = RefinementReport {
                    outcome: Err(RefinementFailure::WorkerLost),
                    sample_count: self.samples.len(),
                    iterations: 0,
                    initial_rms_ut: f64::NAN,
                    final_rms_ut: f64::NAN,
                };
                Some(self.apply_report(report))
            }
        }
    }

    /// Run Phase B now on the current buffer, bypassing the trigger conditions
    pub fn refine_now(&mut self) -> Result<QualityMetrics, RefinementFailure> {
        if let Some((_, metrics)) = self.refined {
            return Ok(metrics);
        }
        let initial = self.bootstrap.correction().ok_or(RefinementFailure::InsufficientSamples {
            available: self.samples.len(),
            required: self.config.min_refine_samples,
        })?;
        self.worker = None;
        self.attempts += 1;
        self.stored_since_attempt = 0;
        let samples: Vec<CalibrationSample> = self.samples.iter().copied().collect();
        let report = refine::run(&samples, &initial, &self.reference, &self.config);
        let outcome = report.outcome.clone();
        self.apply_report(report);
        outcome.map(|(_, metrics)| metrics)
    }

    /// Correction currently in force: Phase B if accepted, else Phase A (or its seeded prior)
    pub fn correction(&self) -> Option<IronCorrection> {
        match &self.refined {
            Some((correction, _)) => Some(*correction),
            None => self.bootstrap.correction(),
        }
    }

    /// Apply the current correction to a raw reading
    pub fn correct(&self, raw_ut: &na::Vector3<f64>) -> Option<na::Vector3<f64>> {
        self.correction().map(|c| c.apply(raw_ut))
    }

    /// True once a correction measured this session exists, not just a seeded prior
    pub fn has_iron_calibration(&self) -> bool {
        self.refined.is_some() || self.bootstrap.is_complete()
    }

    pub fn phase(&self) -> CalibrationPhase {
        self.phase
    }

    pub fn confidence(&self) -> f64 {
        match &self.refined {
            Some((_, metrics)) => metrics.confidence,
            None if self.bootstrap.observed() > 0 => self.bootstrap.confidence(),
            None => 0.0,
        }
    }

    /// Sphericity of the active correction: fitted ellipsoid after Phase B, observed spans before
    pub fn sphericity(&self) -> f64 {
        match &self.refined {
            Some((_, metrics)) => metrics.sphericity,
            None => self.bootstrap.observed_sphericity(),
        }
    }

    pub fn bootstrap_progress(&self) -> f64 {
        self.bootstrap.progress()
    }

    pub fn buffered_samples(&self) -> usize {
        self.samples.len()
    }

    pub fn last_failure(&self) -> Option<&RefinementFailure> {
        self.last_failure.as_ref()
    }

    pub fn quality(&self) -> Option<QualityMetrics> {
        self.refined.map(|(_, metrics)| metrics)
    }

    pub fn state(&self) -> CalibrationState {
        let correction = self.correction().unwrap_or_else(IronCorrection::identity);
        CalibrationState {
            hard_iron_ut: correction.hard_iron_ut,
            soft_iron: correction.soft_iron,
            phase: self.phase,
            sample_count: self.sample_count,
            quality: self.quality(),
            bootstrap_progress: self.bootstrap.progress(),
            confidence: self.confidence(),
            last_failure: self.last_failure.clone(),
        }
    }

    /// Snapshot of the active correction for seeding a later session
    pub fn export(&self) -> CalibrationSnapshot {
        let correction = self.correction().unwrap_or_else(IronCorrection::identity);
        CalibrationSnapshot::new(&correction, self.phase)
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.config.clone(), self.reference);
        debug!(target: "magfusion::calibration", "Iron calibrator reset");
    }
}

fn buffer_coverage(samples: &VecDeque<CalibrationSample>) -> f64 {
    utils::min_span(&utils::rotation_spans(samples.iter().map(|s| &s.attitude)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference() -> GeomagneticReference {
        GeomagneticReference::default()
    }

    fn distortion() -> IronCorrection {
        IronCorrection {
            hard_iron_ut: na::Vector3::new(28.0, -17.0, 42.0),
            soft_iron: na::Matrix3::new(1.08, 0.04, -0.02, 0.04, 0.93, 0.03, -0.02, 0.03, 1.02),
        }
    }

    /// Raw reading and gravity for a device at `attitude`
    fn reading(attitude: &EulerAngles) -> (na::Vector3<f64>, na::Vector3<f64>) {
        let q = attitude.to_quaternion();
        let truth = q.inverse() * reference().world_vector();
        let distortion = distortion();
        (
            distortion.soft_iron * truth + distortion.hard_iron_ut,
            q.inverse() * na::Vector3::z(),
        )
    }

    fn figure_eight(i: usize) -> EulerAngles {
        let s = i as f64;
        EulerAngles::new(
            5.0 + 70.0 * (std::f64::consts::TAU * s / 250.0).sin(),
            -3.0 + 45.0 * (2.0 * std::f64::consts::TAU * s / 250.0).sin(),
            40.0 + 360.0 * s / 500.0,
        )
    }

    fn feed(calibrator: &mut IronCalibrator, count: usize) -> Vec<CalibrationEvent> {
        (0..count)
            .filter_map(|i| {
                let attitude = figure_eight(i);
                let (mag, accel) = reading(&attitude);
                calibrator.update(&mag, &accel, &attitude)
            })
            .collect()
    }

    #[test]
    fn starts_uninitialized_without_correction() {
        let calibrator = IronCalibrator::new(CalibrationConfig::default(), reference());
        assert_eq!(calibrator.phase(), CalibrationPhase::Uninitialized);
        assert!(calibrator.correction().is_none());
        assert!(!calibrator.has_iron_calibration());
        assert_eq!(calibrator.confidence(), 0.0);
    }

    #[test]
    fn bootstrap_then_inline_refinement() {
        let mut calibrator = IronCalibrator::new(CalibrationConfig::default(), reference());
        let events = feed(&mut calibrator, 500);

        assert_eq!(events.first(), Some(&CalibrationEvent::BootstrapComplete));
        assert!(matches!(events.last(), Some(CalibrationEvent::Refined(_))));
        assert_eq!(calibrator.phase(), CalibrationPhase::Refined);
        assert!(calibrator.has_iron_calibration());

        let fitted = calibrator.correction().unwrap();
        let truth = distortion();
        assert!((fitted.hard_iron_ut - truth.hard_iron_ut).norm() < 1.0);
        let inverse = truth.soft_iron.try_inverse().unwrap();
        assert!((fitted.soft_iron - inverse).norm() < 0.03);
        assert!(calibrator.confidence() > 0.8);
    }

    #[test]
    fn spike_at_session_start_does_not_block_calibration() {
        let mut calibrator = IronCalibrator::new(CalibrationConfig::default(), reference());
        let attitude = figure_eight(0);
        let (mag, accel) = reading(&attitude);
        let spike = mag + na::Vector3::new(400.0, 0.0, 0.0);
        assert!(calibrator.update(&spike, &accel, &attitude).is_none());

        let events = feed(&mut calibrator, 500);
        assert!(matches!(events.last(), Some(CalibrationEvent::Refined(_))), "got {:?}", events);
        let fitted = calibrator.correction().unwrap();
        assert!((fitted.hard_iron_ut - distortion().hard_iron_ut).norm() < 1.0);
    }

    #[test]
    fn refine_now_reports_the_actual_failure() {
        let truth = distortion();
        let prior = IronCorrection {
            hard_iron_ut: truth.hard_iron_ut,
            soft_iron: truth.soft_iron.try_inverse().unwrap(),
        };
        let snapshot = CalibrationSnapshot::new(&prior, CalibrationPhase::Refined);
        let mut calibrator =
            IronCalibrator::with_seed(CalibrationConfig::default(), reference(), &snapshot).unwrap();

        // Held still: the seed gives a provisional correction but the buffer never grows
        for i in 0..300 {
            let attitude = EulerAngles::new(10.0 + 0.3 * (i as f64).sin(), -5.0, 30.0);
            let (mag, accel) = reading(&attitude);
            assert!(calibrator.update(&mag, &accel, &attitude).is_none());
        }
        assert_eq!(calibrator.buffered_samples(), 1);

        let failure = calibrator.refine_now().unwrap_err();
        assert_eq!(
            failure,
            RefinementFailure::InsufficientSamples {
                available: 1,
                required: 200
            }
        );
        assert_eq!(calibrator.last_failure(), Some(&failure));
        assert_eq!(calibrator.phase(), CalibrationPhase::Bootstrap);
        assert!(!calibrator.has_iron_calibration());
    }

    #[test]
    fn refine_now_on_refined_calibration_returns_its_metrics() {
        let mut calibrator = IronCalibrator::new(CalibrationConfig::default(), reference());
        feed(&mut calibrator, 500);
        let metrics = calibrator.quality().unwrap();
        assert_eq!(calibrator.refine_now(), Ok(metrics));
    }

    #[test]
    fn refined_calibration_is_frozen() {
        let mut calibrator = IronCalibrator::new(CalibrationConfig::default(), reference());
        feed(&mut calibrator, 500);
        let before = calibrator.correction();
        let (mag, accel) = reading(&EulerAngles::default());
        assert!(calibrator.update(&(mag * 3.0), &accel, &EulerAngles::default()).is_none());
        assert_eq!(calibrator.correction(), before);
        assert_eq!(calibrator.phase(), CalibrationPhase::Refined);

        calibrator.reset();
        assert_eq!(calibrator.phase(), CalibrationPhase::Uninitialized);
        assert!(calibrator.correction().is_none());
    }

    #[test]
    fn stationary_samples_do_not_flood_buffer() {
        let mut calibrator = IronCalibrator::new(CalibrationConfig::default(), reference());
        let attitude = EulerAngles::new(10.0, 5.0, 30.0);
        let (mag, accel) = reading(&attitude);
        for _ in 0..100 {
            calibrator.update(&mag, &accel, &attitude);
        }
        assert_eq!(calibrator.buffered_samples(), 1);
        assert_eq!(calibrator.state().sample_count, 100);
    }

    #[test]
    fn background_refinement_reports_through_poll() {
        let config = CalibrationConfig {
            mode: RefinementMode::Background,
            ..CalibrationConfig::default()
        };
        let mut calibrator = IronCalibrator::new(config, reference());
        let events = feed(&mut calibrator, 500);
        assert!(events.contains(&CalibrationEvent::RefinementStarted));
        assert_eq!(calibrator.phase(), CalibrationPhase::Refining);
        // Phase A stays in force while the worker runs
        assert!(calibrator.correction().is_some());

        let event = calibrator.wait_for_refinement(Duration::from_secs(60));
        assert!(matches!(event, Some(CalibrationEvent::Refined(_))), "got {:?}", event);
        assert_eq!(calibrator.phase(), CalibrationPhase::Refined);
        assert!(calibrator.poll().is_none());
    }

    #[test]
    fn export_seeds_a_new_session() {
        let mut calibrator = IronCalibrator::new(CalibrationConfig::default(), reference());
        feed(&mut calibrator, 500);
        let snapshot = calibrator.export();
        assert_eq!(snapshot.phase, CalibrationPhase::Refined);

        let seeded =
            IronCalibrator::with_seed(CalibrationConfig::default(), reference(), &snapshot).unwrap();
        assert_eq!(seeded.bootstrap_progress(), 0.0);
        assert!(!seeded.has_iron_calibration());
        // The prior is usable as a provisional correction
        assert!(seeded.correction().is_some());
    }
}
