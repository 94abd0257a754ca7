use std::io::Write;
use std::time::Duration;

use anyhow::Context;
use log::{info, warn};
use magfusion::simulation::{SimulatedSample, SimulationConfig, WristSimulator};
use magfusion::{CalibrationEvent, CalibrationPhase, DecoratedSample, FusionMode, Pipeline};
use serde::Serialize;

/// One line of the JSON-lines trace
#[derive(Debug, Serialize)]
pub struct TraceRecord {
    pub index: usize,
    pub timestamp_ms: f64,
    pub roll_deg: f64,
    pub pitch_deg: f64,
    pub yaw_deg: f64,
    pub attitude_error_deg: f64,
    pub nine_dof: bool,
    pub moving: bool,
    pub phase: CalibrationPhase,
    pub calibration_confidence: f64,
    pub earth_ready: bool,
    pub residual_ut: Option<[f64; 3]>,
    pub true_residual_ut: [f64; 3],
    pub confident: bool,
    pub anomaly: bool,
}

impl TraceRecord {
    fn new(index: usize, truth: &SimulatedSample, out: &DecoratedSample) -> Self {
        Self {
            index,
            timestamp_ms: out.timestamp_ms,
            roll_deg: out.euler.roll_deg,
            pitch_deg: out.euler.pitch_deg,
            yaw_deg: out.euler.yaw_deg,
            attitude_error_deg: out.orientation.angle_to(&truth.true_attitude).to_degrees(),
            nine_dof: out.fusion_mode == FusionMode::NineDof,
            moving: out.motion.is_moving,
            phase: out.calibration.phase,
            calibration_confidence: out.calibration.confidence,
            earth_ready: out.earth_field_ready,
            residual_ut: out.residual_ut.map(|r| [r.x, r.y, r.z]),
            true_residual_ut: truth.true_residual_ut.into(),
            confident: out.confident,
            anomaly: out.magnetic_anomaly,
        }
    }
}

/// What happened over a replayed trace
#[derive(Debug, Default, Serialize)]
pub struct ReplaySummary {
    pub samples: usize,
    pub rejected_samples: usize,
    pub bootstrap_complete_at: Option<usize>,
    pub refined_at: Option<usize>,
    pub refinement_rejections: usize,
    pub earth_ready_at: Option<usize>,
    pub anomalies: usize,
    pub max_attitude_error_deg: f64,
    /// Mean residual error against the injected truth over confident samples
    pub mean_residual_error_ut: Option<f64>,
}

pub struct Replay {
    pipeline: Pipeline,
    simulator: WristSimulator,
}

impl Replay {
    pub fn new(pipeline: Pipeline, simulation: SimulationConfig) -> Self {
        Self {
            pipeline,
            simulator: WristSimulator::new(simulation),
        }
    }

    /// Run the whole trace, writing one JSON line per sample to `trace` if given
    pub fn run(&mut self, mut trace: Option<&mut dyn Write>) -> anyhow::Result<ReplaySummary> {
        let mut summary = ReplaySummary::default();
        let mut residual_error_sum = 0.0;
        let mut residual_error_count = 0usize;

        for (index, truth) in self.simulator.by_ref().enumerate() {
            summary.samples += 1;
            let out = match self.pipeline.process(&truth.sample) {
                Ok(out) => out,
                Err(err) => {
                    warn!("Sample {} rejected: {}", index, err);
                    summary.rejected_samples += 1;
                    continue;
                }
            };

            if let Some(event) = &out.calibration_event {
                note_event(&mut summary, index, event);
            }
            if out.earth_field_ready && summary.earth_ready_at.is_none() {
                summary.earth_ready_at = Some(index);
            }
            if out.magnetic_anomaly {
                summary.anomalies += 1;
            }
            let error_deg = out.orientation.angle_to(&truth.true_attitude).to_degrees();
            summary.max_attitude_error_deg = summary.max_attitude_error_deg.max(error_deg);
            if let (true, Some(residual)) = (out.confident, out.residual_ut) {
                residual_error_sum += (residual - truth.true_residual_ut).norm();
                residual_error_count += 1;
            }

            if let Some(writer) = trace.as_mut() {
                let line = serde_json::to_string(&TraceRecord::new(index, &truth, &out))?;
                writeln!(writer, "{}", line).context("Failed to write trace line")?;
            }
        }

        if self.pipeline.calibration_state().phase == CalibrationPhase::Refining {
            info!("Waiting for background refinement to finish");
            if let Some(event) = self.pipeline.wait_for_refinement(Duration::from_secs(30)) {
                let samples = summary.samples;
                note_event(&mut summary, samples, &event);
            }
        }

        if residual_error_count > 0 {
            summary.mean_residual_error_ut = Some(residual_error_sum / residual_error_count as f64);
        }
        Ok(summary)
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }
}

fn note_event(summary: &mut ReplaySummary, index: usize, event: &CalibrationEvent) {
    match event {
        CalibrationEvent::BootstrapComplete => {
            info!("Sample {}: bootstrap calibration complete", index);
            summary.bootstrap_complete_at = Some(index);
        }
        CalibrationEvent::RefinementStarted => {
            info!("Sample {}: background refinement started", index);
        }
        CalibrationEvent::Refined(metrics) => {
            info!(
                "Sample {}: refined, rms {:.2} uT, H/V {:.3}, sphericity {:.2}, confidence {:.2}",
                index, metrics.residual_rms_ut, metrics.hv_ratio, metrics.sphericity,
                metrics.confidence
            );
            summary.refined_at = Some(index);
        }
        CalibrationEvent::RefinementRejected(failure) => {
            warn!("Sample {}: refinement rejected: {}", index, failure);
            summary.refinement_rejections += 1;
        }
    }
}
