use log::debug;
use nalgebra as na;

use super::{quality, CalibrationSample, IronCorrection, RefinementFailure, RefinementReport};
use crate::config::{CalibrationConfig, RefinementConfig};
use crate::sensors::GeomagneticReference;
use crate::utils;

/// Hard-iron offsets (3) followed by the soft-iron matrix, row-major (9)
pub(crate) const PARAM_COUNT: usize = 12;

type Params = na::SVector<f64, PARAM_COUNT>;
type Normal = na::SMatrix<f64, PARAM_COUNT, PARAM_COUNT>;
type SampleJacobian = na::SMatrix<f64, 3, PARAM_COUNT>;

/// Reference field as the sensor should see it, given gravity and the corrected reading.
///
/// Roll and pitch come from the accelerometer. Yaw is the tilt-compensated
/// heading of `corrected_ut`, so only the split between horizontal and
/// vertical components constrains the fit.
pub fn expected_sensor_field(
    accel_g: &na::Vector3<f64>,
    corrected_ut: &na::Vector3<f64>,
    reference: &GeomagneticReference,
) -> na::Vector3<f64> {
    let (roll, pitch) = utils::tilt_from_accel(accel_g);
    let levelled = na::UnitQuaternion::from_euler_angles(roll, pitch, 0.0) * corrected_ut;
    let yaw = (-levelled.y).atan2(levelled.x);
    let attitude = na::UnitQuaternion::from_euler_angles(roll, pitch, yaw);
    attitude.inverse() * reference.world_vector()
}

impl IronCorrection {
    pub(crate) fn to_params(&self) -> Params {
        let m = &self.soft_iron;
        Params::from_column_slice(&[
            self.hard_iron_ut.x,
            self.hard_iron_ut.y,
            self.hard_iron_ut.z,
            m[(0, 0)],
            m[(0, 1)],
            m[(0, 2)],
            m[(1, 0)],
            m[(1, 1)],
            m[(1, 2)],
            m[(2, 0)],
            m[(2, 1)],
            m[(2, 2)],
        ])
    }

    pub(crate) fn from_params(p: &Params) -> Self {
        Self {
            hard_iron_ut: na::Vector3::new(p[0], p[1], p[2]),
            soft_iron: na::Matrix3::new(p[3], p[4], p[5], p[6], p[7], p[8], p[9], p[10], p[11]),
        }
    }
}

/// Outcome of one Levenberg-Marquardt run
#[derive(Debug, Clone)]
pub struct LmOutcome {
    pub correction: IronCorrection,
    pub initial_rms_ut: f64,
    pub final_rms_ut: f64,
    /// Damped solves attempted, accepted or not
    pub iterations: usize,
    pub accepted_steps: usize,
}

fn residual(
    params: &Params,
    sample: &CalibrationSample,
    reference: &GeomagneticReference,
) -> na::Vector3<f64> {
    let corrected = IronCorrection::from_params(params).apply(&sample.mag_ut);
    corrected - expected_sensor_field(&sample.accel_g, &corrected, reference)
}

fn cost(params: &Params, samples: &[CalibrationSample], reference: &GeomagneticReference) -> f64 {
    samples
        .iter()
        .map(|s| residual(params, s, reference).norm_squared())
        .sum()
}

fn clamp_params(params: &mut Params, config: &RefinementConfig) {
    let (diag_low, diag_high) = config.diagonal_bounds;
    for k in 0..3 {
        params[k] = params[k].clamp(-config.max_offset_ut, config.max_offset_ut);
    }
    for row in 0..3 {
        for col in 0..3 {
            let k = 3 + 3 * row + col;
            params[k] = if row == col {
                params[k].clamp(diag_low, diag_high)
            } else {
                params[k].clamp(-config.max_off_diagonal, config.max_off_diagonal)
            };
        }
    }
}

fn step_size(k: usize, config: &RefinementConfig) -> f64 {
    if k < 3 {
        config.offset_step_ut
    } else {
        config.matrix_step
    }
}

/// Accumulate `JᵀJ` and `Jᵀr` with a central-difference Jacobian
fn normal_equations(
    params: &Params,
    samples: &[CalibrationSample],
    reference: &GeomagneticReference,
    config: &RefinementConfig,
) -> (Normal, Params) {
    let mut jtj = Normal::zeros();
    let mut jtr = Params::zeros();
    for sample in samples {
        let r = residual(params, sample, reference);
        let mut jacobian = SampleJacobian::zeros();
        for k in 0..PARAM_COUNT {
            let h = step_size(k, config);
            let mut plus = *params;
            let mut minus = *params;
            plus[k] += h;
            minus[k] -= h;
            let column =
                (residual(&plus, sample, reference) - residual(&minus, sample, reference)) / (2.0 * h);
            jacobian.set_column(k, &column);
        }
        jtj += jacobian.transpose() * jacobian;
        jtr += jacobian.transpose() * r;
    }
    (jtj, jtr)
}

/// Fit offsets and the full soft-iron matrix so corrected readings match the
/// orientation-implied reference field.
pub fn levenberg_marquardt(
    samples: &[CalibrationSample],
    initial: &IronCorrection,
    reference: &GeomagneticReference,
    config: &RefinementConfig,
) -> Result<LmOutcome, RefinementFailure> {
    if samples.is_empty() {
        return Err(RefinementFailure::InsufficientSamples {
            available: 0,
            required: 1,
        });
    }
    let count = samples.len() as f64;
    let rms = |cost: f64| (cost / count).sqrt();

    let mut params = initial.to_params();
    clamp_params(&mut params, config);
    let initial_cost = cost(&params, samples, reference);
    if !initial_cost.is_finite() {
        return Err(RefinementFailure::Diverged { iterations: 0 });
    }

    let mut current = initial_cost;
    let mut lambda = config.initial_lambda;
    let mut iterations = 0;
    let mut accepted_steps = 0;

    'outer: while iterations < config.max_iterations {
        let (jtj, jtr) = normal_equations(&params, samples, reference, config);
        let mut improved = false;
        let mut relative_decrease = f64::INFINITY;

        while iterations < config.max_iterations {
            iterations += 1;
            let mut damped = jtj;
            for k in 0..PARAM_COUNT {
                damped[(k, k)] += lambda * jtj[(k, k)].max(1e-9);
            }
            let Some(cholesky) = na::Cholesky::new(damped) else {
                lambda *= 10.0;
                if lambda > config.max_lambda {
                    break 'outer;
                }
                continue;
            };
            let delta = cholesky.solve(&(-jtr));
            let mut candidate = params + delta;
            clamp_params(&mut candidate, config);
            let candidate_cost = cost(&candidate, samples, reference);

            if candidate_cost.is_finite() && candidate_cost < current {
                relative_decrease = (current - candidate_cost) / current;
                params = candidate;
                current = candidate_cost;
                lambda = (lambda * 0.1).max(1e-12);
                accepted_steps += 1;
                improved = true;
                debug!(target: "magfusion::calibration",
                    "LM step {} accepted: rms={:.3} uT lambda={:.1e}",
                    iterations, rms(current), lambda
                );
                break;
            }
            lambda *= 10.0;
            if lambda > config.max_lambda {
                break;
            }
        }

        if !improved || relative_decrease < config.tolerance {
            break;
        }
    }

    Ok(LmOutcome {
        correction: IronCorrection::from_params(&params),
        initial_rms_ut: rms(initial_cost),
        final_rms_ut: rms(current),
        iterations,
        accepted_steps,
    })
}

/// Full Phase B attempt: fit, then run every quality gate
pub(crate) fn run(
    samples: &[CalibrationSample],
    initial: &IronCorrection,
    reference: &GeomagneticReference,
    config: &CalibrationConfig,
) -> RefinementReport {
    let mut report = RefinementReport {
        outcome: Err(RefinementFailure::InsufficientSamples {
            available: samples.len(),
            required: config.min_refine_samples,
        }),
        sample_count: samples.len(),
        iterations: 0,
        initial_rms_ut: f64::NAN,
        final_rms_ut: f64::NAN,
    };
    if samples.len() < config.min_refine_samples {
        return report;
    }

    let fit = match levenberg_marquardt(samples, initial, reference, &config.refinement) {
        Ok(fit) => fit,
        Err(failure) => {
            report.outcome = Err(failure);
            return report;
        }
    };
    report.iterations = fit.iterations;
    report.initial_rms_ut = fit.initial_rms_ut;
    report.final_rms_ut = fit.final_rms_ut;

    if !fit.final_rms_ut.is_finite()
        || (fit.accepted_steps == 0 && fit.final_rms_ut > config.quality.max_residual_rms_ut)
    {
        report.outcome = Err(RefinementFailure::Diverged {
            iterations: fit.iterations,
        });
        return report;
    }

    let metrics = quality::assess(samples, &fit.correction, fit.final_rms_ut, reference, &config.quality);
    report.outcome = quality::check(&metrics, reference, &config.quality).map(|_| (fit.correction, metrics));
    report
}
