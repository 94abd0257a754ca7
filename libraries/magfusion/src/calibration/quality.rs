use nalgebra as na;

use super::{CalibrationSample, IronCorrection, QualityMetrics, RefinementFailure};
use crate::config::QualityGateConfig;
use crate::sensors::GeomagneticReference;
use crate::utils;

/// Ratio of mean horizontal to mean vertical magnitude of corrected samples,
/// levelled with each sample's own accelerometer tilt
pub fn hv_ratio(samples: &[CalibrationSample], correction: &IronCorrection) -> f64 {
    let (horizontal, vertical) = samples.iter().fold((0.0, 0.0), |(h, v), sample| {
        let levelled = utils::tilt_quaternion(&sample.accel_g) * correction.apply(&sample.mag_ut);
        (h + levelled.x.hypot(levelled.y), v + levelled.z.abs())
    });
    if vertical <= f64::EPSILON {
        f64::INFINITY
    } else {
        horizontal / vertical
    }
}

/// Smallest per-axis span of the raw readings, independent of any attitude estimate
pub fn raw_field_span(samples: &[CalibrationSample]) -> f64 {
    let Some(first) = samples.first() else {
        return 0.0;
    };
    let (min, max) = samples.iter().fold((first.mag_ut, first.mag_ut), |(min, max), s| {
        (min.inf(&s.mag_ut), max.sup(&s.mag_ut))
    });
    (max - min).min()
}

/// Score all quality dimensions of a fitted correction
pub fn assess(
    samples: &[CalibrationSample],
    correction: &IronCorrection,
    residual_rms_ut: f64,
    reference: &GeomagneticReference,
    config: &QualityGateConfig,
) -> QualityMetrics {
    let spans = utils::rotation_spans(samples.iter().map(|s| &s.attitude));
    let coverage_deg = utils::min_span(&spans);
    let hv = hv_ratio(samples, correction);
    let sphericity = correction.ellipsoid_sphericity();

    let rms_score = (1.0 - residual_rms_ut / config.max_residual_rms_ut).clamp(0.0, 1.0);
    let hv_score = if hv.is_finite() {
        (1.0 - (hv - reference.hv_ratio()).abs() / config.hv_tolerance).clamp(0.0, 1.0)
    } else {
        0.0
    };
    let sphericity_score = if sphericity >= config.min_sphericity {
        1.0
    } else {
        sphericity / config.min_sphericity
    };

    QualityMetrics {
        residual_rms_ut,
        sphericity,
        hv_ratio: hv,
        confidence: rms_score * hv_score * sphericity_score,
        coverage_deg,
        field_span_ut: raw_field_span(samples),
    }
}

/// Run the gates in order; the first failure wins
pub fn check(
    metrics: &QualityMetrics,
    reference: &GeomagneticReference,
    config: &QualityGateConfig,
) -> Result<(), RefinementFailure> {
    if metrics.coverage_deg < config.min_coverage_deg {
        return Err(RefinementFailure::InsufficientCoverage {
            coverage_deg: metrics.coverage_deg,
            required_deg: config.min_coverage_deg,
        });
    }

    // Attitude labels can drift while the device sits still; the raw field cannot
    let required_ut = config.min_field_span_fraction * reference.expected_range();
    if metrics.field_span_ut < required_ut {
        return Err(RefinementFailure::NarrowFieldSpan {
            span_ut: metrics.field_span_ut,
            required_ut,
        });
    }

    let expected = reference.hv_ratio();
    let measured = metrics.hv_ratio;
    if (expected - 1.0).abs() > config.hv_inversion_margin && (expected < 1.0) != (measured < 1.0) {
        return Err(RefinementFailure::HvRatioInverted { measured, expected });
    }
    let factor = measured / expected;
    if !measured.is_finite()
        || (measured - expected).abs() > config.hv_tolerance
        || factor > config.max_hv_factor
        || factor < 1.0 / config.max_hv_factor
    {
        return Err(RefinementFailure::HvRatioMismatch { measured, expected });
    }

    if metrics.residual_rms_ut > config.max_residual_rms_ut {
        return Err(RefinementFailure::ResidualTooLarge {
            rms_ut: metrics.residual_rms_ut,
            limit_ut: config.max_residual_rms_ut,
        });
    }

    if metrics.confidence < config.min_confidence {
        return Err(RefinementFailure::LowConfidence {
            confidence: metrics.confidence,
            required: config.min_confidence,
        });
    }
    Ok(())
}

impl IronCorrection {
    /// Smallest over largest semi-axis of the raw-space ellipsoid this correction maps to a sphere
    pub fn ellipsoid_sphericity(&self) -> f64 {
        let Some(inverse) = self.soft_iron.try_inverse() else {
            return 0.0;
        };
        let extents = na::Vector3::new(
            inverse.row(0).norm(),
            inverse.row(1).norm(),
            inverse.row(2).norm(),
        );
        let largest = extents.max();
        if largest <= 0.0 || !largest.is_finite() {
            0.0
        } else {
            extents.min() / largest
        }
    }
}
