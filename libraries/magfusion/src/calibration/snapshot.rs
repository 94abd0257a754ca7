use nalgebra as na;
use serde::{Deserialize, Serialize};

use super::{CalibrationPhase, IronCorrection};
use crate::error::{helpers, PipelineResult};

/// Portable calibration record for seeding a later session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationSnapshot {
    /// Hard-iron offset in microtesla
    pub hard_iron_ut: [f64; 3],
    /// Soft-iron correction matrix, row-major
    pub soft_iron: [[f64; 3]; 3],
    /// Phase the calibration had reached when exported
    pub phase: CalibrationPhase,
}

impl CalibrationSnapshot {
    pub fn new(correction: &IronCorrection, phase: CalibrationPhase) -> Self {
        let m = &correction.soft_iron;
        Self {
            hard_iron_ut: [
                correction.hard_iron_ut.x,
                correction.hard_iron_ut.y,
                correction.hard_iron_ut.z,
            ],
            soft_iron: [
                [m[(0, 0)], m[(0, 1)], m[(0, 2)]],
                [m[(1, 0)], m[(1, 1)], m[(1, 2)]],
                [m[(2, 0)], m[(2, 1)], m[(2, 2)]],
            ],
            phase,
        }
    }

    pub fn correction(&self) -> IronCorrection {
        let s = &self.soft_iron;
        IronCorrection {
            hard_iron_ut: na::Vector3::from(self.hard_iron_ut),
            soft_iron: na::Matrix3::new(
                s[0][0], s[0][1], s[0][2], s[1][0], s[1][1], s[1][2], s[2][0], s[2][1], s[2][2],
            ),
        }
    }

    /// Reject snapshots that could not have come from a working calibration
    pub fn validate(&self) -> PipelineResult<()> {
        let mut values = self.hard_iron_ut.iter().chain(self.soft_iron.iter().flatten());
        if values.any(|v| !v.is_finite()) {
            return Err(helpers::calibration_error(
                "Snapshot contains NaN or infinite values",
                None::<String>,
            ));
        }
        let correction = self.correction();
        if correction.soft_iron.try_inverse().is_none() {
            return Err(helpers::calibration_error(
                "Snapshot soft-iron matrix is singular",
                Some(format!("{:?}", self.soft_iron)),
            ));
        }
        if (0..3).any(|axis| correction.soft_iron[(axis, axis)] <= 0.0) {
            return Err(helpers::calibration_error(
                "Snapshot soft-iron diagonal must be positive",
                Some(format!("{:?}", self.soft_iron)),
            ));
        }
        Ok(())
    }

    pub fn to_json(&self) -> PipelineResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| {
            helpers::calibration_error("Failed to serialize calibration", Some(e.to_string()))
        })
    }

    pub fn from_json(json: &str) -> PipelineResult<Self> {
        let snapshot: Self = serde_json::from_str(json).map_err(|e| {
            helpers::calibration_error("Failed to parse calibration", Some(e.to_string()))
        })?;
        snapshot.validate()?;
        Ok(snapshot)
    }
}
