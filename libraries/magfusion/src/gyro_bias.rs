use log::debug;
use nalgebra as na;

use crate::config::GyroBiasConfig;

/// Exponential moving average of the gyroscope reading while the unit is still
#[derive(Debug, Clone)]
pub struct GyroBiasTracker {
    alpha: f64,
    bias: na::Vector3<f64>,
    updates: u32,
}

impl GyroBiasTracker {
    pub fn new(config: &GyroBiasConfig) -> Self {
        Self {
            alpha: config.alpha,
            bias: na::Vector3::zeros(),
            updates: 0,
        }
    }

    /// Blend a reading into the estimate. Frozen while moving.
    pub fn update(&mut self, gyro_dps: &na::Vector3<f64>, is_moving: bool) -> na::Vector3<f64> {
        if is_moving {
            return self.bias;
        }
        self.bias += (gyro_dps - self.bias) * self.alpha;
        self.updates = self.updates.saturating_add(1);

        if self.updates % 50 == 1 {
            debug!(target: "magfusion::gyro_bias",
                "Gyro bias updated: bias=[{:.4}, {:.4}, {:.4}] dps, updates={}",
                self.bias.x, self.bias.y, self.bias.z, self.updates
            );
        }
        self.bias
    }

    /// Current bias estimate in deg/s
    pub fn bias(&self) -> na::Vector3<f64> {
        self.bias
    }

    /// Subtract the bias from a gyroscope reading
    pub fn correct(&self, gyro_dps: &na::Vector3<f64>) -> na::Vector3<f64> {
        gyro_dps - self.bias
    }

    /// Number of stationary readings blended so far
    pub fn updates(&self) -> u32 {
        self.updates
    }

    /// Fraction of the true bias the estimate has absorbed, assuming a constant bias
    pub fn convergence(&self) -> f64 {
        1.0 - (1.0 - self.alpha).powi(self.updates.min(i32::MAX as u32) as i32)
    }

    pub fn reset(&mut self) {
        self.bias = na::Vector3::zeros();
        self.updates = 0;
        debug!(target: "magfusion::gyro_bias", "Gyro bias tracker reset");
    }
}
