use log::debug;
use nalgebra as na;
use std::collections::VecDeque;

use crate::config::MotionConfig;

/// Result of one classification step
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotionState {
    /// True unless the window is full and both spreads are below threshold
    pub is_moving: bool,
    /// Accelerometer spread over the window in g
    pub accel_std_g: f64,
    /// Gyroscope spread over the window in deg/s
    pub gyro_std_dps: f64,
    /// Whether the rolling window has reached its configured size
    pub window_filled: bool,
}

impl Default for MotionState {
    fn default() -> Self {
        Self {
            is_moving: true,
            accel_std_g: 0.0,
            gyro_std_dps: 0.0,
            window_filled: false,
        }
    }
}

/// Rolling-variance stationary detector over accelerometer and gyroscope
#[derive(Debug, Clone)]
pub struct MotionClassifier {
    config: MotionConfig,
    accel: VecDeque<na::Vector3<f64>>,
    gyro: VecDeque<na::Vector3<f64>>,
    state: MotionState,
}

impl MotionClassifier {
    pub fn new(config: MotionConfig) -> Self {
        Self {
            accel: VecDeque::with_capacity(config.window_size),
            gyro: VecDeque::with_capacity(config.window_size),
            config,
            state: MotionState::default(),
        }
    }

    /// Push one reading pair and reclassify.
    ///
    /// Each group's spread is the square root of the summed per-axis population
    /// variances, i.e. the RMS distance of the readings from their mean.
    pub fn update(&mut self, accel_g: &na::Vector3<f64>, gyro_dps: &na::Vector3<f64>) -> MotionState {
        push_bounded(&mut self.accel, *accel_g, self.config.window_size);
        push_bounded(&mut self.gyro, *gyro_dps, self.config.window_size);

        let window_filled = self.accel.len() >= self.config.window_size;
        let accel_std_g = spread(&self.accel);
        let gyro_std_dps = spread(&self.gyro);
        let is_moving = !(window_filled
            && accel_std_g < self.config.accel_std_threshold_g
            && gyro_std_dps < self.config.gyro_std_threshold_dps);

        if is_moving != self.state.is_moving {
            debug!(target: "magfusion::motion",
                "Motion state changed: moving={} accel_std={:.4} g gyro_std={:.3} dps",
                is_moving, accel_std_g, gyro_std_dps
            );
        }

        self.state = MotionState {
            is_moving,
            accel_std_g,
            gyro_std_dps,
            window_filled,
        };
        self.state
    }

    /// Latest classification
    pub fn state(&self) -> MotionState {
        self.state
    }

    pub fn reset(&mut self) {
        self.accel.clear();
        self.gyro.clear();
        self.state = MotionState::default();
    }
}

fn push_bounded(window: &mut VecDeque<na::Vector3<f64>>, value: na::Vector3<f64>, capacity: usize) {
    if window.len() == capacity {
        window.pop_front();
    }
    window.push_back(value);
}

fn spread(window: &VecDeque<na::Vector3<f64>>) -> f64 {
    if window.len() < 2 {
        return 0.0;
    }
    let n = window.len() as f64;
    let mean = window.iter().fold(na::Vector3::zeros(), |acc, v| acc + v) / n;
    let variance = window.iter().map(|v| (v - mean).norm_squared()).sum::<f64>() / n;
    variance.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn still_accel() -> na::Vector3<f64> {
        na::Vector3::new(0.0, 0.0, 1.0)
    }

    #[test]
    fn reports_moving_until_window_fills() {
        let mut classifier = MotionClassifier::new(MotionConfig::default());
        for i in 0..19 {
            let state = classifier.update(&still_accel(), &na::Vector3::zeros());
            assert!(state.is_moving, "sample {} classified stationary early", i);
            assert!(!state.window_filled);
        }
        let state = classifier.update(&still_accel(), &na::Vector3::zeros());
        assert!(state.window_filled);
        assert!(!state.is_moving);
    }

    #[test]
    fn gyro_spread_marks_motion() {
        let mut classifier = MotionClassifier::new(MotionConfig::default());
        for i in 0..40 {
            let rate = if i % 2 == 0 { 5.0 } else { -5.0 };
            classifier.update(&still_accel(), &na::Vector3::new(rate, 0.0, 0.0));
        }
        let state = classifier.state();
        assert!(state.is_moving);
        assert!((state.gyro_std_dps - 5.0).abs() < 1e-9);
    }

    #[test]
    fn constant_rotation_rate_is_not_spread() {
        // A constant gyro offset is bias, not motion
        let mut classifier = MotionClassifier::new(MotionConfig::default());
        for _ in 0..25 {
            classifier.update(&still_accel(), &na::Vector3::new(0.8, -0.5, 0.3));
        }
        assert!(!classifier.state().is_moving);
        assert!(classifier.state().gyro_std_dps < 1e-12);
    }

    #[test]
    fn reset_clears_window() {
        let mut classifier = MotionClassifier::new(MotionConfig::default());
        for _ in 0..25 {
            classifier.update(&still_accel(), &na::Vector3::zeros());
        }
        classifier.reset();
        assert_eq!(classifier.state(), MotionState::default());
        assert!(classifier.update(&still_accel(), &na::Vector3::zeros()).is_moving);
    }
}
