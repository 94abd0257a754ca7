use log::debug;
use nalgebra as na;
use std::collections::VecDeque;

use crate::calibration::IronCorrection;
use crate::config::EarthFieldConfig;
use crate::sensors::{self, GeomagneticReference};
use crate::utils::{self, EulerAngles};

/// Current world-frame Earth field estimate
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EarthEstimate {
    /// Window mean of the rotated corrected field, in microtesla
    pub world_field_ut: na::Vector3<f64>,
    /// Samples contributing to the mean
    pub sample_count: usize,
    /// Enough samples and enough rotation on every axis
    pub ready: bool,
    /// Rotation spans covered by the contributing samples, in degrees
    pub spans: EulerAngles,
}

#[derive(Debug, Clone, Copy)]
struct WindowEntry {
    raw_ut: na::Vector3<f64>,
    attitude: na::UnitQuaternion<f64>,
    euler: EulerAngles,
    /// None without a correction, or when the correction leaves the reading off the reference sphere
    world_ut: Option<na::Vector3<f64>>,
}

/// Sliding-window average of iron-corrected readings rotated into the world frame.
///
/// The window keeps raw readings with the attitude they were taken at. When
/// the iron correction changes the whole window is corrected again instead of
/// being thrown away, and a heading re-alignment is applied to the stored
/// attitudes, so readiness carries across calibration changes. Readings taken
/// before any correction existed are kept too and start counting as soon as
/// one arrives.
#[derive(Debug, Clone)]
pub struct EarthFieldEstimator {
    config: EarthFieldConfig,
    reference_magnitude_ut: f64,
    window: VecDeque<WindowEntry>,
    correction: Option<IronCorrection>,
    sum: na::Vector3<f64>,
    /// Entries with a world vector
    used: usize,
    pushes: usize,
    spans: EulerAngles,
    ready: bool,
}

impl EarthFieldEstimator {
    pub fn new(config: EarthFieldConfig, reference: GeomagneticReference) -> Self {
        Self {
            window: VecDeque::with_capacity(config.window_capacity),
            config,
            reference_magnitude_ut: reference.magnitude(),
            correction: None,
            sum: na::Vector3::zeros(),
            used: 0,
            pushes: 0,
            spans: EulerAngles::default(),
            ready: false,
        }
    }

    /// Add a raw reading taken at `attitude`
    pub fn update(&mut self, raw_ut: &na::Vector3<f64>, attitude: &na::UnitQuaternion<f64>) {
        if self.window.len() == self.config.window_capacity {
            if let Some(world) = self.window.pop_front().and_then(|oldest| oldest.world_ut) {
                self.sum -= world;
                self.used -= 1;
            }
        }
        let mut entry = WindowEntry {
            raw_ut: *raw_ut,
            attitude: *attitude,
            euler: EulerAngles::from_quaternion(attitude),
            world_ut: None,
        };
        entry.world_ut = self.world_vector(&entry);
        if let Some(world) = entry.world_ut {
            self.sum += world;
            self.used += 1;
        }
        self.window.push_back(entry);
        self.pushes = self.pushes.wrapping_add(1);

        // Re-sum once per window turnover so subtraction error cannot build up
        if self.pushes % self.config.window_capacity == 0 {
            self.resum();
        }
        self.refresh();
    }

    /// Switch to a new iron correction, re-correcting every reading in the window
    pub fn set_correction(&mut self, correction: Option<&IronCorrection>) {
        if self.correction.as_ref() == correction {
            return;
        }
        self.correction = correction.copied();
        self.recompute();
        debug!(target: "magfusion::earth_field",
            "Window re-corrected: {} of {} readings usable", self.used, self.window.len()
        );
    }

    /// Re-express the window after the world frame was rotated by `rotation`
    pub fn rotate(&mut self, rotation: &na::UnitQuaternion<f64>) {
        for entry in self.window.iter_mut() {
            entry.attitude = rotation * entry.attitude;
            entry.euler = EulerAngles::from_quaternion(&entry.attitude);
            entry.world_ut = entry.world_ut.map(|world| rotation * world);
        }
        self.resum();
        self.refresh();
    }

    fn world_vector(&self, entry: &WindowEntry) -> Option<na::Vector3<f64>> {
        let corrected = self.correction.as_ref()?.apply(&entry.raw_ut);
        if (corrected.norm() - self.reference_magnitude_ut).abs() > self.config.max_magnitude_error_ut {
            return None;
        }
        Some(sensors::sensor_to_world(&corrected, &entry.attitude))
    }

    fn recompute(&mut self) {
        for i in 0..self.window.len() {
            let world = self.world_vector(&self.window[i]);
            self.window[i].world_ut = world;
        }
        self.resum();
        self.refresh();
    }

    fn resum(&mut self) {
        let (sum, used) = self
            .window
            .iter()
            .filter_map(|e| e.world_ut)
            .fold((na::Vector3::zeros(), 0), |(sum, used), world| (sum + world, used + 1));
        self.sum = sum;
        self.used = used;
    }

    /// Recompute the cached spans and readiness after the window changed
    fn refresh(&mut self) {
        self.spans = utils::rotation_spans(
            self.window
                .iter()
                .filter(|e| e.world_ut.is_some())
                .map(|e| &e.euler),
        );
        let ready = self.used >= self.config.min_samples
            && utils::min_span(&self.spans) >= self.config.min_rotation_deg;
        if ready != self.ready {
            debug!(target: "magfusion::earth_field",
                "Earth field ready={} with {} samples, mean={:?} uT",
                ready, self.used, self.mean()
            );
            self.ready = ready;
        }
    }

    /// Window mean regardless of readiness
    pub fn mean(&self) -> Option<na::Vector3<f64>> {
        if self.used == 0 {
            None
        } else {
            Some(self.sum / self.used as f64)
        }
    }

    /// Rotation spans (roll, pitch, yaw) covered by the contributing samples, in degrees
    pub fn spans(&self) -> EulerAngles {
        self.spans
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Mean world field, only once ready
    pub fn world_field(&self) -> Option<na::Vector3<f64>> {
        if self.ready {
            self.mean()
        } else {
            None
        }
    }

    /// Samples contributing to the mean
    pub fn len(&self) -> usize {
        self.used
    }

    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    /// Raw readings held, whether or not they contribute
    pub fn buffered(&self) -> usize {
        self.window.len()
    }

    /// 1 when ready, otherwise half the fill fraction toward `min_samples`
    pub fn confidence(&self) -> f64 {
        if self.ready {
            1.0
        } else {
            0.5 * (self.used as f64 / self.config.min_samples as f64).min(1.0)
        }
    }

    pub fn estimate(&self) -> Option<EarthEstimate> {
        Some(EarthEstimate {
            world_field_ut: self.mean()?,
            sample_count: self.used,
            ready: self.ready,
            spans: self.spans,
        })
    }

    pub fn reset(&mut self) {
        self.window.clear();
        self.correction = None;
        self.sum = na::Vector3::zeros();
        self.used = 0;
        self.pushes = 0;
        self.spans = EulerAngles::default();
        self.ready = false;
        debug!(target: "magfusion::earth_field", "Earth field window reset");
    }
}
