//! Deterministic synthetic wrist sensor.
//!
//! Generates accelerometer, gyroscope and magnetometer readings along a
//! scripted attitude trajectory, with a known gyro bias, a known hard/soft
//! iron distortion, Gaussian sensor noise and an optional local magnet.

use nalgebra as na;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::calibration::IronCorrection;
use crate::sensors::{GeomagneticReference, ImuSample};
use crate::utils::{self, EulerAngles};

/// One piece of the scripted trajectory, measured in samples
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Segment {
    /// Hold the base attitude
    Stationary { samples: usize },
    /// Roll and pitch trace a figure eight while yaw sweeps steadily
    FigureEight {
        samples: usize,
        roll_amplitude_deg: f64,
        pitch_amplitude_deg: f64,
        yaw_sweep_deg: f64,
    },
    /// Small roll/pitch oscillation around the base attitude
    Wobble {
        samples: usize,
        amplitude_deg: f64,
        period_samples: usize,
    },
}

impl Segment {
    pub fn samples(&self) -> usize {
        match *self {
            Segment::Stationary { samples }
            | Segment::FigureEight { samples, .. }
            | Segment::Wobble { samples, .. } => samples,
        }
    }

    /// Attitude offset from the base attitude at step `s` within the segment
    fn offset(&self, s: usize) -> EulerAngles {
        let s = s as f64;
        match *self {
            Segment::Stationary { .. } => EulerAngles::default(),
            Segment::FigureEight {
                samples,
                roll_amplitude_deg,
                pitch_amplitude_deg,
                yaw_sweep_deg,
            } => {
                let n = samples.max(1) as f64;
                let lap = std::f64::consts::TAU * s / (n / 2.0);
                EulerAngles::new(
                    roll_amplitude_deg * lap.sin(),
                    pitch_amplitude_deg * (2.0 * lap).sin(),
                    yaw_sweep_deg * s / n,
                )
            }
            Segment::Wobble {
                amplitude_deg,
                period_samples,
                ..
            } => {
                let phase = std::f64::consts::TAU * s / period_samples.max(1) as f64;
                EulerAngles::new(
                    amplitude_deg * phase.sin(),
                    0.5 * amplitude_deg * phase.cos(),
                    0.0,
                )
            }
        }
    }
}

/// Permanent magnet close to the sensor, switched on at `start_sample`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MagnetInjection {
    pub start_sample: usize,
    /// Field the magnet adds in the sensor frame, in microtesla
    pub field_ut: na::Vector3<f64>,
}

#[derive(Debug, Clone)]
pub struct SimulationConfig {
    /// RNG seed for deterministic mode. None = random.
    pub seed: Option<u64>,
    pub sample_rate_hz: f64,
    pub reference: GeomagneticReference,
    /// Soft-iron distortion applied to the true field
    pub soft_iron_distortion: na::Matrix3<f64>,
    /// Hard-iron offset added after distortion, in microtesla
    pub hard_iron_ut: na::Vector3<f64>,
    /// Constant gyroscope bias in deg/s
    pub gyro_bias_dps: na::Vector3<f64>,
    /// Accelerometer noise standard deviation in g
    pub accel_noise_g: f64,
    /// Gyroscope noise standard deviation in deg/s
    pub gyro_noise_dps: f64,
    /// Magnetometer noise standard deviation in microtesla
    pub mag_noise_ut: f64,
    pub base_attitude: EulerAngles,
    pub segments: Vec<Segment>,
    pub magnet: Option<MagnetInjection>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            seed: Some(7),
            sample_rate_hz: 50.0,
            reference: GeomagneticReference::default(),
            soft_iron_distortion: na::Matrix3::new(
                1.08, 0.04, -0.02, 0.04, 0.93, 0.03, -0.02, 0.03, 1.02,
            ),
            hard_iron_ut: na::Vector3::new(28.0, -17.0, 42.0),
            gyro_bias_dps: na::Vector3::new(0.8, -0.5, 0.3),
            accel_noise_g: 0.003,
            gyro_noise_dps: 0.05,
            mag_noise_ut: 0.4,
            base_attitude: EulerAngles::new(5.0, -3.0, 40.0),
            segments: Vec::new(),
            magnet: None,
        }
    }
}

impl SimulationConfig {
    /// Total samples across all segments
    pub fn total_samples(&self) -> usize {
        self.segments.iter().map(Segment::samples).sum()
    }

    /// The correction a perfect calibration would find, if the distortion is invertible
    pub fn true_correction(&self) -> Option<IronCorrection> {
        Some(IronCorrection {
            hard_iron_ut: self.hard_iron_ut,
            soft_iron: self.soft_iron_distortion.try_inverse()?,
        })
    }

    /// Scripted attitude at sample `index`; past the last segment the base attitude is held
    pub fn attitude_at(&self, index: usize) -> na::UnitQuaternion<f64> {
        let mut start = 0;
        let mut offset = EulerAngles::default();
        for segment in &self.segments {
            if index < start + segment.samples() {
                offset = segment.offset(index - start);
                break;
            }
            start += segment.samples();
        }
        let base = &self.base_attitude;
        EulerAngles::new(
            base.roll_deg + offset.roll_deg,
            base.pitch_deg + offset.pitch_deg,
            base.yaw_deg + offset.yaw_deg,
        )
        .to_quaternion()
    }

    fn magnet_at(&self, index: usize) -> na::Vector3<f64> {
        match &self.magnet {
            Some(magnet) if index >= magnet.start_sample => magnet.field_ut,
            _ => na::Vector3::zeros(),
        }
    }
}

/// A generated reading together with the ground truth behind it
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimulatedSample {
    pub sample: ImuSample,
    /// Sensor to world rotation used to generate the sample
    pub true_attitude: na::UnitQuaternion<f64>,
    /// Field of the injected magnet in the sensor frame, zero without one
    pub true_residual_ut: na::Vector3<f64>,
}

/// Iterator over the samples of a [`SimulationConfig`]
pub struct WristSimulator {
    config: SimulationConfig,
    rng: StdRng,
    index: usize,
    total: usize,
}

impl WristSimulator {
    pub fn new(config: SimulationConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            total: config.total_samples(),
            config,
            rng,
            index: 0,
        }
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    fn gaussian_noise(&mut self, stddev: f64) -> f64 {
        if stddev == 0.0 {
            return 0.0;
        }
        let u1: f64 = self.rng.gen::<f64>().max(f64::EPSILON);
        let u2: f64 = self.rng.gen();
        let z = (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos();
        z * stddev
    }

    fn noisy(&mut self, value: na::Vector3<f64>, stddev: f64) -> na::Vector3<f64> {
        na::Vector3::new(
            value.x + self.gaussian_noise(stddev),
            value.y + self.gaussian_noise(stddev),
            value.z + self.gaussian_noise(stddev),
        )
    }

    fn generate(&mut self, index: usize) -> SimulatedSample {
        let dt_s = 1.0 / self.config.sample_rate_hz;
        let attitude = self.config.attitude_at(index);
        let next = self.config.attitude_at(index + 1);

        // Body rate that carries this attitude to the next one in one step
        let rate_dps = (attitude.inverse() * next)
            .scaled_axis()
            .map(|r| utils::rad_to_deg(r) / dt_s);
        let gyro_bias = self.config.gyro_bias_dps;
        let gyro = self.noisy(rate_dps + gyro_bias, self.config.gyro_noise_dps);

        let gravity = attitude.inverse() * na::Vector3::z();
        let accel = self.noisy(gravity, self.config.accel_noise_g);

        let earth = attitude.inverse() * self.config.reference.world_vector();
        let magnet = self.config.magnet_at(index);
        let true_field = self.noisy(earth, self.config.mag_noise_ut) + magnet;
        let raw = self.config.soft_iron_distortion * true_field + self.config.hard_iron_ut;

        SimulatedSample {
            sample: ImuSample {
                accel_g: accel,
                gyro_dps: gyro,
                mag_ut: raw,
                timestamp_ms: index as f64 * dt_s * 1000.0,
            },
            true_attitude: attitude,
            true_residual_ut: magnet,
        }
    }
}

impl Iterator for WristSimulator {
    type Item = SimulatedSample;

    fn next(&mut self) -> Option<Self::Item> {
        if self.index >= self.total {
            return None;
        }
        let sample = self.generate(self.index);
        self.index += 1;
        Some(sample)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.total - self.index;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for WristSimulator {}

/// Rest, a 500-sample figure eight with a full yaw turn, rest again, and a
/// finger magnet that appears 100 samples into the second rest.
pub fn figure_eight_scenario(seed: u64) -> SimulationConfig {
    SimulationConfig {
        seed: Some(seed),
        segments: vec![
            Segment::Stationary { samples: 200 },
            Segment::FigureEight {
                samples: 500,
                roll_amplitude_deg: 70.0,
                pitch_amplitude_deg: 45.0,
                yaw_sweep_deg: 360.0,
            },
            Segment::Stationary { samples: 300 },
        ],
        magnet: Some(MagnetInjection {
            start_sample: 800,
            field_ut: na::Vector3::new(35.0, -25.0, 30.0),
        }),
        ..SimulationConfig::default()
    }
}

/// Rest followed by a small wobble that never exposes enough of the sphere to calibrate
pub fn wobble_scenario(seed: u64) -> SimulationConfig {
    SimulationConfig {
        seed: Some(seed),
        segments: vec![
            Segment::Stationary { samples: 100 },
            Segment::Wobble {
                samples: 900,
                amplitude_deg: 10.0,
                period_samples: 100,
            },
        ],
        ..SimulationConfig::default()
    }
}
