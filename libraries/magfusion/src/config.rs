use crate::error::{helpers, PipelineResult};

/// Configuration for the whole pipeline
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Nominal sample rate in Hz, used for the first time step
    pub sample_rate_hz: f64,

    /// Largest time step in seconds integrated in one go; longer gaps are clamped
    pub max_dt_s: f64,

    pub motion: MotionConfig,
    pub gyro_bias: GyroBiasConfig,
    pub attitude: AttitudeConfig,
    pub calibration: CalibrationConfig,
    pub earth_field: EarthFieldConfig,
    pub residual: ResidualConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            sample_rate_hz: 50.0,
            max_dt_s: 0.5,
            motion: MotionConfig::default(),
            gyro_bias: GyroBiasConfig::default(),
            attitude: AttitudeConfig::default(),
            calibration: CalibrationConfig::default(),
            earth_field: EarthFieldConfig::default(),
            residual: ResidualConfig::default(),
        }
    }
}

/// Stationary/moving classification
#[derive(Debug, Clone)]
pub struct MotionConfig {
    /// Number of samples in the rolling variance window
    pub window_size: usize,
    /// Accelerometer standard deviation below which the unit may be still, in g
    pub accel_std_threshold_g: f64,
    /// Gyroscope standard deviation below which the unit may be still, in deg/s
    pub gyro_std_threshold_dps: f64,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            window_size: 20,
            accel_std_threshold_g: 0.02,
            gyro_std_threshold_dps: 1.5,
        }
    }
}

/// Gyroscope bias EMA
#[derive(Debug, Clone)]
pub struct GyroBiasConfig {
    /// EMA weight applied to each stationary reading
    pub alpha: f64,
    /// Length of a typical stationary stretch, in samples
    pub expected_stationary_samples: u32,
    /// Fraction of a step change the EMA must absorb within that stretch
    pub min_convergence: f64,
}

impl Default for GyroBiasConfig {
    fn default() -> Self {
        Self {
            alpha: 0.1,
            expected_stationary_samples: 20,
            min_convergence: 0.2,
        }
    }
}

/// Madgwick-style attitude fusion
#[derive(Debug, Clone)]
pub struct AttitudeConfig {
    /// Gradient step gain
    pub beta: f64,
    /// Weight of the magnetometer objective relative to gravity
    pub mag_trust: f64,
    /// Multiplier on the magnetometer weight while the unit is moving
    pub moving_mag_attenuation: f64,
}

impl Default for AttitudeConfig {
    fn default() -> Self {
        Self {
            beta: 0.05,
            mag_trust: 0.5,
            moving_mag_attenuation: 0.1,
        }
    }
}

/// Where the Levenberg-Marquardt refinement runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RefinementMode {
    /// Run on the sample that triggers it; deterministic, blocks that tick
    #[default]
    Inline,
    /// Run on a worker thread and swap the result in when it arrives
    Background,
}

/// Levenberg-Marquardt solver settings
#[derive(Debug, Clone)]
pub struct RefinementConfig {
    pub max_iterations: usize,
    /// Central-difference step for hard-iron offsets, in microtesla
    pub offset_step_ut: f64,
    /// Central-difference step for soft-iron matrix entries
    pub matrix_step: f64,
    pub initial_lambda: f64,
    /// Damping at which the solver gives up
    pub max_lambda: f64,
    /// Relative cost decrease below which the solver stops
    pub tolerance: f64,
    /// Bounds on the soft-iron diagonal
    pub diagonal_bounds: (f64, f64),
    /// Largest absolute soft-iron off-diagonal entry
    pub max_off_diagonal: f64,
    /// Largest absolute hard-iron offset, in microtesla
    pub max_offset_ut: f64,
}

impl Default for RefinementConfig {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            offset_step_ut: 0.5,
            matrix_step: 0.01,
            initial_lambda: 1e-3,
            max_lambda: 1e10,
            tolerance: 1e-10,
            diagonal_bounds: (0.5, 2.0),
            max_off_diagonal: 0.5,
            max_offset_ut: 500.0,
        }
    }
}

/// Acceptance thresholds for a refined calibration
#[derive(Debug, Clone)]
pub struct QualityGateConfig {
    /// Minimum rotation span over the buffer on every axis, in degrees
    pub min_coverage_deg: f64,
    /// Smallest raw per-axis field span over the buffer, as a fraction of the expected full-rotation span
    pub min_field_span_fraction: f64,
    /// Largest allowed absolute difference from the reference H/V ratio
    pub hv_tolerance: f64,
    /// Largest allowed multiplicative difference from the reference H/V ratio
    pub max_hv_factor: f64,
    /// Reference ratios closer to 1 than this skip the inversion check
    pub hv_inversion_margin: f64,
    /// Largest acceptable RMS residual after the fit, in microtesla
    pub max_residual_rms_ut: f64,
    /// Ellipsoid sphericity below which confidence is demoted
    pub min_sphericity: f64,
    /// Confidence below which the fit is rejected
    pub min_confidence: f64,
}

impl Default for QualityGateConfig {
    fn default() -> Self {
        Self {
            min_coverage_deg: 30.0,
            min_field_span_fraction: 0.1,
            hv_tolerance: 0.8,
            max_hv_factor: 2.0,
            hv_inversion_margin: 0.2,
            max_residual_rms_ut: 10.0,
            min_sphericity: 0.5,
            min_confidence: 0.3,
        }
    }
}

/// Two-phase hard/soft iron calibration
#[derive(Debug, Clone)]
pub struct CalibrationConfig {
    /// Deviation from the running centre beyond which a raw sample is an outlier, in microtesla
    pub outlier_threshold_ut: f64,
    /// Fraction of the expected full-rotation span each axis must observe
    pub bootstrap_range_fraction: f64,
    /// Capacity of the refinement sample buffer
    pub buffer_capacity: usize,
    /// Samples needed before refinement is attempted
    pub min_refine_samples: usize,
    /// Minimum change in field direction for a sample to be buffered, in degrees
    pub min_sample_separation_deg: f64,
    /// New buffered samples to wait for after a rejected refinement
    pub retry_interval: usize,
    pub mode: RefinementMode,
    pub refinement: RefinementConfig,
    pub quality: QualityGateConfig,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            outlier_threshold_ut: 150.0,
            bootstrap_range_fraction: 0.5,
            buffer_capacity: 500,
            min_refine_samples: 200,
            min_sample_separation_deg: 1.5,
            retry_interval: 100,
            mode: RefinementMode::Inline,
            refinement: RefinementConfig::default(),
            quality: QualityGateConfig::default(),
        }
    }
}

/// World-frame Earth field averaging
#[derive(Debug, Clone)]
pub struct EarthFieldConfig {
    /// Sliding window capacity in samples
    pub window_capacity: usize,
    /// Samples needed before the estimate is ready
    pub min_samples: usize,
    /// Rotation span needed on every axis before the estimate is ready, in degrees
    pub min_rotation_deg: f64,
    /// Window readings whose corrected magnitude is further than this from the
    /// reference are left out of the mean, in microtesla
    pub max_magnitude_error_ut: f64,
}

impl Default for EarthFieldConfig {
    fn default() -> Self {
        Self {
            window_capacity: 200,
            min_samples: 100,
            min_rotation_deg: 30.0,
            max_magnitude_error_ut: 12.0,
        }
    }
}

/// Residual confidence and magnetic anomaly detection
#[derive(Debug, Clone)]
pub struct ResidualConfig {
    /// Combined confidence needed for a residual to be marked confident
    pub min_confidence: f64,
    /// Allowed difference between corrected field magnitude and the reference, in microtesla
    pub magnitude_tolerance_ut: f64,
    /// Residual against a ready Earth estimate beyond which a sample is anomalous, in microtesla
    pub anomaly_threshold_ut: f64,
}

impl Default for ResidualConfig {
    fn default() -> Self {
        Self {
            min_confidence: 0.5,
            magnitude_tolerance_ut: 12.0,
            anomaly_threshold_ut: 15.0,
        }
    }
}

impl PipelineConfig {
    /// Defaults for a unit sampled at `sample_rate_hz`
    pub fn with_sample_rate(sample_rate_hz: f64) -> Self {
        Self {
            sample_rate_hz,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> PipelineResult<()> {
        helpers::check_positive(self.sample_rate_hz, "sample_rate_hz")?;
        helpers::check_positive(self.max_dt_s, "max_dt_s")?;
        self.motion.validate()?;
        self.gyro_bias.validate()?;
        self.attitude.validate()?;
        self.calibration.validate()?;
        self.earth_field.validate()?;
        self.residual.validate()
    }
}

impl MotionConfig {
    pub fn validate(&self) -> PipelineResult<()> {
        if self.window_size < 2 {
            return Err(helpers::config_error(
                format!("Motion window needs at least 2 samples, got {}", self.window_size),
                Some("motion.window_size"),
            ));
        }
        helpers::check_positive(self.accel_std_threshold_g, "motion.accel_std_threshold_g")?;
        helpers::check_positive(self.gyro_std_threshold_dps, "motion.gyro_std_threshold_dps")
    }
}

impl GyroBiasConfig {
    /// Fraction of a step change absorbed after `updates` stationary samples
    pub fn convergence(&self, updates: u32) -> f64 {
        1.0 - (1.0 - self.alpha).powi(updates.min(i32::MAX as u32) as i32)
    }

    pub fn validate(&self) -> PipelineResult<()> {
        if !(self.alpha > 0.0 && self.alpha <= 1.0) {
            return Err(helpers::config_error(
                format!("Gyro bias alpha must be in (0, 1], got {}", self.alpha),
                Some("gyro_bias.alpha"),
            ));
        }
        let reached = self.convergence(self.expected_stationary_samples);
        if reached < self.min_convergence {
            return Err(helpers::config_error(
                format!(
                    "Gyro bias alpha {} converges only {:.1}% in {} stationary samples, need {:.0}%",
                    self.alpha,
                    reached * 100.0,
                    self.expected_stationary_samples,
                    self.min_convergence * 100.0
                ),
                Some("gyro_bias.alpha"),
            ));
        }
        Ok(())
    }
}

impl AttitudeConfig {
    pub fn validate(&self) -> PipelineResult<()> {
        helpers::check_positive(self.beta, "attitude.beta")?;
        if !(0.0..=1.0).contains(&self.mag_trust) {
            return Err(helpers::config_error(
                format!("Magnetometer trust must be in [0, 1], got {}", self.mag_trust),
                Some("attitude.mag_trust"),
            ));
        }
        if !(0.0..=1.0).contains(&self.moving_mag_attenuation) {
            return Err(helpers::config_error(
                format!(
                    "Moving attenuation must be in [0, 1], got {}",
                    self.moving_mag_attenuation
                ),
                Some("attitude.moving_mag_attenuation"),
            ));
        }
        Ok(())
    }
}

impl CalibrationConfig {
    pub fn validate(&self) -> PipelineResult<()> {
        helpers::check_positive(self.outlier_threshold_ut, "calibration.outlier_threshold_ut")?;
        helpers::check_positive(
            self.bootstrap_range_fraction,
            "calibration.bootstrap_range_fraction",
        )?;
        if self.min_refine_samples == 0 || self.min_refine_samples > self.buffer_capacity {
            return Err(helpers::config_error(
                format!(
                    "Refinement needs between 1 and {} samples, got {}",
                    self.buffer_capacity, self.min_refine_samples
                ),
                Some("calibration.min_refine_samples"),
            ));
        }
        if self.min_sample_separation_deg < 0.0 {
            return Err(helpers::config_error(
                "Sample separation cannot be negative",
                Some("calibration.min_sample_separation_deg"),
            ));
        }
        let refinement = &self.refinement;
        if refinement.max_iterations == 0 {
            return Err(helpers::config_error(
                "Refinement needs at least one iteration",
                Some("calibration.refinement.max_iterations"),
            ));
        }
        helpers::check_positive(refinement.offset_step_ut, "calibration.refinement.offset_step_ut")?;
        helpers::check_positive(refinement.matrix_step, "calibration.refinement.matrix_step")?;
        helpers::check_positive(refinement.initial_lambda, "calibration.refinement.initial_lambda")?;
        let (low, high) = refinement.diagonal_bounds;
        if !(low > 0.0 && low < 1.0 && high > 1.0) {
            return Err(helpers::config_error(
                format!("Diagonal bounds must bracket 1, got ({}, {})", low, high),
                Some("calibration.refinement.diagonal_bounds"),
            ));
        }
        if !(0.0..1.0).contains(&self.quality.min_field_span_fraction) {
            return Err(helpers::config_error(
                format!(
                    "Field span fraction must be in [0, 1), got {}",
                    self.quality.min_field_span_fraction
                ),
                Some("calibration.quality.min_field_span_fraction"),
            ));
        }
        helpers::check_positive(self.quality.max_hv_factor, "calibration.quality.max_hv_factor")?;
        helpers::check_positive(
            self.quality.max_residual_rms_ut,
            "calibration.quality.max_residual_rms_ut",
        )
    }
}

impl EarthFieldConfig {
    pub fn validate(&self) -> PipelineResult<()> {
        if self.window_capacity == 0 || self.min_samples > self.window_capacity {
            return Err(helpers::config_error(
                format!(
                    "Earth window of {} cannot hold the {} samples needed",
                    self.window_capacity, self.min_samples
                ),
                Some("earth_field.window_capacity"),
            ));
        }
        helpers::check_positive(self.max_magnitude_error_ut, "earth_field.max_magnitude_error_ut")
    }
}

impl ResidualConfig {
    pub fn validate(&self) -> PipelineResult<()> {
        if !(0.0..=1.0).contains(&self.min_confidence) {
            return Err(helpers::config_error(
                format!("Minimum confidence must be in [0, 1], got {}", self.min_confidence),
                Some("residual.min_confidence"),
            ));
        }
        helpers::check_positive(self.magnitude_tolerance_ut, "residual.magnitude_tolerance_ut")?;
        helpers::check_positive(self.anomaly_threshold_ut, "residual.anomaly_threshold_ut")
    }
}
