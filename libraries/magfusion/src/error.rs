use nalgebra as na;
use std::fmt;
use thiserror::Error;

/// Primary error type for the magfusion crate
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PipelineError {
    /// Error from a sensor reading
    #[error("Sensor error: {message}")]
    SensorError {
        /// Detailed error message
        message: String,
        /// The sensor that produced the reading
        sensor_type: SensorType,
        /// Additional details about the error
        details: Option<String>,
    },

    /// Timing-related errors (non-increasing or invalid timestamps)
    #[error("Timing error: {message}")]
    TimingError {
        /// Detailed error message
        message: String,
        /// Time value that caused the error if available
        time_value: Option<f64>,
    },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    ConfigurationError {
        /// Detailed error message
        message: String,
        /// Configuration parameter that caused the error
        parameter: Option<String>,
    },

    /// Calibration import/export errors
    #[error("Calibration error: {message}")]
    CalibrationError {
        /// Detailed error message
        message: String,
        /// Additional details about the error
        details: Option<String>,
    },
}

/// Sensors of the 9-axis wrist unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorType {
    /// Accelerometer
    Accelerometer,
    /// Gyroscope
    Gyroscope,
    /// Magnetometer
    Magnetometer,
}

impl fmt::Display for SensorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SensorType::Accelerometer => write!(f, "accelerometer"),
            SensorType::Gyroscope => write!(f, "gyroscope"),
            SensorType::Magnetometer => write!(f, "magnetometer"),
        }
    }
}

/// Helper functions for creating common errors
pub mod helpers {
    use super::*;

    /// Create a sensor error
    pub fn sensor_error(
        message: impl Into<String>,
        sensor_type: SensorType,
        details: Option<impl Into<String>>,
    ) -> PipelineError {
        PipelineError::SensorError {
            message: message.into(),
            sensor_type,
            details: details.map(|d| d.into()),
        }
    }

    /// Create a timing error
    pub fn timing_error(message: impl Into<String>, time_value: Option<f64>) -> PipelineError {
        PipelineError::TimingError {
            message: message.into(),
            time_value,
        }
    }

    /// Create a configuration error
    pub fn config_error(
        message: impl Into<String>,
        parameter: Option<impl Into<String>>,
    ) -> PipelineError {
        PipelineError::ConfigurationError {
            message: message.into(),
            parameter: parameter.map(|p| p.into()),
        }
    }

    /// Create a calibration import/export error
    pub fn calibration_error(
        message: impl Into<String>,
        details: Option<impl Into<String>>,
    ) -> PipelineError {
        PipelineError::CalibrationError {
            message: message.into(),
            details: details.map(|d| d.into()),
        }
    }

    /// Check that a sensor vector holds only finite values
    pub fn check_sensor_vector(
        vec: &na::Vector3<f64>,
        sensor_type: SensorType,
    ) -> Result<(), PipelineError> {
        if vec.iter().any(|v| !v.is_finite()) {
            Err(sensor_error(
                format!("{} reading contains NaN or infinite values", sensor_type),
                sensor_type,
                Some(format!("[{}, {}, {}]", vec.x, vec.y, vec.z)),
            ))
        } else {
            Ok(())
        }
    }

    /// Check if a time delta is valid
    pub fn check_time_delta(dt: f64) -> Result<(), PipelineError> {
        if dt <= 0.0 || !dt.is_finite() {
            Err(timing_error(format!("Invalid time delta: {}", dt), Some(dt)))
        } else {
            Ok(())
        }
    }

    /// Check that a configuration value is finite and strictly positive
    pub fn check_positive(value: f64, parameter: &str) -> Result<(), PipelineError> {
        if value > 0.0 && value.is_finite() {
            Ok(())
        } else {
            Err(config_error(
                format!("{} must be positive and finite, got {}", parameter, value),
                Some(parameter),
            ))
        }
    }
}

/// Type alias for Result with PipelineError
pub type PipelineResult<T> = Result<T, PipelineError>;
