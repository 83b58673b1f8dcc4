//! Error types for the power monitor core.

use thiserror::Error;

use super::types::ChannelRole;

pub type Result<T> = std::result::Result<T, PowerInsightError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PowerInsightError {
    #[error("Acquisition error: {0}")]
    Acquisition(#[from] AcquisitionError),

    #[error("Sensor error: {0}")]
    Sensor(#[from] SensorError),

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    /// A pipeline context went away while others still needed it
    #[error("Pipeline error: {0}")]
    Pipeline(String),
}

/// Errors while reading the analog channels
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AcquisitionError {
    #[error("read failed on ADC input {channel}: {reason}")]
    ReadFailed { channel: usize, reason: String },

    #[error("ADC input {channel} returned {value}, outside 0..={max}")]
    OutOfRange { channel: usize, value: i32, max: i32 },

    /// Too many failures in a row, the bus is considered dead
    #[error("sensor bus dead: ADC input {channel} failed {consecutive} consecutive frames ({last})")]
    SensorBusDead {
        channel: usize,
        consecutive: u32,
        last: String,
    },
}

impl AcquisitionError {
    pub fn channel(&self) -> usize {
        match self {
            AcquisitionError::ReadFailed { channel, .. }
            | AcquisitionError::OutOfRange { channel, .. }
            | AcquisitionError::SensorBusDead { channel, .. } => *channel,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, AcquisitionError::SensorBusDead { .. })
    }
}

/// Errors while reading the tariff input
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SensorError {
    #[error("tariff input read failed: {0}")]
    ReadFailed(String),

    #[error("tariff input failed {consecutive} consecutive polls ({last})")]
    InputDead { consecutive: u32, last: String },
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigurationError {
    #[error("no channel with role {0}")]
    MissingRole(ChannelRole),

    #[error("more than one channel with role {0}")]
    DuplicateRole(ChannelRole),

    #[error("duplicate channel {0}")]
    DuplicateChannel(String),

    #[error("invalid calibration for channel {channel}: {reason}")]
    InvalidCalibration { channel: String, reason: String },

    #[error("invalid {name}: {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    #[error("no reading for the {0} channel")]
    MissingReading(ChannelRole),
}
