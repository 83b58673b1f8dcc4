use std::collections::HashSet;
use std::time::Duration;

use super::error::ConfigurationError;
use super::types::*;

/// Sampling schedule and hardware limits.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplerConfig {
    pub sample_rate_hz: f64,
    pub drift_tolerance: f64, // Fraction of the sample period
    pub adc_max: i32,
    pub max_consecutive_failures: u32,
    pub ring_capacity: usize,
    pub max_frames: Option<u64>, // Stop acquisition after this many frame slots
    pub board_voltage: f64,      // Rail the channel scales were calibrated against
}

impl SamplerConfig {
    pub fn period(&self) -> Result<Duration, ConfigurationError> {
        Duration::try_from_secs_f64(1.0 / self.sample_rate_hz)
            .ok()
            .filter(|period| !period.is_zero())
            .ok_or_else(|| invalid("sample_rate_hz", format!("{} is not a positive rate", self.sample_rate_hz)))
    }
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            sample_rate_hz: DEFAULT_SAMPLE_RATE_HZ,
            drift_tolerance: DEFAULT_DRIFT_TOLERANCE,
            adc_max: ADC_MAX_COUNTS,
            max_consecutive_failures: DEFAULT_MAX_CONSECUTIVE_FAILURES,
            ring_capacity: DEFAULT_RING_CAPACITY,
            max_frames: None,
            board_voltage: BOARD_VOLTAGE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WindowMode {
    SampleCount(usize),
    WallTime(Duration),
}

#[derive(Debug, Clone, PartialEq)]
pub struct WindowConfig {
    pub mode: WindowMode,
    pub min_samples: usize, // Below this a window is LowConfidence
    pub ac_coupled: bool,   // Remove the window mean before the power math
}

impl WindowConfig {
    pub fn sample_count(samples: usize) -> Self {
        Self {
            mode: WindowMode::SampleCount(samples),
            min_samples: samples,
            ac_coupled: false,
        }
    }

    pub fn wall_time(length: Duration, sample_rate_hz: f64, drift_tolerance: f64) -> Self {
        let expected = length.as_secs_f64() * sample_rate_hz;
        Self {
            mode: WindowMode::WallTime(length),
            min_samples: (expected * (1.0 - drift_tolerance)).floor() as usize,
            ac_coupled: false,
        }
    }

    pub fn ac_coupled(mut self, enabled: bool) -> Self {
        self.ac_coupled = enabled;
        self
    }

    pub fn expected_samples(&self, sample_rate_hz: f64) -> usize {
        match self.mode {
            WindowMode::SampleCount(samples) => samples,
            WindowMode::WallTime(length) => (length.as_secs_f64() * sample_rate_hz).round() as usize,
        }
    }
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self::sample_count(DEFAULT_WINDOW_SAMPLES)
    }
}

/// Currency per kWh for each tariff.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TariffRates {
    pub day: f64,
    pub night: f64,
}

impl TariffRates {
    pub fn rate(&self, state: TariffState) -> f64 {
        match state {
            TariffState::Day => self.day,
            TariffState::Night => self.night,
        }
    }
}

impl Default for TariffRates {
    fn default() -> Self {
        Self {
            day: 0.2126,
            night: 0.1187,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TariffConfig {
    pub hold_time: Duration,
    pub poll_interval: Duration,
    pub high_level: TariffState, // Tariff signalled by a high input
    pub rates: TariffRates,
    pub max_consecutive_failures: u32,
}

impl TariffConfig {
    pub fn state_for(&self, level: bool) -> TariffState {
        if level {
            self.high_level
        } else {
            self.high_level.other()
        }
    }
}

impl Default for TariffConfig {
    fn default() -> Self {
        Self {
            hold_time: DEFAULT_HOLD_TIME,
            poll_interval: DEFAULT_TARIFF_POLL,
            high_level: TariffState::Night,
            rates: TariffRates::default(),
            max_consecutive_failures: DEFAULT_MAX_CONSECUTIVE_FAILURES,
        }
    }
}

/// Everything the core needs; parsed and handed over by the embedding application.
#[derive(Debug, Clone, PartialEq)]
pub struct PowerInsightConfig {
    pub channels: Vec<Channel>,
    pub sampler: SamplerConfig,
    pub window: WindowConfig,
    pub tariff: TariffConfig,
    pub queue_capacity: usize,
    pub report_every: usize, // Windows averaged per report / snapshot emission
}

impl PowerInsightConfig {
    pub fn new(channels: Vec<Channel>) -> Self {
        Self {
            channels,
            sampler: SamplerConfig::default(),
            window: WindowConfig::default(),
            tariff: TariffConfig::default(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            report_every: 2,
        }
    }

    /// Six CTs on a 10-bit ADC behind a 9V AC transformer: CT1 on the house main, the rest on breakers.
    /// The 3.3V rail on input 4 corrects every scale below.
    pub fn single_phase_house() -> Self {
        const GRID_VOLTAGE: f64 = 247.4;
        const AC_TRANSFORMER_OUTPUT_VOLTAGE: f64 = 27.71;

        let vref = BOARD_VOLTAGE / ADC_FULL_SCALE;
        let ct = |accuracy: f64| vref * 100.0 * accuracy;
        let ac_ratio = (GRID_VOLTAGE / AC_TRANSFORMER_OUTPUT_VOLTAGE) * 11.0;

        let breakers = [
            (1, "ct2", 0.34887, 1.06106079),
            (2, "ct3", 0.34939, 1.16228187),
            (3, "ct4", 0.34545, 1.37349277),
            (6, "ct5", 0.34568, 1.04173608),
            (7, "ct6", 0.35085, 1.53331616),
        ];

        let mut channels = vec![Channel::new(
            0,
            "ct1",
            ChannelRole::WholeLoad,
            ChannelCalibration::new(ct(0.91265), ADC_MID_SCALE).with_phasecal(1.03307871),
        )];
        channels.extend(breakers.iter().map(|&(input, name, accuracy, phasecal)| {
            Channel::new(
                input,
                name,
                ChannelRole::MonitoredBreaker,
                ChannelCalibration::new(ct(accuracy), ADC_MID_SCALE).with_phasecal(phasecal),
            )
        }));
        channels.push(Channel::new(
            5,
            "voltage",
            ChannelRole::VoltageReference,
            ChannelCalibration::new(vref * ac_ratio * 3.32114, ADC_MID_SCALE),
        ));
        channels.push(Channel::new(
            4,
            "board",
            ChannelRole::BoardReference,
            ChannelCalibration::new(BOARD_SENSE_SCALE, 0.0),
        ));

        let mut config = Self::new(channels);
        config.window = config.window.ac_coupled(true);
        config
    }

    pub fn channel_position(&self, role: ChannelRole) -> Option<usize> {
        self.channels.iter().position(|c| c.role == role)
    }

    /// Startup validation; nothing downstream re-checks these.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        validate_channels(&self.channels)?;

        let sampler = &self.sampler;
        sampler.period()?;
        if !(sampler.board_voltage.is_finite() && sampler.board_voltage > 0.0) {
            return Err(invalid("board_voltage", format!("{} is not a positive voltage", sampler.board_voltage)));
        }
        if !(sampler.drift_tolerance > 0.0 && sampler.drift_tolerance < 1.0) {
            return Err(invalid("drift_tolerance", format!("{} is not in (0, 1)", sampler.drift_tolerance)));
        }
        if sampler.adc_max <= 0 {
            return Err(invalid("adc_max", format!("{} is not positive", sampler.adc_max)));
        }
        if sampler.max_consecutive_failures == 0 {
            return Err(invalid("max_consecutive_failures", "must be at least 1".to_string()));
        }
        if sampler.ring_capacity == 0 {
            return Err(invalid("ring_capacity", "must be at least 1".to_string()));
        }

        let expected = self.window.expected_samples(sampler.sample_rate_hz);
        if expected == 0 {
            return Err(invalid("window", "window holds no samples".to_string()));
        }
        if self.window.min_samples > expected {
            return Err(invalid(
                "min_samples",
                format!("{} exceeds the {} samples a window can hold", self.window.min_samples, expected),
            ));
        }

        let tariff = &self.tariff;
        for (name, rate) in [("day rate", tariff.rates.day), ("night rate", tariff.rates.night)] {
            if !(rate.is_finite() && rate >= 0.0) {
                return Err(invalid("tariff rate", format!("{} is {}", name, rate)));
            }
        }
        if tariff.poll_interval.is_zero() {
            return Err(invalid("poll_interval", "must be non-zero".to_string()));
        }
        if tariff.max_consecutive_failures == 0 {
            return Err(invalid("tariff max_consecutive_failures", "must be at least 1".to_string()));
        }

        if self.queue_capacity == 0 {
            return Err(invalid("queue_capacity", "must be at least 1".to_string()));
        }
        if self.report_every == 0 {
            return Err(invalid("report_every", "must be at least 1".to_string()));
        }

        Ok(())
    }
}

fn invalid(name: &'static str, reason: String) -> ConfigurationError {
    ConfigurationError::InvalidParameter { name, reason }
}

pub fn validate_channels(channels: &[Channel]) -> Result<(), ConfigurationError> {
    let mut names = HashSet::new();
    let mut inputs = HashSet::new();

    for channel in channels {
        if !names.insert(channel.name.as_str()) {
            return Err(ConfigurationError::DuplicateChannel(channel.name.clone()));
        }
        if !inputs.insert(channel.adc_input) {
            return Err(ConfigurationError::DuplicateChannel(format!(
                "{} (ADC input {})",
                channel.name, channel.adc_input
            )));
        }
        validate_calibration(channel)?;
    }

    for role in [ChannelRole::VoltageReference, ChannelRole::WholeLoad] {
        match channels.iter().filter(|c| c.role == role).count() {
            0 => return Err(ConfigurationError::MissingRole(role)),
            1 => {}
            _ => return Err(ConfigurationError::DuplicateRole(role)),
        }
    }
    if channels.iter().filter(|c| c.role == ChannelRole::BoardReference).count() > 1 {
        return Err(ConfigurationError::DuplicateRole(ChannelRole::BoardReference));
    }

    Ok(())
}

fn validate_calibration(channel: &Channel) -> Result<(), ConfigurationError> {
    let cal = &channel.calibration;
    let reason = if !(cal.scale.is_finite() && cal.scale >= 0.0) {
        Some(format!("scale {} must be finite and non-negative", cal.scale))
    } else if !cal.dc_offset.is_finite() {
        Some(format!("dc offset {} is not finite", cal.dc_offset))
    } else if !(cal.phase_shift.is_finite() && cal.phase_shift.abs() <= 1.0) {
        Some(format!("phase shift {} is outside -1..=1 samples", cal.phase_shift))
    } else if channel.role == ChannelRole::VoltageReference && cal.phase_shift != 0.0 {
        Some("the voltage reference cannot be phase shifted".to_string())
    } else {
        None
    };

    match reason {
        Some(reason) => Err(ConfigurationError::InvalidCalibration {
            channel: channel.name.clone(),
            reason,
        }),
        None => Ok(()),
    }
}
