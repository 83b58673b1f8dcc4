use std::fmt;
use std::time::Duration;

pub const FREQ_NOMINAL_50: f64 = 50.0;
pub const FREQ_NOMINAL_60: f64 = 60.0;

/// MCP3008 style 10-bit converter.
pub const ADC_MAX_COUNTS: i32 = 1023;
pub const ADC_MID_SCALE: f64 = 512.0;
pub const ADC_FULL_SCALE: f64 = 1024.0;
pub const BOARD_VOLTAGE: f64 = 3.3;
/// Board rail sensed through a 1:2 divider against the converter's 3.31 V reference.
pub const BOARD_SENSE_SCALE: f64 = 3.31 * 2.0 / ADC_FULL_SCALE;

pub const DEFAULT_SAMPLE_RATE_HZ: f64 = 2000.0;
pub const DEFAULT_WINDOW_SAMPLES: usize = 2000;
pub const DEFAULT_DRIFT_TOLERANCE: f64 = 0.02;
pub const DEFAULT_HOLD_TIME: Duration = Duration::from_millis(500);
pub const DEFAULT_TARIFF_POLL: Duration = Duration::from_millis(50);
pub const DEFAULT_MAX_CONSECUTIVE_FAILURES: u32 = 50;
pub const DEFAULT_QUEUE_CAPACITY: usize = 4096;
pub const DEFAULT_RING_CAPACITY: usize = 64;

/// Role a channel plays when the per-window readings are aggregated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChannelRole {
    WholeLoad,
    MonitoredBreaker,
    VoltageReference,
    BoardReference, // Supply rail every channel scale is proportional to
}

impl ChannelRole {
    pub fn is_current(&self) -> bool {
        matches!(self, ChannelRole::WholeLoad | ChannelRole::MonitoredBreaker)
    }
}

impl fmt::Display for ChannelRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ChannelRole::WholeLoad => "whole-load",
            ChannelRole::MonitoredBreaker => "monitored-breaker",
            ChannelRole::VoltageReference => "voltage-reference",
            ChannelRole::BoardReference => "board-reference",
        })
    }
}

/// Per-channel correction applied before any power math.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelCalibration {
    pub scale: f64,       // Engineering units per ADC count
    pub phase_shift: f64, // Voltage shift seen by this channel, in samples (-1.0..=1.0)
    pub dc_offset: f64,   // Counts subtracted before scaling
}

impl ChannelCalibration {
    pub fn new(scale: f64, dc_offset: f64) -> Self {
        Self {
            scale,
            phase_shift: 0.0,
            dc_offset,
        }
    }

    pub fn with_phase_shift(mut self, samples: f64) -> Self {
        self.phase_shift = samples;
        self
    }

    /// Phase shift from a signed angle. Negative angles delay the voltage.
    pub fn with_phase_degrees(self, degrees: f64, samples_per_cycle: f64) -> Self {
        self.with_phase_shift(degrees / 360.0 * samples_per_cycle)
    }

    /// Interpolation constant used by older installations, where 1.0 means no correction.
    pub fn with_phasecal(self, phasecal: f64) -> Self {
        self.with_phase_shift(phasecal - 1.0)
    }
}

impl Default for ChannelCalibration {
    fn default() -> Self {
        Self {
            scale: 1.0,
            phase_shift: 0.0,
            dc_offset: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Channel {
    pub adc_input: usize,
    pub name: String,
    pub role: ChannelRole,
    pub calibration: ChannelCalibration,
}

impl Channel {
    pub fn new(adc_input: usize, name: impl Into<String>, role: ChannelRole, calibration: ChannelCalibration) -> Self {
        Self {
            adc_input,
            name: name.into(),
            role,
            calibration,
        }
    }
}

/// One synchronized set of raw readings, in configuration order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SampleFrame {
    pub sequence: u64,
    pub timestamp: Duration,
    pub raw: Vec<i32>,
}

/// Voltage aligned to one current channel, both in engineering units.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CorrectedSample {
    pub voltage: f64,
    pub current: f64,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct CorrectedFrame {
    pub sequence: u64,
    pub timestamp: Duration,
    pub reference_voltage: f64,
    pub samples: Vec<CorrectedSample>, // One per current channel, in calibrator order
}

/// Interval covered by one accumulation window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WindowSpan {
    pub start: Duration,
    pub end: Duration,
}

impl WindowSpan {
    pub fn new(start: Duration, end: Duration) -> Self {
        Self { start, end }
    }

    pub fn elapsed(&self) -> Duration {
        self.end.saturating_sub(self.start)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadingQuality {
    #[default]
    Confident,
    LowConfidence,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PowerReading {
    pub channel: usize, // Frame position of the current channel
    pub span: WindowSpan,
    pub rms_voltage: f64,
    pub rms_current: f64,
    pub real_power: f64,
    pub apparent_power: f64,
    pub power_factor: f64,
    pub samples: usize,
    pub quality: ReadingQuality,
}

impl PowerReading {
    pub fn is_low_confidence(&self) -> bool {
        self.quality == ReadingQuality::LowConfidence
    }

    /// Applies a common factor to the voltage and current scales after the fact.
    pub fn rescale(&mut self, ratio: f64) {
        self.rms_voltage *= ratio;
        self.rms_current *= ratio;
        self.real_power *= ratio * ratio;
        self.apparent_power *= ratio * ratio;
    }
}

/// Readings emitted together when a window closes.
#[derive(Debug, Clone, PartialEq)]
pub struct PowerWindow {
    pub span: WindowSpan,
    pub readings: Vec<PowerReading>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoadComposition {
    pub span: WindowSpan,
    pub whole_load_power: f64,
    pub monitored_power: f64,
    pub delta_load: f64,
    pub negative_delta: bool,
    pub low_confidence: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TariffState {
    #[default]
    Day,
    Night,
}

impl TariffState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TariffState::Day => "day",
            TariffState::Night => "night",
        }
    }

    pub fn other(&self) -> TariffState {
        match self {
            TariffState::Day => TariffState::Night,
            TariffState::Night => TariffState::Day,
        }
    }
}

impl fmt::Display for TariffState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A debounced tariff transition, timestamped at the first edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TariffChanged {
    pub from: TariffState,
    pub to: TariffState,
    pub at: Duration,
}

/// Warning raised when the sampling schedule slips.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimingDrift {
    Jitter { sequence: u64, lateness: Duration },
    Backpressure { sequence: u64, waited: Duration },
}
