use super::error::ConfigurationError;
use super::types::*;

/*
* @brief Convert one raw ADC reading to engineering units.
* @param raw Raw ADC counts
* @param calibration Channel calibration
* @return Corrected value (volts or amps)
*/
pub fn correct_sample(raw: i32, calibration: &ChannelCalibration) -> f64 {
    (raw as f64 - calibration.dc_offset) * calibration.scale
}

/*
* @brief Shift a sample by a fraction of the sample period.
* @param previous Sample at k-1
* @param current Sample at k
* @param shift Shift in samples, negative values move towards the previous sample
* @return Linearly interpolated (or extrapolated) value at k + shift
*/
pub fn shift_sample(previous: f64, current: f64, shift: f64) -> f64 {
    current + shift * (current - previous)
}

/// Applies offset, scale and phase correction to raw frames.
#[derive(Debug, Clone)]
pub struct Calibrator {
    voltage_position: usize,
    voltage: ChannelCalibration,
    currents: Vec<(usize, ChannelCalibration)>, // Frame position and calibration per current channel
    board: Option<(usize, ChannelCalibration)>,
}

impl Calibrator {
    pub fn new(channels: &[Channel]) -> Result<Self, ConfigurationError> {
        let voltage_position = channels
            .iter()
            .position(|c| c.role == ChannelRole::VoltageReference)
            .ok_or(ConfigurationError::MissingRole(ChannelRole::VoltageReference))?;

        let currents = channels
            .iter()
            .enumerate()
            .filter(|(_, c)| c.role.is_current())
            .map(|(position, c)| (position, c.calibration))
            .collect();

        let board = channels
            .iter()
            .position(|c| c.role == ChannelRole::BoardReference)
            .map(|position| (position, channels[position].calibration));

        Ok(Self {
            voltage_position,
            voltage: channels[voltage_position].calibration,
            currents,
            board,
        })
    }

    /// Board rail in volts, when a board reference channel is configured.
    pub fn board_voltage(&self, frame: &SampleFrame) -> Option<f64> {
        self.board
            .and_then(|(position, calibration)| frame.raw.get(position).map(|&raw| correct_sample(raw, &calibration)))
    }

    /// Frame positions of the current channels, in the order corrected samples are produced.
    pub fn current_positions(&self) -> Vec<usize> {
        self.currents.iter().map(|(position, _)| *position).collect()
    }

    /// Pure and deterministic: same frames and parameters, same output.
    /// `previous` only contributes when it is the immediately preceding frame.
    pub fn calibrate(&self, previous: Option<&SampleFrame>, frame: &SampleFrame) -> CorrectedFrame {
        let voltage = correct_sample(frame.raw[self.voltage_position], &self.voltage);
        let previous_voltage = previous
            .filter(|p| p.sequence + 1 == frame.sequence)
            .map(|p| correct_sample(p.raw[self.voltage_position], &self.voltage));

        let samples = self
            .currents
            .iter()
            .map(|(position, calibration)| {
                let aligned = match previous_voltage {
                    Some(prev) if calibration.phase_shift != 0.0 => shift_sample(prev, voltage, calibration.phase_shift),
                    _ => voltage,
                };
                CorrectedSample {
                    voltage: aligned,
                    current: correct_sample(frame.raw[*position], calibration),
                }
            })
            .collect();

        CorrectedFrame {
            sequence: frame.sequence,
            timestamp: frame.timestamp,
            reference_voltage: voltage,
            samples,
        }
    }
}

/// Measured over nominal rail outside this range is treated as a sensing fault.
const RAIL_RATIO_LIMITS: (f64, f64) = (0.5, 1.5);

/// Averages the board rail over one window. Every channel scale is proportional to the rail,
/// so the window's readings are corrected by the measured/nominal ratio.
#[derive(Debug, Clone)]
pub struct RailCompensation {
    nominal: f64,
    sum: f64,
    count: usize,
}

impl RailCompensation {
    pub fn new(nominal: f64) -> Self {
        Self {
            nominal,
            sum: 0.0,
            count: 0,
        }
    }

    pub fn add(&mut self, volts: f64) {
        self.sum += volts;
        self.count += 1;
    }

    /// Ratio for the readings since the last call, 1.0 without a usable rail reading.
    pub fn take_ratio(&mut self) -> f64 {
        let (sum, count) = (self.sum, self.count);
        self.sum = 0.0;
        self.count = 0;
        if count == 0 {
            return 1.0;
        }

        let measured = sum / count as f64;
        let ratio = measured / self.nominal;
        if ratio.is_finite() && ratio >= RAIL_RATIO_LIMITS.0 && ratio <= RAIL_RATIO_LIMITS.1 {
            log::debug!("board rail {:.3} V over {} samples", measured, count);
            ratio
        } else {
            log::warn!(
                "board rail reads {:.3} V against {:.3} V nominal, scales left uncorrected",
                measured,
                self.nominal
            );
            1.0
        }
    }
}
