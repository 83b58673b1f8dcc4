use std::time::Duration;

use super::config::WindowConfig;
use super::types::*;
use super::window::{policy_for, WindowPolicy, WindowProgress};

/*
* @brief Calculate the apparent power from RMS voltage and current.
* @param rms_voltage RMS voltage in volts
* @param rms_current RMS current in amps
* @return Apparent power in volt-amperes (VA)
*/
pub fn apparent_power(rms_voltage: f64, rms_current: f64) -> f64 {
    rms_voltage * rms_current
}

/*
* @brief Calculate the power factor from real and apparent power.
* @param real_power Real power in watts
* @param apparent_power Apparent power in volt-amperes
* @return Power factor in [-1, 1], 0 when the apparent power is zero
*/
pub fn power_factor(real_power: f64, apparent_power: f64) -> f64 {
    if apparent_power == 0.0 {
        return 0.0;
    }
    (real_power / apparent_power).clamp(-1.0, 1.0)
}

fn root_of_mean_square(mean_square: f64) -> f64 {
    if mean_square > 0.0 {
        mean_square.sqrt()
    } else {
        0.0
    }
}

/// Running sums for one current channel and its aligned voltage.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ChannelSums {
    pub sum_v: f64,
    pub sum_i: f64,
    pub sum_v2: f64,
    pub sum_i2: f64,
    pub sum_vi: f64,
    pub count: usize,
}

/// RMS values and power for one set of sums.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PowerMetrics {
    pub rms_voltage: f64,
    pub rms_current: f64,
    pub real_power: f64,
    pub apparent_power: f64,
    pub power_factor: f64,
}

impl ChannelSums {
    pub fn add(&mut self, voltage: f64, current: f64) {
        self.sum_v += voltage;
        self.sum_i += current;
        self.sum_v2 += voltage * voltage;
        self.sum_i2 += current * current;
        self.sum_vi += voltage * current;
        self.count += 1;
    }

    pub fn metrics(&self, ac_coupled: bool) -> PowerMetrics {
        if self.count == 0 {
            return PowerMetrics::default();
        }
        let n = self.count as f64;
        let (mean_v, mean_i) = if ac_coupled {
            (self.sum_v / n, self.sum_i / n)
        } else {
            (0.0, 0.0)
        };

        let rms_voltage = root_of_mean_square(self.sum_v2 / n - mean_v * mean_v);
        let rms_current = root_of_mean_square(self.sum_i2 / n - mean_i * mean_i);
        let real_power = self.sum_vi / n - mean_v * mean_i;
        let apparent_power = apparent_power(rms_voltage, rms_current);

        PowerMetrics {
            rms_voltage,
            rms_current,
            real_power,
            apparent_power,
            power_factor: power_factor(real_power, apparent_power),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccumulatorState {
    Accumulating,
    Closing,
}

/// Windowed RMS and power integration for every current channel.
pub struct PowerAccumulator {
    policy: Box<dyn WindowPolicy>,
    positions: Vec<usize>,
    sums: Vec<ChannelSums>,
    state: AccumulatorState,
    min_samples: usize,
    ac_coupled: bool,
    sample_period: Duration,
    window_start: Option<Duration>,
    first_sequence: u64,
    last_sequence: Option<u64>,
    latest: Duration,
    samples: usize,
}

impl PowerAccumulator {
    /// `positions` are the frame positions of the current channels, in corrected-sample order.
    pub fn new(positions: Vec<usize>, window: &WindowConfig, sample_period: Duration) -> Self {
        Self::with_policy(positions, policy_for(window), window, sample_period)
    }

    pub fn with_policy(
        positions: Vec<usize>,
        policy: Box<dyn WindowPolicy>,
        window: &WindowConfig,
        sample_period: Duration,
    ) -> Self {
        log::debug!("{} current channels, windows close after {}", positions.len(), policy.describe());
        let sums = vec![ChannelSums::default(); positions.len()];
        Self {
            policy,
            positions,
            sums,
            state: AccumulatorState::Accumulating,
            min_samples: window.min_samples,
            ac_coupled: window.ac_coupled,
            sample_period,
            window_start: None,
            first_sequence: 0,
            last_sequence: None,
            latest: Duration::ZERO,
            samples: 0,
        }
    }

    pub fn state(&self) -> AccumulatorState {
        self.state
    }

    /// Start of the open window, once a slot has been seen.
    pub fn window_start(&self) -> Option<Duration> {
        self.window_start
    }

    pub fn samples(&self) -> usize {
        self.samples
    }

    pub fn push(&mut self, frame: &CorrectedFrame) -> Option<PowerWindow> {
        if !self.enter_slot(frame.sequence, frame.timestamp) {
            return None;
        }
        for (sums, sample) in self.sums.iter_mut().zip(frame.samples.iter()) {
            sums.add(sample.voltage, sample.current);
        }
        self.samples += 1;
        self.close_if_due()
    }

    /// A frame slot that produced no data still advances the window.
    pub fn note_gap(&mut self, sequence: u64, timestamp: Duration) -> Option<PowerWindow> {
        if !self.enter_slot(sequence, timestamp) {
            return None;
        }
        self.close_if_due()
    }

    /// Closes whatever is open, typically on shutdown.
    pub fn finalize(&mut self) -> Option<PowerWindow> {
        match self.window_start {
            Some(_) if self.last_sequence.map_or(false, |last| last >= self.first_sequence) => Some(self.close()),
            _ => None,
        }
    }

    fn enter_slot(&mut self, sequence: u64, timestamp: Duration) -> bool {
        if let Some(last) = self.last_sequence {
            if sequence <= last {
                log::warn!("frame {} arrived after frame {}, ignored", sequence, last);
                return false;
            }
        }
        if self.window_start.is_none() {
            self.window_start = Some(timestamp.saturating_sub(self.sample_period));
            self.first_sequence = sequence;
        }
        self.last_sequence = Some(sequence);
        self.latest = timestamp;
        true
    }

    fn close_if_due(&mut self) -> Option<PowerWindow> {
        let start = self.window_start?;
        let progress = WindowProgress {
            slots: self.last_sequence.map_or(0, |last| last + 1 - self.first_sequence),
            samples: self.samples,
            start,
            latest: self.latest,
        };
        if self.policy.should_close(&progress) {
            Some(self.close())
        } else {
            None
        }
    }

    fn close(&mut self) -> PowerWindow {
        self.state = AccumulatorState::Closing;

        let span = WindowSpan::new(self.window_start.unwrap_or(self.latest), self.latest);
        let quality = if self.samples < self.min_samples {
            log::warn!(
                "window {:?}..{:?} closed with {} of {} samples",
                span.start,
                span.end,
                self.samples,
                self.min_samples
            );
            ReadingQuality::LowConfidence
        } else {
            ReadingQuality::Confident
        };

        let readings = self
            .positions
            .iter()
            .zip(self.sums.iter())
            .map(|(&channel, sums)| {
                let metrics = sums.metrics(self.ac_coupled);
                PowerReading {
                    channel,
                    span,
                    rms_voltage: metrics.rms_voltage,
                    rms_current: metrics.rms_current,
                    real_power: metrics.real_power,
                    apparent_power: metrics.apparent_power,
                    power_factor: metrics.power_factor,
                    samples: sums.count,
                    quality,
                }
            })
            .collect();

        self.sums.iter_mut().for_each(|s| *s = ChannelSums::default());
        self.samples = 0;
        self.window_start = Some(self.latest);
        self.first_sequence = self.last_sequence.map_or(0, |last| last + 1);
        self.state = AccumulatorState::Accumulating;

        PowerWindow { span, readings }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::power_insight::calibration::Calibrator;
    use crate::power_insight::config::WindowConfig;
    use approx::assert_relative_eq;
    use std::f64::consts::PI;

    const FS: f64 = 2000.0;
    const F: f64 = 50.0;
    const PERIOD: Duration = Duration::from_micros(500);

    fn corrected(sequence: u64, pairs: &[(f64, f64)]) -> CorrectedFrame {
        CorrectedFrame {
            sequence,
            timestamp: PERIOD * (sequence as u32 + 1),
            reference_voltage: pairs[0].0,
            samples: pairs
                .iter()
                .map(|&(voltage, current)| CorrectedSample { voltage, current })
                .collect(),
        }
    }

    #[test]
    fn test_power_factor_guards_zero_apparent() {
        assert_eq!(power_factor(10.0, 0.0), 0.0);
        assert_eq!(power_factor(-5.0, 10.0), -0.5);
        assert_eq!(power_factor(10.000001, 10.0), 1.0);
    }

    #[test]
    fn test_dc_window_math() {
        let mut acc = PowerAccumulator::new(vec![0], &WindowConfig::sample_count(4), PERIOD);
        let mut closed = None;
        for (seq, (v, i)) in [(2.0, 1.0), (2.0, 1.0), (-2.0, -1.0), (-2.0, 1.0)].iter().enumerate() {
            closed = acc.push(&corrected(seq as u64, &[(*v, *i)]));
        }
        let window = closed.expect("window closes after four samples");
        let reading = &window.readings[0];
        assert_relative_eq!(reading.rms_voltage, 2.0);
        assert_relative_eq!(reading.rms_current, 1.0);
        assert_relative_eq!(reading.real_power, 1.0); // (2 + 2 + 2 - 2) / 4
        assert_relative_eq!(reading.apparent_power, 2.0);
        assert_relative_eq!(reading.power_factor, 0.5);
        assert_eq!(reading.samples, 4);
        assert_eq!(reading.quality, ReadingQuality::Confident);
        assert_eq!(acc.state(), AccumulatorState::Accumulating);
        assert_eq!(acc.samples(), 0);
    }

    #[test]
    fn test_negative_power_keeps_sign() {
        let mut acc = PowerAccumulator::new(vec![0], &WindowConfig::sample_count(2), PERIOD);
        acc.push(&corrected(0, &[(10.0, -1.0)]));
        let window = acc.push(&corrected(1, &[(-10.0, 1.0)])).unwrap();
        assert_relative_eq!(window.readings[0].real_power, -10.0);
        assert_relative_eq!(window.readings[0].power_factor, -1.0);
        assert!(window.readings[0].apparent_power >= 0.0);
    }

    #[test]
    fn test_ac_coupling_removes_offset() {
        let window = WindowConfig::sample_count(4).ac_coupled(true);
        let mut acc = PowerAccumulator::new(vec![0], &window, PERIOD);
        let mut closed = None;
        for (seq, (v, i)) in [(12.0, 6.0), (8.0, 4.0), (12.0, 6.0), (8.0, 4.0)].iter().enumerate() {
            closed = acc.push(&corrected(seq as u64, &[(*v, *i)]));
        }
        let reading = closed.unwrap().readings[0].clone();
        assert_relative_eq!(reading.rms_voltage, 2.0, epsilon = 1e-9);
        assert_relative_eq!(reading.rms_current, 1.0, epsilon = 1e-9);
        assert_relative_eq!(reading.real_power, 2.0, epsilon = 1e-9);
    }

    #[test]
    fn test_spans_are_contiguous() {
        let mut acc = PowerAccumulator::new(vec![0], &WindowConfig::sample_count(4), PERIOD);
        let mut spans = Vec::new();
        for seq in 0..12u64 {
            if let Some(window) = acc.push(&corrected(seq, &[(1.0, 1.0)])) {
                spans.push(window.span);
            }
        }
        assert_eq!(spans.len(), 3);
        for span in &spans {
            assert_eq!(span.elapsed(), PERIOD * 4);
        }
        assert_eq!(spans[0].end, spans[1].start);
        assert_eq!(spans[1].end, spans[2].start);
    }

    #[test]
    fn test_gap_flags_low_confidence() {
        let mut acc = PowerAccumulator::new(vec![0, 1], &WindowConfig::sample_count(10), PERIOD);
        let mut closed = None;
        for seq in 0..10u64 {
            closed = if seq == 4 {
                acc.note_gap(seq, PERIOD * (seq as u32 + 1))
            } else {
                acc.push(&corrected(seq, &[(1.0, 1.0), (1.0, 2.0)]))
            };
        }
        let window = closed.expect("gap slots still count towards the boundary");
        assert_eq!(window.readings.len(), 2);
        for reading in &window.readings {
            assert_eq!(reading.samples, 9);
            assert!(reading.is_low_confidence());
        }
        assert_relative_eq!(window.readings[1].real_power, 2.0);
    }

    #[test]
    fn test_wall_time_window() {
        let window = WindowConfig::wall_time(Duration::from_millis(5), FS, 0.02);
        let mut acc = PowerAccumulator::new(vec![0], &window, PERIOD);
        let mut closes = Vec::new();
        for seq in 0..30u64 {
            if let Some(w) = acc.push(&corrected(seq, &[(1.0, 1.0)])) {
                closes.push((seq, w.readings[0].samples, w.readings[0].quality));
            }
        }
        assert_eq!(closes[0], (9, 10, ReadingQuality::Confident));
        assert_eq!(closes[1], (19, 10, ReadingQuality::Confident));
    }

    #[test]
    fn test_finalize_flushes_partial_window() {
        let mut acc = PowerAccumulator::new(vec![0], &WindowConfig::sample_count(100), PERIOD);
        assert!(acc.finalize().is_none());
        for seq in 0..30u64 {
            assert!(acc.push(&corrected(seq, &[(2.0, 3.0)])).is_none());
        }
        let window = acc.finalize().expect("partial window");
        assert_eq!(window.readings[0].samples, 30);
        assert!(window.readings[0].is_low_confidence());
        assert_relative_eq!(window.readings[0].real_power, 6.0);
        assert!(acc.finalize().is_none());
    }

    #[test]
    fn test_out_of_order_frame_ignored() {
        let mut acc = PowerAccumulator::new(vec![0], &WindowConfig::sample_count(3), PERIOD);
        acc.push(&corrected(5, &[(1.0, 1.0)]));
        acc.push(&corrected(4, &[(100.0, 100.0)]));
        assert_eq!(acc.samples(), 1);
    }

    #[test]
    fn test_sine_round_trip_matches_phase() {
        let v_rms = 230.0;
        let i_rms = 12.0;
        let phase = 60.0_f64.to_radians();
        let v_scale = 0.8;
        let i_scale = 0.04;

        let channels = vec![
            Channel::new(0, "main", ChannelRole::WholeLoad, ChannelCalibration::new(i_scale, 512.0)),
            Channel::new(1, "voltage", ChannelRole::VoltageReference, ChannelCalibration::new(v_scale, 512.0)),
        ];
        let calibrator = Calibrator::new(&channels).unwrap();
        let mut acc = PowerAccumulator::new(calibrator.current_positions(), &WindowConfig::sample_count(2000), PERIOD);

        let mut previous: Option<SampleFrame> = None;
        let mut closed = None;
        for n in 0..2000u64 {
            let t = n as f64 / FS;
            let v = v_rms * 2f64.sqrt() * (2.0 * PI * F * t).sin();
            let i = i_rms * 2f64.sqrt() * (2.0 * PI * F * t - phase).sin();
            let frame = SampleFrame {
                sequence: n,
                timestamp: PERIOD * n as u32,
                raw: vec![
                    (i / i_scale + 512.0).round() as i32,
                    (v / v_scale + 512.0).round() as i32,
                ],
            };
            closed = acc.push(&calibrator.calibrate(previous.as_ref(), &frame));
            previous = Some(frame);
        }

        let reading = closed.unwrap().readings[0].clone();
        assert_relative_eq!(reading.rms_voltage, v_rms, max_relative = 0.005);
        assert_relative_eq!(reading.rms_current, i_rms, max_relative = 0.005);
        assert_relative_eq!(reading.real_power, v_rms * i_rms * phase.cos(), max_relative = 0.005);
        assert_relative_eq!(reading.power_factor, 0.5, epsilon = 0.005);
    }

    #[test]
    fn test_phase_shift_recovers_lagging_ct() {
        // CT lags half a sample; at 40 samples per cycle that is 4.5 degrees.
        let lag = 0.5 / 40.0 * 2.0 * PI;
        let run = |shift: f64| {
            let channels = vec![
                Channel::new(
                    0,
                    "main",
                    ChannelRole::WholeLoad,
                    ChannelCalibration::new(0.05, 512.0).with_phase_shift(shift),
                ),
                Channel::new(1, "voltage", ChannelRole::VoltageReference, ChannelCalibration::new(1.0, 512.0)),
            ];
            let calibrator = Calibrator::new(&channels).unwrap();
            let mut acc = PowerAccumulator::new(calibrator.current_positions(), &WindowConfig::sample_count(2000), PERIOD);
            let mut previous: Option<SampleFrame> = None;
            let mut closed = None;
            for n in 0..2000u64 {
                let w = 2.0 * PI * F * n as f64 / FS;
                let frame = SampleFrame {
                    sequence: n,
                    timestamp: PERIOD * n as u32,
                    raw: vec![
                        (480.0 * (w - lag).sin() + 512.0).round() as i32,
                        (480.0 * w.sin() + 512.0).round() as i32,
                    ],
                };
                closed = acc.push(&calibrator.calibrate(previous.as_ref(), &frame));
                previous = Some(frame);
            }
            closed.unwrap().readings[0].power_factor
        };

        assert!(run(0.0) < 0.998);
        assert!(run(-0.5) > 0.9995);
    }
}
