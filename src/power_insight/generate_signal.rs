//! Simulated hardware: sine-wave ADC, scheduled tariff input and a virtual clock.

use std::collections::{HashMap, HashSet};
use std::f64::consts::PI;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ndarray::Array1;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::error::{AcquisitionError, SensorError};
use super::sampler::{AdcSource, SampleClock};
use super::tariff::DigitalInput;
use super::types::{ADC_MAX_COUNTS, ADC_MID_SCALE};

const DEFAULT_SEED: u64 = 0x5eed;

// Counts on the house preset: about 240 V and 14 A on the main.
const HOUSE_VOLTAGE_COUNTS: f64 = 323.0;
const HOUSE_WAVES: [(usize, f64, f64); 6] = [
    (0, 68.0, 8.0),  // ct1, whole house
    (1, 12.0, 3.0),  // ct2
    (2, 18.0, 25.0), // ct3
    (3, 6.0, 0.0),   // ct4
    (6, 4.0, 40.0),  // ct5
    (7, 9.0, 12.0),  // ct6
];
const HOUSE_VOLTAGE_INPUT: usize = 5;
// 3.3V rail through the divider.
const HOUSE_BOARD_COUNTS: f64 = 510.0;
const HOUSE_BOARD_INPUT: usize = 4;

fn offset(deg: f64) -> f64 {
    deg * 2.0 * PI / 360.0
}

/*
* @brief Generate one block of a sine wave.
* @param samples Number of samples
* @param fs Sampling frequency in Hz
* @param f Signal frequency in Hz
* @param amplitude Peak value
* @param lag_deg Phase lag in degrees
* @return Samples of amplitude * sin(2*pi*f*n/fs - lag)
*/
pub fn sine_block(samples: usize, fs: f64, f: f64, amplitude: f64, lag_deg: f64) -> Array1<f64> {
    Array1::range(0.0, samples as f64, 1.0).mapv(|n| amplitude * (2.0 * PI * f / fs * n - offset(lag_deg)).sin())
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Wave {
    adc_input: usize,
    amplitude: f64, // Peak, in counts
    lag: f64,       // Radians
    bias: f64,      // Counts
}

/// ADC producing sine waves around mid-scale, with optional noise and fault injection.
pub struct SimulatedAdc {
    sample_rate: f64,
    frequency: f64,
    waves: Vec<Wave>,
    noise: f64,
    rng: StdRng,
    frame: u64,
    failing: HashSet<u64>,
    overrides: HashMap<usize, i32>,
}

impl SimulatedAdc {
    pub fn new(sample_rate: f64, frequency: f64) -> Self {
        Self {
            sample_rate,
            frequency,
            waves: Vec::new(),
            noise: 0.0,
            rng: StdRng::seed_from_u64(DEFAULT_SEED),
            frame: 0,
            failing: HashSet::new(),
            overrides: HashMap::new(),
        }
    }

    /// Signals matching the single phase house channel map.
    pub fn house(sample_rate: f64, frequency: f64) -> Self {
        HOUSE_WAVES.iter().fold(
            Self::new(sample_rate, frequency)
                .with_wave(HOUSE_VOLTAGE_INPUT, HOUSE_VOLTAGE_COUNTS, 0.0)
                .with_level(HOUSE_BOARD_INPUT, HOUSE_BOARD_COUNTS),
            |adc, &(input, amplitude, lag)| adc.with_wave(input, amplitude, lag),
        )
    }

    /// Sets (or replaces) the wave on one input. `lag_deg` delays it against the voltage.
    pub fn with_wave(self, adc_input: usize, amplitude: f64, lag_deg: f64) -> Self {
        self.set_wave(Wave {
            adc_input,
            amplitude,
            lag: offset(lag_deg),
            bias: ADC_MID_SCALE,
        })
    }

    /// Steady level on one input, such as a supply rail.
    pub fn with_level(self, adc_input: usize, counts: f64) -> Self {
        self.set_wave(Wave {
            adc_input,
            amplitude: 0.0,
            lag: 0.0,
            bias: counts,
        })
    }

    fn set_wave(mut self, wave: Wave) -> Self {
        let adc_input = wave.adc_input;
        match self.waves.iter_mut().find(|w| w.adc_input == adc_input) {
            Some(existing) => *existing = wave,
            None => self.waves.push(wave),
        }
        self
    }

    /// Uniform noise of up to `counts` on every conversion.
    pub fn with_noise(mut self, counts: f64) -> Self {
        self.noise = counts.abs();
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Every read fails during the given frames (counted by `end_frame`).
    pub fn fail_frames<I: IntoIterator<Item = u64>>(mut self, frames: I) -> Self {
        self.failing.extend(frames);
        self
    }

    /// Pins an input to a fixed raw value.
    pub fn with_raw_override(mut self, adc_input: usize, value: i32) -> Self {
        self.overrides.insert(adc_input, value);
        self
    }

    pub fn frame(&self) -> u64 {
        self.frame
    }

    /// Reads `samples` consecutive frames of the given inputs, one array per input.
    pub fn capture(&mut self, inputs: &[usize], samples: usize) -> Result<Vec<Array1<f64>>, AcquisitionError> {
        let mut blocks = vec![Array1::<f64>::zeros(samples); inputs.len()];
        for n in 0..samples {
            for (block, &input) in blocks.iter_mut().zip(inputs) {
                block[n] = self.read_channel(input)? as f64;
            }
            self.end_frame();
        }
        Ok(blocks)
    }
}

impl AdcSource for SimulatedAdc {
    fn read_channel(&mut self, adc_input: usize) -> Result<i32, AcquisitionError> {
        if self.failing.contains(&self.frame) {
            return Err(AcquisitionError::ReadFailed {
                channel: adc_input,
                reason: format!("simulated failure in frame {}", self.frame),
            });
        }
        if let Some(&value) = self.overrides.get(&adc_input) {
            return Ok(value);
        }

        let wave = self
            .waves
            .iter()
            .find(|w| w.adc_input == adc_input)
            .copied()
            .ok_or_else(|| AcquisitionError::ReadFailed {
                channel: adc_input,
                reason: "no signal on this input".to_string(),
            })?;

        let t = self.frame as f64 / self.sample_rate;
        let mut value = wave.bias + wave.amplitude * (2.0 * PI * self.frequency * t - wave.lag).sin();
        if self.noise > 0.0 {
            value += self.rng.gen_range(-self.noise..self.noise);
        }
        Ok((value.round() as i32).clamp(0, ADC_MAX_COUNTS))
    }

    fn end_frame(&mut self) {
        self.frame += 1;
    }
}

#[derive(Debug, Default)]
struct ClockState {
    now_ns: AtomicU64,
    delay_ns: AtomicU64,
}

/// Virtual time: sleeping jumps straight to the deadline. Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct SimulatedClock {
    state: Arc<ClockState>,
}

fn nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

impl SimulatedClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        self.state.now_ns.fetch_add(nanos(by), Ordering::SeqCst);
    }

    /// The next `sleep_until` overshoots its deadline by `delay`.
    pub fn delay_next_sleep(&self, delay: Duration) {
        self.state.delay_ns.store(nanos(delay), Ordering::SeqCst);
    }
}

impl SampleClock for SimulatedClock {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.state.now_ns.load(Ordering::SeqCst))
    }

    fn sleep_until(&mut self, deadline: Duration) {
        let delay = self.state.delay_ns.swap(0, Ordering::SeqCst);
        let now = self.state.now_ns.load(Ordering::SeqCst).max(nanos(deadline));
        self.state.now_ns.store(now + delay, Ordering::SeqCst);
    }
}

/// Tariff line following a fixed schedule of level changes.
pub struct SimulatedTariffInput<C: SampleClock> {
    clock: C,
    initial: bool,
    edges: Vec<(Duration, bool)>,
    failures: Vec<(Duration, Duration)>,
}

impl<C: SampleClock> SimulatedTariffInput<C> {
    pub fn new(clock: C, initial: bool) -> Self {
        Self {
            clock,
            initial,
            edges: Vec::new(),
            failures: Vec::new(),
        }
    }

    pub fn switch_at(mut self, at: Duration, level: bool) -> Self {
        self.edges.push((at, level));
        self.edges.sort_by_key(|&(at, _)| at);
        self
    }

    /// A short pulse to the opposite level of whatever is scheduled at `at`.
    pub fn glitch(self, at: Duration, length: Duration) -> Self {
        let level = self.level_at(at);
        self.switch_at(at, !level).switch_at(at + length, level)
    }

    /// Reads fail in `[start, end)`.
    pub fn fail_between(mut self, start: Duration, end: Duration) -> Self {
        self.failures.push((start, end));
        self
    }

    fn level_at(&self, at: Duration) -> bool {
        self.edges
            .iter()
            .take_while(|&&(edge, _)| edge <= at)
            .last()
            .map_or(self.initial, |&(_, level)| level)
    }
}

impl<C: SampleClock> DigitalInput for SimulatedTariffInput<C> {
    fn read_level(&mut self) -> Result<bool, SensorError> {
        let now = self.clock.now();
        if self.failures.iter().any(|&(start, end)| now >= start && now < end) {
            return Err(SensorError::ReadFailed(format!("simulated failure at {:?}", now)));
        }
        Ok(self.level_at(now))
    }
}
