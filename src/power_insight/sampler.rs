use std::time::{Duration, Instant};

use spin_sleep::SpinSleeper;

use super::config::SamplerConfig;
use super::error::{AcquisitionError, ConfigurationError};
use super::types::{Channel, SampleFrame, TimingDrift};

/// Raw analog input, one conversion per call.
pub trait AdcSource: Send {
    fn read_channel(&mut self, adc_input: usize) -> Result<i32, AcquisitionError>;

    /// Called after every channel of a frame has been read (or the frame was abandoned).
    fn end_frame(&mut self) {}
}

/// Monotonic time source measured from the monitor's start.
pub trait SampleClock: Send {
    fn now(&self) -> Duration;
    fn sleep_until(&mut self, deadline: Duration);
}

/// Wall clock with spin-assisted sleeps for sub-millisecond periods.
pub struct SpinClock {
    origin: Instant,
    sleeper: SpinSleeper,
}

impl SpinClock {
    pub fn new() -> Self {
        Self::starting_at(Instant::now())
    }

    /// Clocks sharing an origin produce comparable timestamps.
    pub fn starting_at(origin: Instant) -> Self {
        Self {
            origin,
            sleeper: SpinSleeper::default(),
        }
    }
}

impl Default for SpinClock {
    fn default() -> Self {
        Self::new()
    }
}

impl SampleClock for SpinClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn sleep_until(&mut self, deadline: Duration) {
        let now = self.now();
        if deadline > now {
            self.sleeper.sleep(deadline - now);
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SamplerStats {
    pub frames: u64,
    pub acquisition_errors: u64,
    pub drift_events: u64,
    pub backpressure_events: u64,
    pub max_lateness: Duration,
}

/// Fixed-capacity store of recent frames; slots and their buffers are reused.
pub struct FrameRing {
    slots: Vec<SampleFrame>,
    capacity: usize,
    head: usize, // Index of the most recent frame
    len: usize,
}

impl FrameRing {
    pub fn new(capacity: usize, channels: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: (0..capacity)
                .map(|_| SampleFrame {
                    raw: Vec::with_capacity(channels),
                    ..Default::default()
                })
                .collect(),
            capacity,
            head: capacity - 1,
            len: 0,
        }
    }

    fn advance(&mut self) -> &mut SampleFrame {
        self.head = (self.head + 1) % self.capacity;
        self.len = (self.len + 1).min(self.capacity);
        &mut self.slots[self.head]
    }

    pub fn latest(&self) -> Option<&SampleFrame> {
        if self.is_empty() {
            None
        } else {
            Some(&self.slots[self.head])
        }
    }

    /// Most recent first.
    pub fn recent(&self) -> impl Iterator<Item = &SampleFrame> + '_ {
        (0..self.len).map(move |back| &self.slots[(self.head + self.capacity - back) % self.capacity])
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Drives fixed-rate acquisition of all configured channels.
pub struct Sampler<A: AdcSource, C: SampleClock> {
    adc: A,
    clock: C,
    inputs: Vec<usize>, // ADC input per frame position
    period: Duration,
    tolerance: Duration,
    adc_max: i32,
    max_consecutive_failures: u32,
    next_deadline: Option<Duration>,
    sequence: u64,
    last_attempt: (u64, Duration),
    consecutive_failures: u32,
    ring: FrameRing,
    stats: SamplerStats,
}

impl<A: AdcSource, C: SampleClock> Sampler<A, C> {
    pub fn new(adc: A, clock: C, channels: &[Channel], config: &SamplerConfig) -> Result<Self, ConfigurationError> {
        let period = config.period()?;
        Ok(Self {
            adc,
            clock,
            inputs: channels.iter().map(|c| c.adc_input).collect(),
            period,
            tolerance: period.mul_f64(config.drift_tolerance),
            adc_max: config.adc_max,
            max_consecutive_failures: config.max_consecutive_failures,
            next_deadline: None,
            sequence: 0,
            last_attempt: (0, Duration::ZERO),
            consecutive_failures: 0,
            ring: FrameRing::new(config.ring_capacity, channels.len()),
            stats: SamplerStats::default(),
        })
    }

    /// Blocks until the next sample instant and reads one frame.
    /// The first frame is taken one period after the clock's current time, so it closes a full slot.
    pub fn next_frame(&mut self) -> Result<&SampleFrame, AcquisitionError> {
        let deadline = match self.next_deadline {
            Some(deadline) => deadline,
            None => self.clock.now() + self.period,
        };
        self.clock.sleep_until(deadline);
        let now = self.clock.now();

        let sequence = self.sequence;
        self.sequence += 1;
        self.last_attempt = (sequence, now);

        let lateness = now.saturating_sub(deadline);
        if lateness > self.tolerance {
            self.record_drift(TimingDrift::Jitter { sequence, lateness });
        }
        if lateness > self.stats.max_lateness {
            self.stats.max_lateness = lateness;
        }

        // Re-anchor instead of bursting to catch up.
        self.next_deadline = Some(if lateness > self.period {
            now + self.period
        } else {
            deadline + self.period
        });

        let result = self.read_frame(sequence, now);
        self.adc.end_frame();

        match result {
            Ok(()) => {
                self.consecutive_failures = 0;
                self.stats.frames += 1;
                self.ring.latest().ok_or_else(|| AcquisitionError::ReadFailed {
                    channel: 0,
                    reason: "frame ring is empty".to_string(),
                })
            }
            Err(err) => {
                self.consecutive_failures += 1;
                self.stats.acquisition_errors += 1;
                if self.consecutive_failures >= self.max_consecutive_failures {
                    log::error!(
                        "ADC input {} failed {} consecutive frames, giving up",
                        err.channel(),
                        self.consecutive_failures
                    );
                    return Err(AcquisitionError::SensorBusDead {
                        channel: err.channel(),
                        consecutive: self.consecutive_failures,
                        last: err.to_string(),
                    });
                }
                log::warn!("frame {} lost: {}", sequence, err);
                Err(err)
            }
        }
    }

    fn read_frame(&mut self, sequence: u64, timestamp: Duration) -> Result<(), AcquisitionError> {
        let mut raw = std::mem::take(&mut self.ring.advance().raw);
        raw.clear();

        let mut outcome = Ok(());
        for &input in &self.inputs {
            match self.adc.read_channel(input) {
                Ok(value) if value < 0 || value > self.adc_max => {
                    outcome = Err(AcquisitionError::OutOfRange {
                        channel: input,
                        value,
                        max: self.adc_max,
                    });
                    break;
                }
                Ok(value) => raw.push(value),
                Err(err) => {
                    outcome = Err(err);
                    break;
                }
            }
        }

        if outcome.is_err() {
            // The slot keeps its buffer but does not count as a frame.
            self.ring.retreat(raw);
            return outcome;
        }

        let slot = self.ring.head_mut();
        slot.sequence = sequence;
        slot.timestamp = timestamp;
        slot.raw = raw;
        Ok(())
    }

    fn record_drift(&mut self, drift: TimingDrift) {
        match drift {
            TimingDrift::Jitter { sequence, lateness } => {
                self.stats.drift_events += 1;
                log::warn!("timing drift at frame {}: {:?} late", sequence, lateness);
            }
            TimingDrift::Backpressure { sequence, waited } => {
                self.stats.backpressure_events += 1;
                log::warn!("processing queue full at frame {}, blocked {:?}", sequence, waited);
            }
        }
    }

    /// Queue backpressure seen by the acquisition context.
    pub fn report_backpressure(&mut self, waited: Duration) {
        let sequence = self.last_attempt.0;
        self.record_drift(TimingDrift::Backpressure { sequence, waited });
    }

    /// Sequence number and timestamp of the most recent acquisition attempt.
    pub fn last_attempt(&self) -> (u64, Duration) {
        self.last_attempt
    }

    pub fn stats(&self) -> SamplerStats {
        self.stats
    }

    pub fn ring(&self) -> &FrameRing {
        &self.ring
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn now(&self) -> Duration {
        self.clock.now()
    }
}

impl FrameRing {
    fn head_mut(&mut self) -> &mut SampleFrame {
        &mut self.slots[self.head]
    }

    fn retreat(&mut self, buffer: Vec<i32>) {
        self.slots[self.head].raw = buffer;
        self.head = (self.head + self.capacity - 1) % self.capacity;
        self.len = self.len.saturating_sub(1);
    }
}
