//! Threaded runtime: acquisition, tariff polling and processing contexts around one bounded queue.
//!
//! Acquisition and tariff messages are merged by timestamp. Each source publishes a watermark,
//! the time up to which it will send nothing earlier, and events are only released to the
//! processor once every live source has passed them.

use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::config::{PowerInsightConfig, TariffConfig};
use super::energy::{CostAccumulator, CostEngine, CostReader};
use super::error::{PowerInsightError, Result, SensorError};
use super::processing::{Processor, ProcessorEvent};
use super::sampler::{AdcSource, SampleClock, Sampler, SamplerStats};
use super::sink::OutputSink;
use super::tariff::{DigitalInput, TariffTracker};
use super::types::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Acquisition,
    Tariff,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineMessage {
    Frame(SampleFrame),
    AcquisitionFailed { sequence: u64, timestamp: Duration },
    Tariff(TariffChanged),
    Watermark { source: Source, at: Duration },
    Finished(Source),
    Fatal(PowerInsightError),
}

/// Last timestamp the acquisition context produced, published once it stops.
#[derive(Debug)]
pub struct StopLine(AtomicU64);

impl StopLine {
    const UNSET: u64 = u64::MAX;

    pub fn new() -> Self {
        Self(AtomicU64::new(Self::UNSET))
    }

    pub fn set(&self, at: Duration) {
        let nanos = u64::try_from(at.as_nanos()).unwrap_or(Self::UNSET - 1);
        self.0.store(nanos, Ordering::SeqCst);
    }

    pub fn get(&self) -> Option<Duration> {
        match self.0.load(Ordering::SeqCst) {
            Self::UNSET => None,
            nanos => Some(Duration::from_nanos(nanos)),
        }
    }

    pub fn reached(&self, now: Duration) -> bool {
        self.get().map_or(false, |line| now >= line)
    }
}

impl Default for StopLine {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
struct Pending {
    at: Duration,
    rank: u8, // Tariff before samples on equal timestamps
    order: u64,
    event: ProcessorEvent,
}

impl Pending {
    fn key(&self) -> (Duration, u8, u64) {
        (self.at, self.rank, self.order)
    }
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Pending {}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pending {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.key().cmp(&other.key())
    }
}

/// Reorders events from both sources into one timestamp-ordered stream.
#[derive(Debug, Default)]
pub struct TimestampMerger {
    heap: BinaryHeap<Reverse<Pending>>,
    order: u64,
    acquisition_mark: Option<Duration>,
    tariff_mark: Option<Duration>,
    acquisition_done: bool,
    tariff_done: bool,
}

impl TimestampMerger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: ProcessorEvent) {
        let at = event.timestamp();
        let rank = match event {
            ProcessorEvent::Tariff(_) => 0,
            _ => {
                self.advance(Source::Acquisition, at);
                1
            }
        };
        self.order += 1;
        self.heap.push(Reverse(Pending {
            at,
            rank,
            order: self.order,
            event,
        }));
    }

    pub fn advance(&mut self, source: Source, at: Duration) {
        let mark = match source {
            Source::Acquisition => &mut self.acquisition_mark,
            Source::Tariff => &mut self.tariff_mark,
        };
        if mark.map_or(true, |current| at > current) {
            *mark = Some(at);
        }
    }

    pub fn finish(&mut self, source: Source) {
        match source {
            Source::Acquisition => self.acquisition_done = true,
            Source::Tariff => self.tariff_done = true,
        }
    }

    fn horizon(&self) -> Option<Duration> {
        let acquisition = if self.acquisition_done {
            Duration::MAX
        } else {
            self.acquisition_mark?
        };
        let tariff = if self.tariff_done {
            Duration::MAX
        } else {
            self.tariff_mark?
        };
        Some(acquisition.min(tariff))
    }

    /// Next event every live source has moved past.
    pub fn pop_ready(&mut self) -> Option<ProcessorEvent> {
        let horizon = self.horizon()?;
        match self.heap.peek() {
            Some(Reverse(next)) if next.at <= horizon => self.heap.pop().map(|Reverse(p)| p.event),
            _ => None,
        }
    }

    pub fn pending(&self) -> usize {
        self.heap.len()
    }

    pub fn is_done(&self) -> bool {
        self.acquisition_done && self.tariff_done && self.heap.is_empty()
    }
}

/// Hardware handed to the pipeline threads.
pub struct PipelineIo<A, C, D, T> {
    pub adc: A,
    pub sample_clock: C,
    pub tariff_input: D,
    pub tariff_clock: T,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineReport {
    pub stats: SamplerStats,
    pub windows: u64,
    pub tariff_changes: u64,
    pub snapshot: CostAccumulator,
}

pub struct Pipeline {
    config: PowerInsightConfig,
    shutdown: Arc<AtomicBool>,
    cost: CostEngine,
}

impl Pipeline {
    pub fn new(config: PowerInsightConfig) -> Result<Self> {
        config.validate()?;
        let cost = CostEngine::new(config.tariff.rates);
        Ok(Self {
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
            cost,
        })
    }

    /// Setting the flag stops acquisition; everything queued is still processed and flushed.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    pub fn cost_reader(&self) -> CostReader {
        self.cost.reader()
    }

    /// Runs until shutdown, the frame limit or a fatal error. Fatal errors are returned after the flush.
    pub fn run<A, C, D, T, S>(self, io: PipelineIo<A, C, D, T>, sink: S) -> Result<PipelineReport>
    where
        A: AdcSource + 'static,
        C: SampleClock + 'static,
        D: DigitalInput + 'static,
        T: SampleClock + 'static,
        S: OutputSink,
    {
        let PipelineIo {
            adc,
            sample_clock,
            mut tariff_input,
            mut tariff_clock,
        } = io;

        let start = tariff_clock.now();
        let initial_level = initial_level(&mut tariff_input, &mut tariff_clock, &self.config.tariff)?;
        let tracker = TariffTracker::new(initial_level, start, &self.config.tariff);
        let mut processor = Processor::with_engine(&self.config, tracker.state(), self.cost, sink)?;

        let (tx, rx) = mpsc::sync_channel::<PipelineMessage>(self.config.queue_capacity);
        let stop_line = Arc::new(StopLine::new());

        log::info!(
            "starting: {} channels at {} Hz, queue of {}",
            self.config.channels.len(),
            self.config.sampler.sample_rate_hz,
            self.config.queue_capacity
        );

        let acquisition = spawn_acquisition(
            adc,
            sample_clock,
            &self.config,
            tx.clone(),
            Arc::clone(&self.shutdown),
            Arc::clone(&stop_line),
        )?;
        let tariff = spawn_tariff(
            tariff_input,
            tariff_clock,
            tracker,
            self.config.tariff.clone(),
            tx,
            Arc::clone(&self.shutdown),
            stop_line,
        )?;

        let fatal = process(&rx, &mut processor, &self.shutdown);
        drop(rx);
        let snapshot = processor.finish();

        let stats = acquisition
            .join()
            .map_err(|_| PowerInsightError::Pipeline("acquisition thread panicked".to_string()))?;
        tariff
            .join()
            .map_err(|_| PowerInsightError::Pipeline("tariff thread panicked".to_string()))?;

        if let Some(err) = fatal {
            return Err(err);
        }

        Ok(PipelineReport {
            stats,
            windows: processor.windows(),
            tariff_changes: processor.tariff_changes(),
            snapshot,
        })
    }
}

fn initial_level<D: DigitalInput, T: SampleClock>(
    input: &mut D,
    clock: &mut T,
    config: &TariffConfig,
) -> Result<bool> {
    let mut failures = 0;
    loop {
        match input.read_level() {
            Ok(level) => return Ok(level),
            Err(err) => {
                failures += 1;
                if failures >= config.max_consecutive_failures {
                    return Err(SensorError::InputDead {
                        consecutive: failures,
                        last: err.to_string(),
                    }
                    .into());
                }
                log::warn!("initial tariff read failed: {}", err);
                let next = clock.now() + config.poll_interval;
                clock.sleep_until(next);
            }
        }
    }
}

fn spawn_acquisition<A, C>(
    adc: A,
    clock: C,
    config: &PowerInsightConfig,
    tx: SyncSender<PipelineMessage>,
    shutdown: Arc<AtomicBool>,
    stop_line: Arc<StopLine>,
) -> Result<JoinHandle<SamplerStats>>
where
    A: AdcSource + 'static,
    C: SampleClock + 'static,
{
    let mut sampler = Sampler::new(adc, clock, &config.channels, &config.sampler)?;
    let max_frames = config.sampler.max_frames;

    thread::Builder::new()
        .name("acquisition".to_string())
        .spawn(move || {
            let mut slots = 0u64;
            while !shutdown.load(Ordering::SeqCst) && max_frames.map_or(true, |max| slots < max) {
                slots += 1;
                let message = match sampler.next_frame().map(SampleFrame::clone) {
                    Ok(frame) => PipelineMessage::Frame(frame),
                    Err(err) if err.is_fatal() => {
                        shutdown.store(true, Ordering::SeqCst);
                        let _ = tx.send(PipelineMessage::Fatal(err.into()));
                        break;
                    }
                    Err(_) => {
                        let (sequence, timestamp) = sampler.last_attempt();
                        PipelineMessage::AcquisitionFailed { sequence, timestamp }
                    }
                };
                if !send(&tx, message, &mut sampler) {
                    break;
                }
            }

            let last = if slots == 0 { sampler.now() } else { sampler.last_attempt().1 };
            stop_line.set(last);
            let _ = tx.send(PipelineMessage::Finished(Source::Acquisition));
            let stats = sampler.stats();
            log::info!(
                "acquisition stopped after {} frames ({} lost, {} drift warnings)",
                stats.frames,
                stats.acquisition_errors,
                stats.drift_events
            );
            stats
        })
        .map_err(|err| PowerInsightError::Pipeline(format!("cannot start acquisition thread: {}", err)))
}

/// Counts a full queue as backpressure, then blocks. False once the receiver is gone.
fn send<A: AdcSource, C: SampleClock>(
    tx: &SyncSender<PipelineMessage>,
    message: PipelineMessage,
    sampler: &mut Sampler<A, C>,
) -> bool {
    match tx.try_send(message) {
        Ok(()) => true,
        Err(TrySendError::Full(message)) => {
            let started = Instant::now();
            let sent = tx.send(message).is_ok();
            sampler.report_backpressure(started.elapsed());
            sent
        }
        Err(TrySendError::Disconnected(_)) => false,
    }
}

fn spawn_tariff<D, T>(
    mut input: D,
    mut clock: T,
    mut tracker: TariffTracker,
    config: TariffConfig,
    tx: SyncSender<PipelineMessage>,
    shutdown: Arc<AtomicBool>,
    stop_line: Arc<StopLine>,
) -> Result<JoinHandle<()>>
where
    D: DigitalInput + 'static,
    T: SampleClock + 'static,
{
    thread::Builder::new()
        .name("tariff".to_string())
        .spawn(move || {
            let mut failures = 0u32;
            let mut next = clock.now();
            loop {
                next += config.poll_interval;
                clock.sleep_until(next);
                let now = clock.now();

                match input.read_level() {
                    Ok(level) => {
                        failures = 0;
                        if let Some(event) = tracker.observe(level, now) {
                            if tx.send(PipelineMessage::Tariff(event)).is_err() {
                                break;
                            }
                        }
                    }
                    Err(err) => {
                        failures += 1;
                        if failures >= config.max_consecutive_failures {
                            log::error!("tariff input failed {} consecutive polls, giving up", failures);
                            shutdown.store(true, Ordering::SeqCst);
                            let dead = SensorError::InputDead {
                                consecutive: failures,
                                last: err.to_string(),
                            };
                            let _ = tx.send(PipelineMessage::Fatal(dead.into()));
                            break;
                        }
                        log::warn!("{}", err);
                    }
                }

                let watermark = PipelineMessage::Watermark {
                    source: Source::Tariff,
                    at: tracker.settled_until(now),
                };
                if tx.send(watermark).is_err() || stop_line.reached(now) {
                    break;
                }
            }
            let _ = tx.send(PipelineMessage::Finished(Source::Tariff));
        })
        .map_err(|err| PowerInsightError::Pipeline(format!("cannot start tariff thread: {}", err)))
}

/// Processing context. Returns the first fatal error reported by another context.
fn process<S: OutputSink>(
    rx: &Receiver<PipelineMessage>,
    processor: &mut Processor<S>,
    shutdown: &AtomicBool,
) -> Option<PowerInsightError> {
    let mut merger = TimestampMerger::new();
    let mut fatal = None;

    while !merger.is_done() {
        match rx.recv() {
            Ok(PipelineMessage::Frame(frame)) => merger.push(ProcessorEvent::Frame(frame)),
            Ok(PipelineMessage::AcquisitionFailed { sequence, timestamp }) => {
                merger.push(ProcessorEvent::Gap { sequence, timestamp })
            }
            Ok(PipelineMessage::Tariff(event)) => merger.push(ProcessorEvent::Tariff(event)),
            Ok(PipelineMessage::Watermark { source, at }) => merger.advance(source, at),
            Ok(PipelineMessage::Finished(source)) => merger.finish(source),
            Ok(PipelineMessage::Fatal(err)) => {
                log::error!("{}", err);
                shutdown.store(true, Ordering::SeqCst);
                fatal.get_or_insert(err);
            }
            Err(_) => {
                merger.finish(Source::Acquisition);
                merger.finish(Source::Tariff);
            }
        }

        while let Some(event) = merger.pop_ready() {
            processor.handle(event);
        }
    }

    fatal
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(sequence: u64, ms: u64) -> ProcessorEvent {
        ProcessorEvent::Frame(SampleFrame {
            sequence,
            timestamp: Duration::from_millis(ms),
            raw: vec![512, 512],
        })
    }

    fn tariff(ms: u64) -> ProcessorEvent {
        ProcessorEvent::Tariff(TariffChanged {
            from: TariffState::Day,
            to: TariffState::Night,
            at: Duration::from_millis(ms),
        })
    }

    fn drain(merger: &mut TimestampMerger) -> Vec<Duration> {
        std::iter::from_fn(|| merger.pop_ready()).map(|e| e.timestamp()).collect()
    }

    #[test]
    fn test_frames_wait_for_tariff_watermark() {
        let mut merger = TimestampMerger::new();
        merger.push(frame(0, 10));
        merger.push(frame(1, 20));
        assert!(drain(&mut merger).is_empty());

        merger.advance(Source::Tariff, Duration::from_millis(15));
        assert_eq!(drain(&mut merger), vec![Duration::from_millis(10)]);
        assert_eq!(merger.pending(), 1);
    }

    #[test]
    fn test_late_tariff_event_is_ordered_before_frames() {
        let mut merger = TimestampMerger::new();
        merger.advance(Source::Tariff, Duration::from_millis(5));
        merger.push(frame(0, 10));
        merger.push(frame(1, 20));
        merger.push(frame(2, 30));
        // Edge at 20 ms, confirmed later; watermark moves past the frames only now.
        merger.push(tariff(20));
        merger.advance(Source::Tariff, Duration::from_millis(40));

        let order: Vec<_> = std::iter::from_fn(|| merger.pop_ready()).collect();
        assert_eq!(order.len(), 4);
        assert_eq!(order[0].timestamp(), Duration::from_millis(10));
        assert!(matches!(order[1], ProcessorEvent::Tariff(_)));
        assert_eq!(order[2].timestamp(), Duration::from_millis(20));
        assert_eq!(order[3].timestamp(), Duration::from_millis(30));
    }

    #[test]
    fn test_finished_source_stops_holding_back() {
        let mut merger = TimestampMerger::new();
        merger.push(frame(0, 10));
        merger.finish(Source::Tariff);
        assert_eq!(drain(&mut merger), vec![Duration::from_millis(10)]);
        assert!(!merger.is_done());
        merger.finish(Source::Acquisition);
        assert!(merger.is_done());
    }

    #[test]
    fn test_tariff_waits_for_acquisition() {
        let mut merger = TimestampMerger::new();
        merger.push(tariff(50));
        merger.advance(Source::Tariff, Duration::from_millis(60));
        assert!(drain(&mut merger).is_empty());
        merger.push(frame(0, 49));
        assert_eq!(drain(&mut merger), vec![Duration::from_millis(49)]);
        merger.push(frame(1, 50));
        assert_eq!(drain(&mut merger), vec![Duration::from_millis(50), Duration::from_millis(50)]);
    }

    #[test]
    fn test_stop_line() {
        let line = StopLine::new();
        assert!(!line.reached(Duration::from_secs(100)));
        line.set(Duration::from_secs(2));
        assert!(!line.reached(Duration::from_secs(1)));
        assert!(line.reached(Duration::from_secs(2)));
    }
}
