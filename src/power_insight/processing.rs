use std::time::Duration;

use super::calibration::{Calibrator, RailCompensation};
use super::config::PowerInsightConfig;
use super::energy::{CostAccumulator, CostEngine, CostReader};
use super::error::ConfigurationError;
use super::load::LoadComposer;
use super::power::PowerAccumulator;
use super::sink::OutputSink;
use super::tariff::TariffTimeline;
use super::types::*;

/// Input to the processing context, already in timestamp order.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessorEvent {
    Frame(SampleFrame),
    Gap { sequence: u64, timestamp: Duration },
    Tariff(TariffChanged),
}

impl ProcessorEvent {
    pub fn timestamp(&self) -> Duration {
        match self {
            ProcessorEvent::Frame(frame) => frame.timestamp,
            ProcessorEvent::Gap { timestamp, .. } => *timestamp,
            ProcessorEvent::Tariff(event) => event.at,
        }
    }
}

/// Calibration, windowing, load composition and cost integration for one stream of frames.
pub struct Processor<S: OutputSink> {
    calibrator: Calibrator,
    rail: RailCompensation,
    accumulator: PowerAccumulator,
    composer: LoadComposer,
    cost: CostEngine,
    timeline: TariffTimeline,
    started: bool, // Timeline anchored to the first window
    previous: Option<SampleFrame>,
    sink: S,
    report_every: usize,
    windows: u64,
    tariff_changes: u64,
}

impl<S: OutputSink> Processor<S> {
    pub fn new(config: &PowerInsightConfig, initial_tariff: TariffState, sink: S) -> Result<Self, ConfigurationError> {
        Self::with_engine(config, initial_tariff, CostEngine::new(config.tariff.rates), sink)
    }

    /// Uses an existing engine, so readers handed out earlier keep working.
    pub fn with_engine(
        config: &PowerInsightConfig,
        initial_tariff: TariffState,
        cost: CostEngine,
        sink: S,
    ) -> Result<Self, ConfigurationError> {
        config.validate()?;
        let calibrator = Calibrator::new(&config.channels)?;
        let composer = LoadComposer::new(&config.channels)?;
        let accumulator = PowerAccumulator::new(calibrator.current_positions(), &config.window, config.sampler.period()?);

        Ok(Self {
            calibrator,
            rail: RailCompensation::new(config.sampler.board_voltage),
            accumulator,
            composer,
            cost,
            timeline: TariffTimeline::new(Duration::ZERO, initial_tariff),
            started: false,
            previous: None,
            sink,
            report_every: config.report_every.max(1),
            windows: 0,
            tariff_changes: 0,
        })
    }

    pub fn handle(&mut self, event: ProcessorEvent) {
        match event {
            ProcessorEvent::Frame(frame) => self.process_frame(&frame),
            ProcessorEvent::Gap { sequence, timestamp } => self.process_gap(sequence, timestamp),
            ProcessorEvent::Tariff(event) => self.apply_tariff(event),
        }
    }

    pub fn process_frame(&mut self, frame: &SampleFrame) {
        let corrected = self.calibrator.calibrate(self.previous.as_ref(), frame);
        if let Some(volts) = self.calibrator.board_voltage(frame) {
            self.rail.add(volts);
        }
        match self.previous.as_mut() {
            Some(previous) => previous.clone_from(frame),
            None => self.previous = Some(frame.clone()),
        }

        let closed = self.accumulator.push(&corrected);
        self.after_slot(closed);
    }

    pub fn process_gap(&mut self, sequence: u64, timestamp: Duration) {
        log::debug!("frame {} missing at {:?}", sequence, timestamp);
        let closed = self.accumulator.note_gap(sequence, timestamp);
        self.after_slot(closed);
    }

    /// Transitions earlier than the open window are applied from its start.
    pub fn apply_tariff(&mut self, event: TariffChanged) {
        if self.started {
            self.timeline.record(event);
        } else {
            self.timeline = TariffTimeline::new(Duration::ZERO, event.to);
        }
        self.tariff_changes += 1;
        self.sink.on_tariff_change(&event);
    }

    pub fn tariff(&self) -> TariffState {
        self.timeline.current()
    }

    pub fn cost_reader(&self) -> CostReader {
        self.cost.reader()
    }

    pub fn windows(&self) -> u64 {
        self.windows
    }

    pub fn tariff_changes(&self) -> u64 {
        self.tariff_changes
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Closes the partial window and flushes the sink with the final ledger.
    pub fn finish(&mut self) -> CostAccumulator {
        if let Some(window) = self.accumulator.finalize() {
            self.close_window(window);
        }
        let snapshot = self.cost.snapshot();
        self.sink.on_snapshot(&snapshot);
        self.sink.flush();
        log::info!("processing finished after {} windows", self.windows);
        snapshot
    }

    fn after_slot(&mut self, closed: Option<PowerWindow>) {
        match closed {
            Some(window) => {
                self.anchor(window.span.start);
                self.close_window(window);
            }
            None => {
                if let Some(start) = self.accumulator.window_start() {
                    self.anchor(start);
                }
            }
        }
    }

    fn anchor(&mut self, start: Duration) {
        if !self.started {
            self.timeline.rebase(start);
            self.started = true;
        }
    }

    fn close_window(&mut self, mut window: PowerWindow) {
        let ratio = self.rail.take_ratio();
        if ratio != 1.0 {
            window.readings.iter_mut().for_each(|reading| reading.rescale(ratio));
        }
        self.sink.on_readings(window.span, &window.readings);

        let composition = match self.composer.compose(&window.readings) {
            Ok(composition) => Some(composition),
            Err(err) => {
                log::error!("window {:?}..{:?}: {}", window.span.start, window.span.end, err);
                None
            }
        };

        self.cost.integrate_window(&window, composition.as_ref(), &self.timeline);
        self.timeline.restart(window.span.end);

        if let Some(composition) = composition {
            self.sink.on_composition(&composition);
        }

        self.windows += 1;
        if self.windows % self.report_every as u64 == 0 {
            self.sink.on_snapshot(&self.cost.snapshot());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::power_insight::config::WindowConfig;
    use crate::power_insight::energy::MeterId;
    use crate::power_insight::generate_signal::SimulatedAdc;
    use crate::power_insight::sampler::AdcSource;
    use crate::power_insight::sink::MemorySink;
    use approx::assert_relative_eq;

    const PERIOD: Duration = Duration::from_micros(500);

    fn config(window_samples: usize) -> PowerInsightConfig {
        let mut config = PowerInsightConfig::new(vec![
            Channel::new(0, "main", ChannelRole::WholeLoad, ChannelCalibration::new(0.05, 512.0)),
            Channel::new(1, "kitchen", ChannelRole::MonitoredBreaker, ChannelCalibration::new(0.05, 512.0)),
            Channel::new(5, "voltage", ChannelRole::VoltageReference, ChannelCalibration::new(1.0, 512.0)),
        ]);
        config.window = WindowConfig::sample_count(window_samples);
        config.report_every = 1;
        config
    }

    fn adc() -> SimulatedAdc {
        SimulatedAdc::new(2000.0, 50.0)
            .with_wave(5, 300.0, 0.0)
            .with_wave(0, 200.0, 0.0)
            .with_wave(1, 80.0, 0.0)
    }

    fn frames(count: u64) -> Vec<SampleFrame> {
        frames_from(adc(), &[0, 1, 5], count)
    }

    fn frames_from(mut adc: SimulatedAdc, inputs: &[usize], count: u64) -> Vec<SampleFrame> {
        (0..count)
            .map(|sequence| {
                let raw = inputs.iter().map(|&input| adc.read_channel(input).unwrap()).collect();
                adc.end_frame();
                SampleFrame {
                    sequence,
                    timestamp: PERIOD * (sequence as u32 + 1),
                    raw,
                }
            })
            .collect()
    }

    fn run(events: Vec<ProcessorEvent>) -> (CostAccumulator, MemorySink) {
        let sink = MemorySink::new();
        let mut processor = Processor::new(&config(400), TariffState::Day, sink.clone()).unwrap();
        for event in events {
            processor.handle(event);
        }
        (processor.finish(), sink)
    }

    #[test]
    fn test_processing_is_deterministic() {
        let events: Vec<ProcessorEvent> = frames(1000).into_iter().map(ProcessorEvent::Frame).collect();
        let (first_snapshot, first) = run(events.clone());
        let (second_snapshot, second) = run(events);
        assert_eq!(first_snapshot, second_snapshot);
        assert_eq!(first.recorded().windows, second.recorded().windows);
    }

    #[test]
    fn test_windows_compose_and_flush() {
        let events = frames(1000).into_iter().map(ProcessorEvent::Frame).collect();
        let (snapshot, sink) = run(events);
        let recorded = sink.recorded();

        // Two full windows and the partial one from finish.
        assert_eq!(recorded.windows.len(), 3);
        assert_eq!(recorded.compositions.len(), 3);
        assert!(recorded.flushed);
        assert!(recorded.windows[2].readings[0].is_low_confidence());

        let composition = recorded.compositions[0];
        assert_relative_eq!(
            composition.delta_load,
            composition.whole_load_power - composition.monitored_power
        );
        // 300 counts * 1 V against 200 and 80 counts * 0.05 A, in phase.
        assert_relative_eq!(composition.whole_load_power, 300.0 * 10.0 / 2.0, max_relative = 0.01);
        assert_relative_eq!(composition.delta_load, 300.0 * 6.0 / 2.0, max_relative = 0.01);

        let total = 1000.0 * PERIOD.as_secs_f64() * 1500.0 / 3.6e6;
        assert_relative_eq!(snapshot.energy_day(MeterId::Channel(0)), total, max_relative = 0.01);
        assert_eq!(snapshot.integrated_until, PERIOD * 1000);
    }

    #[test]
    fn test_tariff_change_splits_window() {
        let mut events: Vec<ProcessorEvent> = frames(400).into_iter().map(ProcessorEvent::Frame).collect();
        let change = TariffChanged {
            from: TariffState::Day,
            to: TariffState::Night,
            at: PERIOD * 100,
        };
        events.insert(99, ProcessorEvent::Tariff(change));
        let (snapshot, sink) = run(events);

        let day = snapshot.energy_day(MeterId::Channel(0));
        let night = snapshot.energy_night(MeterId::Channel(0));
        assert_relative_eq!(night / (day + night), 0.75, max_relative = 1e-9);
        assert_eq!(sink.recorded().tariff_changes, vec![change]);
    }

    #[test]
    fn test_tariff_before_first_frame_sets_initial_state() {
        let mut events: Vec<ProcessorEvent> = frames(400).into_iter().map(ProcessorEvent::Frame).collect();
        events.insert(
            0,
            ProcessorEvent::Tariff(TariffChanged {
                from: TariffState::Day,
                to: TariffState::Night,
                at: Duration::ZERO,
            }),
        );
        let (snapshot, _) = run(events);
        assert_eq!(snapshot.energy_day(MeterId::Channel(0)), 0.0);
        assert!(snapshot.energy_night(MeterId::Channel(0)) > 0.0);
    }

    #[test]
    fn test_gap_marks_window_low_confidence() {
        let events = frames(400)
            .into_iter()
            .map(|frame| {
                if frame.sequence == 200 {
                    ProcessorEvent::Gap {
                        sequence: frame.sequence,
                        timestamp: frame.timestamp,
                    }
                } else {
                    ProcessorEvent::Frame(frame)
                }
            })
            .collect();
        let (_, sink) = run(events);
        let windows = sink.recorded().windows;
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].readings[0].samples, 399);
        assert!(windows[0].readings[0].is_low_confidence());
        assert!(sink.recorded().compositions[0].low_confidence);
    }

    #[test]
    fn test_invalid_sample_rate_is_an_error() {
        let mut config = config(400);
        config.sampler.sample_rate_hz = 0.0;
        assert!(matches!(
            Processor::new(&config, TariffState::Day, MemorySink::new()),
            Err(ConfigurationError::InvalidParameter { name: "sample_rate_hz", .. })
        ));

        let mut config = self::config(400);
        config.report_every = 0;
        assert!(Processor::new(&config, TariffState::Day, MemorySink::new()).is_err());
    }

    #[test]
    fn test_low_board_rail_scales_readings() {
        let mut config = config(400);
        config.channels.push(Channel::new(
            4,
            "board",
            ChannelRole::BoardReference,
            ChannelCalibration::new(0.0066, 0.0),
        ));
        config.sampler.board_voltage = 3.3;

        let reading_with_rail = |counts: f64| {
            let sink = MemorySink::new();
            let mut processor = Processor::new(&config, TariffState::Day, sink.clone()).unwrap();
            for frame in frames_from(adc().with_level(4, counts), &[0, 1, 5, 4], 400) {
                processor.process_frame(&frame);
            }
            processor.finish();
            sink.recorded().windows[0].readings[0].clone()
        };

        // 500 counts is the nominal 3.3 V, 490 counts is 2% low.
        let nominal = reading_with_rail(500.0);
        let low = reading_with_rail(490.0);
        assert_relative_eq!(low.rms_voltage / nominal.rms_voltage, 0.98, max_relative = 1e-9);
        assert_relative_eq!(low.rms_current / nominal.rms_current, 0.98, max_relative = 1e-9);
        assert_relative_eq!(low.real_power / nominal.real_power, 0.98 * 0.98, max_relative = 1e-9);
        assert_relative_eq!(low.power_factor, nominal.power_factor, max_relative = 1e-12);
        assert_relative_eq!(nominal.rms_voltage, 300.0 / 2f64.sqrt(), max_relative = 0.01);
    }
}
