use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::energy::CostAccumulator;
use super::types::*;

/// Receives everything the processing context produces.
pub trait OutputSink: Send {
    fn on_readings(&mut self, span: WindowSpan, readings: &[PowerReading]);

    fn on_composition(&mut self, composition: &LoadComposition);

    fn on_tariff_change(&mut self, _event: &TariffChanged) {}

    fn on_snapshot(&mut self, snapshot: &CostAccumulator);

    /// Called once on shutdown after the final window and snapshot.
    fn flush(&mut self) {}
}

/// Everything a `MemorySink` has seen.
#[derive(Debug, Clone, Default)]
pub struct Recorded {
    pub windows: Vec<PowerWindow>,
    pub compositions: Vec<LoadComposition>,
    pub tariff_changes: Vec<TariffChanged>,
    pub snapshots: Vec<CostAccumulator>,
    pub flushed: bool,
}

/// Keeps all output in memory; clones share the same record.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    record: Arc<Mutex<Recorded>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Recorded> {
        self.record.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn recorded(&self) -> Recorded {
        self.lock().clone()
    }
}

impl OutputSink for MemorySink {
    fn on_readings(&mut self, span: WindowSpan, readings: &[PowerReading]) {
        self.lock().windows.push(PowerWindow {
            span,
            readings: readings.to_vec(),
        });
    }

    fn on_composition(&mut self, composition: &LoadComposition) {
        self.lock().compositions.push(*composition);
    }

    fn on_tariff_change(&mut self, event: &TariffChanged) {
        self.lock().tariff_changes.push(*event);
    }

    fn on_snapshot(&mut self, snapshot: &CostAccumulator) {
        self.lock().snapshots.push(snapshot.clone());
    }

    fn flush(&mut self) {
        self.lock().flushed = true;
    }
}

impl<S: OutputSink + ?Sized> OutputSink for Box<S> {
    fn on_readings(&mut self, span: WindowSpan, readings: &[PowerReading]) {
        (**self).on_readings(span, readings)
    }

    fn on_composition(&mut self, composition: &LoadComposition) {
        (**self).on_composition(composition)
    }

    fn on_tariff_change(&mut self, event: &TariffChanged) {
        (**self).on_tariff_change(event)
    }

    fn on_snapshot(&mut self, snapshot: &CostAccumulator) {
        (**self).on_snapshot(snapshot)
    }

    fn flush(&mut self) {
        (**self).flush()
    }
}
