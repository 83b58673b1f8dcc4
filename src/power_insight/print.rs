use std::time::Duration;

use super::energy::{CostAccumulator, MeterId};
use super::sink::OutputSink;
use super::types::*;

#[derive(Debug, Clone, Copy, Default)]
struct ReadingAverage {
    rms_voltage: f64,
    rms_current: f64,
    real_power: f64,
    apparent_power: f64,
    power_factor: f64,
    low_confidence: bool,
    windows: usize,
}

impl ReadingAverage {
    fn add(&mut self, reading: &PowerReading) {
        self.rms_voltage += reading.rms_voltage;
        self.rms_current += reading.rms_current;
        self.real_power += reading.real_power;
        self.apparent_power += reading.apparent_power;
        self.power_factor += reading.power_factor;
        self.low_confidence |= reading.is_low_confidence();
        self.windows += 1;
    }

    fn mean(&self, total: f64) -> f64 {
        if self.windows == 0 {
            0.0
        } else {
            total / self.windows as f64
        }
    }
}

/// Logs readings averaged over several windows, plus tariff changes and cost snapshots.
pub struct LogSink {
    names: Vec<String>, // Channel name per frame position
    report_every: usize,
    pending: Vec<ReadingAverage>,
    delta_sum: f64,
    delta_windows: usize,
    delta_negative: bool,
    windows: usize,
    first_start: Option<Duration>,
    last_end: Duration,
}

impl LogSink {
    pub fn new(channels: &[Channel], report_every: usize) -> Self {
        Self {
            names: channels.iter().map(|c| c.name.clone()).collect(),
            report_every: report_every.max(1),
            pending: vec![ReadingAverage::default(); channels.len()],
            delta_sum: 0.0,
            delta_windows: 0,
            delta_negative: false,
            windows: 0,
            first_start: None,
            last_end: Duration::ZERO,
        }
    }

    fn name(&self, position: usize) -> &str {
        self.names.get(position).map_or("?", |n| n.as_str())
    }

    fn report(&mut self) {
        if self.windows == 0 {
            return;
        }
        let end = self.last_end;
        let start = self.first_start.unwrap_or(end);
        log::info!("Readings {:?}..{:?} ({} windows):", start, end, self.windows);

        for (position, average) in self.pending.iter().enumerate() {
            if average.windows == 0 {
                continue;
            }
            print_reading(self.name(position), average);
        }
        if self.delta_windows > 0 {
            let delta = self.delta_sum / self.delta_windows as f64;
            let flag = if self.delta_negative { " (negative)" } else { "" };
            log::info!("  delta load: {:.1} W{}\n", delta, flag);
        }

        self.pending.iter_mut().for_each(|a| *a = ReadingAverage::default());
        self.delta_sum = 0.0;
        self.delta_windows = 0;
        self.delta_negative = false;
        self.windows = 0;
        self.first_start = None;
    }
}

/*
* @brief Print the averaged readings of one channel.
* @param name Channel name
* @param average Accumulated readings
*/
fn print_reading(name: &str, average: &ReadingAverage) {
    let flag = if average.low_confidence { " [low confidence]" } else { "" };
    log::info!("  {}:{}", name, flag);
    log::info!("    Vrms: {:.2} V", average.mean(average.rms_voltage));
    log::info!("    Irms: {:.3} A", average.mean(average.rms_current));
    log::info!("    Real power: {:.1} W", average.mean(average.real_power));
    log::info!("    Apparent power: {:.1} VA", average.mean(average.apparent_power));
    log::info!("    Power factor: {:.3}", average.mean(average.power_factor));
}

/*
* @brief Print energy and cost per meter.
* @param names Channel name per frame position
* @param snapshot Cost ledger copy
*/
pub fn print_costs(names: &[String], snapshot: &CostAccumulator) {
    log::info!("Energy up to {:?}:", snapshot.integrated_until);
    for (meter, buckets) in &snapshot.meters {
        let name = match meter {
            MeterId::Channel(position) => names.get(*position).map_or("?", |n| n.as_str()),
            MeterId::DeltaLoad => "delta load",
        };
        log::info!(
            "  {}: day {:.4} kWh ({:.4}), night {:.4} kWh ({:.4}), exported {:.4} kWh",
            name,
            buckets.energy_day(),
            snapshot.cost_day(*meter),
            buckets.energy_night(),
            snapshot.cost_night(*meter),
            buckets.total_exported()
        );
    }
}

impl OutputSink for LogSink {
    fn on_readings(&mut self, span: WindowSpan, readings: &[PowerReading]) {
        if self.first_start.is_none() {
            self.first_start = Some(span.start);
        }
        for reading in readings {
            if let Some(average) = self.pending.get_mut(reading.channel) {
                average.add(reading);
            }
        }
        self.windows += 1;
        self.last_end = span.end;
        log::debug!("window {:?}..{:?} closed", span.start, span.end);
    }

    /// Follows the readings of the same window; reports once enough windows are in.
    fn on_composition(&mut self, composition: &LoadComposition) {
        self.delta_sum += composition.delta_load;
        self.delta_windows += 1;
        self.delta_negative |= composition.negative_delta;
        if self.windows >= self.report_every {
            self.report();
        }
    }

    fn on_tariff_change(&mut self, event: &TariffChanged) {
        log::info!("Tariff: {} -> {} at {:?}", event.from, event.to, event.at);
    }

    fn on_snapshot(&mut self, snapshot: &CostAccumulator) {
        print_costs(&self.names, snapshot);
    }

    fn flush(&mut self) {
        self.report();
    }
}
