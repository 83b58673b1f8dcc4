use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::config::TariffRates;
use super::tariff::TariffTimeline;
use super::types::*;

/*
 * (3600 * 1000) converts watt-seconds (joules) to kilowatt-hours.
 * One kilowatt-hour is 3.6 x 10^6 joules.
 */
const JOULES_PER_KWH: f64 = 3600.0 * 1000.0;

/*
* @brief Energy for a constant power over an interval.
* @param power_w Real power in watts
* @param elapsed Interval length
* @return Energy in kWh, signed like the power
*/
pub fn energy_kwh(power_w: f64, elapsed: Duration) -> f64 {
    power_w * elapsed.as_secs_f64() / JOULES_PER_KWH
}

/// What a bucket belongs to: a current channel (by frame position) or the derived delta load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MeterId {
    Channel(usize),
    DeltaLoad,
}

/// Imported and exported energy under one tariff. Both only grow.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TariffEnergy {
    pub imported_kwh: f64,
    pub exported_kwh: f64,
}

impl TariffEnergy {
    fn add(&mut self, kwh: f64) {
        if kwh >= 0.0 {
            self.imported_kwh += kwh;
        } else {
            self.exported_kwh -= kwh;
        }
    }

    pub fn balance(&self) -> f64 {
        self.imported_kwh - self.exported_kwh
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EnergyBuckets {
    pub day: TariffEnergy,
    pub night: TariffEnergy,
}

impl EnergyBuckets {
    fn bucket_mut(&mut self, state: TariffState) -> &mut TariffEnergy {
        match state {
            TariffState::Day => &mut self.day,
            TariffState::Night => &mut self.night,
        }
    }

    pub fn energy_day(&self) -> f64 {
        self.day.imported_kwh
    }

    pub fn energy_night(&self) -> f64 {
        self.night.imported_kwh
    }

    pub fn total_exported(&self) -> f64 {
        self.day.exported_kwh + self.night.exported_kwh
    }
}

/// Cumulative energy per meter. Costs are derived on read and never stored.
#[derive(Debug, Clone, PartialEq)]
pub struct CostAccumulator {
    pub meters: BTreeMap<MeterId, EnergyBuckets>,
    pub rates: TariffRates,
    pub integrated_until: Duration,
}

impl CostAccumulator {
    pub fn new(rates: TariffRates) -> Self {
        Self {
            meters: BTreeMap::new(),
            rates,
            integrated_until: Duration::ZERO,
        }
    }

    pub fn buckets(&self, meter: MeterId) -> EnergyBuckets {
        self.meters.get(&meter).copied().unwrap_or_default()
    }

    pub fn energy_day(&self, meter: MeterId) -> f64 {
        self.buckets(meter).energy_day()
    }

    pub fn energy_night(&self, meter: MeterId) -> f64 {
        self.buckets(meter).energy_night()
    }

    pub fn cost_day(&self, meter: MeterId) -> f64 {
        self.energy_day(meter) * self.rates.rate(TariffState::Day)
    }

    pub fn cost_night(&self, meter: MeterId) -> f64 {
        self.energy_night(meter) * self.rates.rate(TariffState::Night)
    }

    pub fn cost(&self, meter: MeterId) -> f64 {
        self.cost_day(meter) + self.cost_night(meter)
    }

    fn add(&mut self, meter: MeterId, power_w: f64, elapsed: Duration, tariff: TariffState) {
        if !power_w.is_finite() {
            log::warn!("non-finite power {} for {:?} skipped", power_w, meter);
            return;
        }
        self.meters
            .entry(meter)
            .or_default()
            .bucket_mut(tariff)
            .add(energy_kwh(power_w, elapsed));
    }
}

fn lock(ledger: &Mutex<CostAccumulator>) -> MutexGuard<'_, CostAccumulator> {
    ledger.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Read-only handle for other contexts; every snapshot is a consistent copy.
#[derive(Clone)]
pub struct CostReader {
    ledger: Arc<Mutex<CostAccumulator>>,
}

impl CostReader {
    pub fn snapshot(&self) -> CostAccumulator {
        lock(&self.ledger).clone()
    }
}

/// Sole writer of the cost ledger.
pub struct CostEngine {
    ledger: Arc<Mutex<CostAccumulator>>,
}

impl CostEngine {
    pub fn new(rates: TariffRates) -> Self {
        Self {
            ledger: Arc::new(Mutex::new(CostAccumulator::new(rates))),
        }
    }

    pub fn reader(&self) -> CostReader {
        CostReader {
            ledger: Arc::clone(&self.ledger),
        }
    }

    pub fn snapshot(&self) -> CostAccumulator {
        lock(&self.ledger).clone()
    }

    /// Integrates one reading over `elapsed` under a single tariff.
    pub fn integrate(&mut self, reading: &PowerReading, elapsed: Duration, tariff: TariffState) {
        let mut ledger = lock(&self.ledger);
        ledger.add(MeterId::Channel(reading.channel), reading.real_power, elapsed, tariff);
    }

    /// Integrates a closed window, split at every tariff transition inside it.
    /// All meters are updated under one lock.
    pub fn integrate_window(
        &mut self,
        window: &PowerWindow,
        composition: Option<&LoadComposition>,
        timeline: &TariffTimeline,
    ) {
        let segments = timeline.segments(window.span.end);
        let mut ledger = lock(&self.ledger);

        for reading in &window.readings {
            for segment in &segments {
                ledger.add(MeterId::Channel(reading.channel), reading.real_power, segment.duration, segment.state);
            }
        }
        if let Some(composition) = composition {
            for segment in &segments {
                ledger.add(MeterId::DeltaLoad, composition.delta_load, segment.duration, segment.state);
            }
        }
        if window.span.end > ledger.integrated_until {
            ledger.integrated_until = window.span.end;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::power_insight::load::compose_powers;
    use approx::assert_relative_eq;
    use std::thread;

    fn reading(channel: usize, real_power: f64, start_s: u64, end_s: u64) -> PowerReading {
        PowerReading {
            channel,
            span: WindowSpan::new(Duration::from_secs(start_s), Duration::from_secs(end_s)),
            rms_voltage: 240.0,
            rms_current: real_power.abs() / 240.0,
            real_power,
            apparent_power: real_power.abs(),
            power_factor: 1.0,
            samples: 100,
            quality: ReadingQuality::Confident,
        }
    }

    #[test]
    fn test_one_kilowatt_for_an_hour() {
        let mut engine = CostEngine::new(TariffRates { day: 0.30, night: 0.10 });
        engine.integrate(&reading(0, 1000.0, 0, 3600), Duration::from_secs(3600), TariffState::Day);
        let snapshot = engine.snapshot();
        assert_relative_eq!(snapshot.energy_day(MeterId::Channel(0)), 1.0);
        assert_relative_eq!(snapshot.cost_day(MeterId::Channel(0)), 0.30);
        assert_eq!(snapshot.energy_night(MeterId::Channel(0)), 0.0);
    }

    #[test]
    fn test_exported_energy_is_separate() {
        let mut engine = CostEngine::new(TariffRates::default());
        engine.integrate(&reading(1, -500.0, 0, 7200), Duration::from_secs(7200), TariffState::Night);
        let buckets = engine.snapshot().buckets(MeterId::Channel(1));
        assert_eq!(buckets.night.imported_kwh, 0.0);
        assert_relative_eq!(buckets.night.exported_kwh, 1.0);
        assert_relative_eq!(buckets.night.balance(), -1.0);
    }

    #[test]
    fn test_window_straddling_transition_is_split() {
        let mut engine = CostEngine::new(TariffRates { day: 0.2, night: 0.1 });
        let window = PowerWindow {
            span: WindowSpan::new(Duration::ZERO, Duration::from_secs(10)),
            readings: vec![reading(0, 3600.0, 0, 10)],
        };
        let mut timeline = TariffTimeline::new(Duration::ZERO, TariffState::Day);
        timeline.record(TariffChanged {
            from: TariffState::Day,
            to: TariffState::Night,
            at: Duration::from_secs(4),
        });

        engine.integrate_window(&window, None, &timeline);

        let snapshot = engine.snapshot();
        let day = snapshot.energy_day(MeterId::Channel(0));
        let night = snapshot.energy_night(MeterId::Channel(0));
        assert_relative_eq!(day, 0.004);
        assert_relative_eq!(night, 0.006);
        assert_relative_eq!(day + night, energy_kwh(3600.0, Duration::from_secs(10)));
        assert_relative_eq!(snapshot.cost(MeterId::Channel(0)), 0.004 * 0.2 + 0.006 * 0.1);
        assert_eq!(snapshot.integrated_until, Duration::from_secs(10));
    }

    #[test]
    fn test_delta_load_is_metered() {
        let mut engine = CostEngine::new(TariffRates::default());
        let window = PowerWindow {
            span: WindowSpan::new(Duration::ZERO, Duration::from_secs(3600)),
            readings: vec![reading(0, 400.0, 0, 3600), reading(1, 600.0, 0, 3600)],
        };
        let composition = compose_powers(400.0, &[600.0]);
        let timeline = TariffTimeline::new(Duration::ZERO, TariffState::Day);
        engine.integrate_window(&window, Some(&composition), &timeline);

        let delta = engine.snapshot().buckets(MeterId::DeltaLoad);
        assert_eq!(delta.day.imported_kwh, 0.0);
        assert_relative_eq!(delta.day.exported_kwh, 0.2);
    }

    #[test]
    fn test_snapshot_is_idempotent() {
        let mut engine = CostEngine::new(TariffRates::default());
        engine.integrate(&reading(0, 123.4, 0, 1), Duration::from_secs(1), TariffState::Day);
        let reader = engine.reader();
        assert_eq!(engine.snapshot(), engine.snapshot());
        assert_eq!(reader.snapshot(), engine.snapshot());
    }

    #[test]
    fn test_energy_never_decreases() {
        let mut engine = CostEngine::new(TariffRates::default());
        let mut previous = engine.snapshot().buckets(MeterId::Channel(0));
        for (i, power) in [100.0, -50.0, 0.0, 2500.0, -10.0].iter().enumerate() {
            let state = if i % 2 == 0 { TariffState::Day } else { TariffState::Night };
            engine.integrate(&reading(0, *power, 0, 60), Duration::from_secs(60), state);
            let now = engine.snapshot().buckets(MeterId::Channel(0));
            assert!(now.day.imported_kwh >= previous.day.imported_kwh);
            assert!(now.day.exported_kwh >= previous.day.exported_kwh);
            assert!(now.night.imported_kwh >= previous.night.imported_kwh);
            assert!(now.night.exported_kwh >= previous.night.exported_kwh);
            previous = now;
        }
    }

    #[test]
    fn test_concurrent_snapshots_see_whole_windows() {
        let mut engine = CostEngine::new(TariffRates::default());
        let reader = engine.reader();
        let timeline = TariffTimeline::new(Duration::ZERO, TariffState::Day);

        let watcher = thread::spawn(move || {
            for _ in 0..2000 {
                let snapshot = reader.snapshot();
                let a = snapshot.energy_day(MeterId::Channel(0));
                let b = snapshot.energy_day(MeterId::Channel(1));
                assert_relative_eq!(a, b, epsilon = 1e-12);
            }
        });

        let window = PowerWindow {
            span: WindowSpan::new(Duration::ZERO, Duration::from_secs(1)),
            readings: vec![reading(0, 1000.0, 0, 1), reading(1, 1000.0, 0, 1)],
        };
        for _ in 0..2000 {
            engine.integrate_window(&window, None, &timeline);
        }
        watcher.join().unwrap();
    }
}
