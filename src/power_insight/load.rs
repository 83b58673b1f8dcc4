use super::error::ConfigurationError;
use super::types::*;

/// Derives the unmonitored remainder from the whole-load and breaker readings.
#[derive(Debug, Clone)]
pub struct LoadComposer {
    whole_load: usize,
    breakers: Vec<usize>,
}

impl LoadComposer {
    pub fn new(channels: &[Channel]) -> Result<Self, ConfigurationError> {
        let mut whole = channels
            .iter()
            .enumerate()
            .filter(|(_, c)| c.role == ChannelRole::WholeLoad)
            .map(|(position, _)| position);

        let whole_load = whole
            .next()
            .ok_or(ConfigurationError::MissingRole(ChannelRole::WholeLoad))?;
        if whole.next().is_some() {
            return Err(ConfigurationError::DuplicateRole(ChannelRole::WholeLoad));
        }

        let breakers = channels
            .iter()
            .enumerate()
            .filter(|(_, c)| c.role == ChannelRole::MonitoredBreaker)
            .map(|(position, _)| position)
            .collect();

        Ok(Self { whole_load, breakers })
    }

    /// Breakers missing from `readings` are left out of the sum. Negative deltas are flagged, never clamped.
    pub fn compose(&self, readings: &[PowerReading]) -> Result<LoadComposition, ConfigurationError> {
        let whole = readings
            .iter()
            .find(|r| r.channel == self.whole_load)
            .ok_or(ConfigurationError::MissingReading(ChannelRole::WholeLoad))?;

        let breakers: Vec<&PowerReading> = readings
            .iter()
            .filter(|r| self.breakers.contains(&r.channel))
            .collect();

        let powers: Vec<f64> = breakers.iter().map(|r| r.real_power).collect();
        let mut composition = compose_powers(whole.real_power, &powers);
        composition.span = whole.span;
        composition.low_confidence = whole.is_low_confidence() || breakers.iter().any(|r| r.is_low_confidence());

        if composition.negative_delta {
            log::warn!(
                "monitored breakers ({:.1} W) exceed the whole load ({:.1} W), delta {:.1} W",
                composition.monitored_power,
                composition.whole_load_power,
                composition.delta_load
            );
        }

        Ok(composition)
    }
}

pub fn compose_powers(whole_load_power: f64, breaker_powers: &[f64]) -> LoadComposition {
    let monitored_power: f64 = breaker_powers.iter().sum();
    let delta_load = whole_load_power - monitored_power;

    LoadComposition {
        span: WindowSpan::default(),
        whole_load_power,
        monitored_power,
        delta_load,
        negative_delta: delta_load < 0.0,
        low_confidence: false,
    }
}
