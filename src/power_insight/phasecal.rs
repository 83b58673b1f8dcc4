//! Offline calibration helpers: phase shift from a resistive load, scale from a reference meter.

use ndarray::{s, Array1, ArrayView1};

use super::error::ConfigurationError;

/// Search limits for `find_phase_shift`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhaseSearchOptions {
    pub coarse_step: f64, // Scan step over -1..=1 samples
    pub tolerance: f64,   // Refinement stops below this step
}

impl Default for PhaseSearchOptions {
    fn default() -> Self {
        Self {
            coarse_step: 0.05,
            tolerance: 1e-4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhaseSearch {
    pub shift: f64,
    pub power_factor: f64,
}

impl PhaseSearch {
    /// The multiplicative constant older installations are configured with.
    pub fn phasecal(&self) -> f64 {
        self.shift + 1.0
    }

    pub fn degrees(&self, samples_per_cycle: f64) -> f64 {
        self.shift / samples_per_cycle * 360.0
    }
}

fn ac_coupled(wave: &Array1<f64>) -> Array1<f64> {
    let mean = wave.mean().unwrap_or(0.0);
    wave.mapv(|x| x - mean)
}

/*
* @brief Power factor of a current against a shifted voltage.
* @param voltage AC coupled voltage samples
* @param current AC coupled current samples
* @param shift Voltage shift in samples
* @return Power factor, 0 when either wave is flat
*/
fn power_factor_at(voltage: ArrayView1<f64>, current: ArrayView1<f64>, shift: f64) -> f64 {
    let previous = voltage.slice(s![..-1]);
    let present = voltage.slice(s![1..]);
    let current = current.slice(s![1..]);

    let shifted = &present + &((&present - &previous) * shift);
    let denominator = (shifted.dot(&shifted) * current.dot(&current)).sqrt();
    if denominator == 0.0 {
        0.0
    } else {
        shifted.dot(&current) / denominator
    }
}

/// Finds the voltage shift that maximises the power factor of a purely resistive load.
pub fn find_phase_shift(
    voltage: &Array1<f64>,
    current: &Array1<f64>,
    options: &PhaseSearchOptions,
) -> Result<PhaseSearch, ConfigurationError> {
    if voltage.len() != current.len() || voltage.len() < 3 {
        return Err(ConfigurationError::InvalidParameter {
            name: "capture",
            reason: format!("need two equal blocks of 3+ samples, got {} and {}", voltage.len(), current.len()),
        });
    }
    if !(options.coarse_step > 0.0 && options.tolerance > 0.0) {
        return Err(ConfigurationError::InvalidParameter {
            name: "phase search step",
            reason: "steps must be positive".to_string(),
        });
    }

    let voltage = ac_coupled(voltage);
    let current = ac_coupled(current);
    let pf = |shift: f64| power_factor_at(voltage.view(), current.view(), shift);

    let mut best = PhaseSearch {
        shift: 0.0,
        power_factor: pf(0.0),
    };
    let steps = (2.0 / options.coarse_step).round() as usize;
    for n in 0..=steps {
        let shift = (-1.0 + n as f64 * options.coarse_step).min(1.0);
        let power_factor = pf(shift);
        if power_factor > best.power_factor {
            best = PhaseSearch { shift, power_factor };
        }
    }

    let mut step = options.coarse_step / 2.0;
    while step >= options.tolerance {
        for shift in [best.shift - step, best.shift + step] {
            if shift.abs() > 1.0 {
                continue;
            }
            let power_factor = pf(shift);
            if power_factor > best.power_factor {
                best = PhaseSearch { shift, power_factor };
            }
        }
        step /= 2.0;
    }

    log::debug!("phase search: shift {:.4} samples, pf {:.5}", best.shift, best.power_factor);
    Ok(best)
}

/*
* @brief Scale that maps a captured wave onto a known RMS value.
* @param raw Raw ADC counts
* @param dc_offset Counts removed before scaling
* @param target_rms RMS value measured by a reference meter
* @return Engineering units per count
*/
pub fn scale_for_reference(raw: &Array1<f64>, dc_offset: f64, target_rms: f64) -> Result<f64, ConfigurationError> {
    let rms = raw.mapv(|x| (x - dc_offset).powi(2)).mean().unwrap_or(0.0).sqrt();
    if rms == 0.0 || !target_rms.is_finite() || target_rms <= 0.0 {
        return Err(ConfigurationError::InvalidParameter {
            name: "reference",
            reason: format!("cannot map an RMS of {:.3} counts onto {}", rms, target_rms),
        });
    }
    Ok(target_rms / rms)
}
