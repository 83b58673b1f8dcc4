use clap::Parser;

use power_insight::phasecal::{find_phase_shift, scale_for_reference, PhaseSearchOptions};
use power_insight::{
    ChannelRole, PowerInsightConfig, PowerInsightError, SimulatedAdc, ADC_MID_SCALE, DEFAULT_SAMPLE_RATE_HZ,
    FREQ_NOMINAL_50,
};

/// Phase and scale calibration for one CT channel
#[derive(Parser, Debug)]
#[command(author, version, about = "Find phase shift and scale constants for a CT channel", long_about = None)]
struct Args {
    /// Channel name from the house channel map (ct1..ct6)
    #[arg(short, long, default_value = "ct1")]
    channel: String,

    /// Samples captured per channel
    #[arg(long, default_value_t = 4000)]
    samples: usize,

    #[arg(long, default_value_t = DEFAULT_SAMPLE_RATE_HZ)]
    sample_rate: f64,

    #[arg(long, default_value_t = FREQ_NOMINAL_50)]
    frequency: f64,

    /// Grid voltage measured with a reference meter
    #[arg(long, default_value_t = 240.0)]
    target_voltage: f64,

    /// Load current measured with a reference meter, if any
    #[arg(long)]
    target_current: Option<f64>,

    /// Refinement stops below this step, in samples
    #[arg(long, default_value_t = 1e-4)]
    tolerance: f64,

    #[arg(long, default_value_t = 0.0)]
    noise: f64,
}

fn main() -> Result<(), PowerInsightError> {
    env_logger::init();
    let args = Args::parse();

    let config = PowerInsightConfig::single_phase_house();
    let ct = config
        .channels
        .iter()
        .find(|c| c.name == args.channel && c.role.is_current())
        .ok_or_else(|| PowerInsightError::Pipeline(format!("no current channel named {}", args.channel)))?;
    let voltage = config
        .channels
        .iter()
        .find(|c| c.role == ChannelRole::VoltageReference)
        .ok_or_else(|| PowerInsightError::Pipeline("no voltage reference channel".to_string()))?;

    log::info!("Capturing {} samples of {} against {}", args.samples, ct.name, voltage.name);
    let mut adc = SimulatedAdc::house(args.sample_rate, args.frequency).with_noise(args.noise);
    let blocks = adc.capture(&[voltage.adc_input, ct.adc_input], args.samples)?;

    let options = PhaseSearchOptions {
        tolerance: args.tolerance,
        ..Default::default()
    };
    let search = find_phase_shift(&blocks[0], &blocks[1], &options)?;
    let samples_per_cycle = args.sample_rate / args.frequency;

    log::info!("Phase:");
    log::info!("  Shift: {:.4} samples ({:.2}º)", search.shift, search.degrees(samples_per_cycle));
    log::info!("  Phasecal: {:.8}", search.phasecal());
    log::info!("  Power factor: {:.5}", search.power_factor);
    log::info!("  Configured shift: {:.4} samples\n", ct.calibration.phase_shift);

    let voltage_scale = scale_for_reference(&blocks[0], ADC_MID_SCALE, args.target_voltage)?;
    log::info!("Scale:");
    log::info!(
        "  {}: {:.6} V/count for {:.1} V (configured {:.6})",
        voltage.name,
        voltage_scale,
        args.target_voltage,
        voltage.calibration.scale
    );
    if let Some(target) = args.target_current {
        let current_scale = scale_for_reference(&blocks[1], ADC_MID_SCALE, target)?;
        log::info!(
            "  {}: {:.6} A/count for {:.3} A (configured {:.6})",
            ct.name,
            current_scale,
            target,
            ct.calibration.scale
        );
    }

    Ok(())
}
