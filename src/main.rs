use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use signal_hook::consts::signal::*;

use power_insight::{
    DigitalInput, LogSink, Pipeline, PipelineIo, PowerInsightConfig, PowerInsightError, SampleClock, SimulatedAdc,
    SimulatedClock, SimulatedTariffInput, SpinClock, TariffRates, WindowConfig, BOARD_VOLTAGE, DEFAULT_SAMPLE_RATE_HZ,
    DEFAULT_WINDOW_SAMPLES, FREQ_NOMINAL_50,
};

/// Power Insight CLI
#[derive(Parser, Debug)]
#[command(author, version, about = "CT power monitor with day/night cost accounting", long_about = None)]
struct Args {
    /// Frames to acquire before stopping, 0 runs until interrupted
    #[arg(long, default_value_t = 20_000)]
    frames: u64,

    /// Sampling rate per channel in Hz
    #[arg(long, default_value_t = DEFAULT_SAMPLE_RATE_HZ)]
    sample_rate: f64,

    /// Mains frequency of the simulated signals
    #[arg(long, default_value_t = FREQ_NOMINAL_50)]
    frequency: f64,

    /// Window length in samples
    #[arg(long, default_value_t = DEFAULT_WINDOW_SAMPLES)]
    window_samples: usize,

    /// Window length in milliseconds, overrides --window-samples
    #[arg(long)]
    window_ms: Option<u64>,

    /// Time a tariff level must hold before it counts
    #[arg(long, default_value_t = 500)]
    hold_ms: u64,

    #[arg(long, default_value_t = 0.2126)]
    day_rate: f64,

    #[arg(long, default_value_t = 0.1187)]
    night_rate: f64,

    /// Simulated switch to the night tariff, in milliseconds from start
    #[arg(long)]
    night_at: Option<u64>,

    /// Sample on the wall clock instead of virtual time
    #[arg(short = 'r', long)]
    realtime: bool,

    /// Windows averaged per report
    #[arg(long, default_value_t = 2)]
    report_every: usize,

    /// Noise added to every simulated conversion, in counts
    #[arg(long, default_value_t = 0.0)]
    noise: f64,

    /// Board rail the channel scales were calibrated at
    #[arg(long, default_value_t = BOARD_VOLTAGE)]
    board_voltage: f64,
}

fn build_config(args: &Args) -> PowerInsightConfig {
    let mut config = PowerInsightConfig::single_phase_house();
    config.sampler.sample_rate_hz = args.sample_rate;
    config.sampler.max_frames = (args.frames > 0).then_some(args.frames);
    config.sampler.board_voltage = args.board_voltage;
    config.window = match args.window_ms {
        Some(ms) => WindowConfig::wall_time(Duration::from_millis(ms), args.sample_rate, config.sampler.drift_tolerance),
        None => WindowConfig::sample_count(args.window_samples),
    }
    .ac_coupled(true);
    config.tariff.hold_time = Duration::from_millis(args.hold_ms);
    config.tariff.rates = TariffRates {
        day: args.day_rate,
        night: args.night_rate,
    };
    config.report_every = args.report_every;
    config
}

fn tariff_input<C: SampleClock>(clock: C, night_at: Option<u64>) -> impl DigitalInput {
    let input = SimulatedTariffInput::new(clock, false);
    match night_at {
        Some(ms) => input.switch_at(Duration::from_millis(ms), true),
        None => input,
    }
}

fn main() -> Result<(), PowerInsightError> {
    env_logger::init();
    let args = Args::parse();

    let config = build_config(&args);
    for channel in &config.channels {
        log::debug!("ADC input {}: {} ({})", channel.adc_input, channel.name, channel.role);
    }
    let sink = LogSink::new(&config.channels, config.report_every);
    let pipeline = Pipeline::new(config)?;

    let shutdown = pipeline.shutdown_handle();
    for signal in [SIGINT, SIGTERM] {
        signal_hook::flag::register(signal, Arc::clone(&shutdown))
            .map_err(|err| PowerInsightError::Pipeline(format!("cannot register signal {}: {}", signal, err)))?;
    }

    let adc = SimulatedAdc::house(args.sample_rate, args.frequency).with_noise(args.noise);
    let report = if args.realtime {
        log::info!("Sampling on the wall clock.");
        let origin = Instant::now();
        let io = PipelineIo {
            adc,
            sample_clock: SpinClock::starting_at(origin),
            tariff_input: tariff_input(SpinClock::starting_at(origin), args.night_at),
            tariff_clock: SpinClock::starting_at(origin),
        };
        pipeline.run(io, sink)?
    } else {
        log::info!("Sampling in virtual time.");
        let tariff_clock = SimulatedClock::new();
        let io = PipelineIo {
            adc,
            sample_clock: SimulatedClock::new(),
            tariff_input: tariff_input(tariff_clock.clone(), args.night_at),
            tariff_clock,
        };
        pipeline.run(io, sink)?
    };

    log::info!("Summary:");
    log::info!("  Frames: {} ({} lost)", report.stats.frames, report.stats.acquisition_errors);
    log::info!("  Windows: {}", report.windows);
    log::info!("  Tariff changes: {}", report.tariff_changes);
    log::info!("  Drift warnings: {}", report.stats.drift_events);
    log::info!("  Backpressure: {}", report.stats.backpressure_events);
    log::info!("  Max lateness: {:?}", report.stats.max_lateness);
    Ok(())
}
