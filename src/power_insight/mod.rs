pub mod calibration;
pub mod config;
pub mod energy;
pub mod error;
pub mod generate_signal;
pub mod load;
pub mod phasecal;
pub mod pipeline;
pub mod power;
pub mod print;
pub mod processing;
pub mod sampler;
pub mod sink;
pub mod tariff;
pub mod types;
pub mod window;

pub use calibration::{Calibrator, RailCompensation};
pub use config::{PowerInsightConfig, SamplerConfig, TariffConfig, TariffRates, WindowConfig, WindowMode};
pub use energy::{CostAccumulator, CostEngine, CostReader, EnergyBuckets, MeterId, TariffEnergy};
pub use error::{AcquisitionError, ConfigurationError, PowerInsightError, Result, SensorError};
pub use generate_signal::{SimulatedAdc, SimulatedClock, SimulatedTariffInput};
pub use load::LoadComposer;
pub use pipeline::{Pipeline, PipelineIo, PipelineReport};
pub use power::PowerAccumulator;
pub use print::LogSink;
pub use processing::{Processor, ProcessorEvent};
pub use sampler::{AdcSource, SampleClock, Sampler, SamplerStats, SpinClock};
pub use sink::{MemorySink, OutputSink};
pub use tariff::{DigitalInput, TariffTimeline, TariffTracker};
pub use types::*;
