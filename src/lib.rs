pub mod power_insight;

pub use power_insight::*;
