use std::time::Duration;

use super::config::{WindowConfig, WindowMode};

/// Where the open window stands when a boundary decision is made.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowProgress {
    pub slots: u64,       // Sequence slots covered, including lost frames
    pub samples: usize,   // Frames actually accumulated
    pub start: Duration,  // Window start
    pub latest: Duration, // Timestamp of the most recent slot
}

/// Decides when an accumulation window closes. The accumulation math never looks at the policy.
pub trait WindowPolicy: Send {
    fn should_close(&self, progress: &WindowProgress) -> bool;
    fn describe(&self) -> String;
}

#[derive(Debug, Clone, Copy)]
pub struct SampleCountWindow {
    slots: u64,
}

impl SampleCountWindow {
    pub fn new(samples: usize) -> Self {
        Self {
            slots: samples.max(1) as u64,
        }
    }
}

impl WindowPolicy for SampleCountWindow {
    fn should_close(&self, progress: &WindowProgress) -> bool {
        progress.slots >= self.slots
    }

    fn describe(&self) -> String {
        format!("{} samples", self.slots)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WallTimeWindow {
    length: Duration,
}

impl WallTimeWindow {
    pub fn new(length: Duration) -> Self {
        Self { length }
    }
}

impl WindowPolicy for WallTimeWindow {
    fn should_close(&self, progress: &WindowProgress) -> bool {
        progress.latest.saturating_sub(progress.start) >= self.length
    }

    fn describe(&self) -> String {
        format!("{:?}", self.length)
    }
}

pub fn policy_for(config: &WindowConfig) -> Box<dyn WindowPolicy> {
    match config.mode {
        WindowMode::SampleCount(samples) => Box::new(SampleCountWindow::new(samples)),
        WindowMode::WallTime(length) => Box::new(WallTimeWindow::new(length)),
    }
}
