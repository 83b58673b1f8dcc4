//! Day/night tariff sensing.
//!
//! The tariff meter drives a digital line; a level change only counts once it has been
//! held for the configured time. Accepted transitions are timestamped at the first edge,
//! so energy between the edge and its confirmation is still billed at the new rate.

use std::time::Duration;

use super::config::TariffConfig;
use super::error::SensorError;
use super::types::{TariffChanged, TariffState};

/// Digital level input used for tariff sensing.
pub trait DigitalInput: Send {
    fn read_level(&mut self) -> Result<bool, SensorError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PendingEdge {
    state: TariffState,
    since: Duration,
}

#[derive(Debug, Clone)]
pub struct TariffTracker {
    state: TariffState,
    last_transition: Duration,
    config: TariffConfig,
    pending: Option<PendingEdge>,
    last_observed: Duration,
}

impl TariffTracker {
    /// Takes the initial state from the first read; no event is produced for it.
    pub fn new(initial_level: bool, at: Duration, config: &TariffConfig) -> Self {
        let state = config.state_for(initial_level);
        log::info!("initial tariff: {}", state);
        Self {
            state,
            last_transition: at,
            config: config.clone(),
            pending: None,
            last_observed: at,
        }
    }

    pub fn state(&self) -> TariffState {
        self.state
    }

    pub fn last_transition(&self) -> Duration {
        self.last_transition
    }

    pub fn observe(&mut self, level: bool, at: Duration) -> Option<TariffChanged> {
        if at < self.last_observed {
            log::warn!("tariff level at {:?} is older than {:?}, ignored", at, self.last_observed);
            return None;
        }
        self.last_observed = at;

        let observed = self.config.state_for(level);
        if observed == self.state {
            if let Some(pending) = self.pending.take() {
                log::debug!(
                    "tariff glitch to {} rejected after {:?}",
                    pending.state,
                    at.saturating_sub(pending.since)
                );
            }
            return None;
        }

        let since = match self.pending {
            Some(pending) => pending.since,
            None => {
                self.pending = Some(PendingEdge { state: observed, since: at });
                at
            }
        };

        if at.saturating_sub(since) < self.config.hold_time {
            return None;
        }

        let event = TariffChanged {
            from: self.state,
            to: observed,
            at: since,
        };
        self.state = observed;
        self.last_transition = since;
        self.pending = None;
        log::info!("tariff changed {} -> {} at {:?}", event.from, event.to, event.at);
        Some(event)
    }

    /// Latest time up to which no earlier transition can still be reported.
    pub fn settled_until(&self, now: Duration) -> Duration {
        match self.pending {
            Some(pending) => pending.since.saturating_sub(Duration::from_nanos(1)),
            None => now,
        }
    }
}

/// Stretch of a window spent under one tariff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TariffSegment {
    pub state: TariffState,
    pub duration: Duration,
}

/// Transitions seen inside the open accumulation window.
#[derive(Debug, Clone)]
pub struct TariffTimeline {
    start: Duration,
    initial: TariffState,
    changes: Vec<TariffChanged>,
}

impl TariffTimeline {
    pub fn new(start: Duration, state: TariffState) -> Self {
        Self {
            start,
            initial: state,
            changes: Vec::new(),
        }
    }

    pub fn current(&self) -> TariffState {
        self.changes.last().map_or(self.initial, |c| c.to)
    }

    /// Records a transition. Anything older than the window or the previous change is moved forward.
    pub fn record(&mut self, mut event: TariffChanged) {
        let floor = self.changes.last().map_or(self.start, |c| c.at);
        if event.at < floor {
            log::warn!(
                "tariff change at {:?} precedes {:?}, applied from {:?}",
                event.at,
                floor,
                floor
            );
            event.at = floor;
        }
        self.changes.push(event);
    }

    pub fn segments(&self, end: Duration) -> Vec<TariffSegment> {
        let mut segments = Vec::with_capacity(self.changes.len() + 1);
        let mut cursor = self.start;
        let mut state = self.initial;

        for change in &self.changes {
            let at = change.at.min(end);
            if at > cursor {
                segments.push(TariffSegment {
                    state,
                    duration: at - cursor,
                });
                cursor = at;
            }
            state = change.to;
        }
        if end > cursor {
            segments.push(TariffSegment {
                state,
                duration: end - cursor,
            });
        }
        segments
    }

    /// Starts the next window where the last one ended.
    pub fn restart(&mut self, start: Duration) {
        self.initial = self.current();
        self.start = start;
        self.changes.clear();
    }

    /// Moves the start of an empty timeline, used before the first window opens.
    pub fn rebase(&mut self, start: Duration) {
        if self.changes.is_empty() {
            self.start = start;
        }
    }
}
