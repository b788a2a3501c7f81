//! Debounces the per-frame EAR signal into discrete drowsiness events.
//!
//! Two states per closure episode: watching open eyes (no timer) and timing a
//! closure (timer set). `DrowsyDetected` is an output edge, not a state: it
//! fires once, on the frame where the closure first reaches the threshold
//! duration, and the timer is cleared at the same moment.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Default EAR below which the eyes count as closed.
pub const DEFAULT_EAR_THRESHOLD: f32 = 0.25;
/// Default continuous closure time before an event fires.
pub const DEFAULT_CLOSURE_DURATION: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DrowsinessConfig {
    pub ear_threshold: f32,
    pub closure_duration: Duration,
}

impl Default for DrowsinessConfig {
    fn default() -> Self {
        Self {
            ear_threshold: DEFAULT_EAR_THRESHOLD,
            closure_duration: DEFAULT_CLOSURE_DURATION,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebounceEvent {
    NoEvent,
    DrowsyDetected,
}

pub struct Debouncer {
    config: DrowsinessConfig,
    /// Start of the current closure episode. Set iff the eyes have been
    /// continuously below threshold since this instant.
    closed_since: Option<Instant>,
}

impl Debouncer {
    pub fn new(config: DrowsinessConfig) -> Self {
        Self {
            config,
            closed_since: None,
        }
    }

    /// Feed one EAR sample taken at `now`.
    ///
    /// A non-finite sample is dropped like a frame without a face: the timer
    /// is neither started nor cleared.
    pub fn evaluate(&mut self, ear: f32, now: Instant) -> DebounceEvent {
        if !ear.is_finite() {
            tracing::debug!(ear, "ignoring non-finite EAR sample");
            return DebounceEvent::NoEvent;
        }

        if ear >= self.config.ear_threshold {
            if self.closed_since.take().is_some() {
                tracing::trace!(ear, "eyes reopened, closure timer cleared");
            }
            return DebounceEvent::NoEvent;
        }

        let Some(start) = self.closed_since else {
            tracing::trace!(ear, "closure episode started");
            self.closed_since = Some(now);
            return DebounceEvent::NoEvent;
        };

        let elapsed = now.saturating_duration_since(start);
        if elapsed >= self.config.closure_duration {
            self.closed_since = None;
            tracing::debug!(ear, elapsed_ms = elapsed.as_millis() as u64, "drowsiness detected");
            DebounceEvent::DrowsyDetected
        } else {
            DebounceEvent::NoEvent
        }
    }

    /// Whether a closure episode is currently being timed.
    pub fn is_timing(&self) -> bool {
        self.closed_since.is_some()
    }

    /// Elapsed time of the current closure episode, if any.
    pub fn closure_elapsed(&self, now: Instant) -> Option<Duration> {
        self.closed_since
            .map(|start| now.saturating_duration_since(start))
    }
}

impl Default for Debouncer {
    fn default() -> Self {
        Self::new(DrowsinessConfig::default())
    }
}
