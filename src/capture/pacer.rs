//! Frame pacing for display and encoder consumers

use std::time::{Duration, Instant};

use tracing::debug;

use crate::capture::device::DeviceFormat;

/// Sleeps out the remainder of each frame interval after delivery
#[derive(Debug, Clone)]
pub struct FramePacer {
    interval: Option<Duration>,
    cycle_start: Option<Instant>,
}

impl FramePacer {
    /// Pace at a fixed interval, or not at all for `None`
    pub fn new(interval: Option<Duration>) -> Self {
        Self {
            interval,
            cycle_start: None,
        }
    }

    /// Interval from an explicit rate override, falling back to the device's
    /// negotiated frame interval
    pub fn for_device(format: &DeviceFormat, fps_override: Option<u32>) -> Self {
        let interval = match fps_override {
            Some(0) => None,
            Some(fps) => Some(Duration::from_secs(1) / fps),
            None => format.interval(),
        };
        debug!("Frame pacing interval: {:?}", interval);
        Self::new(interval)
    }

    pub fn interval(&self) -> Option<Duration> {
        self.interval
    }

    /// Mark the start of a capture cycle
    pub fn begin(&mut self) {
        self.cycle_start = Some(Instant::now());
    }

    /// Time left in the current interval
    pub fn remaining(&self) -> Duration {
        match (self.interval, self.cycle_start) {
            (Some(interval), Some(start)) => interval.saturating_sub(start.elapsed()),
            _ => Duration::ZERO,
        }
    }

    /// Sleep until the current interval is used up
    pub fn wait(&mut self) {
        let remaining = self.remaining();
        if !remaining.is_zero() {
            std::thread::sleep(remaining);
        }
        self.cycle_start = None;
    }
}
