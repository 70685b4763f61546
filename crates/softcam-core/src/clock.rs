//! Monotonic elapsed-time source.
//!
//! Readings are seconds relative to a movable origin. `rewind` pushes the
//! origin into the future, so the next readings are negative until real
//! time catches up. The sender uses this to keep a frame schedule: after
//! each frame it rewinds by one interval and sleeps while the reading is
//! still negative.

use std::time::{Duration, Instant};

/// Monotonic clock measuring seconds since construction or the last reset.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    origin: Instant,
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock {
    /// Start a clock at zero.
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    /// Seconds elapsed since the origin. Negative after a `rewind` until
    /// the rewound amount has passed.
    pub fn now(&self) -> f32 {
        let now = Instant::now();
        match now.checked_duration_since(self.origin) {
            Some(elapsed) => elapsed.as_secs_f32(),
            None => -self.origin.duration_since(now).as_secs_f32(),
        }
    }

    /// Move the origin to the current instant.
    pub fn reset(&mut self) {
        self.origin = Instant::now();
    }

    /// Move the origin `seconds` later, lowering subsequent readings by
    /// that amount. Non-positive or non-finite values are ignored.
    pub fn rewind(&mut self, seconds: f32) {
        if let Some(origin) =
            seconds_to_duration(seconds).and_then(|delta| self.origin.checked_add(delta))
        {
            self.origin = origin;
        }
    }

    /// Block the calling thread for `seconds`. Non-positive values return
    /// immediately.
    pub fn sleep(seconds: f32) {
        if let Some(delta) = seconds_to_duration(seconds) {
            std::thread::sleep(delta);
        }
    }
}

fn seconds_to_duration(seconds: f32) -> Option<Duration> {
    if seconds > 0.0 {
        Duration::try_from_secs_f32(seconds).ok()
    } else {
        None
    }
}
