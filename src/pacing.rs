//! Wall-clock pacing
//!
//! In virtual mode the calendar jumps straight to the next entry. In
//! realtime mode each step first sleeps until the wall-clock instant that
//! corresponds to the entry's logical time, scaled by `scale`
//! (1 = realtime, 2 = twice as fast).

use spin_sleep::SpinSleeper;
use std::time::{Duration, Instant};

/// Default scale used when pacing is requested without one.
pub const DEFAULT_REALTIME_SCALE: f64 = 1.0;

/// Pacing mode.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum PacingMode {
    Virtual,
    Realtime { scale: f64 },
}

/// Maps logical time onto wall-clock time.
pub struct Pacing {
    mode: PacingMode,

    /// Time dilation anchors (realtime only).
    wall_anchor: Instant,
    logical_anchor: f64,

    sleeper: SpinSleeper,
}

impl Default for Pacing {
    fn default() -> Self {
        Self::new()
    }
}

impl Pacing {
    pub fn new() -> Self {
        Self {
            mode: PacingMode::Virtual,
            wall_anchor: Instant::now(),
            logical_anchor: 0.0,
            sleeper: SpinSleeper::default(),
        }
    }

    pub fn mode(&self) -> PacingMode {
        self.mode
    }

    /// Switch to realtime pacing anchored at logical time `now`.
    ///
    /// Asking again for the scale already in effect keeps the anchors, so a
    /// process requesting pacing on every resumption does not drift.
    pub fn set_realtime(&mut self, scale: f64, now: f64) {
        let scale = if scale.is_finite() && scale > 0.0 {
            scale
        } else {
            DEFAULT_REALTIME_SCALE
        };
        if self.mode == (PacingMode::Realtime { scale }) {
            return;
        }
        self.mode = PacingMode::Realtime { scale };
        self.wall_anchor = Instant::now();
        self.logical_anchor = now;
    }

    pub fn set_virtual(&mut self) {
        self.mode = PacingMode::Virtual;
    }

    /// How long to sleep before logical time `target` may be dispatched.
    pub fn wall_delay(&self, target: f64) -> Duration {
        let PacingMode::Realtime { scale } = self.mode else {
            return Duration::ZERO;
        };
        let due = ((target - self.logical_anchor) / scale).max(0.0);
        let elapsed = self.wall_anchor.elapsed().as_secs_f64();
        let remaining = due - elapsed;
        if remaining.is_finite() && remaining > 0.0 {
            Duration::from_secs_f64(remaining)
        } else {
            Duration::ZERO
        }
    }

    /// Block until logical time `target` is due.
    pub fn wait_until(&self, target: f64) {
        let delay = self.wall_delay(target);
        if !delay.is_zero() {
            self.sleeper.sleep(delay);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_virtual_never_waits() {
        let pacing = Pacing::new();
        assert_eq!(pacing.mode(), PacingMode::Virtual);
        assert_eq!(pacing.wall_delay(1_000.0), Duration::ZERO);
    }

    #[test]
    fn test_realtime_scales_delay() {
        let mut pacing = Pacing::new();
        pacing.set_realtime(100.0, 0.0);
        let d = pacing.wall_delay(1.0);
        // 1 logical second at 100x is at most 10ms of wall time
        assert!(d <= Duration::from_millis(10));
        assert!(d > Duration::from_millis(5));
    }

    #[test]
    fn test_invalid_scale_falls_back() {
        let mut pacing = Pacing::new();
        pacing.set_realtime(-3.0, 0.0);
        assert_eq!(
            pacing.mode(),
            PacingMode::Realtime {
                scale: DEFAULT_REALTIME_SCALE
            }
        );
        pacing.set_virtual();
        assert_eq!(pacing.mode(), PacingMode::Virtual);
    }

    #[test]
    fn test_same_scale_keeps_anchor() {
        let mut pacing = Pacing::new();
        pacing.set_realtime(1000.0, 0.0);
        let anchor = pacing.wall_anchor;
        pacing.set_realtime(1000.0, 5.0);
        assert_eq!(pacing.wall_anchor, anchor);
        assert_eq!(pacing.logical_anchor, 0.0);
    }

    #[test]
    fn test_past_targets_do_not_wait() {
        let mut pacing = Pacing::new();
        pacing.set_realtime(1.0, 10.0);
        assert_eq!(pacing.wall_delay(5.0), Duration::ZERO);
    }
}
