//! Event-loop lag measurement
//!
//! A timer asks to fire every [`SAMPLE_INTERVAL`]; the drift between when it
//! should have fired and when it actually did is the lag sample. Samples are
//! smoothed so a single slow poll does not spike the reported value.

use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use tokio::time::{interval, Instant, MissedTickBehavior};

const SAMPLE_INTERVAL: Duration = Duration::from_millis(500);

/// Source of the lag figure reported in worker pings, in milliseconds
pub trait LagProbe {
    fn lag(&self) -> f64;
}

/// Timer-drift probe with exponential smoothing
#[derive(Clone)]
pub struct TimerLag {
    current: Rc<Cell<f64>>,
}

impl TimerLag {
    /// Spawn the sampling loop on the current local set
    pub fn start() -> Self {
        let current = Rc::new(Cell::new(0.0));
        let shared = current.clone();
        tokio::task::spawn_local(async move {
            let mut ticker = interval(SAMPLE_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut expected = Instant::now() + SAMPLE_INTERVAL;
            loop {
                ticker.tick().await;
                let now = Instant::now();
                let drift = now.saturating_duration_since(expected).as_secs_f64() * 1000.0;
                // Two thirds history, one third fresh sample
                let smoothed = shared.get() * 2.0 / 3.0 + drift / 3.0;
                shared.set(smoothed);
                expected = now + SAMPLE_INTERVAL;
            }
        });
        Self { current }
    }
}

impl LagProbe for TimerLag {
    fn lag(&self) -> f64 {
        self.current.get()
    }
}

/// Fixed-value probe for tests
#[derive(Clone, Default)]
pub struct FixedLag {
    value: Rc<Cell<f64>>,
}

impl FixedLag {
    pub fn new(value: f64) -> Self {
        Self {
            value: Rc::new(Cell::new(value)),
        }
    }

    pub fn set(&self, value: f64) {
        self.value.set(value);
    }
}

impl LagProbe for FixedLag {
    fn lag(&self) -> f64 {
        self.value.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_probe_reports_its_value() {
        let probe = FixedLag::new(42.0);
        assert_eq!(probe.lag(), 42.0);
        probe.set(7.5);
        assert_eq!(probe.lag(), 7.5);
    }

    #[tokio::test(start_paused = true)]
    async fn timer_probe_starts_at_zero() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let probe = TimerLag::start();
                assert_eq!(probe.lag(), 0.0);
                // With paused time the timer fires exactly on schedule, so
                // the smoothed lag stays at zero
                tokio::time::sleep(Duration::from_secs(2)).await;
                assert_eq!(probe.lag(), 0.0);
            })
            .await;
    }
}
