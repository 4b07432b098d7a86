//! The fixed-rate ticker driving every instance from one scheduling context.
//!
//! The ticker fires at the nominal period and reports the *real* elapsed
//! interval as `dt`; overruns are carried forward by the underlying interval
//! (ticks are delayed, never dropped). Stopping is cooperative through a
//! shared flag the game loop checks every cycle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::{interval, Interval, MissedTickBehavior};

/// Cooperative stop flag shared between the game loop and shutdown handling.
#[derive(Debug, Clone, Default)]
pub struct RunFlag(Arc<AtomicBool>);

impl RunFlag {
    pub fn new() -> RunFlag {
        RunFlag(Arc::new(AtomicBool::new(true)))
    }

    pub fn is_running(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    pub fn stop(&self) {
        self.0.store(false, Ordering::Relaxed);
    }
}

pub struct Ticker {
    interval: Interval,
    last: Instant,
    tick: u64,
}

impl Ticker {
    pub fn new(rate: u32) -> Ticker {
        let period = Duration::from_secs_f64(1.0 / rate.max(1) as f64);
        let mut interval = interval(period);
        // Catch up after an overrun instead of skipping ticks.
        interval.set_missed_tick_behavior(MissedTickBehavior::Burst);
        Ticker {
            interval,
            last: Instant::now(),
            tick: 0,
        }
    }

    /// Waits for the next tick. Returns the monotonic tick number and the
    /// wall time elapsed since the previous tick, in seconds.
    pub async fn next(&mut self) -> (u64, f32) {
        self.interval.tick().await;
        let now = Instant::now();
        let dt = now.duration_since(self.last).as_secs_f32();
        self.last = now;
        let tick = self.tick;
        self.tick += 1;
        (tick, dt)
    }

    pub fn current_tick(&self) -> u64 {
        self.tick
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_flag() {
        let flag = RunFlag::new();
        assert!(flag.is_running());
        let clone = flag.clone();
        clone.stop();
        assert!(!flag.is_running());
    }

    #[tokio::test]
    async fn test_ticks_are_monotonic_with_real_dt() {
        let mut ticker = Ticker::new(200);
        let (t0, _) = ticker.next().await;
        let (t1, dt1) = ticker.next().await;
        let (t2, dt2) = ticker.next().await;
        assert_eq!(t0, 0);
        assert_eq!(t1, 1);
        assert_eq!(t2, 2);
        assert!(dt1 > 0.0);
        assert!(dt2 > 0.0);
        assert_eq!(ticker.current_tick(), 3);
    }

    #[tokio::test]
    async fn test_overrun_reports_real_elapsed_time() {
        let mut ticker = Ticker::new(100);
        ticker.next().await;
        // Simulate a slow tick body.
        tokio::time::sleep(Duration::from_millis(35)).await;
        let (_, dt) = ticker.next().await;
        assert!(dt >= 0.030, "dt {} must include the overrun", dt);
    }
}
