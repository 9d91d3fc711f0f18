//! Trailing-window throughput for progress events

use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// Average bytes/second over the last `window`, so bursts of part
/// completions don't make the reported speed jump.
#[derive(Debug)]
pub struct SpeedMeter {
    window: Duration,
    /// (time, cumulative bytes)
    samples: VecDeque<(Instant, u64)>,
}

impl SpeedMeter {
    pub fn new(window: Duration) -> Self {
        let mut samples = VecDeque::new();
        samples.push_back((Instant::now(), 0));
        Self {
            window: window.max(Duration::from_millis(1)),
            samples,
        }
    }

    /// Record the cumulative byte count and return the current speed.
    pub fn record(&mut self, total_bytes: u64) -> f64 {
        let now = Instant::now();
        self.samples.push_back((now, total_bytes));

        // Keep one sample at or before the window start as the baseline
        while self.samples.len() > 2 {
            match self.samples.get(1) {
                Some((at, _)) if now.duration_since(*at) >= self.window => {
                    self.samples.pop_front();
                }
                _ => break,
            }
        }

        let Some(&(start, start_bytes)) = self.samples.front() else {
            return 0.0;
        };
        let elapsed = now.duration_since(start).as_secs_f64();
        if elapsed <= 0.0 {
            return 0.0;
        }
        total_bytes.saturating_sub(start_bytes) as f64 / elapsed
    }
}
