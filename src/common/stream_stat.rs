//! used to collect latency statistics and decide when things should happen.
//!
//! The [`LatencyWindow`] holds the last measured one-way delays for a client
//! and turns them into an adaptive buffer depth.  A p95 was chosen over the
//! window max (which over-provisions on a single spike) and over the mean
//! (which under-provisions under heavy-tail jitter).
//!
//! The MilliTimer drives the periodic work in the engine loop: the dispatch
//! tick, the stats broadcast, and the operator summary.
use std::fmt;

/// most samples the window will hold before the oldest is trimmed
pub const LATENCY_WINDOW_MAX: usize = 200;
/// floor and ceiling for the adaptive buffer depth in milliseconds
pub const BUFFER_FLOOR_MS: u64 = 10;
pub const BUFFER_CEILING_MS: u64 = 300;
/// fixed safety margin added on top of the p95, guards sub-sample drift
pub const BUFFER_MARGIN_MS: f64 = 15.0;
/// depth used before the first sample arrives
pub const BUFFER_DEFAULT_MS: u64 = 40;

/// rolling window of one-way delay samples for one client
#[derive(Debug)]
pub struct LatencyWindow {
    samples: Vec<f64>,
}

impl LatencyWindow {
    pub fn build() -> LatencyWindow {
        LatencyWindow {
            samples: Vec::new(),
        }
    }
    pub fn len(&self) -> usize {
        self.samples.len()
    }
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
    /// add a delay sample in milliseconds.  Negative values (client clock
    /// ahead of ours) are clamped to zero before they enter the window.
    pub fn add_sample(&mut self, sample: f64) -> () {
        self.samples.push(sample.max(0.0));
        if self.samples.len() > LATENCY_WINDOW_MAX {
            self.samples.remove(0);
        }
    }
    /// the element at floor(0.95 * (len - 1)) of the sorted window
    pub fn p95(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let mut sorted = self.samples.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let idx = (0.95 * (sorted.len() - 1) as f64).floor() as usize;
        sorted[idx]
    }
    pub fn avg(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<f64>() / self.samples.len() as f64
    }
    /// the last n samples, oldest first
    pub fn history(&self, n: usize) -> &[f64] {
        let start = self.samples.len().saturating_sub(n);
        &self.samples[start..]
    }
    /// adaptive depth: clamp(round(p95 + margin), floor, ceiling)
    pub fn buffer_depth_ms(&self) -> u64 {
        if self.samples.is_empty() {
            return BUFFER_DEFAULT_MS;
        }
        let depth = (self.p95() + BUFFER_MARGIN_MS).round() as u64;
        depth.clamp(BUFFER_FLOOR_MS, BUFFER_CEILING_MS)
    }
}

impl fmt::Display for LatencyWindow {
    // This trait requires `fmt` with this exact signature.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{{ n: {}, p95: {:.1}, avg: {:.1}, depth: {} }}",
            self.len(),
            self.p95(),
            self.avg(),
            self.buffer_depth_ms()
        )
    }
}

#[cfg(test)]
mod test_latency_window {
    use super::*;

    #[test]
    fn build() {
        let win = LatencyWindow::build();
        assert_eq!(win.len(), 0);
        assert_eq!(win.p95(), 0.0);
        assert_eq!(win.buffer_depth_ms(), BUFFER_DEFAULT_MS);
    }

    #[test]
    fn single_sample_p95() {
        // with one sample the p95 is that sample
        let mut win = LatencyWindow::build();
        win.add_sample(30.0);
        assert_eq!(win.p95(), 30.0);
        assert_eq!(win.buffer_depth_ms(), 45);
    }

    #[test]
    fn negative_samples_clamp_to_zero() {
        let mut win = LatencyWindow::build();
        win.add_sample(-20.0);
        assert_eq!(win.p95(), 0.0);
        // 0 + 15 margin, floored at 10 does not apply
        assert_eq!(win.buffer_depth_ms(), 15);
    }

    #[test]
    fn depth_is_clamped() {
        let mut win = LatencyWindow::build();
        win.add_sample(1000.0);
        assert_eq!(win.buffer_depth_ms(), BUFFER_CEILING_MS);
    }

    #[test]
    fn window_trims_oldest() {
        let mut win = LatencyWindow::build();
        for i in 0..(LATENCY_WINDOW_MAX + 50) {
            win.add_sample(i as f64);
        }
        assert_eq!(win.len(), LATENCY_WINDOW_MAX);
        // the first 50 samples are gone
        assert_eq!(win.history(LATENCY_WINDOW_MAX)[0], 50.0);
    }

    #[test]
    fn p95_under_heavy_tail() {
        // 19 fast samples and one spike:  p95 should sit on the fast cluster
        let mut win = LatencyWindow::build();
        for _ in 0..19 {
            win.add_sample(20.0);
        }
        win.add_sample(500.0);
        // idx = floor(0.95 * 19) = 18 of the sorted window
        assert_eq!(win.p95(), 20.0);
    }

    #[test]
    fn history_returns_tail() {
        let mut win = LatencyWindow::build();
        for i in 0..10 {
            win.add_sample(i as f64);
        }
        let tail = win.history(3);
        assert_eq!(tail, &[7.0, 8.0, 9.0]);
    }
}

/// Timer with millisecond accuracy to let things know when a certain time (or more) passed
#[derive(Debug)]
pub struct MilliTimer {
    last_time: u128,
    interval: u128,
}

impl MilliTimer {
    /// create a new timer with the current millisecond value and the interval (in milliseconds)
    pub fn build(now: u128, interval: u128) -> MilliTimer {
        MilliTimer {
            last_time: now,
            interval: interval,
        }
    }
    /// check if the timer is expired
    pub fn expired(&self, now: u128) -> bool {
        (self.last_time + self.interval) < now
    }
    /// reset the timer to the value of now
    pub fn reset(&mut self, now: u128) {
        self.last_time = now;
    }
    /// Ask how long since the last time you were reset
    pub fn since(&self, now: u128) -> u128 {
        now - self.last_time
    }
}
