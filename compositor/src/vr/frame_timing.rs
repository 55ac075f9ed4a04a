//! Frame timing instrumentation for the render loop.
//!
//! Keeps a rolling window of per-frame CPU and interval samples and counts
//! frames that blew the budget implied by the target frame rate.

use std::collections::VecDeque;

/// Rolling frame timing statistics over a window of samples.
#[derive(Debug)]
pub struct FrameTiming {
    /// Time spent building and encoding each frame, in milliseconds.
    pub cpu_times: VecDeque<f64>,
    /// Wall time between consecutive frame starts, in milliseconds.
    pub intervals: VecDeque<f64>,
    pub window_size: usize,
    pub total_frames: u64,
    /// Frames whose CPU time exceeded `budget_ms`.
    pub missed_frames: u64,
    /// Frame budget in milliseconds (11.1 for 90Hz).
    pub budget_ms: f64,
}

impl Default for FrameTiming {
    fn default() -> Self {
        Self::for_rate(90, 1000)
    }
}

impl FrameTiming {
    pub fn new(window_size: usize, budget_ms: f64) -> Self {
        Self {
            cpu_times: VecDeque::with_capacity(window_size),
            intervals: VecDeque::with_capacity(window_size),
            window_size,
            total_frames: 0,
            missed_frames: 0,
            budget_ms,
        }
    }

    /// Timing window whose budget matches a display refresh rate.
    pub fn for_rate(frame_rate: u32, window_size: usize) -> Self {
        Self::new(window_size, 1000.0 / frame_rate.max(1) as f64)
    }

    /// Record one frame. `interval_ms` is `None` for the first frame.
    pub fn record_frame(&mut self, cpu_ms: f64, interval_ms: Option<f64>) {
        push_sample(&mut self.cpu_times, cpu_ms, self.window_size);
        if let Some(interval) = interval_ms {
            push_sample(&mut self.intervals, interval, self.window_size);
        }
        self.total_frames += 1;
        if cpu_ms > self.budget_ms {
            self.missed_frames += 1;
        }
    }

    pub fn stats(&self) -> FrameTimingStats {
        let cpu = sorted(&self.cpu_times);
        let interval = sorted(&self.intervals);
        let interval_p50 = percentile(&interval, 50.0);
        FrameTimingStats {
            cpu_p50: percentile(&cpu, 50.0),
            cpu_p99: percentile(&cpu, 99.0),
            interval_p50,
            interval_p95: percentile(&interval, 95.0),
            fps: if interval_p50 > 0.0 { 1000.0 / interval_p50 } else { 0.0 },
            missed_pct: if self.total_frames > 0 {
                (self.missed_frames as f64 / self.total_frames as f64) * 100.0
            } else {
                0.0
            },
            total_frames: self.total_frames,
            missed_frames: self.missed_frames,
        }
    }
}

fn push_sample(samples: &mut VecDeque<f64>, value: f64, window_size: usize) {
    samples.push_back(value);
    while samples.len() > window_size {
        samples.pop_front();
    }
}

fn sorted(samples: &VecDeque<f64>) -> Vec<f64> {
    let mut v: Vec<f64> = samples.iter().copied().collect();
    v.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    v
}

/// Nearest-rank percentile of a sorted slice.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((sorted.len() as f64 - 1.0) * p / 100.0).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

/// Computed frame timing statistics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameTimingStats {
    pub cpu_p50: f64,
    pub cpu_p99: f64,
    pub interval_p50: f64,
    pub interval_p95: f64,
    pub fps: f64,
    pub missed_pct: f64,
    pub total_frames: u64,
    pub missed_frames: u64,
}

impl FrameTimingStats {
    /// Format stats as an s-expression for IPC.
    pub fn to_sexp(&self) -> String {
        format!(
            "(:cpu-p50 {:.2} :cpu-p99 {:.2} :interval-p50 {:.2} :interval-p95 {:.2} :fps {:.0} :missed-pct {:.1} :total-frames {} :missed-frames {})",
            self.cpu_p50,
            self.cpu_p99,
            self.interval_p50,
            self.interval_p95,
            self.fps,
            self.missed_pct,
            self.total_frames,
            self.missed_frames,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_stats() {
        let ft = FrameTiming::new(100, 11.1);
        let stats = ft.stats();
        assert_eq!(stats, FrameTimingStats::default());
    }

    #[test]
    fn test_budget_from_rate() {
        let ft = FrameTiming::for_rate(90, 10);
        assert!((ft.budget_ms - 11.11).abs() < 0.01);
        // Zero rate must not divide by zero.
        let ft = FrameTiming::for_rate(0, 10);
        assert_eq!(ft.budget_ms, 1000.0);
    }

    #[test]
    fn test_missed_frame_detection() {
        let mut ft = FrameTiming::new(100, 11.1);
        ft.record_frame(12.0, None);
        assert_eq!(ft.missed_frames, 1);
        ft.record_frame(4.0, Some(11.0));
        assert_eq!(ft.missed_frames, 1);
        assert_eq!(ft.total_frames, 2);
        assert!((ft.stats().missed_pct - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_fps_from_intervals() {
        let mut ft = FrameTiming::new(100, 11.1);
        ft.record_frame(1.0, None);
        for _ in 0..10 {
            ft.record_frame(1.0, Some(10.0));
        }
        let stats = ft.stats();
        assert!((stats.fps - 100.0).abs() < 1e-9);
        assert_eq!(stats.interval_p50, 10.0);
    }

    #[test]
    fn test_window_size_trim() {
        let mut ft = FrameTiming::new(5, 11.1);
        for i in 0..10 {
            ft.record_frame(i as f64, Some(11.0));
        }
        assert_eq!(ft.cpu_times.len(), 5);
        assert_eq!(ft.intervals.len(), 5);
        assert_eq!(ft.cpu_times.front(), Some(&5.0));
        assert_eq!(ft.total_frames, 10);
    }

    #[test]
    fn test_stats_sexp_format() {
        let mut ft = FrameTiming::new(100, 11.1);
        ft.record_frame(2.0, Some(11.0));
        let sexp = ft.stats().to_sexp();
        assert!(sexp.starts_with("(:cpu-p50 2.00"));
        assert!(sexp.contains(":total-frames 1"));
        assert!(lexpr::from_str(&sexp).is_ok());
    }
}
