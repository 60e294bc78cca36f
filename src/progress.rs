//! Progress reporting: the sink trait consumed by front ends, plus the
//! throttling and speed helpers that produce its text.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Receiver of human-facing progress updates.
pub trait ProgressSink: Send + Sync {
    fn set_label(&self, text: &str);
    /// Progress in per-mille (0..=1000).
    fn set_progress(&self, per_mille: u32);
    fn set_progress_text(&self, text: &str);
    /// Present a version's change log. Sinks without a changelog view ignore it.
    fn show_changelog(&self, _version: &str, _text: &str) {}
}

/// Sink that forwards everything to the log.
#[derive(Debug, Default)]
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn set_label(&self, text: &str) {
        tracing::info!("{}", text);
    }

    fn set_progress(&self, _per_mille: u32) {}

    fn set_progress_text(&self, text: &str) {
        tracing::debug!("{}", text);
    }
}

/// Lets an event through at most once per interval.
#[derive(Debug)]
pub struct IntervalTimer {
    interval: Duration,
    last: Option<Instant>,
}

impl IntervalTimer {
    pub fn new(interval: Duration) -> Self {
        IntervalTimer {
            interval,
            last: None,
        }
    }

    /// True when the interval has elapsed since the last accepted tick.
    pub fn tick(&mut self) -> bool {
        let now = Instant::now();
        match self.last {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

/// Average transfer speed over a sliding window.
#[derive(Debug)]
pub struct SpeedSampler {
    window: Duration,
    samples: VecDeque<(Instant, u64)>,
}

impl SpeedSampler {
    pub fn new(window: Duration) -> Self {
        SpeedSampler {
            window,
            samples: VecDeque::new(),
        }
    }

    pub fn sample(&mut self, bytes: u64) {
        self.sample_at(Instant::now(), bytes);
    }

    fn sample_at(&mut self, at: Instant, bytes: u64) {
        self.samples.push_back((at, bytes));
        while let Some((first, _)) = self.samples.front() {
            if at.duration_since(*first) > self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Bytes per second over the retained samples.
    pub fn speed(&self) -> u64 {
        let (Some((first, _)), Some((last, _))) = (self.samples.front(), self.samples.back())
        else {
            return 0;
        };
        let total: u64 = self.samples.iter().map(|(_, b)| b).sum();
        let elapsed = last.duration_since(*first).as_secs_f64().max(1.0);
        (total as f64 / elapsed) as u64
    }
}

impl Default for SpeedSampler {
    fn default() -> Self {
        SpeedSampler::new(Duration::from_millis(3000))
    }
}

/// Render a byte count with two decimals and a binary unit.
pub fn format_bytes(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;
    let b = bytes as f64;
    if b < KB {
        format!("{bytes} B")
    } else if b < MB {
        format!("{:.2} KB", b / KB)
    } else if b < GB {
        format!("{:.2} MB", b / MB)
    } else {
        format!("{:.2} GB", b / GB)
    }
}

/// `"12.5%  -  1.20 MB/9.60 MB   -   300.00 KB/s"`
pub fn download_text(done: u64, total: u64, speed: u64) -> String {
    let percent = if total == 0 {
        0.0
    } else {
        done as f64 / total as f64 * 100.0
    };
    format!(
        "{percent:.1}%  -  {}/{}   -   {}/s",
        format_bytes(done),
        format_bytes(total),
        format_bytes(speed)
    )
}

pub fn per_mille(done: u64, total: u64) -> u32 {
    if total == 0 {
        return 0;
    }
    ((done.min(total) as u128 * 1000) / total as u128) as u32
}
