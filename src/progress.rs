use std::time::{Duration, Instant};

use indicatif::{ProgressBar, ProgressStyle};

/// Minimum gap between two progress reports.
pub const REPORT_INTERVAL: Duration = Duration::from_millis(100);

/// Receives byte-level download progress.
pub trait ProgressSink: Send + Sync {
    /// Called once the total is known (0 when the server does not say).
    fn start(&self, total: u64, resumed_from: u64);

    fn update(&self, downloaded: u64);

    fn finish(&self);
}

/// Silent.
impl ProgressSink for () {
    fn start(&self, _total: u64, _resumed_from: u64) {}

    fn update(&self, _downloaded: u64) {}

    fn finish(&self) {}
}

impl ProgressSink for ProgressBar {
    fn start(&self, total: u64, resumed_from: u64) {
        if total > 0 {
            self.set_length(total);
        }
        self.set_position(resumed_from);
    }

    fn update(&self, downloaded: u64) {
        self.set_position(downloaded);
    }

    fn finish(&self) {
        self.finish_and_clear();
    }
}

/// Terminal bar for one image download.
pub fn download_bar(label: &str) -> ProgressBar {
    let bar = ProgressBar::new(0);
    if let Ok(style) = ProgressStyle::default_bar()
        .template("{msg} {spinner:.green} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")
    {
        bar.set_style(style.progress_chars("#>-"));
    }
    bar.set_message(label.to_string());
    bar
}

/// Rate-limits progress reports.
#[derive(Debug)]
pub struct Throttle {
    interval: Duration,
    last: Option<Instant>,
}

impl Throttle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    /// True at most once per interval. The first call always passes.
    pub fn ready(&mut self) -> bool {
        self.ready_at(Instant::now())
    }

    fn ready_at(&mut self, now: Instant) -> bool {
        match self.last {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

impl Default for Throttle {
    fn default() -> Self {
        Self::new(REPORT_INTERVAL)
    }
}
