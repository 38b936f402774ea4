use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::time::{Duration, Instant};

/// Throughput and remaining-time estimate at one point in a transfer
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rate {
    pub bytes_per_sec: f64,
    pub eta: Option<Duration>,
}

/// Compute throughput from cumulative bytes received since the transfer started
#[must_use]
#[allow(clippy::cast_precision_loss, clippy::cast_sign_loss, clippy::cast_possible_truncation)]
pub fn rate(received: u64, elapsed: Duration, remaining: Option<u64>) -> Rate {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 || received == 0 {
        return Rate {
            bytes_per_sec: 0.0,
            eta: None,
        };
    }
    let bytes_per_sec = received as f64 / secs;
    let eta = remaining.map(|left| Duration::from_secs((left as f64 / bytes_per_sec).ceil() as u64));
    Rate { bytes_per_sec, eta }
}

/// Format bytes as human-readable string
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}

#[must_use]
pub fn format_eta(eta: Duration) -> String {
    let secs = eta.as_secs();
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{h}:{m:02}:{s:02}")
    } else {
        format!("{m}:{s:02}")
    }
}

/// Progress reporting for one transfer, throttled to a minimum interval
pub struct Progress {
    bar: Option<ProgressBar>,
    interval: Duration,
    start: Instant,
    last_emit: Option<Instant>,
    /// Bytes already on disk before this transfer resumed
    resumed: u64,
    received: u64,
    total: Option<u64>,
}

impl Progress {
    #[must_use]
    pub fn new(label: &str, total: Option<u64>, resumed: u64, interval: Duration, enabled: bool) -> Self {
        let bar = enabled.then(|| {
            let bar = ProgressBar::with_draw_target(total, ProgressDrawTarget::stderr());
            let style = ProgressStyle::with_template("{prefix} [{bar:30}] {bytes}/{total_bytes} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=> ");
            bar.set_style(style);
            bar.set_prefix(label.to_string());
            bar.set_position(resumed);
            bar
        });

        Self {
            bar,
            interval,
            start: Instant::now(),
            last_emit: None,
            resumed,
            received: 0,
            total,
        }
    }

    /// Record `n` more bytes; the display is refreshed at most once per interval
    pub fn advance(&mut self, n: u64) {
        self.received += n;
        let now = Instant::now();
        if self
            .last_emit
            .is_some_and(|last| now.duration_since(last) < self.interval)
        {
            return;
        }
        self.last_emit = Some(now);
        self.emit();
    }

    #[must_use]
    pub fn position(&self) -> u64 {
        self.resumed + self.received
    }

    #[must_use]
    pub fn current_rate(&self) -> Rate {
        let remaining = self.total.map(|t| t.saturating_sub(self.position()));
        rate(self.received, self.start.elapsed(), remaining)
    }

    fn emit(&self) {
        let Some(bar) = &self.bar else {
            return;
        };
        let r = self.current_rate();
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let speed = format_bytes(r.bytes_per_sec as u64);
        let msg = match r.eta {
            Some(eta) => format!("{speed}/s, ETA {}", format_eta(eta)),
            None => format!("{speed}/s"),
        };
        bar.set_position(self.position());
        bar.set_message(msg);
    }

    pub fn finish(&self) {
        if let Some(bar) = &self.bar {
            self.emit();
            bar.finish_and_clear();
        }
    }
}
