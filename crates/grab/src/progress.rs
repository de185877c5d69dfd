//! Progress estimation.
//!
//! Two producers feed one sink contract: the segment downloader reports
//! byte counts with playback positions, and the external combiner's stderr
//! is scraped line by line. Both extrapolate a total-size estimate that
//! never shrinks below the bytes already transferred.

use std::sync::Arc;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use tracing::trace;

/// Consumer contract for progress reporting. Implemented by the UI layer;
/// the engine ships a no-op implementation for callers that do not care.
pub trait ProgressSink: Send + Sync {
    fn init(&self, estimated_total: u64);
    fn update(&self, done: u64, estimated_total: u64);
}

/// Sink that discards everything.
pub struct NullSink;

impl ProgressSink for NullSink {
    fn init(&self, _estimated_total: u64) {}
    fn update(&self, _done: u64, _estimated_total: u64) {}
}

/// Slack added to every extrapolated total so the estimate stays ahead of
/// the byte counter instead of oscillating around it.
const ESTIMATE_MARGIN: u64 = 64 * 1024;

/// Extrapolate a total size from bytes transferred and the fraction of the
/// presentation they cover. Without a usable fraction the estimate degrades
/// to a floor just above the byte count.
pub fn extrapolate_total(done: u64, fraction: Option<f64>) -> u64 {
    let floor = done + ESTIMATE_MARGIN;
    match fraction {
        Some(f) if f > f64::EPSILON => ((done as f64 / f).round() as u64).max(floor),
        _ => floor,
    }
}

/// Segment-path producer: driven by the fetchers after every segment copy.
#[derive(Clone)]
pub struct SegmentProgress {
    sink: Arc<dyn ProgressSink>,
}

impl SegmentProgress {
    pub fn new(sink: Arc<dyn ProgressSink>) -> Self {
        Self { sink }
    }

    pub fn init(&self, estimated_total: u64) {
        self.sink.init(estimated_total);
    }

    /// Report the job-wide byte counter together with the playback fraction
    /// of the segment that was just appended.
    pub fn record(&self, bytes_done: u64, fraction: Option<f64>) {
        self.sink
            .update(bytes_done, extrapolate_total(bytes_done, fraction));
    }
}

static DURATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Duration:\s*(\d+):(\d{2}):(\d{2})(?:\.(\d+))?").expect("valid regex")
});

static PROGRESS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(L?)size=\s*(\d+)\s*[kK]i?B\s+time=(\d+):(\d{2}):(\d{2})(?:\.(\d+))?")
        .expect("valid regex")
});

/// External-process producer: parses the remuxer's line-oriented stderr.
///
/// A `Duration:` marker seen before transfer starts fixes the total media
/// duration; each `size=... time=...` line reports cumulative output size
/// and elapsed media time; the final line (`Lsize=`) pins the estimate to
/// the reported size exactly.
pub struct RemuxProgress {
    sink: Arc<dyn ProgressSink>,
    total_duration: Option<Duration>,
    transfer_started: bool,
    last_line: String,
}

impl RemuxProgress {
    pub fn new(sink: Arc<dyn ProgressSink>) -> Self {
        Self {
            sink,
            total_duration: None,
            transfer_started: false,
            last_line: String::new(),
        }
    }

    /// Last non-empty line observed, kept as the diagnostic message for
    /// stall and exit-status failures.
    pub fn last_line(&self) -> &str {
        &self.last_line
    }

    pub fn observe_line(&mut self, line: &str) {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return;
        }
        self.last_line = trimmed.to_string();

        if !self.transfer_started
            && self.total_duration.is_none()
            && let Some(caps) = DURATION_RE.captures(trimmed)
        {
            self.total_duration = parse_clock(&caps, 1);
            trace!(total = ?self.total_duration, "Remuxer reported input duration");
            return;
        }

        if let Some(caps) = PROGRESS_RE.captures(trimmed) {
            self.transfer_started = true;
            let is_final = &caps[1] == "L";
            let bytes = caps[2].parse::<u64>().unwrap_or(0) * 1024;

            if is_final {
                self.sink.update(bytes, bytes);
                return;
            }

            let fraction = match (parse_clock(&caps, 3), self.total_duration) {
                (Some(elapsed), Some(total)) if !total.is_zero() => {
                    Some((elapsed.as_secs_f64() / total.as_secs_f64()).min(1.0))
                }
                _ => None,
            };
            self.sink.update(bytes, extrapolate_total(bytes, fraction));
        }
    }
}

/// Parse `H:MM:SS[.cc]` starting at capture group `first`.
fn parse_clock(caps: &regex::Captures<'_>, first: usize) -> Option<Duration> {
    let hours: u64 = caps.get(first)?.as_str().parse().ok()?;
    let minutes: u64 = caps.get(first + 1)?.as_str().parse().ok()?;
    let seconds: u64 = caps.get(first + 2)?.as_str().parse().ok()?;
    let mut duration = Duration::from_secs(hours * 3_600 + minutes * 60 + seconds);
    if let Some(frac) = caps.get(first + 3) {
        let digits = frac.as_str();
        if let Ok(value) = digits.parse::<u64>() {
            let scale = 10u64.pow(digits.len() as u32);
            duration += Duration::from_secs_f64(value as f64 / scale as f64);
        }
    }
    Some(duration)
}
