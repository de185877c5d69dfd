//! Terminal progress bars backing the engine's progress sink contract.

use std::sync::Arc;

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

use grab_engine::ProgressSink;

fn styled_bar(label: &str) -> ProgressBar {
    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{msg} [{bar:30.cyan/blue}] {bytes}/{total_bytes}")
            .unwrap()
            .progress_chars("=> "),
    );
    bar.set_message(label.to_string());
    bar
}

/// One progress bar fed by a job's estimator. The estimated total moves as
/// the extrapolation refines; the bar length follows it.
pub struct BarSink {
    bar: ProgressBar,
}

impl BarSink {
    pub fn new(label: &str) -> Self {
        Self {
            bar: styled_bar(label),
        }
    }
}

impl ProgressSink for BarSink {
    fn init(&self, estimated_total: u64) {
        self.bar.set_length(estimated_total);
    }

    fn update(&self, done: u64, estimated_total: u64) {
        self.bar.set_length(estimated_total);
        self.bar.set_position(done);
    }
}

impl Drop for BarSink {
    fn drop(&mut self) {
        self.bar.finish_and_clear();
    }
}

/// Produces one bar per scheduled job, stacked under a shared
/// `MultiProgress` so concurrent jobs render cleanly.
pub struct BarFactory {
    multi: MultiProgress,
}

impl BarFactory {
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
        }
    }

    pub fn sink(&self, label: &str) -> Arc<dyn ProgressSink> {
        Arc::new(BarSink {
            bar: self.multi.add(styled_bar(label)),
        })
    }
}
