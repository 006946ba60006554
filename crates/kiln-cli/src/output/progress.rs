//! Progress indicators for module loads

use indicatif::{ProgressBar as IndicatifProgressBar, ProgressStyle as IndicatifStyle};
use kiln_core::ProgressCallback;
use std::sync::Arc;
use std::time::Duration;

const BAR_TEMPLATE: &str = "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos:>3}% {prefix} {msg}";

/// Progress bar wrapper for CLI operations
pub struct ProgressBar {
    inner: IndicatifProgressBar,
}

impl ProgressBar {
    /// Percentage bar for a module load
    pub fn percent(module: &str) -> Self {
        let pb = IndicatifProgressBar::new(100);
        pb.set_style(
            IndicatifStyle::default_bar()
                .template(BAR_TEMPLATE)
                .unwrap_or_else(|_| IndicatifStyle::default_bar())
                .progress_chars("=>-"),
        );
        pb.enable_steady_tick(Duration::from_millis(100));
        pb.set_prefix(module.to_string());
        Self { inner: pb }
    }

    /// Bar that draws nothing, for JSON output
    pub fn hidden() -> Self {
        Self {
            inner: IndicatifProgressBar::hidden(),
        }
    }

    /// Loader progress callback that drives this bar
    pub fn callback(&self) -> ProgressCallback {
        let pb = self.inner.clone();
        Arc::new(move |percent: f64, stage: &str| {
            pb.set_position(percent.round().clamp(0.0, 100.0) as u64);
            pb.set_message(stage.to_string());
        })
    }

    #[cfg(test)]
    pub fn position(&self) -> u64 {
        self.inner.position()
    }

    /// Finish the progress bar with a message
    pub fn finish_with_message(&self, message: &str) {
        self.inner.finish_with_message(message.to_string());
    }

    /// Abandon with message
    pub fn abandon_with_message(&self, message: &str) {
        self.inner.abandon_with_message(message.to_string());
    }
}
