//! Thread-safe progress reporting with an ETA estimate.
//!
//! Thin wrapper over `indicatif` so library crates can report progress
//! without knowing whether the run is interactive. The bar is internally
//! synchronised; `inc` may be called from any worker thread.

use indicatif::{ProgressBar, ProgressStyle};

#[derive(Debug, Clone)]
pub struct Progress {
    bar: ProgressBar,
}

impl Progress {
    /// A visible bar over `len` steps with the given label.
    pub fn new(len: u64, label: &str) -> Self {
        let bar = ProgressBar::new(len);
        bar.set_style(
            ProgressStyle::with_template(
                "{prefix:>12} [{bar:30}] {pos}/{len} (eta {eta})",
            )
            .expect("static progress template is valid")
            .progress_chars("#>-"),
        );
        bar.set_prefix(label.to_string());
        Progress { bar }
    }

    /// A reporter that displays nothing, for quiet runs and tests.
    pub fn hidden() -> Self {
        Progress {
            bar: ProgressBar::hidden(),
        }
    }

    pub fn inc(&self) {
        self.bar.inc(1);
    }

    pub fn finish(&self) {
        self.bar.finish();
    }
}
