//! Cargo-style progress display
//!
//! Entry lines scroll above a byte counter that stays at the bottom. When
//! progress is disabled the bar is hidden but still counts, so totals are
//! available for the final summary either way.

use crossterm::style::{Color, Stylize};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::logger::{Logger, NoopLogger};

#[derive(Clone)]
pub struct TransferProgress {
    bar: ProgressBar,
    start_time: Instant,
    show_entries: bool,
}

impl TransferProgress {
    pub fn new(enabled: bool) -> Self {
        let bar = if enabled {
            let pb = ProgressBar::new_spinner();
            pb.set_style(
                ProgressStyle::default_spinner()
                    .template("{spinner:.green} {bytes} ({binary_bytes_per_sec}) {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_spinner())
                    .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏ "),
            );
            pb.enable_steady_tick(Duration::from_millis(100));
            pb
        } else {
            ProgressBar::hidden()
        };
        Self {
            bar,
            start_time: Instant::now(),
            show_entries: enabled,
        }
    }

    pub fn hidden() -> Self {
        Self::new(false)
    }

    /// Switch to a bounded bar once the body size is known.
    pub fn set_total(&self, bytes: u64) {
        self.bar.set_length(bytes);
        if self.show_entries {
            self.bar.set_style(
                ProgressStyle::default_bar()
                    .template("{bar:30.green/white} {bytes}/{total_bytes} ({eta}) {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_bar()),
            );
        }
    }

    pub fn inc(&self, bytes: u64) {
        self.bar.inc(bytes);
    }

    pub fn set_position(&self, bytes: u64) {
        self.bar.set_position(bytes);
    }

    pub fn position(&self) -> u64 {
        self.bar.position()
    }

    /// The underlying bar, for `wrap_read`/`wrap_write` style counting.
    pub fn bar(&self) -> &ProgressBar {
        &self.bar
    }

    /// Print an entry operation above the progress line
    pub fn entry(&self, operation: &str, path: &Path) {
        if self.show_entries {
            self.bar.suspend(|| {
                println!(
                    "  {} {}",
                    format!("{:>9}", operation).with(Color::Green).bold(),
                    path.display().to_string().with(Color::Cyan)
                );
            });
        }
    }

    pub fn finish(&self, files: u64, bytes: u64) {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        self.bar.finish_with_message(format!(
            "{} {} file(s), {} in {:.1}s",
            "Completed".with(Color::Green).bold(),
            files,
            prettify_size(bytes),
            elapsed
        ));
    }

    pub fn abandon(&self, msg: &str) {
        self.bar
            .abandon_with_message(format!("{} {}", "Failed".with(Color::Red).bold(), msg));
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }
}

/// Event logger and progress display travelling together through a transfer.
#[derive(Clone)]
pub struct Reporter {
    logger: Arc<dyn Logger>,
    progress: TransferProgress,
}

impl Reporter {
    pub fn new(logger: Arc<dyn Logger>, progress: TransferProgress) -> Self {
        Self { logger, progress }
    }

    pub fn silent() -> Self {
        Self::new(Arc::new(NoopLogger), TransferProgress::hidden())
    }

    pub fn logger(&self) -> &dyn Logger {
        self.logger.as_ref()
    }

    pub fn progress(&self) -> &TransferProgress {
        &self.progress
    }
}

impl Default for Reporter {
    fn default() -> Self {
        Self::silent()
    }
}

/// Human readable byte count: `B`, `kiB`, `MiB`, `GiB` with two decimals.
pub fn prettify_size(bytes: u64) -> String {
    const KIB: f64 = 1024.0;
    let b = bytes as f64;
    if b < KIB {
        format!("{} B", bytes)
    } else if b < KIB * KIB {
        format!("{:.2} kiB", b / KIB)
    } else if b < KIB * KIB * KIB {
        format!("{:.2} MiB", b / (KIB * KIB))
    } else {
        format!("{:.2} GiB", b / (KIB * KIB * KIB))
    }
}
