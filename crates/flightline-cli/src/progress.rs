//! Transfer progress display with progress bars.

use flightline_core::{Direction, TransferProgress};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

const BAR_TEMPLATE: &str =
    "{msg}\n{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})";

/// One transfer's progress bar
pub struct TransferBar {
    bar: ProgressBar,
    label: String,
}

impl TransferBar {
    /// Add a bar for a transfer to `multi`
    #[must_use]
    pub fn new(multi: &MultiProgress, total_bytes: u64, name: &str, direction: Direction) -> Self {
        let bar = multi.add(ProgressBar::new(total_bytes));

        let style = ProgressStyle::default_bar()
            .template(BAR_TEMPLATE)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-");
        bar.set_style(style);

        let label = match direction {
            Direction::Send => format!("Sending: {name}"),
            Direction::Receive => format!("Receiving: {name}"),
        };
        bar.set_message(label.clone());

        Self { bar, label }
    }

    /// Apply a progress snapshot
    pub fn update(&self, progress: &TransferProgress) {
        self.bar.set_length(progress.bytes_total);
        self.bar.set_position(progress.bytes_done);
        self.bar.set_message(format!(
            "{} ({}, ETA {})",
            self.label,
            progress.speed_string(),
            progress.eta_string()
        ));
    }

    /// Finish with success message
    pub fn finish(&self) {
        self.bar.finish_with_message(format!("{} - done", self.label));
    }

    /// Abandon the progress bar (for errors)
    pub fn abandon(&self, reason: &str) {
        self.bar
            .abandon_with_message(format!("{} - failed: {reason}", self.label));
    }
}

/// Format bytes in human-readable format
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    format!("{size:.2} {}", UNITS[unit_idx])
}
