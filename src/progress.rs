//! Progress reporting for sync runs
//!
//! Provides a live spinner while the engine runs and a styled summary at the end.

use crate::engine::{EngineProgress, SyncSummary};
use console::style;
use humansize::{format_size, BINARY};
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::BTreeMap;
use std::time::Duration;

/// Spinner showing engine counters
pub struct ProgressReporter {
    bar: ProgressBar,
}

impl ProgressReporter {
    pub fn new() -> Self {
        let bar = ProgressBar::new_spinner();

        bar.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} [{elapsed_precise}] {msg}")
                .expect("Invalid progress template")
                .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏"),
        );

        bar.enable_steady_tick(Duration::from_millis(100));

        Self { bar }
    }

    /// Update the progress display
    pub fn update(&self, progress: &EngineProgress) {
        let counts = &progress.counts;
        let secs = progress.elapsed.as_secs_f64();
        let rate = if secs > 0.0 {
            (counts.objects_complete + counts.objects_skipped) as f64 / secs
        } else {
            0.0
        };

        let mut msg = format!(
            "Complete: {} | Skipped: {} | Failed: {} | Size: {} | Rate: {:.0}/s | Sync queue: {} | Query queue: {}",
            format_number(counts.objects_complete),
            format_number(counts.objects_skipped),
            format_number(counts.objects_failed),
            format_size(counts.bytes_complete, BINARY),
            rate,
            format_number(progress.sync_remaining + progress.retry_remaining),
            format_number(progress.query_remaining),
        );
        if progress.awaiting_retry > 0 {
            msg.push_str(&format!(" | Awaiting retry: {}", format_number(progress.awaiting_retry)));
        }
        if let Some(estimate) = &progress.estimate {
            let done = counts.objects_complete + counts.objects_skipped + counts.objects_failed;
            msg.push_str(&format!(
                " | Estimated: {}{} ({})",
                format_number(estimate.total_objects),
                if estimate.complete { "" } else { "+" },
                format_percent(done, estimate.total_objects),
            ));
        }

        self.bar.set_message(msg);
    }

    pub fn set_status(&self, status: &str) {
        self.bar.set_message(status.to_string());
    }

    pub fn finish(&self, message: &str) {
        self.bar.finish_with_message(message.to_string());
    }

    pub fn finish_and_clear(&self) {
        self.bar.finish_and_clear();
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

/// Format a number with thousands separators
pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let bytes: Vec<_> = s.bytes().rev().collect();

    let chunks: Vec<String> = bytes
        .chunks(3)
        .map(|chunk| {
            chunk
                .iter()
                .rev()
                .map(|&b| b as char)
                .collect::<String>()
        })
        .collect();

    chunks.into_iter().rev().collect::<Vec<_>>().join(",")
}

/// Share of `total` reached, for display
pub fn format_percent(done: u64, total: u64) -> String {
    if total == 0 {
        return "-".to_string();
    }
    format!("{:.1}%", (done.min(total) as f64 / total as f64) * 100.0)
}

/// Print the end-of-run summary
pub fn print_summary(summary: &SyncSummary, db_path: &str) {
    let counts = &summary.counts;
    let duration_secs = summary.duration.as_secs_f64();

    println!();
    if summary.terminated {
        println!("{}", style("Sync Terminated").yellow().bold());
    } else {
        println!("{}", style("Sync Complete").green().bold());
    }
    println!("{}", style("─".repeat(50)).dim());
    println!(
        "  {} {} ({})",
        style("Completed:").bold(),
        format_number(counts.objects_complete),
        format_size(counts.bytes_complete, BINARY)
    );
    if counts.objects_copy_skipped > 0 {
        println!(
            "  {} {} ({})",
            style("Copy skipped:").bold(),
            format_number(counts.objects_copy_skipped),
            format_size(counts.bytes_copy_skipped, BINARY)
        );
    }
    println!(
        "  {} {} ({})",
        style("Skipped:").bold(),
        format_number(counts.objects_skipped),
        format_size(counts.bytes_skipped, BINARY)
    );
    println!(
        "  {} {:.1}s ({:.0} objects/sec)",
        style("Duration:").bold(),
        duration_secs,
        summary.objects_per_second()
    );
    if counts.objects_failed > 0 {
        println!(
            "  {} {}",
            style("Failed:").yellow().bold(),
            format_number(counts.objects_failed)
        );
        for failed in &summary.failed_objects {
            println!("    {} {}", style(&failed.identifier).red(), style(&failed.message).dim());
        }
    }
    if let Some(estimate) = &summary.estimate {
        println!(
            "  {} {} ({}){}",
            style("Estimated:").bold(),
            format_number(estimate.total_objects),
            format_size(estimate.total_bytes, BINARY),
            if estimate.complete { "" } else { " - incomplete" }
        );
    }
    println!("  {} {}", style("Database:").bold(), db_path);
    println!();
}

/// Print per-status record counts
pub fn print_report(table: &str, counts: &BTreeMap<String, u64>) {
    let total: u64 = counts.values().sum();

    println!();
    println!("{} {}", style("Status of").bold(), style(table).cyan().bold());
    println!("{}", style("─".repeat(50)).dim());
    for (status, count) in counts {
        println!("  {:<16} {}", format!("{}:", status), format_number(*count));
    }
    println!("  {:<16} {}", style("Total:").bold(), format_number(total));
    println!();
}

/// Print a header at the start of a run
pub fn print_header(source: &str, target: &str, sync_threads: usize, db: &str) {
    println!();
    println!(
        "{} {}",
        style("objsync").cyan().bold(),
        env!("CARGO_PKG_VERSION")
    );
    println!("{}", style("─".repeat(50)).dim());
    println!("  {} {}", style("Source:").bold(), source);
    println!("  {} {}", style("Target:").bold(), target);
    println!("  {} {}", style("Threads:").bold(), sync_threads);
    println!("  {} {}", style("Database:").bold(), db);
    println!();
}
