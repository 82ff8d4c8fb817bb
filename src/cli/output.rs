//! CLI output formatting utilities.

use chrono::TimeDelta;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};

/// Output helper for CLI formatting.
pub struct Output;

impl Output {
    /// Print an info message.
    pub fn info(msg: &str) {
        println!("{} {}", style(">>").cyan().bold(), msg);
    }

    /// Print a success message.
    pub fn success(msg: &str) {
        println!("{} {}", style(">>").green().bold(), msg);
    }

    /// Print a warning message.
    pub fn warning(msg: &str) {
        eprintln!("{} {}", style(">>").yellow().bold(), msg);
    }

    /// Print an error message.
    pub fn error(msg: &str) {
        eprintln!("{} {}", style(">>").red().bold(), msg);
    }

    /// Print a header.
    pub fn header(msg: &str) {
        println!("\n{}", style(msg).bold().underlined());
    }

    /// Print a key-value pair.
    pub fn kv(key: &str, value: &str) {
        println!("  {}: {}", style(key).dim(), value);
    }

    /// Print one catalog entry.
    pub fn tool_info(name: &str, description: &str, note: &str) {
        println!("  {} {}{}", style("*").cyan(), style(name).bold(), style(note).dim());
        if !description.is_empty() {
            println!("    {}", content_preview(description, 160));
        }
    }

    /// Print one recorded span.
    pub fn span_info(span_type: &str, name: &str, elapsed: &str, failed: bool) {
        let marker = if failed {
            style("x").red().bold()
        } else {
            style("*").cyan()
        };
        println!(
            "  {} {:<10} {} {}",
            marker,
            style(span_type).dim(),
            style(name).bold(),
            style(elapsed).dim()
        );
    }

    /// Create a spinner.
    pub fn spinner(msg: &str) -> ProgressBar {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        pb.set_message(msg.to_string());
        pb.enable_steady_tick(std::time::Duration::from_millis(100));
        pb
    }

    /// Format a span or trace duration.
    pub fn format_elapsed(delta: TimeDelta) -> String {
        let millis = delta.num_milliseconds().max(0);
        if millis < 1000 {
            format!("{}ms", millis)
        } else if millis < 60_000 {
            format!("{:.1}s", millis as f64 / 1000.0)
        } else {
            format!("{}m {}s", millis / 60_000, (millis % 60_000) / 1000)
        }
    }
}

/// Truncate content with ellipsis.
fn content_preview(content: &str, max_len: usize) -> String {
    let content = content.replace('\n', " ");
    if content.chars().count() <= max_len {
        content
    } else {
        let truncated: String = content.chars().take(max_len).collect();
        format!("{}...", truncated)
    }
}
