//! Rendering run reports for the terminal and for files.

use anyhow::{Context, Result};
use chaos_core::{EventType, Report};
use clap::ValueEnum;
use std::fmt::Write as _;
use std::path::Path;
use unicode_width::{UnicodeWidthChar, UnicodeWidthStr};

const WIDTH: usize = 64;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum ReportFormat {
    /// Boxed summary with an event timeline
    #[default]
    Table,
    Json,
    #[value(alias = "md")]
    Markdown,
    /// One-line summary
    Compact,
}

pub fn render(report: &Report, format: ReportFormat) -> Result<String> {
    Ok(match format {
        ReportFormat::Table => table(report),
        ReportFormat::Json => serde_json::to_string_pretty(report).context("serializing report")?,
        ReportFormat::Markdown => markdown(report),
        ReportFormat::Compact => compact(report),
    })
}

/// Read a report previously written with `--format json`.
pub fn load(path: &Path) -> Result<Report> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading report {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("parsing report {}", path.display()))
}

pub fn write_to(path: &Path, content: &str) -> Result<()> {
    std::fs::write(path, content).with_context(|| format!("writing report {}", path.display()))
}

fn status(report: &Report) -> &'static str {
    if report.success { "PASSED" } else { "FAILED" }
}

fn icon(event_type: EventType) -> &'static str {
    match event_type {
        EventType::Start => ">",
        EventType::Success => "+",
        EventType::Failure => "x",
        EventType::Error => "!",
        EventType::Cleanup => "~",
        EventType::Info => "-",
    }
}

/// Cut `s` to at most `max` terminal columns, marking the cut with "...".
fn truncate(s: &str, max: usize) -> String {
    if s.width() <= max {
        return s.to_string();
    }
    let budget = max.saturating_sub(3);
    let mut used = 0;
    let mut out = String::new();
    for ch in s.chars() {
        let w = ch.width().unwrap_or(0);
        if used + w > budget {
            break;
        }
        used += w;
        out.push(ch);
    }
    out.push_str("...");
    out
}

/// Left-align `s` in `columns` terminal columns.
fn pad(s: &str, columns: usize) -> String {
    let fill = columns.saturating_sub(s.width());
    format!("{s}{}", " ".repeat(fill))
}

fn human(d: std::time::Duration) -> String {
    // Whole milliseconds keep the output readable.
    let ms = std::time::Duration::from_millis(d.as_millis() as u64);
    humantime::format_duration(ms).to_string()
}

fn table(report: &Report) -> String {
    let stats = report.stats();
    let rule = "=".repeat(WIDTH + 2);
    let thin = "-".repeat(WIDTH + 2);
    let row = |out: &mut String, text: String| {
        let _ = writeln!(out, "| {} |", pad(&truncate(&text, WIDTH), WIDTH));
    };

    let mut out = String::new();
    let _ = writeln!(out, "+{rule}+");
    row(&mut out, format!("Scenario: {}", report.scenario));
    if !report.description.is_empty() {
        row(&mut out, report.description.clone());
    }
    let _ = writeln!(out, "+{rule}+");
    row(&mut out, format!("Status: {}", status(report)));
    row(&mut out, format!("Duration: {}", human(report.duration)));
    row(
        &mut out,
        format!(
            "Steps: {} total, {} success, {} failed, {} cleanup",
            stats.total_steps, stats.success_steps, stats.failed_steps, stats.cleanup_steps
        ),
    );
    let _ = writeln!(out, "+{rule}+");
    row(&mut out, "Timeline:".to_string());
    let _ = writeln!(out, "+{thin}+");
    for event in report.events() {
        row(
            &mut out,
            format!(
                "{} {} {} {}",
                icon(event.event_type),
                event.timestamp.format("%H:%M:%S"),
                pad(&truncate(&event.step, 20), 20),
                event.message
            ),
        );
    }
    let _ = writeln!(out, "+{rule}+");
    if let Some(err) = &report.error {
        let _ = writeln!(out, "\nError: {err}");
    }
    out
}

fn markdown(report: &Report) -> String {
    let stats = report.stats();
    let mut out = String::new();
    let _ = writeln!(out, "# Chaos Test Report: {}\n", report.scenario);
    if !report.description.is_empty() {
        let _ = writeln!(out, "_{}_\n", report.description);
    }
    let _ = writeln!(out, "## Summary\n");
    let _ = writeln!(out, "- **Status**: {}", status(report));
    let _ = writeln!(out, "- **Duration**: {}", human(report.duration));
    let _ = writeln!(
        out,
        "- **Steps**: {} total, {} success, {} failed, {} cleanup\n",
        stats.total_steps, stats.success_steps, stats.failed_steps, stats.cleanup_steps
    );
    let _ = writeln!(out, "## Timeline\n");
    let _ = writeln!(out, "| Time | Type | Step | Message |");
    let _ = writeln!(out, "|------|------|------|---------|");
    for event in report.events() {
        let _ = writeln!(
            out,
            "| {} | {} | {} | {} |",
            event.timestamp.format("%H:%M:%S"),
            event.event_type,
            event.step,
            event.message.replace('|', "\\|")
        );
    }
    if let Some(err) = &report.error {
        let _ = writeln!(out, "\n## Error\n\n```\n{err}\n```");
    }
    out
}

fn compact(report: &Report) -> String {
    format!(
        "[{}] {} - {} steps in {}",
        if report.success { "PASS" } else { "FAIL" },
        report.scenario,
        report.stats().total_steps,
        human(report.duration)
    )
}
