use std::io::Write;

use owo_colors::OwoColorize;
use pagefield_core::{ContributorStats, FinalResult, HistoryStats, HistorySummary};

/// Whether to use colored output.
#[derive(Debug, Clone, Copy)]
pub struct ColorMode(pub bool);

impl ColorMode {
    pub fn enabled(&self) -> bool {
        self.0
    }
}

pub fn print_document_completed(
    w: &mut dyn Write,
    name: &str,
    rows: usize,
    elapsed: f64,
    skipped: &[usize],
    color: ColorMode,
) -> std::io::Result<()> {
    let line = format!("{name}: {rows} rows in {elapsed:.2}s");
    if color.enabled() {
        write!(w, "{} {}", "✓".green(), line)?;
    } else {
        write!(w, "[OK] {line}")?;
    }
    if !skipped.is_empty() {
        let pages = join_pages(skipped);
        if color.enabled() {
            write!(w, " {}", format!("(skipped pages {pages})").yellow())?;
        } else {
            write!(w, " (skipped pages {pages})")?;
        }
    }
    writeln!(w)
}

pub fn print_document_failed(
    w: &mut dyn Write,
    name: &str,
    error: &str,
    color: ColorMode,
) -> std::io::Result<()> {
    if color.enabled() {
        writeln!(w, "{} {}: {}", "✗".red(), name, error.red())
    } else {
        writeln!(w, "[FAILED] {name}: {error}")
    }
}

/// Print the job summary once the final message arrives.
pub fn print_summary(
    w: &mut dyn Write,
    result: &FinalResult,
    artifact: Option<&str>,
    color: ColorMode,
) -> std::io::Result<()> {
    writeln!(w)?;
    let header = "Extraction summary";
    if color.enabled() {
        writeln!(w, "{}", header.bold())?;
    } else {
        writeln!(w, "{header}")?;
    }
    writeln!(
        w,
        "  Documents:   {} ({} failed)",
        result.documents_total, result.documents_failed
    )?;
    writeln!(w, "  Rows:        {}", result.total_rows)?;
    writeln!(w, "  Total time:  {:.2}s", result.total_time)?;
    writeln!(w, "  Avg per row: {:.2}s", result.avg_time_per_row)?;

    for (name, pages) in &result.skipped_pages {
        let msg = format!("  {name}: skipped pages {}", join_pages(pages));
        if color.enabled() {
            writeln!(w, "{}", msg.yellow())?;
        } else {
            writeln!(w, "{msg}")?;
        }
    }

    match artifact {
        Some(path) if color.enabled() => writeln!(w, "  Output:      {}", path.cyan())?,
        Some(path) => writeln!(w, "  Output:      {path}")?,
        None if color.enabled() => writeln!(w, "  {}", "No rows extracted".dimmed())?,
        None => writeln!(w, "  No rows extracted")?,
    }
    Ok(())
}

pub fn print_error(w: &mut dyn Write, message: &str, color: ColorMode) -> std::io::Result<()> {
    if color.enabled() {
        writeln!(w, "{} {}", "Error:".red().bold(), message)
    } else {
        writeln!(w, "Error: {message}")
    }
}

pub fn print_history(
    w: &mut dyn Write,
    rows: &[HistorySummary],
    color: ColorMode,
) -> std::io::Result<()> {
    if rows.is_empty() {
        return writeln!(w, "No history recorded.");
    }
    for row in rows {
        let stamp = if color.enabled() {
            row.timestamp.dimmed().to_string()
        } else {
            row.timestamp.clone()
        };
        writeln!(
            w,
            "{stamp}  {:<16} {:<40} {:>6} rows  {:>8.2}s  ({:.2}s/row)",
            row.username, row.document_name, row.total_rows, row.total_time, row.avg_time_per_row
        )?;
    }
    Ok(())
}

pub fn print_stats(
    w: &mut dyn Write,
    stats: &HistoryStats,
    contributors: &[ContributorStats],
    color: ColorMode,
) -> std::io::Result<()> {
    writeln!(w, "Users:     {}", stats.total_users)?;
    writeln!(w, "Documents: {}", stats.total_documents_processed)?;
    writeln!(w, "Rows:      {}", stats.total_rows_processed)?;
    if contributors.is_empty() {
        return Ok(());
    }
    writeln!(w)?;
    for c in contributors {
        let name = if color.enabled() {
            c.username.bold().to_string()
        } else {
            c.username.clone()
        };
        writeln!(
            w,
            "{name}: {} documents, {} rows, {:.2}s/row",
            c.total_documents, c.total_rows, c.avg_time_per_row
        )?;
    }
    Ok(())
}

fn join_pages(pages: &[usize]) -> String {
    pages
        .iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
