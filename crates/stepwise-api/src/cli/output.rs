//! Shared output helpers for CLI commands.

use chrono::{DateTime, Utc};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use serde_json::Value;

pub fn print_json(value: &Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn table(headers: &[&str]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(
            headers
                .iter()
                .enumerate()
                .map(|(i, h)| {
                    let cell = Cell::new(h);
                    if i == 0 { cell.fg(Color::Cyan) } else { cell }
                })
                .collect::<Vec<_>>(),
        );
    table
}

pub fn print_table(table: &Table) {
    println!();
    println!("{table}");
    println!();
}

pub fn success(message: &str) {
    println!();
    println!("  {} {message}", style("*").green().bold());
}

pub fn empty(message: &str, hint: &str) {
    println!();
    println!("  {message}");
    if !hint.is_empty() {
        println!("  {}", style(hint).dim());
    }
    println!();
}

pub fn timestamp(dt: &DateTime<Utc>) -> String {
    dt.format("%Y-%m-%d %H:%M:%S").to_string()
}

pub fn optional_timestamp(dt: Option<&DateTime<Utc>>) -> String {
    dt.map(timestamp).unwrap_or_else(|| "-".to_string())
}

/// Colorize a status string by how it ended.
pub fn status_cell(status: &str) -> Cell {
    let cell = Cell::new(status);
    match status {
        "completed" | "succeeded" | "published" => cell.fg(Color::Green),
        "failed" | "cancelled" | "deprecated" => cell.fg(Color::Red),
        "waiting" | "retrying" => cell.fg(Color::Yellow),
        _ => cell,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_timestamp_format() {
        let dt = Utc.with_ymd_and_hms(2026, 3, 14, 9, 26, 53).unwrap();
        assert_eq!(timestamp(&dt), "2026-03-14 09:26:53");
        assert_eq!(optional_timestamp(None), "-");
    }
}
