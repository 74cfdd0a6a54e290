//! Result log summary table.

use std::path::Path;

use anyhow::{Context, Result};
use comfy_table::{presets::UTF8_FULL, Cell, Color, ContentArrangement, Table};

use idmigrate_core::models::{MigrationResult, Stage};
use idmigrate_core::result_log::{read_all, PriorResults};

use crate::style;

/// Print the latest entry per key from the result log at `path`.
pub fn run_report(path: &Path, failed_only: bool, as_json: bool) -> Result<()> {
    let entries = read_all(path)
        .with_context(|| format!("failed to read result log {}", path.display()))?;
    let lines = entries.len();
    let latest = PriorResults::from_results(entries);

    let rows: Vec<&MigrationResult> = latest
        .iter()
        .filter(|r| !failed_only || r.is_failed())
        .collect();

    if as_json {
        for row in &rows {
            println!("{}", serde_json::to_string(row)?);
        }
        return Ok(());
    }

    if latest.is_empty() {
        println!("No results recorded in {}.", path.display());
        return Ok(());
    }

    println!();
    println!("{}", style::header("Migration Results"));
    println!(
        "{}",
        style::dim(&format!(
            "{} ({} lines, {} users)",
            path.display(),
            lines,
            latest.len()
        ))
    );
    println!();

    if rows.is_empty() {
        println!("{}", style::success("No failed users."));
    } else {
        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.set_content_arrangement(ContentArrangement::Dynamic);
        table.set_header(vec!["User", "Stage", "Destination ID", "Recorded", "Error"]);

        for result in &rows {
            table.add_row(vec![
                Cell::new(&result.key),
                stage_cell(result.stage),
                Cell::new(result.destination_user_id.as_deref().unwrap_or("—")),
                Cell::new(result.recorded_at.format("%Y-%m-%d %H:%M:%S")),
                Cell::new(truncate(result.error.as_deref().unwrap_or(""), 80)),
            ]);
        }
        println!("{}", table);
    }

    println!();
    println!(
        "  password_set: {}  profile_created: {}  failed: {}",
        latest.count_at(Stage::PasswordSet),
        latest.count_at(Stage::ProfileCreated),
        latest.count_at(Stage::Failed)
    );
    println!();

    Ok(())
}

fn stage_cell(stage: Stage) -> Cell {
    match stage {
        Stage::PasswordSet => Cell::new("✓ password_set").fg(Color::Green),
        Stage::ProfileCreated => Cell::new("● profile_created").fg(Color::Cyan),
        Stage::Failed => Cell::new("✗ failed").fg(Color::Red),
        Stage::Pending => Cell::new("pending"),
    }
}

pub(crate) fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{}...", cut)
    }
}
