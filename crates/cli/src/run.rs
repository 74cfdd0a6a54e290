//! The `run` command: drive a migration with progress output.

use std::process::ExitCode;

use anyhow::{Context, Result};
use dialoguer::Confirm;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

use idmigrate_core::config::AppConfig;
use idmigrate_core::models::{RunSummary, UnitOutcome};
use idmigrate_core::orchestrator::{self, PlannedAction, UnitReport};
use idmigrate_core::{HttpDestinationClient, Orchestrator, PriorResults, ResultLog};

use crate::{prepare_units, print_load_problems, style, Prepared};

pub struct RunOptions {
    pub dry_run: bool,
    pub fresh: bool,
    pub yes: bool,
}

/// Run the migration. Returns a failing exit code when any unit failed.
pub async fn run_migration(config: &AppConfig, opts: RunOptions) -> Result<ExitCode> {
    let mut prepared = prepare_units(config)?;
    print_load_problems(&prepared);

    let prior = if opts.fresh {
        info!("ignoring prior results (--fresh)");
        PriorResults::default()
    } else {
        PriorResults::load(&config.run.result_log).context("failed to read prior results")?
    };

    let planned = orchestrator::plan(&prepared.units, &prior);
    let to_skip = planned
        .iter()
        .filter(|p| p.action == PlannedAction::Skip)
        .count();
    let to_migrate = planned.len() - to_skip;

    println!();
    println!("{}", style::header("Migration"));
    println!("  Destination : {}", config.destination.base_url);
    println!("  Result log  : {}", config.run.result_log.display());
    println!(
        "  Users       : {} ({} to migrate, {} already complete)",
        planned.len(),
        to_migrate,
        to_skip
    );
    println!();

    if opts.dry_run {
        crate::print_plan(&planned);
        println!("{}", style::dim("Dry run: no API calls were made and no results were written."));
        return Ok(ExitCode::SUCCESS);
    }

    if to_migrate == 0 {
        println!("{}", style::dim("Nothing to do: every user is already migrated."));
        let summary = RunSummary {
            skipped: to_skip,
            ..Default::default()
        };
        return Ok(finish(summary, &prepared, None));
    }

    config
        .require_credentials()
        .context("destination credentials are not available")?;

    if !opts.yes {
        let confirmed = Confirm::new()
            .with_prompt(format!(
                "Migrate {} users to {}?",
                to_migrate, config.destination.base_url
            ))
            .default(false)
            .interact()
            .context("failed to read confirmation (use --yes for non-interactive runs)")?;
        if !confirmed {
            println!("{}", style::warn("Migration cancelled. Nothing was sent."));
            return Ok(ExitCode::SUCCESS);
        }
    }

    let client = HttpDestinationClient::from_config(&config.destination, &config.retry)
        .context("failed to create destination client")?;
    let log = ResultLog::open(&config.run.result_log).context("failed to open result log")?;

    let progress = ProgressBar::new(prepared.units.len() as u64);
    progress.set_style(
        ProgressStyle::with_template("{spinner:.blue} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .context("invalid progress template")?
            .progress_chars("=> "),
    );
    let bar = progress.clone();

    let mut orchestrator =
        Orchestrator::new(client, log, prior).with_observer(move |report: &UnitReport<'_>| {
            bar.set_message(report.key.to_string());
            bar.inc(1);
            if report.outcome == UnitOutcome::Failed {
                bar.println(style::error(&format!(
                    "{}: {}",
                    report.key,
                    report.error.unwrap_or("unknown error")
                )));
            }
        });

    let units = std::mem::take(&mut prepared.units);
    let result = orchestrator.run(units).await;
    progress.finish_and_clear();
    let summary = result.context("migration aborted")?;
    Ok(finish(
        summary,
        &prepared,
        Some(orchestrator.run_id().to_string()),
    ))
}

/// Print the final summary and pick the exit code.
fn finish(mut summary: RunSummary, prepared: &Prepared, run_id: Option<String>) -> ExitCode {
    summary.load_issues = prepared.skipped_rows();
    summary.orphan_passwords = prepared.warnings.len();

    println!();
    if summary.has_failures() {
        println!(
            "{}",
            style::error(&format!("Migration finished with failures ({})", summary))
        );
        println!(
            "  Inspect with: idmigrate report --failed-only, then rerun to retry failed users."
        );
    } else {
        println!(
            "{}",
            style::success(&format!("Migration complete ({})", summary))
        );
    }
    if summary.partial > 0 {
        println!("  {} user(s) migrated without a password.", summary.partial);
    }
    if summary.load_issues + summary.orphan_passwords > 0 {
        println!(
            "  {} input row(s) skipped, {} orphan password(s) dropped.",
            summary.load_issues, summary.orphan_passwords
        );
    }
    if let Some(run_id) = run_id {
        println!("  Run ID: {}", run_id);
    }
    println!();

    exit_code(&summary)
}

/// Non-zero when any unit failed.
pub(crate) fn exit_code(summary: &RunSummary) -> ExitCode {
    if summary.has_failures() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_reflects_failures() {
        let mut summary = RunSummary {
            created: 4,
            skipped: 1,
            ..Default::default()
        };
        assert_eq!(exit_code(&summary), ExitCode::SUCCESS);

        summary.record(UnitOutcome::Failed);
        assert_eq!(exit_code(&summary), ExitCode::FAILURE);
    }

    #[test]
    fn test_all_skipped_run_succeeds() {
        let summary = RunSummary {
            skipped: 3,
            ..Default::default()
        };
        assert_eq!(exit_code(&summary), ExitCode::SUCCESS);
        assert_eq!(
            summary.to_string(),
            "created: 0, resumed: 0, failed: 0, skipped: 3"
        );
    }
}
