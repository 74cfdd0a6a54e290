//! idmigrate command-line migration tool.
//!
//! Provides subcommands for generating and validating a configuration,
//! previewing how the exported records join, running the migration against
//! the destination tenant, and reporting on the result log.

mod report;
mod run;
mod style;

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use idmigrate_core::config::{AppConfig, RunConfig};
use idmigrate_core::identity::JoinWarning;
use idmigrate_core::loader::LoadIssue;
use idmigrate_core::models::MigrationUnit;
use idmigrate_core::orchestrator::{self, PlannedAction, PlannedUnit};
use idmigrate_core::{IdentityMapper, PriorResults, RecordLoader};

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// idmigrate command-line migration tool.
#[derive(Parser, Debug)]
#[command(
    name = "idmigrate",
    version,
    about = "Migrate user profiles and password hashes between identity tenants"
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, global = true, default_value = "./idmigrate.toml")]
    config: PathBuf,

    /// Log level override (trace, debug, info, warn, error).
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate a default configuration file.
    Init {
        /// Output path for the generated config file.
        #[arg(short, long, default_value = "./idmigrate.toml")]
        output: PathBuf,

        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },

    /// Validate a configuration file.
    Validate,

    /// Load and join the input files and show what a run would do.
    Plan {
        /// Ignore results from earlier runs.
        #[arg(long)]
        fresh: bool,

        /// Maximum number of users to list.
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Migrate users to the destination tenant.
    Run {
        /// Walk the input without calling the API or writing results.
        #[arg(long)]
        dry_run: bool,

        /// Ignore results from earlier runs.
        #[arg(long)]
        fresh: bool,

        /// Do not ask for confirmation.
        #[arg(short, long)]
        yes: bool,
    },

    /// Summarize the result log (latest entry per user).
    Report {
        /// Only show users whose latest result is a failure.
        #[arg(long)]
        failed_only: bool,

        /// Print one JSON object per line instead of a table.
        #[arg(long)]
        json: bool,
    },
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{}", style::error(&format!("Error: {:#}", e)));
            ExitCode::FAILURE
        }
    }
}

async fn dispatch(cli: Cli) -> Result<ExitCode> {
    match cli.command {
        Commands::Init { output, force } => {
            let _guard = init_logging(cli.log_level.as_deref(), None)?;
            cmd_init(&output, force)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Validate => {
            let _guard = init_logging(cli.log_level.as_deref(), None)?;
            cmd_validate(&cli.config)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Plan { fresh, limit } => {
            let config = load_config(&cli.config)?;
            let _guard = init_logging(cli.log_level.as_deref(), Some(&config.run))?;
            cmd_plan(&config, fresh, limit)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Run {
            dry_run,
            fresh,
            yes,
        } => {
            let config = load_config(&cli.config)?;
            // Held until exit so the log file is flushed.
            let _guard = init_logging(cli.log_level.as_deref(), Some(&config.run))?;
            run::run_migration(
                &config,
                run::RunOptions {
                    dry_run,
                    fresh,
                    yes,
                },
            )
            .await
        }
        Commands::Report { failed_only, json } => {
            let config = load_config(&cli.config)?;
            let _guard = init_logging(cli.log_level.as_deref(), None)?;
            report::run_report(&config.run.result_log, failed_only, json)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

/// Install the tracing subscriber.
///
/// Level precedence: `--log-level`, then `RUST_LOG`, then the config's
/// `run.log_level`, then `warn`. When the config names a log file, a plain
/// text copy of the output is appended there as well.
fn init_logging(flag: Option<&str>, run: Option<&RunConfig>) -> Result<Option<WorkerGuard>> {
    let filter = build_filter(flag, run.map(|r| r.log_level.as_str()));

    let console = tracing_subscriber::fmt::layer()
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr);

    let (file_layer, guard) = match run.and_then(|r| r.log_file.as_ref()) {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            let (writer, guard) = tracing_appender::non_blocking(file);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file_layer)
        .init();

    Ok(guard)
}

fn build_filter(flag: Option<&str>, config_level: Option<&str>) -> EnvFilter {
    if let Some(level) = flag {
        return EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    }
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config_level.unwrap_or("warn")))
        .unwrap_or_else(|_| EnvFilter::new("warn"))
}

// ---------------------------------------------------------------------------
// Config and input helpers
// ---------------------------------------------------------------------------

fn load_config(path: &Path) -> Result<AppConfig> {
    let mut config =
        AppConfig::load_from_file(path).context("failed to load configuration file")?;
    config
        .resolve_env_vars()
        .context("failed to resolve environment variables")?;
    config.validate().context("configuration validation failed")?;
    Ok(config)
}

/// Loaded and joined input, plus everything that was skipped on the way.
pub(crate) struct Prepared {
    pub units: Vec<MigrationUnit>,
    pub issues: Vec<LoadIssue>,
    pub warnings: Vec<JoinWarning>,
    pub profiles: usize,
    pub passwords: usize,
}

impl Prepared {
    /// Input rows left out of the units. Rows kept without a bad field are
    /// not counted.
    pub fn skipped_rows(&self) -> usize {
        self.issues.iter().filter(|i| i.skips_row()).count()
    }
}

pub(crate) fn prepare_units(config: &AppConfig) -> Result<Prepared> {
    let loader = RecordLoader::from_config(&config.input);
    let profiles = loader
        .load_profiles(&config.input.profiles)
        .context("failed to load profile records")?;
    let passwords = loader
        .load_passwords(&config.input.passwords)
        .context("failed to load password records")?;

    let profile_count = profiles.records.len();
    let password_count = passwords.records.len();
    let mut issues = profiles.issues;
    issues.extend(passwords.issues);

    let joined = IdentityMapper::join(profiles.records, passwords.records);
    Ok(Prepared {
        units: joined.units,
        issues,
        warnings: joined.warnings,
        profiles: profile_count,
        passwords: password_count,
    })
}

pub(crate) fn print_load_problems(prepared: &Prepared) {
    for issue in &prepared.issues {
        println!("{}", style::warn(&issue.to_string()));
    }
    for warning in &prepared.warnings {
        println!("{}", style::warn(&warning.to_string()));
    }
}

pub(crate) fn print_plan(planned: &[PlannedUnit]) {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["User", "Last stage", "Action"]);

    for unit in planned {
        let action = match unit.action {
            PlannedAction::Skip => "skip (complete)".to_string(),
            PlannedAction::Migrate {
                resume,
                set_password,
            } => {
                let steps = if set_password {
                    "create + password"
                } else {
                    "create only"
                };
                if resume {
                    format!("{} (resume)", steps)
                } else {
                    steps.to_string()
                }
            }
        };
        table.add_row(vec![
            unit.key.clone(),
            unit.prior_stage
                .map(style::stage)
                .unwrap_or_else(|| style::dim("—")),
            action,
        ]);
    }

    println!("{}", table);
    println!();
}

// ---------------------------------------------------------------------------
// Subcommand implementations
// ---------------------------------------------------------------------------

const DEFAULT_CONFIG: &str = r#"# idmigrate configuration
# Credentials are never stored here: the *_env fields name environment
# variables that hold them.

[run]
log_level = "info"
result_log = "./migration-results.jsonl"
# log_file = "./migration.log"

[input]
profiles = "./account_data/user_details.csv"
passwords = "./account_data/user_passwords.csv"
join_key = "email"               # or "source_id"
duplicate_passwords = "reject"   # or "latest"
# default_hash_algorithm = "bcrypt"

[destination]
base_url = "https://api.us.frontegg.com"
client_id_env = "DEST_CLIENT_ID"
secret_env = "DEST_SECRET"
timeout_secs = 30

[destination.paths]
auth = "/auth/vendor"
create_user = "/identity/resources/users/v2"
user_by_email = "/identity/resources/users/v1/email"
set_password = "/identity/resources/users/v1/{userId}/password"

[retry]
max_attempts = 3
base_delay_ms = 500
max_delay_ms = 8000
"#;

fn cmd_init(output: &Path, force: bool) -> Result<()> {
    if output.exists() && !force {
        anyhow::bail!(
            "file already exists: {}. Use --force or choose a different path.",
            output.display()
        );
    }

    std::fs::write(output, DEFAULT_CONFIG).context("failed to write config file")?;

    println!(
        "{}",
        style::success(&format!(
            "Default configuration written to {}",
            output.display()
        ))
    );
    println!();
    println!("Next steps:");
    println!("  1. Point [input] at the profile and password exports");
    println!("  2. Set DEST_CLIENT_ID and DEST_SECRET for the destination tenant");
    println!(
        "  3. Validate with: idmigrate validate --config {}",
        output.display()
    );
    println!(
        "  4. Preview with:  idmigrate plan --config {}",
        output.display()
    );

    Ok(())
}

fn cmd_validate(config_path: &Path) -> Result<()> {
    println!("Validating configuration: {}", config_path.display());
    println!();

    let mut config =
        AppConfig::load_from_file(config_path).context("failed to parse configuration")?;
    println!("  [OK] TOML structure is valid");

    config
        .resolve_env_vars()
        .context("failed to resolve environment variables")?;
    println!("  [OK] Environment variable references processed");

    match config.validate() {
        Ok(()) => println!("  [OK] All required fields are valid"),
        Err(e) => {
            println!("  [FAIL] Validation error: {}", e);
            anyhow::bail!("configuration validation failed");
        }
    }

    for input in [&config.input.profiles, &config.input.passwords] {
        if input.exists() {
            println!("  [OK] Input file found: {}", input.display());
        } else {
            println!("  [WARN] Input file not found: {}", input.display());
        }
    }

    println!();
    println!("Configuration summary:");
    println!("  Destination   : {}", config.destination.base_url);
    println!(
        "  Client ID     : {}",
        if config.destination.client_id.is_some() {
            "set"
        } else {
            "NOT SET"
        }
    );
    println!(
        "  Secret        : {}",
        if config.destination.secret.is_some() {
            "set"
        } else {
            "NOT SET"
        }
    );
    println!("  Join key      : {}", config.input.join_key);
    println!("  Result log    : {}", config.run.result_log.display());
    println!(
        "  Retry         : {} attempts, {}ms base, {}ms cap",
        config.retry.max_attempts, config.retry.base_delay_ms, config.retry.max_delay_ms
    );
    println!();

    if let Err(e) = config.require_credentials() {
        println!("{}", style::warn(&e.to_string()));
        println!("Configuration is valid, but `run` needs the credentials above.");
    } else {
        println!("Configuration is valid.");
    }

    Ok(())
}

fn cmd_plan(config: &AppConfig, fresh: bool, limit: usize) -> Result<()> {
    let prepared = prepare_units(config)?;
    let prior = if fresh {
        PriorResults::default()
    } else {
        PriorResults::load(&config.run.result_log).context("failed to read prior results")?
    };
    let planned = orchestrator::plan(&prepared.units, &prior);

    println!();
    println!("{}", style::header("Input"));
    println!("  Profiles loaded  : {}", prepared.profiles);
    println!("  Passwords loaded : {}", prepared.passwords);
    println!("  Rows skipped     : {}", prepared.skipped_rows());
    println!("  Orphan passwords : {}", prepared.warnings.len());
    println!();

    if !prepared.issues.is_empty() || !prepared.warnings.is_empty() {
        print_load_problems(&prepared);
        println!();
    }

    let partial = prepared.units.iter().filter(|u| u.is_partial()).count();
    let skip = planned
        .iter()
        .filter(|p| p.action == PlannedAction::Skip)
        .count();
    let resume = planned
        .iter()
        .filter(|p| matches!(p.action, PlannedAction::Migrate { resume: true, .. }))
        .count();

    println!("{}", style::header("Plan"));
    println!("  Users            : {}", planned.len());
    println!("  Without password : {}", partial);
    println!("  Already complete : {}", skip);
    println!("  To resume        : {}", resume);
    println!("  New              : {}", planned.len() - skip - resume);
    println!();

    if !planned.is_empty() {
        let shown = planned.len().min(limit);
        print_plan(&planned[..shown]);
        if shown < planned.len() {
            println!(
                "{}",
                style::dim(&format!("... {} more (use --limit)", planned.len() - shown))
            );
            println!();
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config: AppConfig = toml::from_str(DEFAULT_CONFIG).expect("default config parses");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_fields_are_not_skipped_rows() {
        let prepared = Prepared {
            units: Vec::new(),
            issues: vec![
                LoadIssue::InvalidField {
                    source: "p.csv".into(),
                    row: 1,
                    column: "metadata",
                    detail: "not valid JSON".into(),
                },
                LoadIssue::MalformedRow {
                    source: "p.csv".into(),
                    row: 2,
                    detail: "missing value for 'email'".into(),
                },
            ],
            warnings: Vec::new(),
            profiles: 1,
            passwords: 0,
        };
        assert_eq!(prepared.skipped_rows(), 1);
    }

    #[test]
    fn test_cli_parses_run_flags() {
        let cli = Cli::parse_from(["idmigrate", "-c", "x.toml", "run", "--dry-run", "--yes"]);
        assert_eq!(cli.config, PathBuf::from("x.toml"));
        match cli.command {
            Commands::Run {
                dry_run,
                fresh,
                yes,
            } => {
                assert!(dry_run);
                assert!(!fresh);
                assert!(yes);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
