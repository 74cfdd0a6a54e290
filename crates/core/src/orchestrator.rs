//! Migration orchestrator.
//!
//! Drives each [`MigrationUnit`] through its state machine against a
//! [`DestinationApi`]:
//!
//! 1. Skip the unit if prior results show it complete.
//! 2. Create the destination user (or reuse an existing one).
//! 3. Assign the password, when the unit has one.
//! 4. Append the unit's result to the log before moving on.
//!
//! Units run strictly one after another in input order. A failing unit is
//! recorded and the batch continues; only an unreachable destination or an
//! unwritable result log stops the run.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::destination::DestinationApi;
use crate::errors::MigrationError;
use crate::models::{MigrationResult, MigrationUnit, RunSummary, Stage, UnitOutcome};
use crate::result_log::{PriorResults, ResultLog};

// ---------------------------------------------------------------------------
// Progress reporting
// ---------------------------------------------------------------------------

/// Emitted once per unit after it has been handled.
#[derive(Debug, Clone)]
pub struct UnitReport<'a> {
    /// 0-based position in the batch.
    pub index: usize,
    pub total: usize,
    pub key: &'a str,
    pub outcome: UnitOutcome,
    pub error: Option<&'a str>,
}

type Observer = Box<dyn FnMut(&UnitReport<'_>) + Send>;

// ---------------------------------------------------------------------------
// Planning
// ---------------------------------------------------------------------------

/// What a run would do with a unit, given the prior results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlannedAction {
    /// Already complete; no calls.
    Skip,
    /// Create (or look up) the user, then set the password if there is one.
    Migrate { resume: bool, set_password: bool },
}

/// One line of a dry run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedUnit {
    pub key: String,
    pub action: PlannedAction,
    /// Stage recorded by the latest earlier run, if any.
    pub prior_stage: Option<Stage>,
}

/// Decide what would happen to each unit without touching the destination
/// or the log.
pub fn plan(units: &[MigrationUnit], prior: &PriorResults) -> Vec<PlannedUnit> {
    units
        .iter()
        .map(|unit| {
            let previous = prior.get(unit.key());
            let action = if is_complete(unit, previous) {
                PlannedAction::Skip
            } else {
                PlannedAction::Migrate {
                    resume: previous.is_some(),
                    set_password: !unit.is_partial(),
                }
            };
            PlannedUnit {
                key: unit.key().to_string(),
                action,
                prior_stage: previous.map(|r| r.stage),
            }
        })
        .collect()
}

/// A unit is done once its latest result reached the unit's terminal stage.
fn is_complete(unit: &MigrationUnit, previous: Option<&MigrationResult>) -> bool {
    match previous.map(|r| r.stage) {
        Some(Stage::PasswordSet) => true,
        Some(Stage::ProfileCreated) => unit.is_partial(),
        _ => false,
    }
}

fn advance(stage: &mut Stage, next: Stage) {
    debug_assert!(
        stage.can_advance_to(next),
        "illegal stage transition {} -> {}",
        stage,
        next
    );
    *stage = next;
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Sequential migration driver. Owns the result log for its whole life.
pub struct Orchestrator<A: DestinationApi> {
    api: A,
    log: ResultLog,
    prior: PriorResults,
    run_id: Uuid,
    observer: Option<Observer>,
}

impl<A: DestinationApi> Orchestrator<A> {
    pub fn new(api: A, log: ResultLog, prior: PriorResults) -> Self {
        let run_id = Uuid::new_v4();
        info!(%run_id, log = %log.path().display(), prior = prior.len(), "initializing orchestrator");
        Self {
            api,
            log,
            prior,
            run_id,
            observer: None,
        }
    }

    /// Call `observer` after every unit, skipped ones included.
    pub fn with_observer<F>(mut self, observer: F) -> Self
    where
        F: FnMut(&UnitReport<'_>) + Send + 'static,
    {
        self.observer = Some(Box::new(observer));
        self
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    /// Migrate every unit in order and return the final counts.
    ///
    /// Fails without attempting any unit when the destination rejects the
    /// initial access check. A unit-level failure never ends the run.
    pub async fn run(&mut self, units: Vec<MigrationUnit>) -> Result<RunSummary, MigrationError> {
        let mut summary = RunSummary {
            started_at: Some(Utc::now()),
            ..Default::default()
        };
        let total = units.len();
        info!(run_id = %self.run_id, units = total, "starting migration run");

        if let Err(e) = self.api.check_access().await {
            error!(error = %e, "destination access check failed, no units attempted");
            return Err(MigrationError::DestinationUnavailable(e));
        }

        for (index, unit) in units.iter().enumerate() {
            let (outcome, detail) = self.process(unit).await?;
            summary.record(outcome);
            if unit.is_partial() && matches!(outcome, UnitOutcome::Created | UnitOutcome::Resumed)
            {
                summary.partial += 1;
            }
            if let Some(observer) = self.observer.as_mut() {
                observer(&UnitReport {
                    index,
                    total,
                    key: unit.key(),
                    outcome,
                    error: detail.as_deref(),
                });
            }
        }

        summary.completed_at = Some(Utc::now());
        info!(
            run_id = %self.run_id,
            created = summary.created,
            resumed = summary.resumed,
            failed = summary.failed,
            skipped = summary.skipped,
            results_written = self.log.written(),
            "migration run complete"
        );
        Ok(summary)
    }

    /// Handle one unit. Returns its outcome and the error detail on failure.
    async fn process(
        &mut self,
        unit: &MigrationUnit,
    ) -> Result<(UnitOutcome, Option<String>), MigrationError> {
        let key = unit.key();
        let previous = self.prior.get(key);
        if is_complete(unit, previous) {
            debug!(key, "already complete, skipping");
            return Ok((UnitOutcome::Skipped, None));
        }
        let resuming = previous.is_some();
        let mut stage = Stage::Pending;

        let created = match self.api.create_user(&unit.profile).await {
            Ok(created) => created,
            Err(e) => {
                let detail = e.to_string();
                warn!(key, error = %detail, "profile creation failed");
                self.log
                    .append(&MigrationResult::failed(self.run_id, key, &detail, None))?;
                return Ok((UnitOutcome::Failed, Some(detail)));
            }
        };
        advance(&mut stage, Stage::ProfileCreated);

        if let Some(ref password) = unit.password {
            if let Err(e) = self
                .api
                .set_password(
                    &created.id,
                    &password.password_hash,
                    &password.hash_algorithm_tag,
                )
                .await
            {
                let detail = e.to_string();
                warn!(key, user_id = %created.id, error = %detail, "password assignment failed");
                self.log.append(&MigrationResult::failed(
                    self.run_id,
                    key,
                    &detail,
                    Some(&created.id),
                ))?;
                return Ok((UnitOutcome::Failed, Some(detail)));
            }
            advance(&mut stage, Stage::PasswordSet);
        }

        self.log
            .append(&MigrationResult::reached(self.run_id, key, stage, &created.id))?;

        let outcome = if created.already_existed || resuming {
            UnitOutcome::Resumed
        } else {
            UnitOutcome::Created
        };
        debug!(key, user_id = %created.id, stage = %stage, %outcome, "unit migrated");
        Ok((outcome, None))
    }
}
