//! Domain model types used throughout idmigrate.
//!
//! Records are immutable once loaded. A [`MigrationResult`] is written once
//! per processed unit and never touched again.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Input records
// ---------------------------------------------------------------------------

/// One row of the profile file.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfileRecord {
    /// Normalized join key.
    pub key: String,
    /// 1-based data row number in the source file.
    pub row: usize,
    pub email: String,
    /// User ID in the source tenant.
    pub source_id: Option<String>,
    pub name: Option<String>,
    /// Sub-tenant the user belongs to in the destination account.
    pub tenant_id: Option<String>,
    pub phone_number: Option<String>,
    pub profile_picture_url: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub verified: Option<bool>,
    /// Login provider in the source tenant (e.g. `local`, `google`).
    pub provider: Option<String>,
    /// TOTP seed for an enrolled authenticator app.
    pub authenticator_app_mfa_secret: Option<String>,
}

impl fmt::Debug for UserProfileRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserProfileRecord")
            .field("key", &self.key)
            .field("row", &self.row)
            .field("email", &self.email)
            .field("source_id", &self.source_id)
            .field("name", &self.name)
            .field("tenant_id", &self.tenant_id)
            .field("phone_number", &self.phone_number)
            .field("profile_picture_url", &self.profile_picture_url)
            .field("metadata", &self.metadata)
            .field("verified", &self.verified)
            .field("provider", &self.provider)
            .field(
                "authenticator_app_mfa_secret",
                &self.authenticator_app_mfa_secret.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

/// One row of the password file.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct PasswordRecord {
    /// Normalized join key.
    pub key: String,
    /// 1-based data row number in the source file.
    pub row: usize,
    pub password_hash: String,
    /// Hashing scheme understood by the destination (e.g. `bcrypt`).
    pub hash_algorithm_tag: String,
    pub created_at: Option<DateTime<Utc>>,
}

impl fmt::Debug for PasswordRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PasswordRecord")
            .field("key", &self.key)
            .field("row", &self.row)
            .field("password_hash", &"<redacted>")
            .field("hash_algorithm_tag", &self.hash_algorithm_tag)
            .field("created_at", &self.created_at)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Migration unit
// ---------------------------------------------------------------------------

/// A profile plus its password, if one was supplied. The unit of work and
/// of retry.
#[derive(Debug, Clone, PartialEq)]
pub struct MigrationUnit {
    pub profile: UserProfileRecord,
    pub password: Option<PasswordRecord>,
}

impl MigrationUnit {
    pub fn key(&self) -> &str {
        &self.profile.key
    }

    /// Profile-only unit: valid, but no password step will run.
    pub fn is_partial(&self) -> bool {
        self.password.is_none()
    }

    /// The stage at which this unit has nothing left to do.
    pub fn terminal_stage(&self) -> Stage {
        if self.is_partial() {
            Stage::ProfileCreated
        } else {
            Stage::PasswordSet
        }
    }
}

// ---------------------------------------------------------------------------
// Stage
// ---------------------------------------------------------------------------

/// Per-unit migration state.
///
/// `Pending → ProfileCreated → PasswordSet`, or `Failed` from any
/// non-terminal stage.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Pending,
    ProfileCreated,
    PasswordSet,
    Failed,
}

impl Stage {
    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_advance_to(self, next: Stage) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::ProfileCreated)
                | (Self::ProfileCreated, Self::PasswordSet)
                | (Self::Pending, Self::Failed)
                | (Self::ProfileCreated, Self::Failed)
        )
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::ProfileCreated => write!(f, "profile_created"),
            Self::PasswordSet => write!(f, "password_set"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

// ---------------------------------------------------------------------------
// Result
// ---------------------------------------------------------------------------

/// The durable outcome of processing one unit. One JSON line in the log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MigrationResult {
    pub key: String,
    pub stage: Stage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_user_id: Option<String>,
    pub run_id: Uuid,
    pub recorded_at: DateTime<Utc>,
}

impl MigrationResult {
    /// A unit that reached `stage` without error.
    pub fn reached(run_id: Uuid, key: &str, stage: Stage, destination_user_id: &str) -> Self {
        Self {
            key: key.to_string(),
            stage,
            error: None,
            destination_user_id: Some(destination_user_id.to_string()),
            run_id,
            recorded_at: Utc::now(),
        }
    }

    /// A unit that stopped with an error.
    pub fn failed(
        run_id: Uuid,
        key: &str,
        error: impl Into<String>,
        destination_user_id: Option<&str>,
    ) -> Self {
        Self {
            key: key.to_string(),
            stage: Stage::Failed,
            error: Some(error.into()),
            destination_user_id: destination_user_id.map(str::to_string),
            run_id,
            recorded_at: Utc::now(),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.stage == Stage::Failed
    }
}

// ---------------------------------------------------------------------------
// Summary
// ---------------------------------------------------------------------------

/// How a unit ended up in this run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UnitOutcome {
    /// A new destination user was created.
    Created,
    /// An existing destination user, or an earlier run's progress, was reused.
    Resumed,
    Failed,
    /// Already complete according to prior results; nothing was sent.
    Skipped,
}

impl fmt::Display for UnitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Resumed => write!(f, "resumed"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

/// Final counts for a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunSummary {
    pub created: usize,
    pub resumed: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Units that completed without a password step.
    pub partial: usize,
    /// Input rows skipped by the loader.
    pub load_issues: usize,
    /// Password rows with no matching profile.
    pub orphan_passwords: usize,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl RunSummary {
    pub fn record(&mut self, outcome: UnitOutcome) {
        match outcome {
            UnitOutcome::Created => self.created += 1,
            UnitOutcome::Resumed => self.resumed += 1,
            UnitOutcome::Failed => self.failed += 1,
            UnitOutcome::Skipped => self.skipped += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.created + self.resumed + self.failed + self.skipped
    }

    pub fn has_failures(&self) -> bool {
        self.failed > 0
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "created: {}, resumed: {}, failed: {}, skipped: {}",
            self.created, self.resumed, self.failed, self.skipped
        )
    }
}
