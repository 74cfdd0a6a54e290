//! Record loader for the profile and password CSV exports.
//!
//! Each file must have a header row. Rows are keyed by the configured
//! [`JoinKey`] column. A row that cannot be used (missing key, missing
//! required value, duplicate key) is skipped and reported as a [`LoadIssue`].
//! An unparsable optional cell only drops that field; the row is kept and the
//! problem reported as [`LoadIssue::InvalidField`]. Only an unreadable file or
//! a header without the key column fails the whole load.

use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use chrono::{DateTime, NaiveDateTime, Utc};
use csv::{ReaderBuilder, StringRecord, Trim};
use tracing::{debug, info, warn};

use crate::config::{DuplicatePolicy, InputConfig, JoinKey};
use crate::errors::LoadError;
use crate::models::{PasswordRecord, UserProfileRecord};

// Header aliases accepted for each logical column. The first name is the
// canonical one.
const EMAIL: &[&str] = &["email"];
pub(crate) const USER_ID: &[&str] = &["userId", "user_id"];
const NAME: &[&str] = &["name"];
const TENANT_ID: &[&str] = &["tenantId", "account"];
const PHONE: &[&str] = &["phoneNumber", "phone"];
const PICTURE: &[&str] = &["profilePictureUrl"];
const METADATA: &[&str] = &["metadata", "additionalFields"];
const VERIFIED: &[&str] = &["verified", "verifyUser"];
const PASSWORD_HASH: &[&str] = &["passwordHash", "hash", "password"];
const HASH_TYPE: &[&str] = &["passwordHashType", "hashType"];
const PROVIDER: &[&str] = &["provider"];
const MFA_SECRET: &[&str] = &["authenticatorAppMfaSecret", "authenticatorSecret"];
const CREATED_AT: &[&str] = &["createdAt"];

// ---------------------------------------------------------------------------
// Issues
// ---------------------------------------------------------------------------

/// A problem found while loading a row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadIssue {
    /// An optional cell could not be parsed. The row was kept without it.
    InvalidField {
        source: String,
        row: usize,
        column: &'static str,
        detail: String,
    },
    /// A required value is missing or unparsable.
    MalformedRow {
        source: String,
        row: usize,
        detail: String,
    },
    /// The row's key was already taken by another row of the same file.
    DuplicateKey {
        source: String,
        key: String,
        /// The row that was skipped.
        row: usize,
        /// The row that was kept.
        kept_row: usize,
    },
}

impl LoadIssue {
    pub fn row(&self) -> usize {
        match self {
            Self::InvalidField { row, .. }
            | Self::MalformedRow { row, .. }
            | Self::DuplicateKey { row, .. } => *row,
        }
    }

    /// Whether the row was left out of the loaded records.
    pub fn skips_row(&self) -> bool {
        !matches!(self, Self::InvalidField { .. })
    }
}

impl fmt::Display for LoadIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidField {
                source,
                row,
                column,
                detail,
            } => write!(f, "{}: row {}: ignored '{}': {}", source, row, column, detail),
            Self::MalformedRow {
                source,
                row,
                detail,
            } => write!(f, "{}: row {} skipped: {}", source, row, detail),
            Self::DuplicateKey {
                source,
                key,
                row,
                kept_row,
            } => write!(
                f,
                "{}: row {} skipped: duplicate key '{}' (kept row {})",
                source, row, key, kept_row
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// Keyed, insertion-ordered record storage
// ---------------------------------------------------------------------------

/// Records that carry their own join key.
pub trait Keyed {
    fn key(&self) -> &str;
    fn row(&self) -> usize;
}

impl Keyed for UserProfileRecord {
    fn key(&self) -> &str {
        &self.key
    }
    fn row(&self) -> usize {
        self.row
    }
}

impl Keyed for PasswordRecord {
    fn key(&self) -> &str {
        &self.key
    }
    fn row(&self) -> usize {
        self.row
    }
}

/// Unique-key records in file order.
#[derive(Debug, Clone)]
pub struct KeyedRecords<T> {
    entries: Vec<T>,
    index: HashMap<String, usize>,
}

impl<T: Keyed> KeyedRecords<T> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            index: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&T> {
        self.index.get(key).map(|&i| &self.entries[i])
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter()
    }

    /// Insert a record whose key is not yet present.
    fn push(&mut self, record: T) {
        self.index.insert(record.key().to_string(), self.entries.len());
        self.entries.push(record);
    }

    /// Replace the record at `key`, keeping its position. Returns the old one.
    fn replace(&mut self, record: T) -> Option<T> {
        let i = *self.index.get(record.key())?;
        Some(std::mem::replace(&mut self.entries[i], record))
    }
}

impl<T: Keyed> Default for KeyedRecords<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> IntoIterator for KeyedRecords<T> {
    type Item = T;
    type IntoIter = std::vec::IntoIter<T>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

/// Records from one file plus the rows that were skipped.
#[derive(Debug, Clone)]
pub struct LoadOutcome<T> {
    pub records: KeyedRecords<T>,
    pub issues: Vec<LoadIssue>,
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Parses profile and password exports into keyed records.
#[derive(Debug, Clone)]
pub struct RecordLoader {
    join_key: JoinKey,
    duplicate_passwords: DuplicatePolicy,
    default_hash_algorithm: Option<String>,
}

impl RecordLoader {
    pub fn new(join_key: JoinKey) -> Self {
        Self {
            join_key,
            duplicate_passwords: DuplicatePolicy::Reject,
            default_hash_algorithm: None,
        }
    }

    pub fn from_config(config: &InputConfig) -> Self {
        Self {
            join_key: config.join_key,
            duplicate_passwords: config.duplicate_passwords,
            default_hash_algorithm: config.default_hash_algorithm.clone(),
        }
    }

    pub fn with_duplicate_passwords(mut self, policy: DuplicatePolicy) -> Self {
        self.duplicate_passwords = policy;
        self
    }

    pub fn with_default_hash_algorithm(mut self, algorithm: impl Into<String>) -> Self {
        self.default_hash_algorithm = Some(algorithm.into());
        self
    }

    /// Load the profile file at `path`.
    pub fn load_profiles<P: AsRef<Path>>(
        &self,
        path: P,
    ) -> Result<LoadOutcome<UserProfileRecord>, LoadError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading profile records");
        let file = open(path)?;
        let outcome = self.read_profiles(file, &path.display().to_string())?;
        info!(
            loaded = outcome.records.len(),
            issues = outcome.issues.len(),
            "profile records loaded"
        );
        Ok(outcome)
    }

    /// Load the password file at `path`.
    pub fn load_passwords<P: AsRef<Path>>(
        &self,
        path: P,
    ) -> Result<LoadOutcome<PasswordRecord>, LoadError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading password records");
        let file = open(path)?;
        let outcome = self.read_passwords(file, &path.display().to_string())?;
        info!(
            loaded = outcome.records.len(),
            issues = outcome.issues.len(),
            "password records loaded"
        );
        Ok(outcome)
    }

    /// Parse profile rows from any reader. `source` names it in issues.
    pub fn read_profiles<R: Read>(
        &self,
        reader: R,
        source: &str,
    ) -> Result<LoadOutcome<UserProfileRecord>, LoadError> {
        let join_key = self.join_key;
        read_keyed(reader, source, join_key, |_, _| false, |record, cols, row, bad| {
            let key = required(record, cols.key, join_key.column())?;
            let email = required(record, cols.find(EMAIL), "email")?;
            let metadata = cell(record, cols.find(METADATA)).and_then(|raw| {
                serde_json::from_str::<serde_json::Value>(raw)
                    .map_err(|e| bad.push(("metadata", format!("not valid JSON: {}", e))))
                    .ok()
            });
            let verified = cell(record, cols.find(VERIFIED)).and_then(|raw| {
                let parsed = parse_bool(raw);
                if parsed.is_none() {
                    bad.push(("verified", format!("expected true or false, got '{}'", raw)));
                }
                parsed
            });

            Ok(UserProfileRecord {
                key: join_key.normalize(key),
                row,
                email: email.to_lowercase(),
                source_id: owned(record, cols.find(USER_ID)),
                name: owned(record, cols.find(NAME)),
                tenant_id: owned(record, cols.find(TENANT_ID)),
                phone_number: owned(record, cols.find(PHONE)),
                profile_picture_url: owned(record, cols.find(PICTURE)),
                metadata,
                verified,
                provider: owned(record, cols.find(PROVIDER)),
                authenticator_app_mfa_secret: owned(record, cols.find(MFA_SECRET)),
            })
        })
    }

    /// Parse password rows from any reader. `source` names it in issues.
    pub fn read_passwords<R: Read>(
        &self,
        reader: R,
        source: &str,
    ) -> Result<LoadOutcome<PasswordRecord>, LoadError> {
        let join_key = self.join_key;
        let default_algorithm = self.default_hash_algorithm.as_deref();
        let prefer_newer: fn(&PasswordRecord, &PasswordRecord) -> bool =
            match self.duplicate_passwords {
                DuplicatePolicy::Reject => |_, _| false,
                DuplicatePolicy::Latest => |new, kept| new.created_at > kept.created_at,
            };

        read_keyed(reader, source, join_key, prefer_newer, |record, cols, row, _| {
            let key = required(record, cols.key, join_key.column())?;
            let hash = required(record, cols.find(PASSWORD_HASH), "passwordHash")?;
            let algorithm = match cell(record, cols.find(HASH_TYPE)) {
                Some(tag) => tag,
                None => default_algorithm
                    .ok_or_else(|| "missing value for 'passwordHashType'".to_string())?,
            };
            let created_at = cell(record, cols.find(CREATED_AT)).and_then(|raw| {
                let parsed = parse_timestamp(raw);
                if parsed.is_none() {
                    warn!(row, value = raw, "unparsable createdAt, treating as unknown");
                }
                parsed
            });

            Ok(PasswordRecord {
                key: join_key.normalize(key),
                row,
                password_hash: hash.to_string(),
                hash_algorithm_tag: algorithm.to_string(),
                created_at,
            })
        })
    }
}

// ---------------------------------------------------------------------------
// CSV plumbing
// ---------------------------------------------------------------------------

/// Header positions for one file.
struct Columns {
    by_name: HashMap<String, usize>,
    key: Option<usize>,
}

impl Columns {
    fn find(&self, names: &[&str]) -> Option<usize> {
        names.iter().find_map(|n| self.by_name.get(*n).copied())
    }
}

fn open(path: &Path) -> Result<File, LoadError> {
    File::open(path).map_err(|source| LoadError::Io {
        path: path.display().to_string(),
        source,
    })
}

/// Shared row loop: parse each record, enforce key uniqueness, collect
/// issues. `prefer(new, kept)` decides whether a duplicate displaces the
/// row already stored. `parse` pushes `(column, detail)` for optional cells
/// it had to drop.
fn read_keyed<R, T, P, F>(
    reader: R,
    source: &str,
    join_key: JoinKey,
    prefer: P,
    parse: F,
) -> Result<LoadOutcome<T>, LoadError>
where
    R: Read,
    T: Keyed,
    P: Fn(&T, &T) -> bool,
    F: Fn(&StringRecord, &Columns, usize, &mut Vec<(&'static str, String)>) -> Result<T, String>,
{
    let mut rdr = ReaderBuilder::new()
        .flexible(true)
        .trim(Trim::All)
        .from_reader(reader);

    let headers = rdr.headers().map_err(|e| LoadError::Csv {
        path: source.to_string(),
        detail: e.to_string(),
    })?;
    let by_name: HashMap<String, usize> = headers
        .iter()
        .enumerate()
        .map(|(i, h)| (h.to_string(), i))
        .collect();
    let key = join_key
        .columns()
        .iter()
        .find_map(|n| by_name.get(*n).copied());
    if key.is_none() {
        return Err(LoadError::MissingColumn {
            path: source.to_string(),
            column: join_key.column().to_string(),
        });
    }
    let cols = Columns { by_name, key };

    let mut records = KeyedRecords::new();
    let mut issues = Vec::new();

    for (i, result) in rdr.records().enumerate() {
        let row = i + 1;
        let record = match result {
            Ok(r) => r,
            Err(e) => {
                if let csv::ErrorKind::Io(_) = e.kind() {
                    return Err(LoadError::Csv {
                        path: source.to_string(),
                        detail: e.to_string(),
                    });
                }
                issues.push(LoadIssue::MalformedRow {
                    source: source.to_string(),
                    row,
                    detail: e.to_string(),
                });
                continue;
            }
        };

        let mut bad_fields = Vec::new();
        let parsed = match parse(&record, &cols, row, &mut bad_fields) {
            Ok(p) => p,
            Err(detail) => {
                warn!(source, row, %detail, "skipping malformed row");
                issues.push(LoadIssue::MalformedRow {
                    source: source.to_string(),
                    row,
                    detail,
                });
                continue;
            }
        };
        for (column, detail) in bad_fields {
            warn!(source, row, column, %detail, "ignoring invalid field");
            issues.push(LoadIssue::InvalidField {
                source: source.to_string(),
                row,
                column,
                detail,
            });
        }

        match records.get(parsed.key()) {
            None => records.push(parsed),
            Some(kept) if prefer(&parsed, kept) => {
                let key = parsed.key().to_string();
                let new_row = parsed.row();
                if let Some(displaced) = records.replace(parsed) {
                    warn!(source, key = %key, row = displaced.row(), kept_row = new_row, "duplicate key, keeping newer row");
                    issues.push(LoadIssue::DuplicateKey {
                        source: source.to_string(),
                        key,
                        row: displaced.row(),
                        kept_row: new_row,
                    });
                }
            }
            Some(kept) => {
                warn!(source, key = parsed.key(), row, kept_row = kept.row(), "duplicate key, skipping row");
                issues.push(LoadIssue::DuplicateKey {
                    source: source.to_string(),
                    key: parsed.key().to_string(),
                    row,
                    kept_row: kept.row(),
                });
            }
        }
    }

    debug!(source, records = records.len(), issues = issues.len(), "csv read complete");
    Ok(LoadOutcome { records, issues })
}

/// Non-empty cell at `idx`.
fn cell(record: &StringRecord, idx: Option<usize>) -> Option<&str> {
    idx.and_then(|i| record.get(i)).filter(|v| !v.is_empty())
}

fn owned(record: &StringRecord, idx: Option<usize>) -> Option<String> {
    cell(record, idx).map(str::to_string)
}

fn required<'r>(
    record: &'r StringRecord,
    idx: Option<usize>,
    column: &str,
) -> Result<&'r str, String> {
    cell(record, idx).ok_or_else(|| format!("missing value for '{}'", column))
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "y" => Some(true),
        "false" | "0" | "no" | "n" => Some(false),
        _ => None,
    }
}

/// Accepts RFC 3339 and the `YYYY-MM-DD HH:MM:SS[.fff]` form database
/// exports use, read as UTC.
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}
