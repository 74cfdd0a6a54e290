//! Core join logic.
//!
//! [`IdentityMapper`] consumes the loader's keyed records and produces
//! [`MigrationUnit`]s in profile-file order, so reruns over the same input
//! walk units in the same sequence.

use std::collections::HashMap;
use std::fmt;

use tracing::{debug, info, warn};

use crate::loader::KeyedRecords;
use crate::models::{MigrationUnit, PasswordRecord, UserProfileRecord};

/// A password record that could not be attached to any profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinWarning {
    /// No profile row carries this key; credentials cannot be attached to a
    /// user that will not exist.
    OrphanPassword { key: String, row: usize },
}

impl fmt::Display for JoinWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OrphanPassword { key, row } => write!(
                f,
                "password row {} for '{}' has no matching profile, dropped",
                row, key
            ),
        }
    }
}

/// Units ready for migration plus the records that were dropped.
#[derive(Debug, Clone, Default)]
pub struct JoinOutcome {
    pub units: Vec<MigrationUnit>,
    pub warnings: Vec<JoinWarning>,
}

impl JoinOutcome {
    /// Number of units with no password to migrate.
    pub fn partial_count(&self) -> usize {
        self.units.iter().filter(|u| u.is_partial()).count()
    }
}

/// Full outer join of profiles and passwords on their key.
pub struct IdentityMapper;

impl IdentityMapper {
    pub fn join(
        profiles: KeyedRecords<UserProfileRecord>,
        passwords: KeyedRecords<PasswordRecord>,
    ) -> JoinOutcome {
        info!(
            profiles = profiles.len(),
            passwords = passwords.len(),
            "joining profile and password records"
        );

        // Orphans first, in password-file order, while both sides are intact.
        let warnings: Vec<JoinWarning> = passwords
            .iter()
            .filter(|pw| !profiles.contains_key(&pw.key))
            .map(|pw| {
                warn!(key = %pw.key, row = pw.row, "orphan password record dropped");
                JoinWarning::OrphanPassword {
                    key: pw.key.clone(),
                    row: pw.row,
                }
            })
            .collect();

        let mut by_key: HashMap<String, PasswordRecord> = passwords
            .into_iter()
            .map(|pw| (pw.key.clone(), pw))
            .collect();

        let units: Vec<MigrationUnit> = profiles
            .into_iter()
            .map(|profile| {
                let password = by_key.remove(&profile.key);
                if password.is_none() {
                    debug!(key = %profile.key, "no password for profile, unit is partial");
                }
                MigrationUnit { profile, password }
            })
            .collect();

        let outcome = JoinOutcome { units, warnings };
        info!(
            units = outcome.units.len(),
            partial = outcome.partial_count(),
            orphans = outcome.warnings.len(),
            "join complete"
        );
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JoinKey;
    use crate::loader::RecordLoader;

    fn join(profiles_csv: &str, passwords_csv: &str) -> JoinOutcome {
        let loader = RecordLoader::new(JoinKey::Email);
        let profiles = loader
            .read_profiles(profiles_csv.as_bytes(), "profiles.csv")
            .unwrap();
        let passwords = loader
            .read_passwords(passwords_csv.as_bytes(), "passwords.csv")
            .unwrap();
        IdentityMapper::join(profiles.records, passwords.records)
    }

    #[test]
    fn test_keys_in_both_files_form_complete_units() {
        let out = join(
            "email,name\na@x.com,A\nb@x.com,B\nc@x.com,C\n",
            "email,passwordHash,passwordHashType\nc@x.com,H3,bcrypt\na@x.com,H1,bcrypt\nb@x.com,H2,bcrypt\n",
        );
        assert!(out.warnings.is_empty());
        assert_eq!(out.units.len(), 3);
        for unit in &out.units {
            let pw = unit.password.as_ref().expect("password attached");
            assert_eq!(pw.key, unit.key());
        }
        assert_eq!(out.partial_count(), 0);
    }

    #[test]
    fn test_units_follow_profile_order() {
        let out = join(
            "email\nz@x.com\na@x.com\nm@x.com\n",
            "email,passwordHash,passwordHashType\na@x.com,H,md5\n",
        );
        let keys: Vec<&str> = out.units.iter().map(MigrationUnit::key).collect();
        assert_eq!(keys, vec!["z@x.com", "a@x.com", "m@x.com"]);
    }

    #[test]
    fn test_profile_only_key_is_partial() {
        let out = join(
            "email,name\na@x.com,A\nb@x.com,B\n",
            "email,passwordHash,passwordHashType\na@x.com,H1,bcrypt\n",
        );
        assert_eq!(out.units.len(), 2);
        assert!(!out.units[0].is_partial());
        assert!(out.units[1].is_partial());
        assert_eq!(out.partial_count(), 1);
    }

    #[test]
    fn test_password_only_key_is_dropped_with_warning() {
        let out = join(
            "email\na@x.com\n",
            "email,passwordHash,passwordHashType\nghost@x.com,H9,bcrypt\na@x.com,H1,bcrypt\nspook@x.com,H8,bcrypt\n",
        );
        assert_eq!(out.units.len(), 1);
        assert_eq!(
            out.warnings,
            vec![
                JoinWarning::OrphanPassword {
                    key: "ghost@x.com".into(),
                    row: 1
                },
                JoinWarning::OrphanPassword {
                    key: "spook@x.com".into(),
                    row: 3
                },
            ]
        );
        assert!(out.warnings[0].to_string().contains("no matching profile"));
    }

    #[test]
    fn test_join_key_case_insensitive_for_email() {
        let out = join(
            "email\nAlice@Example.com\n",
            "email,passwordHash,passwordHashType\nalice@example.COM,H,bcrypt\n",
        );
        assert!(out.warnings.is_empty());
        assert!(!out.units[0].is_partial());
    }

    #[test]
    fn test_empty_inputs() {
        let out = IdentityMapper::join(KeyedRecords::new(), KeyedRecords::new());
        assert!(out.units.is_empty());
        assert!(out.warnings.is_empty());
    }
}
