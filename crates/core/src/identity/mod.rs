//! Identity mapping: joins source profile records with their password
//! credentials into migration units.
//!
//! The join is a full outer join on the configured key:
//! 1. Key in both files: one complete unit.
//! 2. Key only in the profile file: a partial (profile-only) unit.
//! 3. Key only in the password file: dropped with a [`JoinWarning`].

pub mod mapper;

pub use mapper::{IdentityMapper, JoinOutcome, JoinWarning};
