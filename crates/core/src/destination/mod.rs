//! Destination tenant API for idmigrate.
//!
//! [`DestinationApi`] is the seam the orchestrator drives; the production
//! implementation is [`HttpDestinationClient`]. Every call is awaited to
//! completion, retries included, before the caller moves on.

pub mod client;
pub mod retry;

pub use client::HttpDestinationClient;
pub use retry::RetryPolicy;

use crate::errors::ClientError;
use crate::models::UserProfileRecord;

/// A user as it exists in the destination tenant after `create_user`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedUser {
    /// Destination user ID.
    pub id: String,
    /// `true` when the user was already there and its ID was looked up
    /// instead of creating a duplicate.
    pub already_existed: bool,
}

/// Administrative operations the migration needs from the destination.
#[allow(async_fn_in_trait)]
pub trait DestinationApi {
    /// Confirm the credentials work. Called once before any unit.
    async fn check_access(&self) -> Result<(), ClientError>;

    /// Create the user, or resolve the existing user's ID on conflict.
    async fn create_user(&self, profile: &UserProfileRecord) -> Result<CreatedUser, ClientError>;

    /// Assign a pre-hashed password to a destination user.
    async fn set_password(
        &self,
        user_id: &str,
        password_hash: &str,
        hash_algorithm_tag: &str,
    ) -> Result<(), ClientError>;
}
