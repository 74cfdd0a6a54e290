//! idmigrate core library.
//!
//! This crate provides the building blocks for moving user profiles and
//! password hashes from one identity tenant to another: configuration,
//! tabular record loading, identity joining, the destination API client,
//! the durable result log, and the migration orchestrator.

pub mod config;
pub mod destination;
pub mod errors;
pub mod identity;
pub mod loader;
pub mod models;
pub mod orchestrator;
pub mod result_log;

// Re-exports for convenience.
pub use config::AppConfig;
pub use destination::{DestinationApi, HttpDestinationClient};
pub use identity::IdentityMapper;
pub use loader::RecordLoader;
pub use orchestrator::Orchestrator;
pub use result_log::{PriorResults, ResultLog};
