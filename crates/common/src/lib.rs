#![deny(missing_docs)]

//! Shared error taxonomy, typed identifiers, and settings for SpanFlow crates.
//!
//! Architecture role:
//! - provides common [`SfqError`] / [`Result`] contracts
//! - defines the strongly-typed identifiers exchanged between the cluster and
//!   planner layers
//! - hosts the read-only planner settings injected into planner instances
//!
//! Key modules:
//! - [`error`]
//! - [`ids`]
//! - [`settings`]

/// Shared error taxonomy.
pub mod error;
/// Strongly-typed identifier wrappers.
pub mod ids;
/// Read-only planner settings.
pub mod settings;

pub use error::{Result, SfqError};
pub use ids::{DistSqlVersion, NodeId, StageId};
pub use settings::PlannerSettings;
