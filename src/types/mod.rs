//! Core domain types for the CI runner.
//!
//! This module contains the fundamental types used throughout the
//! application, designed to encode invariants via the type system.

pub mod build;
pub mod ids;

// Re-export commonly used types at the module level
pub use build::{BuildDescriptor, BuildRecord, BuildStatus, RecordError, TriggerKind};
pub use ids::{
    BuildNumber, InvalidRepoName, InvalidSha, ProjectId, RepoName, RequestId, Sha,
};
