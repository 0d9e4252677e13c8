//! Repository Module
//!
//! Data access layer for the orchestrator.
//! Each repository handles database operations for a specific domain entity.

pub mod build;
pub mod credential;
pub mod queue;
pub mod subscription;

// Re-export for convenience
pub use build as build_repository;
pub use credential as credential_repository;
pub use queue as queue_repository;
pub use subscription as subscription_repository;
