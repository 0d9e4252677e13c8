//! Service Module
//!
//! Business logic layer for the orchestrator.
//! Services orchestrate between repositories and contain domain logic.

pub mod build;
pub mod credential;
pub mod subscription;

// Re-export for convenience
pub use build as build_service;
pub use credential as credential_service;
pub use subscription as subscription_service;
