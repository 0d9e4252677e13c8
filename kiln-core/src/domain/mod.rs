//! Core domain types
//!
//! These types are shared between the orchestrator (which persists them) and
//! the runner (which executes builds and reports results).

pub mod build;
pub mod commit;
pub mod config;
pub mod credential;
pub mod stage;
pub mod summary;
