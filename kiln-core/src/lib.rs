//! Kiln Core
//!
//! Core types and abstractions for the Kiln CI system.
//!
//! This crate contains:
//! - Domain types: builds, stages, stage results, summaries, credentials
//! - DTOs: Data transfer objects for inter-service communication
//! - Interfaces: the collaborator traits the build engine depends on
//! - Metrics: the injected metrics sink

pub mod domain;
pub mod dto;
pub mod error;
pub mod interface;
pub mod metrics;
