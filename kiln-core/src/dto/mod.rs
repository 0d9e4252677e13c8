//! Data Transfer Objects for inter-service communication
//!
//! Request and response bodies exchanged between the runner, the
//! orchestrator and whatever decodes VCS events.

pub mod build;
pub mod credential;
pub mod signal;
pub mod subscription;
