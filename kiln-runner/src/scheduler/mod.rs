//! Scheduler layer for the runner
//!
//! Claims queued builds from the orchestrator and drives each one in its own
//! task, from claim to the final output flush.

pub mod output;
pub mod poller;

pub use poller::BuildPoller;
