//! Repository layer
//!
//! Adapters that implement the core collaborator traits over the
//! orchestrator's HTTP API. They hold no state beyond the client and carry
//! no business logic.

mod credentials;
mod storage;

pub use credentials::HttpCredentialStore;
pub use storage::HttpBuildStorage;
