//! Collaborator interfaces
//!
//! The build engine talks to the outside world only through these traits:
//! - `BuildStorage`: summary, stage and output persistence
//! - `CredentialStore`: decrypted secrets and SSH keys
//! - `BuildQueue`: the outbound dispatch boundary
//! - `VcsHandler`: commit and build-config lookups
//!
//! The orchestrator implements them over Postgres, the runner over HTTP.

mod credentials;
mod dispatch;
mod storage;
mod vcs;

pub use credentials::CredentialStore;
pub use dispatch::BuildQueue;
pub use storage::BuildStorage;
pub use vcs::VcsHandler;
