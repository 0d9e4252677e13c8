//! Credential DTOs

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::domain::credential::CredentialType;

#[derive(Clone, Serialize, Deserialize)]
pub struct AddSshKey {
    pub path: String,
    pub key: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SshKeyExists {
    pub exists: bool,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ThrowawayToken {
    pub token: String,
}

/// A credential to store; the secret is write-only through the API
#[derive(Clone, Serialize, Deserialize)]
pub struct NewCredential {
    pub account: String,
    pub identifier: String,
    pub cred_type: CredentialType,
    pub sub_type: String,
    pub secret: String,
}

impl fmt::Debug for NewCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NewCredential")
            .field("account", &self.account)
            .field("identifier", &self.identifier)
            .field("cred_type", &self.cred_type)
            .field("sub_type", &self.sub_type)
            .field("secret", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CreatedCredential {
    pub id: i64,
}
