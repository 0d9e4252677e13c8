//! Credential domain types
//!
//! Credentials carry decrypted secret material. They are fetched once, used
//! for the duration of a build and never logged.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::domain::build::VcsType;

/// Kind of credential
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CredentialType {
    Vcs,
    Repo,
    K8s,
    Ssh,
    Generic,
}

impl CredentialType {
    pub fn as_str(self) -> &'static str {
        match self {
            CredentialType::Vcs => "vcs",
            CredentialType::Repo => "repo",
            CredentialType::K8s => "k8s",
            CredentialType::Ssh => "ssh",
            CredentialType::Generic => "generic",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "vcs" => Some(CredentialType::Vcs),
            "repo" => Some(CredentialType::Repo),
            "k8s" => Some(CredentialType::K8s),
            "ssh" => Some(CredentialType::Ssh),
            "generic" => Some(CredentialType::Generic),
            _ => None,
        }
    }
}

/// A decrypted credential
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub id: i64,
    pub account: String,
    pub identifier: String,
    pub cred_type: CredentialType,
    /// e.g. `bitbucket`, `docker`, `kubeconfig`
    pub sub_type: String,
    pub secret: String,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("id", &self.id)
            .field("account", &self.account)
            .field("identifier", &self.identifier)
            .field("cred_type", &self.cred_type)
            .field("sub_type", &self.sub_type)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Identifier under which an account's VCS credential is stored
pub fn vcs_identifier(vcs_type: VcsType, account: &str) -> String {
    format!("{}_{}", vcs_sub_type(vcs_type), account)
}

pub fn vcs_sub_type(vcs_type: VcsType) -> &'static str {
    match vcs_type {
        VcsType::Bitbucket => "bitbucket",
        VcsType::Github => "github",
    }
}

/// Secret-store path of a credential, e.g. `creds/vcs/acme/bitbucket/bitbucket_acme`
pub fn credential_path(
    cred_type: CredentialType,
    account: &str,
    sub_type: &str,
    identifier: &str,
) -> String {
    format!(
        "creds/{}/{}/{}/{}",
        cred_type.as_str(),
        account,
        sub_type,
        identifier
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vcs_credential_path() {
        let identifier = vcs_identifier(VcsType::Bitbucket, "acme");
        assert_eq!(identifier, "bitbucket_acme");
        assert_eq!(
            credential_path(CredentialType::Vcs, "acme", "bitbucket", &identifier),
            "creds/vcs/acme/bitbucket/bitbucket_acme"
        );
    }

    #[test]
    fn test_debug_redacts_secret() {
        let cred = Credential {
            id: 1,
            account: "acme".into(),
            identifier: "docker".into(),
            cred_type: CredentialType::Repo,
            sub_type: "docker".into(),
            secret: "hunter2".into(),
        };
        assert!(!format!("{:?}", cred).contains("hunter2"));
    }

    #[test]
    fn test_type_round_trips_through_str() {
        for t in [
            CredentialType::Vcs,
            CredentialType::Repo,
            CredentialType::K8s,
            CredentialType::Ssh,
            CredentialType::Generic,
        ] {
            assert_eq!(CredentialType::parse(t.as_str()), Some(t));
        }
    }
}
