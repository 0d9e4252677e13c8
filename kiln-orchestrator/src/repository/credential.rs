//! Credential Repository
//!
//! Credential rows hold secret material. Nothing here logs row contents.

use kiln_core::domain::credential::{Credential, CredentialType};
use kiln_core::dto::credential::NewCredential;
use sqlx::PgPool;

/// Insert or replace a credential and return its id
pub async fn upsert(pool: &PgPool, cred: &NewCredential) -> Result<i64, sqlx::Error> {
    let (id,): (i64,) = sqlx::query_as(
        r#"
        INSERT INTO credentials (account, identifier, cred_type, sub_type, secret)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (account, cred_type, identifier)
        DO UPDATE SET sub_type = EXCLUDED.sub_type, secret = EXCLUDED.secret
        RETURNING id
        "#,
    )
    .bind(&cred.account)
    .bind(&cred.identifier)
    .bind(cred.cred_type.as_str())
    .bind(&cred.sub_type)
    .bind(&cred.secret)
    .fetch_one(pool)
    .await?;

    Ok(id)
}

/// Find one credential by its key
pub async fn find(
    pool: &PgPool,
    cred_type: CredentialType,
    identifier: &str,
    account: &str,
) -> Result<Option<Credential>, sqlx::Error> {
    let row = sqlx::query_as::<_, CredentialRow>(
        r#"
        SELECT id, account, identifier, cred_type, sub_type, secret
        FROM credentials
        WHERE account = $1 AND cred_type = $2 AND identifier = $3
        "#,
    )
    .bind(account)
    .bind(cred_type.as_str())
    .bind(identifier)
    .fetch_optional(pool)
    .await?;

    Ok(row.and_then(|r| r.into_credential()))
}

// =============================================================================
// SSH Keys
// =============================================================================

pub async fn put_ssh_key(pool: &PgPool, path: &str, key: &str) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO ssh_keys (path, key)
        VALUES ($1, $2)
        ON CONFLICT (path) DO UPDATE SET key = EXCLUDED.key
        "#,
    )
    .bind(path)
    .bind(key)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn ssh_key_exists(pool: &PgPool, path: &str) -> Result<bool, sqlx::Error> {
    let (exists,): (bool,) = sqlx::query_as("SELECT EXISTS (SELECT 1 FROM ssh_keys WHERE path = $1)")
        .bind(path)
        .fetch_one(pool)
        .await?;

    Ok(exists)
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct CredentialRow {
    id: i64,
    account: String,
    identifier: String,
    cred_type: String,
    sub_type: String,
    secret: String,
}

impl CredentialRow {
    /// Rows with an unknown type are treated as missing
    fn into_credential(self) -> Option<Credential> {
        Some(Credential {
            id: self.id,
            account: self.account,
            identifier: self.identifier,
            cred_type: CredentialType::parse(&self.cred_type)?,
            sub_type: self.sub_type,
            secret: self.secret,
        })
    }
}
