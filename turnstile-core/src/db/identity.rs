use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

#[cfg(test)]
use mockall::automock;

use crate::error::Error;

/// Who a presented credential belongs to
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CredentialOwner {
    pub user_id: Uuid,
    pub organization_id: Option<Uuid>,
    /// Set when the credential is an API key
    pub api_key_id: Option<Uuid>,
}

/// Credential lookups by SHA-256 hex digest. Revoked or expired credentials never match.
#[async_trait]
#[cfg_attr(test, automock)]
pub trait IdentityQueries: Send + Sync {
    async fn find_api_key_owner(
        &self,
        key_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<CredentialOwner>, Error>;

    async fn find_access_token_owner(
        &self,
        token_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<CredentialOwner>, Error>;
}
