use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::postgres::PgRow;

use super::RelationalPool;
use crate::db::identity::{CredentialOwner, IdentityQueries};
use crate::error::Error;

fn owner_from_row(row: &PgRow, is_api_key: bool) -> Result<CredentialOwner, Error> {
    Ok(CredentialOwner {
        user_id: row.try_get("user_id")?,
        organization_id: row.try_get("organization_id")?,
        api_key_id: if is_api_key {
            Some(row.try_get("id")?)
        } else {
            None
        },
    })
}

#[async_trait]
impl IdentityQueries for RelationalPool {
    async fn find_api_key_owner(
        &self,
        key_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<CredentialOwner>, Error> {
        let mut conn = self.acquire().await?;
        let row = sqlx::query(
            r"
            SELECT id, user_id, organization_id
            FROM api_keys
            WHERE key_hash = $1
              AND revoked_at IS NULL
              AND (expires_at IS NULL OR expires_at > $2)
            ",
        )
        .bind(key_hash)
        .bind(now)
        .fetch_optional(&mut *conn)
        .await?;
        row.map(|row| owner_from_row(&row, true)).transpose()
    }

    async fn find_access_token_owner(
        &self,
        token_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<CredentialOwner>, Error> {
        let mut conn = self.acquire().await?;
        let row = sqlx::query(
            r"
            SELECT user_id, organization_id
            FROM access_tokens
            WHERE token_hash = $1
              AND revoked_at IS NULL
              AND (expires_at IS NULL OR expires_at > $2)
            ",
        )
        .bind(token_hash)
        .bind(now)
        .fetch_optional(&mut *conn)
        .await?;
        row.map(|row| owner_from_row(&row, false)).transpose()
    }
}
