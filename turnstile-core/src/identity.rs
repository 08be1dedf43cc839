//! Caller identification.
//!
//! A `ClientIdentity` is never absent: callers without a credential that resolves are
//! identified by their network address. Resolution to a user and organization is
//! best-effort; stages that need it treat an unresolved identity as "skip", not as an error.

use std::borrow::Cow;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::http::{HeaderMap, header};
use chrono::Utc;
use serde::Serialize;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::db::identity::{CredentialOwner, IdentityQueries};

pub const API_KEY_HEADER: &str = "x-api-key";
pub const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";

/// Address token used when the caller's address is unavailable,
/// so counter keys are always well-formed
pub const UNKNOWN_CLIENT: &str = "unknown_client";

/// Hex-encoded SHA-256 digest, the form credentials are stored in
pub fn sha256_hex(value: &str) -> String {
    hex::encode(Sha256::digest(value.as_bytes()))
}

/// A counter key that can go in logs: a raw API key is replaced by a digest prefix
pub fn loggable_counter_key(key: &str) -> Cow<'_, str> {
    match key.split_once("api_key:") {
        Some((prefix, raw)) => Cow::Owned(format!("{prefix}api_key:{}", &sha256_hex(raw)[..16])),
        None => Cow::Borrowed(key),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityKind {
    ApiKey,
    BearerToken,
    Ip,
}

impl IdentityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            IdentityKind::ApiKey => "api_key",
            IdentityKind::BearerToken => "bearer_token",
            IdentityKind::Ip => "ip",
        }
    }
}

/// Created per request and discarded afterwards. Never persisted.
#[derive(Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    kind: IdentityKind,
    raw_value: String,
    source_address: String,
    owner: Option<CredentialOwner>,
}

impl ClientIdentity {
    pub fn from_source_address(source_address: impl Into<String>) -> Self {
        let source_address = source_address.into();
        Self {
            kind: IdentityKind::Ip,
            raw_value: source_address.clone(),
            source_address,
            owner: None,
        }
    }

    /// An identity whose credential resolved to `owner`
    pub fn resolved(
        kind: IdentityKind,
        raw_value: &str,
        source_address: String,
        owner: CredentialOwner,
    ) -> Self {
        Self {
            kind,
            raw_value: raw_value.to_string(),
            source_address,
            owner: Some(owner),
        }
    }

    pub fn kind(&self) -> IdentityKind {
        self.kind
    }

    pub fn source_address(&self) -> &str {
        &self.source_address
    }

    pub fn resolved_user_id(&self) -> Option<Uuid> {
        self.owner.as_ref().map(|o| o.user_id)
    }

    pub fn resolved_org_id(&self) -> Option<Uuid> {
        self.owner.as_ref().and_then(|o| o.organization_id)
    }

    pub fn api_key_id(&self) -> Option<Uuid> {
        self.owner.as_ref().and_then(|o| o.api_key_id)
    }

    /// The identity component of counter keys:
    /// `api_key:<key>`, `bearer_token:<first 16 hex chars of its SHA-256>` or `ip:<address>`
    pub fn key(&self) -> String {
        match self.kind {
            IdentityKind::ApiKey => format!("api_key:{}", self.raw_value),
            IdentityKind::BearerToken => {
                let digest = sha256_hex(&self.raw_value);
                format!("bearer_token:{}", &digest[..16])
            }
            IdentityKind::Ip => self.ip_key(),
        }
    }

    /// The caller's address as a counter key, regardless of any credential
    pub fn ip_key(&self) -> String {
        format!("ip:{}", self.source_address)
    }
}

impl std::fmt::Debug for ClientIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let raw_value = match self.kind {
            IdentityKind::Ip => self.raw_value.as_str(),
            IdentityKind::ApiKey | IdentityKind::BearerToken => "[REDACTED]",
        };
        f.debug_struct("ClientIdentity")
            .field("kind", &self.kind)
            .field("raw_value", &raw_value)
            .field("source_address", &self.source_address)
            .field("resolved_user_id", &self.resolved_user_id())
            .field("resolved_org_id", &self.resolved_org_id())
            .finish()
    }
}

fn api_key(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

pub struct IdentityResolver {
    queries: Arc<dyn IdentityQueries>,
    trust_forwarded_for: bool,
}

impl IdentityResolver {
    pub fn new(queries: Arc<dyn IdentityQueries>, trust_forwarded_for: bool) -> Self {
        Self {
            queries,
            trust_forwarded_for,
        }
    }

    /// Resolution order is fixed: API key, then bearer token, then source address.
    /// The first credential that resolves wins.
    #[tracing::instrument(skip_all)]
    pub async fn resolve(&self, headers: &HeaderMap, peer: Option<SocketAddr>) -> ClientIdentity {
        let source_address = self.source_address(headers, peer);
        let now = Utc::now();

        if let Some(key) = api_key(headers) {
            match self.queries.find_api_key_owner(&sha256_hex(key), now).await {
                Ok(Some(owner)) => {
                    return ClientIdentity::resolved(
                        IdentityKind::ApiKey,
                        key,
                        source_address,
                        owner,
                    );
                }
                Ok(None) => tracing::debug!("Presented API key did not resolve"),
                // The error was logged when it was created
                Err(_) => {}
            }
        }

        if let Some(token) = bearer_token(headers) {
            match self
                .queries
                .find_access_token_owner(&sha256_hex(token), now)
                .await
            {
                Ok(Some(owner)) => {
                    return ClientIdentity::resolved(
                        IdentityKind::BearerToken,
                        token,
                        source_address,
                        owner,
                    );
                }
                Ok(None) => tracing::debug!("Presented bearer token did not resolve"),
                Err(_) => {}
            }
        }

        ClientIdentity::from_source_address(source_address)
    }

    fn source_address(&self, headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
        if self.trust_forwarded_for
            && let Some(forwarded) = headers
                .get(FORWARDED_FOR_HEADER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.split(',').next())
                .and_then(|v| v.trim().parse::<IpAddr>().ok())
        {
            return forwarded.to_string();
        }
        match peer {
            Some(peer) => peer.ip().to_string(),
            None => UNKNOWN_CLIENT.to_string(),
        }
    }
}
