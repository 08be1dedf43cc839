//! Valkey-backed fixed-window counters.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bb8::ManageConnection;
use redis::aio::ConnectionLike;
use serde::Deserialize;
use tokio::time::timeout;

use super::{ValkeyConnectionManager, execute_load_function_library};
use crate::db::counters::{CounterStore, WindowState, duration_ms};
use crate::db::pool::ManagedPool;
use crate::db::{HealthCheckable, MonitoredPool};
use crate::error::{Error, ErrorDetails};
use crate::identity::loggable_counter_key;

// Important: these types must match the replies of the Lua functions in turnstile-core/src/db/valkey/lua/turnstile_ratelimit.lua.
// Lint.IfEdited()

/// Response from turnstile_window_read_v1 Lua function
#[derive(Debug, Deserialize)]
struct WindowReadResponse {
    exists: bool,
    count: u64,
    ttl_ms: i64,
}

/// Response from turnstile_window_hit_v1 Lua function
#[derive(Debug, Deserialize)]
struct WindowHitResponse {
    count: u64,
    ttl_ms: i64,
}

// Lint.ThenEdit(turnstile-core/src/db/valkey/lua/turnstile_ratelimit.lua)

fn ttl_from_ms(ttl_ms: i64) -> Duration {
    Duration::from_millis(u64::try_from(ttl_ms).unwrap_or(0))
}

/// Execute window_read against any async Redis-compatible connection.
async fn execute_read_window<C: ConnectionLike>(
    conn: &mut C,
    key: &str,
) -> Result<Option<WindowState>, Error> {
    // Use FCALL_RO for read-only operations (works with replicas)
    let result: String = redis::cmd("FCALL_RO")
        .arg("turnstile_window_read_v1")
        .arg(1) // number of keys
        .arg(key)
        .query_async(conn)
        .await?;

    let response: WindowReadResponse = serde_json::from_str(&result).map_err(|e| {
        Error::new(ErrorDetails::CounterStoreQuery {
            message: format!("Failed to parse window_read response: {e}"),
        })
    })?;

    if !response.exists {
        return Ok(None);
    }
    Ok(Some(WindowState {
        count: response.count,
        ttl: ttl_from_ms(response.ttl_ms),
    }))
}

/// Execute window_hit against any async Redis-compatible connection.
async fn execute_hit_window<C: ConnectionLike>(
    conn: &mut C,
    key: &str,
    window: Duration,
) -> Result<WindowState, Error> {
    let result: String = redis::cmd("FCALL")
        .arg("turnstile_window_hit_v1")
        .arg(1)
        .arg(key)
        .arg(duration_ms(window))
        .query_async(conn)
        .await?;

    let response: WindowHitResponse = serde_json::from_str(&result).map_err(|e| {
        Error::new(ErrorDetails::CounterStoreQuery {
            message: format!("Failed to parse window_hit response: {e}"),
        })
    })?;

    Ok(WindowState {
        count: response.count,
        ttl: ttl_from_ms(response.ttl_ms),
    })
}

async fn execute_acquire_lock<C: ConnectionLike>(
    conn: &mut C,
    key: &str,
    token: &str,
    ttl: Duration,
) -> Result<bool, Error> {
    let reply: Option<String> = redis::cmd("SET")
        .arg(key)
        .arg(token)
        .arg("NX")
        .arg("PX")
        .arg(duration_ms(ttl))
        .query_async(conn)
        .await?;
    Ok(reply.is_some())
}

async fn execute_release_lock<C: ConnectionLike>(
    conn: &mut C,
    key: &str,
    token: &str,
) -> Result<bool, Error> {
    let released: i64 = redis::cmd("FCALL")
        .arg("turnstile_lock_release_v1")
        .arg(1)
        .arg(key)
        .arg(token)
        .query_async(conn)
        .await?;
    Ok(released == 1)
}

const HEALTH_CHECK_TIMEOUT_MS: u64 = 1000;

/// Counter store over a primary pool and an optional read replica pool.
///
/// Reads prefer the replica and fall back to the primary on any replica error.
/// Writes always go to the primary.
pub struct ValkeyCounterStore<M: ManageConnection = ValkeyConnectionManager> {
    primary: Arc<ManagedPool<M>>,
    replica: Option<Arc<ManagedPool<M>>>,
}

impl<M> ValkeyCounterStore<M>
where
    M: ManageConnection,
    M::Connection: ConnectionLike,
    M::Error: std::fmt::Display,
{
    pub fn new(primary: Arc<ManagedPool<M>>, replica: Option<Arc<ManagedPool<M>>>) -> Self {
        Self { primary, replica }
    }

    pub async fn load_function_library(&self) -> Result<(), Error> {
        let mut conn = self.primary.checkout().await?;
        execute_load_function_library(&mut *conn).await
    }

    async fn read_from(pool: &ManagedPool<M>, key: &str) -> Result<Option<WindowState>, Error> {
        let mut conn = pool.checkout().await?;
        execute_read_window(&mut *conn, key).await
    }
}

#[async_trait]
impl<M> CounterStore for ValkeyCounterStore<M>
where
    M: ManageConnection,
    M::Connection: ConnectionLike,
    M::Error: std::fmt::Display,
{
    #[tracing::instrument(skip_all, fields(key = %loggable_counter_key(key)))]
    async fn read_window(&self, key: &str) -> Result<Option<WindowState>, Error> {
        if let Some(replica) = &self.replica {
            match Self::read_from(replica, key).await {
                Ok(state) => return Ok(state),
                Err(e) => {
                    tracing::warn!(
                        pool = replica.name(),
                        "Counter read failed on the replica, falling back to the primary: {e}"
                    );
                    metrics::counter!(
                        "turnstile_counter_store_fallbacks_total",
                        "pool" => replica.name().to_string()
                    )
                    .increment(1);
                }
            }
        }
        Self::read_from(&self.primary, key).await
    }

    #[tracing::instrument(skip_all, fields(key = %loggable_counter_key(key)))]
    async fn hit_window(&self, key: &str, window: Duration) -> Result<WindowState, Error> {
        let mut conn = self.primary.checkout().await?;
        execute_hit_window(&mut *conn, key, window).await
    }

    async fn try_acquire_lock(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, Error> {
        let mut conn = self.primary.checkout().await?;
        execute_acquire_lock(&mut *conn, key, token, ttl).await
    }

    async fn release_lock(&self, key: &str, token: &str) -> Result<(), Error> {
        let mut conn = self.primary.checkout().await?;
        if !execute_release_lock(&mut *conn, key, token).await? {
            tracing::warn!("Lock `{key}` expired before it was released");
        }
        Ok(())
    }
}

#[async_trait]
impl<M> HealthCheckable for ValkeyCounterStore<M>
where
    M: ManageConnection,
    M::Connection: ConnectionLike,
    M::Error: std::fmt::Display,
{
    async fn health(&self) -> Result<(), Error> {
        let check = async {
            let mut conn = self.primary.checkout().await?;
            redis::cmd("PING")
                .query_async::<()>(&mut *conn)
                .await
                .map_err(|e| {
                    Error::new(ErrorDetails::CounterStoreConnection {
                        pool: self.primary.name().to_string(),
                        message: format!("Valkey health check failed: {e}"),
                    })
                })?;
            Ok::<(), Error>(())
        };

        match timeout(Duration::from_millis(HEALTH_CHECK_TIMEOUT_MS), check).await {
            Ok(result) => result,
            Err(_) => Err(Error::new(ErrorDetails::CounterStoreConnection {
                pool: self.primary.name().to_string(),
                message: "Valkey health check timed out".to_string(),
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::pool::PoolTimeouts;
    use crate::db::valkey::test_helpers::{ScriptedConnection, ScriptedManager, connection_error};
    use tracing_test::traced_test;

    fn pool(name: &str, connection: &ScriptedConnection) -> Arc<ManagedPool<ScriptedManager>> {
        let timeouts = PoolTimeouts {
            checkout: Duration::from_millis(200),
            connect: Duration::from_millis(200),
            idle: Duration::from_secs(300),
            max_lifetime: Duration::from_secs(1800),
        };
        let manager = ScriptedManager {
            connection: connection.clone(),
        };
        Arc::new(ManagedPool::connect_lazy(name, manager, 5, &timeouts))
    }

    fn read_cmd(key: &str) -> redis::Cmd {
        let mut cmd = redis::cmd("FCALL_RO");
        cmd.arg("turnstile_window_read_v1").arg(1).arg(key);
        cmd
    }

    #[tokio::test]
    async fn test_read_window_sends_correct_command() {
        let conn = ScriptedConnection::new();
        conn.expect_str(
            &read_cmd("rate_limit:seance:api_key:abc"),
            r#"{"exists":true,"count":4,"ttl_ms":1500000}"#,
        );
        let state = execute_read_window(&mut conn.clone(), "rate_limit:seance:api_key:abc")
            .await
            .unwrap();
        assert_eq!(
            state,
            Some(WindowState {
                count: 4,
                ttl: Duration::from_millis(1_500_000),
            })
        );
        assert_eq!(conn.remaining(), 0);
    }

    #[tokio::test]
    async fn test_read_window_missing_key() {
        let conn = ScriptedConnection::new();
        conn.expect_str(&read_cmd("k"), r#"{"exists":false,"count":0,"ttl_ms":0}"#);
        let state = execute_read_window(&mut conn.clone(), "k").await.unwrap();
        assert_eq!(state, None);
    }

    #[tokio::test]
    async fn test_hit_window_sends_window_in_millis() {
        let conn = ScriptedConnection::new();
        conn.expect_str(
            redis::cmd("FCALL")
                .arg("turnstile_window_hit_v1")
                .arg(1)
                .arg("rate_limit:general:ip:198.51.100.7")
                .arg(3_600_000u64),
            r#"{"count":1,"ttl_ms":3600000}"#,
        );
        let state = execute_hit_window(
            &mut conn.clone(),
            "rate_limit:general:ip:198.51.100.7",
            Duration::from_secs(3600),
        )
        .await
        .unwrap();
        assert_eq!(state.count, 1);
        assert_eq!(state.ttl, Duration::from_secs(3600));
    }

    #[tokio::test]
    async fn test_malformed_reply_is_a_query_error() {
        let conn = ScriptedConnection::new();
        conn.expect_str(&read_cmd("k"), "not json");
        let err = execute_read_window(&mut conn.clone(), "k").await.unwrap_err();
        assert!(matches!(
            err.get_details(),
            ErrorDetails::CounterStoreQuery { .. }
        ));
    }

    #[tokio::test]
    async fn test_lock_commands() {
        let conn = ScriptedConnection::new();
        conn.expect(
            redis::cmd("SET")
                .arg("lock:quota_reset")
                .arg("token-1")
                .arg("NX")
                .arg("PX")
                .arg(60_000u64),
            Ok(redis::Value::Okay),
        )
        .expect(
            redis::cmd("SET")
                .arg("lock:quota_reset")
                .arg("token-2")
                .arg("NX")
                .arg("PX")
                .arg(60_000u64),
            Ok(redis::Value::Nil),
        )
        .expect(
            redis::cmd("FCALL")
                .arg("turnstile_lock_release_v1")
                .arg(1)
                .arg("lock:quota_reset")
                .arg("token-1"),
            Ok(redis::Value::Int(1)),
        );
        let store = ValkeyCounterStore::new(pool("counter_background", &conn), None);
        let ttl = Duration::from_secs(60);
        assert!(store.try_acquire_lock("lock:quota_reset", "token-1", ttl).await.unwrap());
        assert!(!store.try_acquire_lock("lock:quota_reset", "token-2", ttl).await.unwrap());
        store.release_lock("lock:quota_reset", "token-1").await.unwrap();
        assert_eq!(conn.remaining(), 0);
    }

    #[tokio::test]
    async fn test_replica_error_falls_back_to_primary() {
        let key = "rate_limit:api_general:ip:203.0.113.5";
        let replica = ScriptedConnection::new();
        replica.expect(&read_cmd(key), Err(connection_error()));
        let primary = ScriptedConnection::new();
        primary.expect_str(&read_cmd(key), r#"{"exists":true,"count":10,"ttl_ms":120000}"#);

        let store = ValkeyCounterStore::new(
            pool("counter_primary", &primary),
            Some(pool("counter_replica", &replica)),
        );
        let state = store.read_window(key).await.unwrap().unwrap();
        assert_eq!(state.count, 10);
        assert_eq!(replica.remaining(), 0);
        assert_eq!(primary.remaining(), 0);
    }

    #[tokio::test]
    async fn test_writes_never_go_to_the_replica() {
        let key = "rate_limit:seance:api_key:abc";
        let replica = ScriptedConnection::new();
        let primary = ScriptedConnection::new();
        primary.expect_str(
            redis::cmd("FCALL")
                .arg("turnstile_window_hit_v1")
                .arg(1)
                .arg(key)
                .arg(3_600_000u64),
            r#"{"count":7,"ttl_ms":1000}"#,
        );
        let store = ValkeyCounterStore::new(
            pool("counter_primary", &primary),
            Some(pool("counter_replica", &replica)),
        );
        let state = store
            .hit_window(key, Duration::from_secs(3600))
            .await
            .unwrap();
        assert_eq!(state.count, 7);
        assert_eq!(primary.remaining(), 0);
    }

    #[tokio::test]
    async fn test_health_pings_primary() {
        let primary = ScriptedConnection::new();
        primary.expect(&redis::cmd("PING"), Ok(redis::Value::SimpleString("PONG".to_string())));
        let store = ValkeyCounterStore::new(pool("counter_primary", &primary), None);
        store.health().await.unwrap();

        primary.expect(&redis::cmd("PING"), Err(connection_error()));
        let err = store.health().await.unwrap_err();
        assert!(err.is_store_unavailable());
    }

    #[tokio::test]
    #[traced_test]
    async fn test_fallback_warning_names_the_key_without_the_credential() {
        let key = "rate_limit:seance:api_key:sk-live-123";
        let replica = ScriptedConnection::new();
        replica.expect(&read_cmd(key), Err(connection_error()));
        let primary = ScriptedConnection::new();
        primary.expect_str(&read_cmd(key), r#"{"exists":false,"count":0,"ttl_ms":0}"#);

        let store = ValkeyCounterStore::new(
            pool("counter_primary", &primary),
            Some(pool("counter_replica", &replica)),
        );
        store.read_window(key).await.unwrap();

        assert!(logs_contain("falling back to the primary"));
        assert!(logs_contain("key=rate_limit:seance:api_key:"));
        assert!(!logs_contain("sk-live-123"));
    }
}
