mod counters;
#[cfg(test)]
pub(crate) mod test_helpers;

use std::time::Duration;

use redis::aio::{ConnectionLike, MultiplexedConnection};
use redis::{AsyncConnectionConfig, Client, RedisError, RedisResult};
use secrecy::{ExposeSecret, SecretString};

use crate::error::{Error, ErrorDetails};

pub use counters::ValkeyCounterStore;

/// Opens multiplexed Valkey connections for a `bb8` pool.
///
/// Every connection gets a bounded connect timeout and response timeout, so a slow or
/// unreachable store fails the caller instead of blocking it.
pub struct ValkeyConnectionManager {
    client: Client,
    connection_config: AsyncConnectionConfig,
}

impl ValkeyConnectionManager {
    pub fn new(
        pool_name: &str,
        url: &SecretString,
        connect_timeout: Duration,
        response_timeout: Duration,
    ) -> Result<Self, Error> {
        let client = Client::open(url.expose_secret()).map_err(|e| {
            Error::new(ErrorDetails::CounterStoreConnection {
                pool: pool_name.to_string(),
                message: format!("Failed to create Valkey client: {e}"),
            })
        })?;
        let connection_config = AsyncConnectionConfig::new()
            .set_connection_timeout(Some(connect_timeout))
            .set_response_timeout(Some(response_timeout));
        Ok(Self {
            client,
            connection_config,
        })
    }
}

impl bb8::ManageConnection for ValkeyConnectionManager {
    type Connection = MultiplexedConnection;
    type Error = RedisError;

    async fn connect(&self) -> Result<MultiplexedConnection, RedisError> {
        self.client
            .get_multiplexed_async_connection_with_config(&self.connection_config)
            .await
    }

    async fn is_valid(&self, conn: &mut MultiplexedConnection) -> Result<(), RedisError> {
        redis::cmd("PING").query_async::<()>(conn).await
    }

    fn has_broken(&self, _conn: &mut MultiplexedConnection) -> bool {
        false
    }
}

/// Load the counter function library into Valkey.
/// This should be called once at startup, against every pool that runs writes.
pub(crate) async fn execute_load_function_library<C: ConnectionLike>(
    conn: &mut C,
) -> Result<(), Error> {
    let lua_code = include_str!("lua/turnstile_ratelimit.lua");

    // Use FUNCTION LOAD with REPLACE to load/update the library
    let result: RedisResult<String> = redis::cmd("FUNCTION")
        .arg("LOAD")
        .arg("REPLACE")
        .arg(lua_code)
        .query_async(conn)
        .await;
    result.map(|_| ()).map_err(|e| {
        Error::new(ErrorDetails::CounterStoreQuery {
            message: format!("Failed to load function library: {e}"),
        })
    })
}
