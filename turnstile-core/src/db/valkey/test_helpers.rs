//! A scripted Valkey connection: every command must match the next expected packed
//! command exactly, and receives the canned reply queued with it.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use redis::aio::ConnectionLike;
use redis::{Cmd, Pipeline, RedisError, RedisFuture, RedisResult, Value};

type Script = Arc<Mutex<VecDeque<(Vec<u8>, RedisResult<Value>)>>>;

#[derive(Clone, Default)]
pub struct ScriptedConnection {
    script: Script,
}

impl ScriptedConnection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn expect(&self, cmd: &Cmd, reply: RedisResult<Value>) -> &Self {
        self.script
            .lock()
            .unwrap()
            .push_back((cmd.get_packed_command(), reply));
        self
    }

    pub fn expect_str(&self, cmd: &Cmd, reply: &str) -> &Self {
        self.expect(cmd, Ok(Value::BulkString(reply.as_bytes().to_vec())))
    }

    pub fn remaining(&self) -> usize {
        self.script.lock().unwrap().len()
    }
}

pub fn connection_error() -> RedisError {
    RedisError::from(std::io::Error::new(
        std::io::ErrorKind::ConnectionReset,
        "connection reset by peer",
    ))
}

impl ConnectionLike for ScriptedConnection {
    fn req_packed_command<'a>(&'a mut self, cmd: &'a Cmd) -> RedisFuture<'a, Value> {
        let packed = cmd.get_packed_command();
        let next = self.script.lock().unwrap().pop_front();
        Box::pin(async move {
            let Some((expected, reply)) = next else {
                panic!(
                    "unexpected command: {}",
                    String::from_utf8_lossy(&packed)
                );
            };
            assert_eq!(
                String::from_utf8_lossy(&packed),
                String::from_utf8_lossy(&expected),
                "command did not match the script"
            );
            reply
        })
    }

    fn req_packed_commands<'a>(
        &'a mut self,
        _cmd: &'a Pipeline,
        _offset: usize,
        _count: usize,
    ) -> RedisFuture<'a, Vec<Value>> {
        Box::pin(async { panic!("pipelines are not scripted") })
    }

    fn get_db(&self) -> i64 {
        0
    }
}

/// Hands out clones of one `ScriptedConnection`, so all checkouts share a script
#[derive(Clone, Default)]
pub struct ScriptedManager {
    pub connection: ScriptedConnection,
}

impl bb8::ManageConnection for ScriptedManager {
    type Connection = ScriptedConnection;
    type Error = RedisError;

    async fn connect(&self) -> Result<ScriptedConnection, RedisError> {
        Ok(self.connection.clone())
    }

    async fn is_valid(&self, _conn: &mut ScriptedConnection) -> Result<(), RedisError> {
        Ok(())
    }

    fn has_broken(&self, _conn: &mut ScriptedConnection) -> bool {
        false
    }
}
