use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Value;
use std::cell::Cell;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{RateLimitError, Result};
use crate::metrics::Scope;

/// A single backend reply. The only operation the core needs from a reply
/// is to narrow it to an integer counter value.
pub trait Response: Send {
    fn as_int(&self) -> Result<i64>;
}

/// One pipelined command exchange with the backend: enqueue without
/// waiting, drain replies later in FIFO order. A connection, once
/// acquired, is used exclusively by one request until released — pipelines
/// are never shared across requests.
#[async_trait]
pub trait Connection: Send {
    /// Enqueue `cmd key arg0 arg1 ...` without waiting for a reply.
    fn pipe_append(&mut self, cmd: &str, args: &[String]);

    /// Pop the next queued reply, executing the pipeline on first call.
    async fn pipe_response(&mut self) -> Result<Box<dyn Response>>;
}

/// Hands out connections. `get` blocks indefinitely if the pool is
/// momentarily exhausted rather than failing fast — callers are expected
/// to release what they acquire on every exit path.
#[async_trait]
pub trait Pool: Send + Sync {
    async fn get(&self) -> Result<Box<dyn Connection>>;

    /// Whether this pool serves per-second traffic (used by the engine to
    /// decide which pool a SECOND-unit descriptor should route to).
    fn is_per_second(&self) -> bool {
        false
    }
}

// ---------------------------------------------------------------------
// Redis-backed implementation.
// ---------------------------------------------------------------------

/// Redis connection configuration. Dial/read/write timeouts default to one
/// second, matching the original driver's `radix.DialTimeout(1 * time.Second)`.
#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
    pub command_timeout: Duration,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            command_timeout: Duration::from_secs(1),
        }
    }
}

struct RedisResponse(i64);

impl Response for RedisResponse {
    fn as_int(&self) -> Result<i64> {
        Ok(self.0)
    }
}

/// A connection leased from a [`RedisPool`]. Commands are buffered into a
/// `redis::Pipeline`; the pipeline is sent to the server only when the
/// first reply is actually requested, then replies are handed out in
/// enqueue order.
///
/// Holds the pool's stats so release is tied to the connection's lifetime
/// rather than to `get()` returning: `cx_active` is decremented on `Drop`,
/// and `cx_local_close` is bumped only if this connection is being
/// discarded after a backend error, never on a clean return to the caller.
pub struct RedisConnection {
    manager: ConnectionManager,
    pipeline: redis::Pipeline,
    replies: Option<std::vec::IntoIter<Value>>,
    stats: Arc<PoolStats>,
    errored: Cell<bool>,
}

#[async_trait]
impl Connection for RedisConnection {
    fn pipe_append(&mut self, cmd: &str, args: &[String]) {
        let mut c = redis::cmd(cmd);
        for arg in args {
            c.arg(arg);
        }
        self.pipeline.add_command(c);
    }

    async fn pipe_response(&mut self) -> Result<Box<dyn Response>> {
        if self.replies.is_none() {
            let values: Vec<Value> = match self.pipeline.query_async(&mut self.manager).await {
                Ok(values) => values,
                Err(e) => {
                    self.errored.set(true);
                    return Err(RateLimitError::Redis(e));
                }
            };
            self.replies = Some(values.into_iter());
        }

        let value = self
            .replies
            .as_mut()
            .and_then(Iterator::next)
            .ok_or_else(|| {
                RateLimitError::ResponseDecode("pipeline returned fewer replies than expected".into())
            })?;

        match value {
            Value::Int(n) => Ok(Box::new(RedisResponse(n))),
            Value::Okay => Ok(Box::new(RedisResponse(0))),
            other => Err(RateLimitError::ResponseDecode(format!(
                "expected integer reply, got {:?}",
                other
            ))),
        }
    }
}

impl Drop for RedisConnection {
    fn drop(&mut self) {
        self.stats.connection_active.dec();
        if self.errored.get() {
            self.stats.connection_local_close.inc();
        }
    }
}

struct PoolStats {
    connection_active: prometheus::IntGauge,
    connection_total: prometheus::IntCounter,
    connection_local_close: prometheus::IntCounter,
}

/// A Redis-backed connection pool. `redis::aio::ConnectionManager` already
/// multiplexes and auto-reconnects a single logical connection, so "get a
/// connection" here is a cheap clone of that handle rather than a
/// checkout from a fixed-size free list — it still satisfies the Pool
/// contract (acquire/release, blocks rather than errors when unavailable,
/// because the manager itself queues requests while reconnecting).
pub struct RedisPool {
    manager: ConnectionManager,
    per_second: bool,
    stats: Arc<PoolStats>,
}

impl RedisPool {
    pub async fn connect(config: RedisConfig, per_second: bool, scope: &Scope) -> Result<Self> {
        let client = redis::Client::open(config.url.clone()).map_err(RateLimitError::Redis)?;
        let manager = client
            .get_tokio_connection_manager()
            .await
            .map_err(RateLimitError::Redis)?;

        let stats = Arc::new(PoolStats {
            connection_active: scope.gauge("cx_active"),
            connection_total: scope.counter("cx_total"),
            connection_local_close: scope.counter("cx_local_close"),
        });

        Ok(Self {
            manager,
            per_second,
            stats,
        })
    }
}

#[async_trait]
impl Pool for RedisPool {
    async fn get(&self) -> Result<Box<dyn Connection>> {
        self.stats.connection_active.inc();
        self.stats.connection_total.inc();
        Ok(Box::new(RedisConnection {
            manager: self.manager.clone(),
            pipeline: redis::pipe(),
            replies: None,
            stats: self.stats.clone(),
            errored: Cell::new(false),
        }))
    }

    fn is_per_second(&self) -> bool {
        self.per_second
    }
}

/// An in-memory backend double, exercised by both in-crate unit tests and
/// the black-box integration suite.
pub mod test_support {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// An in-memory counter backend for deterministic tests: `INCRBY`
    /// accumulates into a map, `EXPIRE` is accepted and ignored (TTL
    /// eviction is not modeled — the engine never reads EXPIRE's reply).
    pub struct MockPool {
        state: Arc<MockState>,
        per_second: bool,
    }

    struct MockState {
        counters: Mutex<std::collections::HashMap<String, i64>>,
        /// Appended-to log of `(cmd, args)` pairs issued across all
        /// connections, for assertions about exactly which commands were
        /// sent.
        log: Mutex<Vec<(String, Vec<String>)>>,
    }

    impl MockPool {
        pub fn new(per_second: bool) -> Self {
            Self {
                state: Arc::new(MockState {
                    counters: Mutex::new(std::collections::HashMap::new()),
                    log: Mutex::new(Vec::new()),
                }),
                per_second,
            }
        }

        /// Pre-seed a key's counter value, as if a prior request had
        /// already incremented it.
        pub fn seed(&self, key: &str, value: i64) {
            self.state
                .counters
                .lock()
                .unwrap()
                .insert(key.to_string(), value);
        }

        pub fn commands_issued(&self) -> Vec<(String, Vec<String>)> {
            self.state.log.lock().unwrap().clone()
        }
    }

    struct MockResponse(i64);

    impl Response for MockResponse {
        fn as_int(&self) -> Result<i64> {
            Ok(self.0)
        }
    }

    pub struct MockConnection {
        state: Arc<MockState>,
        queued: VecDeque<(String, Vec<String>)>,
        replies: Option<VecDeque<i64>>,
    }

    #[async_trait]
    impl Connection for MockConnection {
        fn pipe_append(&mut self, cmd: &str, args: &[String]) {
            self.queued.push_back((cmd.to_string(), args.to_vec()));
        }

        async fn pipe_response(&mut self) -> Result<Box<dyn Response>> {
            if self.replies.is_none() {
                let mut replies = VecDeque::new();
                let mut counters = self.state.counters.lock().unwrap();
                let mut log = self.state.log.lock().unwrap();
                for (cmd, args) in self.queued.drain(..) {
                    log.push((cmd.clone(), args.clone()));
                    match cmd.as_str() {
                        "INCRBY" => {
                            let key = &args[0];
                            let by: i64 = args[1].parse().unwrap_or(0);
                            let entry = counters.entry(key.clone()).or_insert(0);
                            *entry += by;
                            replies.push_back(*entry);
                        }
                        "EXPIRE" => {
                            replies.push_back(1);
                        }
                        _ => replies.push_back(0),
                    }
                }
                self.replies = Some(replies);
            }

            let value = self
                .replies
                .as_mut()
                .and_then(VecDeque::pop_front)
                .ok_or_else(|| RateLimitError::ResponseDecode("no more replies".into()))?;
            Ok(Box::new(MockResponse(value)))
        }
    }

    #[async_trait]
    impl Pool for MockPool {
        async fn get(&self) -> Result<Box<dyn Connection>> {
            Ok(Box::new(MockConnection {
                state: self.state.clone(),
                queued: VecDeque::new(),
                replies: None,
            }))
        }

        fn is_per_second(&self) -> bool {
            self.per_second
        }
    }
}
