//! Redis-backed [`Store`].
//!
//! Transactions use optimistic concurrency: every key read inside the closure
//! is `WATCH`ed first, and the buffered writes are sent as one
//! `MULTI`/`EXEC` pipeline. A nil `EXEC` reply means a watched key changed;
//! the closure is then re-run against fresh state, up to `max_attempts`.
//!
//! Requires the `redis` feature.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use super::{Capabilities, ScoreRange, Store, StoreError, Txn, TxnRead, WriteOp};

fn map_redis_error(e: redis::RedisError) -> StoreError {
    if e.is_io_error() || e.is_connection_refusal() || e.is_timeout() || e.is_connection_dropped()
    {
        StoreError::Unavailable(e.to_string())
    } else {
        StoreError::Protocol(e.to_string())
    }
}

fn bound(value: Option<i64>, unbounded: &'static str) -> String {
    value.map_or_else(|| unbounded.to_string(), |v| v.to_string())
}

struct RedisReader<'a> {
    conn: &'a mut redis::Connection,
    watched: HashSet<String>,
}

impl RedisReader<'_> {
    fn watch(&mut self, key: &str) -> Result<(), StoreError> {
        if self.watched.insert(key.to_string()) {
            redis::cmd("WATCH")
                .arg(key)
                .query::<()>(self.conn)
                .map_err(map_redis_error)?;
        }
        Ok(())
    }
}

impl TxnRead for RedisReader<'_> {
    fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.watch(key)?;
        redis::cmd("GET")
            .arg(key)
            .query(self.conn)
            .map_err(map_redis_error)
    }

    fn hget(&mut self, key: &str, field: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.watch(key)?;
        redis::cmd("HGET")
            .arg(key)
            .arg(field)
            .query(self.conn)
            .map_err(map_redis_error)
    }

    fn hgetall(&mut self, key: &str) -> Result<BTreeMap<String, Vec<u8>>, StoreError> {
        self.watch(key)?;
        redis::cmd("HGETALL")
            .arg(key)
            .query(self.conn)
            .map_err(map_redis_error)
    }

    fn hlen(&mut self, key: &str) -> Result<u64, StoreError> {
        self.watch(key)?;
        redis::cmd("HLEN")
            .arg(key)
            .query(self.conn)
            .map_err(map_redis_error)
    }

    fn zscore(&mut self, key: &str, member: &str) -> Result<Option<i64>, StoreError> {
        self.watch(key)?;
        let score: Option<f64> = redis::cmd("ZSCORE")
            .arg(key)
            .arg(member)
            .query(self.conn)
            .map_err(map_redis_error)?;
        Ok(score.map(|s| s.round() as i64))
    }

    fn zcard(&mut self, key: &str) -> Result<u64, StoreError> {
        self.watch(key)?;
        redis::cmd("ZCARD")
            .arg(key)
            .query(self.conn)
            .map_err(map_redis_error)
    }

    fn zrange_by_score(
        &mut self,
        key: &str,
        range: ScoreRange,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<(String, i64)>, StoreError> {
        self.watch(key)?;
        let rows: Vec<(String, f64)> = redis::cmd("ZRANGEBYSCORE")
            .arg(key)
            .arg(bound(range.min, "-inf"))
            .arg(bound(range.max, "+inf"))
            .arg("WITHSCORES")
            .arg("LIMIT")
            .arg(offset)
            .arg(limit)
            .query(self.conn)
            .map_err(map_redis_error)?;
        Ok(rows
            .into_iter()
            .map(|(member, score)| (member, score.round() as i64))
            .collect())
    }
}

fn queue_write(pipe: &mut redis::Pipeline, op: &WriteOp) {
    match op {
        WriteOp::Set { key, value, ttl } => {
            let cmd = pipe.cmd("SET").arg(key).arg(value.as_slice());
            if let Some(ttl) = ttl {
                cmd.arg("PX").arg(ttl.as_millis().max(1) as u64);
            }
            cmd.ignore();
        }
        WriteOp::Del { key } => {
            pipe.cmd("DEL").arg(key).ignore();
        }
        WriteOp::HSet { key, field, value } => {
            pipe.cmd("HSET").arg(key).arg(field).arg(value.as_slice()).ignore();
        }
        WriteOp::HDel { key, field } => {
            pipe.cmd("HDEL").arg(key).arg(field).ignore();
        }
        WriteOp::ZAdd { key, member, score } => {
            pipe.cmd("ZADD").arg(key).arg(*score).arg(member).ignore();
        }
        WriteOp::ZRem { key, member } => {
            pipe.cmd("ZREM").arg(key).arg(member).ignore();
        }
    }
}

fn unwatch(conn: &mut redis::Connection) {
    if let Err(e) = redis::cmd("UNWATCH").query::<()>(conn) {
        debug!(error = %e, "UNWATCH failed");
    }
}

/// Shared [`Store`] on a Redis server.
#[derive(Debug, Clone)]
pub struct RedisStore {
    client: Arc<redis::Client>,
    connect_timeout: Duration,
    max_attempts: u32,
}

impl RedisStore {
    pub fn new(
        redis_url: impl AsRef<str>,
        connect_timeout: Duration,
        max_attempts: u32,
    ) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(Self {
            client: Arc::new(client),
            connect_timeout,
            max_attempts: max_attempts.max(1),
        })
    }

    /// Round-trip a `PING`.
    pub fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.connection()?;
        redis::cmd("PING")
            .query::<String>(&mut conn)
            .map(|_| ())
            .map_err(map_redis_error)
    }

    fn connection(&self) -> Result<redis::Connection, StoreError> {
        self.client
            .get_connection_with_timeout(self.connect_timeout)
            .map_err(map_redis_error)
    }
}

impl Store for RedisStore {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            shared: true,
            change_notifications: false,
            optimistic: true,
        }
    }

    fn transact<T, E, F>(&self, mut f: F) -> Result<T, E>
    where
        F: FnMut(&mut Txn<'_>) -> Result<T, E>,
        E: From<StoreError>,
    {
        let mut conn = self.connection()?;

        for attempt in 1..=self.max_attempts {
            let mut reader = RedisReader {
                conn: &mut conn,
                watched: HashSet::new(),
            };
            let outcome = {
                let mut txn = Txn::new(&mut reader);
                f(&mut txn).map(|value| (value, txn.into_writes()))
            };
            let watched_any = !reader.watched.is_empty();

            let (value, writes) = match outcome {
                Ok(ok) => ok,
                Err(e) => {
                    if watched_any {
                        unwatch(&mut conn);
                    }
                    return Err(e);
                }
            };

            if writes.is_empty() {
                if watched_any {
                    unwatch(&mut conn);
                }
                return Ok(value);
            }

            let mut pipe = redis::pipe();
            pipe.atomic();
            for op in &writes {
                queue_write(&mut pipe, op);
            }

            let committed: Option<redis::Value> =
                pipe.query(&mut conn).map_err(map_redis_error)?;
            if committed.is_some() {
                return Ok(value);
            }
            debug!(attempt, writes = writes.len(), "watched key changed; retrying transaction");
        }

        Err(StoreError::Contention {
            attempts: self.max_attempts,
        }
        .into())
    }
}
