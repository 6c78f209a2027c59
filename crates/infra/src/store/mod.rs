//! Shared state store abstraction.
//!
//! All queue state lives behind [`Store`]. Every operation that touches more
//! than one record runs inside [`Store::transact`]: the closure reads through
//! a [`Txn`], buffers its writes, and the store applies the buffered writes
//! atomically. If the store detects a concurrent modification of anything
//! the closure read, the closure is re-run against fresh state (optimistic
//! backends) or never observed it in the first place (locking backends).
//!
//! Reads never observe the closure's own buffered writes. Code running inside
//! a transaction must therefore be written against the state it read, which
//! keeps behaviour identical across backends.
//!
//! The data model is deliberately small: byte values with an optional TTL,
//! hashes of byte values, and sorted sets with integer scores.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

pub mod in_memory;
#[cfg(test)]
pub(crate) mod outage;
#[cfg(feature = "redis")]
pub mod redis;

pub use in_memory::InMemoryStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisStore;

/// Store-level failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("transaction aborted after {attempts} conflicting attempts")]
    Contention { attempts: u32 },
    #[error("store protocol error: {0}")]
    Protocol(String),
}

/// What a backend can do beyond the baseline contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    /// State is visible to other processes.
    pub shared: bool,
    /// [`Store::wait_for_change`] wakes on commits instead of sleeping.
    pub change_notifications: bool,
    /// Transactions may be re-run on conflict.
    pub optimistic: bool,
}

/// A buffered mutation, applied at commit.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Set {
        key: String,
        value: Vec<u8>,
        ttl: Option<Duration>,
    },
    Del {
        key: String,
    },
    HSet {
        key: String,
        field: String,
        value: Vec<u8>,
    },
    HDel {
        key: String,
        field: String,
    },
    ZAdd {
        key: String,
        member: String,
        score: i64,
    },
    ZRem {
        key: String,
        member: String,
    },
}

/// Inclusive score bounds for sorted-set range reads. `None` is unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScoreRange {
    pub min: Option<i64>,
    pub max: Option<i64>,
}

impl ScoreRange {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn up_to(max: i64) -> Self {
        Self {
            min: None,
            max: Some(max),
        }
    }

    pub fn contains(&self, score: i64) -> bool {
        self.min.is_none_or(|min| score >= min) && self.max.is_none_or(|max| score <= max)
    }
}

/// Read access granted to a transaction closure. Implemented per backend.
pub trait TxnRead {
    fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    fn hget(&mut self, key: &str, field: &str) -> Result<Option<Vec<u8>>, StoreError>;

    fn hgetall(&mut self, key: &str) -> Result<BTreeMap<String, Vec<u8>>, StoreError>;

    fn hlen(&mut self, key: &str) -> Result<u64, StoreError>;

    fn zscore(&mut self, key: &str, member: &str) -> Result<Option<i64>, StoreError>;

    fn zcard(&mut self, key: &str) -> Result<u64, StoreError>;

    /// Members with scores in `range`, ordered by (score, member).
    fn zrange_by_score(
        &mut self,
        key: &str,
        range: ScoreRange,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<(String, i64)>, StoreError>;
}

/// One attempt at a transaction: reads go to the backend, writes are buffered.
pub struct Txn<'a> {
    reader: &'a mut dyn TxnRead,
    writes: Vec<WriteOp>,
}

impl<'a> Txn<'a> {
    pub fn new(reader: &'a mut dyn TxnRead) -> Self {
        Self {
            reader,
            writes: Vec::new(),
        }
    }

    pub fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.reader.get(key)
    }

    pub fn hget(&mut self, key: &str, field: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.reader.hget(key, field)
    }

    pub fn hgetall(&mut self, key: &str) -> Result<BTreeMap<String, Vec<u8>>, StoreError> {
        self.reader.hgetall(key)
    }

    pub fn hlen(&mut self, key: &str) -> Result<u64, StoreError> {
        self.reader.hlen(key)
    }

    pub fn zscore(&mut self, key: &str, member: &str) -> Result<Option<i64>, StoreError> {
        self.reader.zscore(key, member)
    }

    pub fn zcard(&mut self, key: &str) -> Result<u64, StoreError> {
        self.reader.zcard(key)
    }

    pub fn zrange_by_score(
        &mut self,
        key: &str,
        range: ScoreRange,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<(String, i64)>, StoreError> {
        self.reader.zrange_by_score(key, range, offset, limit)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Vec<u8>, ttl: Option<Duration>) {
        self.writes.push(WriteOp::Set {
            key: key.into(),
            value,
            ttl,
        });
    }

    pub fn del(&mut self, key: impl Into<String>) {
        self.writes.push(WriteOp::Del { key: key.into() });
    }

    pub fn hset(&mut self, key: impl Into<String>, field: impl Into<String>, value: Vec<u8>) {
        self.writes.push(WriteOp::HSet {
            key: key.into(),
            field: field.into(),
            value,
        });
    }

    pub fn hdel(&mut self, key: impl Into<String>, field: impl Into<String>) {
        self.writes.push(WriteOp::HDel {
            key: key.into(),
            field: field.into(),
        });
    }

    pub fn zadd(&mut self, key: impl Into<String>, member: impl Into<String>, score: i64) {
        self.writes.push(WriteOp::ZAdd {
            key: key.into(),
            member: member.into(),
            score,
        });
    }

    pub fn zrem(&mut self, key: impl Into<String>, member: impl Into<String>) {
        self.writes.push(WriteOp::ZRem {
            key: key.into(),
            member: member.into(),
        });
    }

    pub fn has_writes(&self) -> bool {
        !self.writes.is_empty()
    }

    pub fn into_writes(self) -> Vec<WriteOp> {
        self.writes
    }
}

/// Shared state store.
pub trait Store: Send + Sync {
    fn capabilities(&self) -> Capabilities;

    /// Run `f` as one atomic read-modify-write.
    ///
    /// `f` may be invoked more than once; it must not have side effects
    /// outside the [`Txn`]. Writes are discarded when `f` returns `Err`.
    fn transact<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnMut(&mut Txn<'_>) -> Result<T, E>,
        E: From<StoreError>;

    /// Block until another commit lands or `timeout` elapses.
    fn wait_for_change(&self, timeout: Duration) {
        std::thread::sleep(timeout);
    }
}

impl<S: Store> Store for Arc<S> {
    fn capabilities(&self) -> Capabilities {
        (**self).capabilities()
    }

    fn transact<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnMut(&mut Txn<'_>) -> Result<T, E>,
        E: From<StoreError>,
    {
        (**self).transact(f)
    }

    fn wait_for_change(&self, timeout: Duration) {
        (**self).wait_for_change(timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn score_range_bounds_are_inclusive() {
        let r = ScoreRange {
            min: Some(5),
            max: Some(10),
        };
        assert!(r.contains(5));
        assert!(r.contains(10));
        assert!(!r.contains(4));
        assert!(!r.contains(11));
        assert!(ScoreRange::all().contains(i64::MIN));
        assert!(ScoreRange::up_to(0).contains(-1));
    }
}
