//! Single-process store for tests and embedded use.
//!
//! One mutex serialises every transaction, so closures always run exactly
//! once and never conflict. Commits wake threads parked in
//! [`Store::wait_for_change`].

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};

use spindle_core::{Clock, SystemClock, clock::saturating_add};

use super::{Capabilities, ScoreRange, Store, StoreError, Txn, TxnRead, WriteOp};

#[derive(Debug)]
enum Entry {
    Bytes {
        value: Vec<u8>,
        expires_at: Option<DateTime<Utc>>,
    },
    Hash(BTreeMap<String, Vec<u8>>),
    ZSet(SortedSet),
}

#[derive(Debug, Default)]
struct SortedSet {
    scores: HashMap<String, i64>,
    ordered: BTreeSet<(i64, String)>,
}

impl SortedSet {
    fn insert(&mut self, member: String, score: i64) {
        if let Some(old) = self.scores.insert(member.clone(), score) {
            self.ordered.remove(&(old, member.clone()));
        }
        self.ordered.insert((score, member));
    }

    fn remove(&mut self, member: &str) {
        if let Some(old) = self.scores.remove(member) {
            self.ordered.remove(&(old, member.to_string()));
        }
    }

    fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }
}

#[derive(Debug, Default)]
struct Data {
    entries: HashMap<String, Entry>,
    /// Expiry index for `Bytes` values; may hold stale pairs for keys that
    /// were since overwritten or deleted.
    expiring: BTreeSet<(DateTime<Utc>, String)>,
    version: u64,
}

impl Data {
    fn evict_expired(&mut self, now: DateTime<Utc>) {
        while let Some((at, _)) = self.expiring.first() {
            if *at > now {
                break;
            }
            let Some((at, key)) = self.expiring.pop_first() else {
                break;
            };
            let current = matches!(
                self.entries.get(&key),
                Some(Entry::Bytes { expires_at: Some(e), .. }) if *e == at
            );
            if current {
                self.entries.remove(&key);
            }
        }
    }

    fn apply(&mut self, op: WriteOp, now: DateTime<Utc>) {
        match op {
            WriteOp::Set { key, value, ttl } => {
                let expires_at = ttl.map(|ttl| saturating_add(now, ttl));
                if let Some(at) = expires_at {
                    self.expiring.insert((at, key.clone()));
                }
                self.entries.insert(key, Entry::Bytes { value, expires_at });
            }
            WriteOp::Del { key } => {
                self.entries.remove(&key);
            }
            WriteOp::HSet { key, field, value } => {
                let entry = self
                    .entries
                    .entry(key)
                    .or_insert_with(|| Entry::Hash(BTreeMap::new()));
                if !matches!(entry, Entry::Hash(_)) {
                    *entry = Entry::Hash(BTreeMap::new());
                }
                if let Entry::Hash(map) = entry {
                    map.insert(field, value);
                }
            }
            WriteOp::HDel { key, field } => {
                if let Some(Entry::Hash(map)) = self.entries.get_mut(&key) {
                    map.remove(&field);
                    if map.is_empty() {
                        self.entries.remove(&key);
                    }
                }
            }
            WriteOp::ZAdd { key, member, score } => {
                let entry = self
                    .entries
                    .entry(key)
                    .or_insert_with(|| Entry::ZSet(SortedSet::default()));
                if !matches!(entry, Entry::ZSet(_)) {
                    *entry = Entry::ZSet(SortedSet::default());
                }
                if let Entry::ZSet(set) = entry {
                    set.insert(member, score);
                }
            }
            WriteOp::ZRem { key, member } => {
                if let Some(Entry::ZSet(set)) = self.entries.get_mut(&key) {
                    set.remove(&member);
                    if set.is_empty() {
                        self.entries.remove(&key);
                    }
                }
            }
        }
    }
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::Protocol(format!("WRONGTYPE operation against key {key}"))
}

struct Reader<'a> {
    data: &'a Data,
    now: DateTime<Utc>,
}

impl Reader<'_> {
    fn hash(&self, key: &str) -> Result<Option<&BTreeMap<String, Vec<u8>>>, StoreError> {
        match self.data.entries.get(key) {
            None => Ok(None),
            Some(Entry::Hash(map)) => Ok(Some(map)),
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn zset(&self, key: &str) -> Result<Option<&SortedSet>, StoreError> {
        match self.data.entries.get(key) {
            None => Ok(None),
            Some(Entry::ZSet(set)) => Ok(Some(set)),
            Some(_) => Err(wrong_type(key)),
        }
    }
}

impl TxnRead for Reader<'_> {
    fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        match self.data.entries.get(key) {
            None => Ok(None),
            Some(Entry::Bytes { value, expires_at }) => match expires_at {
                Some(at) if *at <= self.now => Ok(None),
                _ => Ok(Some(value.clone())),
            },
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn hget(&mut self, key: &str, field: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.hash(key)?.and_then(|m| m.get(field).cloned()))
    }

    fn hgetall(&mut self, key: &str) -> Result<BTreeMap<String, Vec<u8>>, StoreError> {
        Ok(self.hash(key)?.cloned().unwrap_or_default())
    }

    fn hlen(&mut self, key: &str) -> Result<u64, StoreError> {
        Ok(self.hash(key)?.map_or(0, |m| m.len() as u64))
    }

    fn zscore(&mut self, key: &str, member: &str) -> Result<Option<i64>, StoreError> {
        Ok(self.zset(key)?.and_then(|s| s.scores.get(member).copied()))
    }

    fn zcard(&mut self, key: &str) -> Result<u64, StoreError> {
        Ok(self.zset(key)?.map_or(0, |s| s.scores.len() as u64))
    }

    fn zrange_by_score(
        &mut self,
        key: &str,
        range: ScoreRange,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<(String, i64)>, StoreError> {
        let Some(set) = self.zset(key)? else {
            return Ok(Vec::new());
        };
        Ok(set
            .ordered
            .iter()
            .skip_while(|(score, _)| range.min.is_some_and(|min| *score < min))
            .take_while(|(score, _)| range.contains(*score))
            .skip(offset)
            .take(limit)
            .map(|(score, member)| (member.clone(), *score))
            .collect())
    }
}

/// In-process [`Store`]. Value TTLs are evaluated against the injected clock.
#[derive(Debug)]
pub struct InMemoryStore {
    data: Mutex<Data>,
    changed: Condvar,
    clock: Arc<dyn Clock>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            data: Mutex::new(Data::default()),
            changed: Condvar::new(),
            clock,
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn lock(&self) -> MutexGuard<'_, Data> {
        // A panicking closure never leaves partial writes behind, so the data
        // is still consistent after a poison.
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of top-level keys currently held. Expired values are dropped at
    /// the start of the next transaction.
    pub fn key_count(&self) -> usize {
        self.lock().entries.len()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Store for InMemoryStore {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            shared: false,
            change_notifications: true,
            optimistic: false,
        }
    }

    fn transact<T, E, F>(&self, mut f: F) -> Result<T, E>
    where
        F: FnMut(&mut Txn<'_>) -> Result<T, E>,
        E: From<StoreError>,
    {
        let mut data = self.lock();
        let now = self.clock.now();
        data.evict_expired(now);

        let (value, writes) = {
            let mut reader = Reader { data: &*data, now };
            let mut txn = Txn::new(&mut reader);
            let value = f(&mut txn)?;
            (value, txn.into_writes())
        };

        if !writes.is_empty() {
            for op in writes {
                data.apply(op, now);
            }
            data.version = data.version.wrapping_add(1);
            self.changed.notify_all();
        }

        Ok(value)
    }

    fn wait_for_change(&self, timeout: Duration) {
        let data = self.lock();
        let seen = data.version;
        let _ = self
            .changed
            .wait_timeout_while(data, timeout, |d| d.version == seen)
            .unwrap_or_else(PoisonError::into_inner);
    }
}
