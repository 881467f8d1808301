//! Shared key-value store with expiry: locks, cursors, queues, flags.
//!
//! Every process of the engine talks to the same store. Locks are plain keys
//! set with NX and a TTL, so a crashed holder cannot block anyone for longer
//! than the TTL.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{CustodyError, CustodyResult};

#[async_trait]
pub trait KvStore: Send + Sync {
    /// Set only if absent. Returns whether the key was written.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> CustodyResult<bool>;
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> CustodyResult<()>;
    async fn get(&self, key: &str) -> CustodyResult<Option<String>>;
    async fn exists(&self, key: &str) -> CustodyResult<bool>;
    async fn delete(&self, key: &str) -> CustodyResult<bool>;
    /// Delete only while the key still holds `value`.
    async fn delete_if_eq(&self, key: &str, value: &str) -> CustodyResult<bool>;

    /// Append to the tail. Returns the new length.
    async fn list_push(&self, key: &str, value: &str) -> CustodyResult<usize>;
    /// Pop from the head.
    async fn list_pop(&self, key: &str) -> CustodyResult<Option<String>>;
    /// Remove every occurrence. Returns how many were removed.
    async fn list_remove(&self, key: &str, value: &str) -> CustodyResult<usize>;
    async fn list_range(&self, key: &str) -> CustodyResult<Vec<String>>;
    async fn list_len(&self, key: &str) -> CustodyResult<usize>;

    async fn zadd(&self, key: &str, member: &str, score: i64) -> CustodyResult<()>;
    /// Members with score <= `max`, lowest first.
    async fn zrange_by_score(&self, key: &str, max: i64) -> CustodyResult<Vec<String>>;
    async fn zscore(&self, key: &str, member: &str) -> CustodyResult<Option<i64>>;
    async fn zrem(&self, key: &str, member: &str) -> CustodyResult<bool>;
    async fn zcard(&self, key: &str) -> CustodyResult<usize>;
}

/// An acquired lock. Released explicitly; otherwise it lapses with its TTL.
pub struct LockGuard {
    kv: Arc<dyn KvStore>,
    key: String,
    token: String,
}

impl LockGuard {
    /// `Ok(None)` when someone else holds the lock.
    pub async fn acquire(kv: &Arc<dyn KvStore>, key: impl Into<String>, ttl: Duration) -> CustodyResult<Option<Self>> {
        let key = key.into();
        let token = Uuid::new_v4().to_string();
        if kv.set_nx(&key, &token, ttl).await? {
            debug!(lock = %key, "lock acquired");
            Ok(Some(Self { kv: kv.clone(), key, token }))
        } else {
            Ok(None)
        }
    }

    pub fn key(&self) -> &str { &self.key }

    pub async fn release(self) {
        match self.kv.delete_if_eq(&self.key, &self.token).await {
            Ok(true) => debug!(lock = %self.key, "lock released"),
            Ok(false) => warn!(lock = %self.key, "lock expired before release"),
            Err(e) => warn!(lock = %self.key, error = %e, "lock release failed, waiting for ttl"),
        }
    }
}

enum Slot {
    Str(String),
    List(VecDeque<String>),
    ZSet(BTreeMap<String, i64>),
}

struct Entry {
    slot: Slot,
    expires: Option<Instant>,
}

impl Entry {
    fn live(&self, now: Instant) -> bool { self.expires.map_or(true, |at| at > now) }
}

/// Process-local [`KvStore`] for tests and single-node deployments.
#[derive(Default)]
pub struct MemoryKv {
    entries: Mutex<HashMap<String, Entry>>,
    unavailable: AtomicBool,
}

impl MemoryKv {
    pub fn new() -> Self { Self::default() }

    /// Make every call fail as if the store were down.
    pub fn set_unavailable(&self, down: bool) { self.unavailable.store(down, Ordering::SeqCst); }

    fn entries(&self) -> CustodyResult<MutexGuard<'_, HashMap<String, Entry>>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CustodyError::LockStore("store unavailable".into()));
        }
        let mut entries = self.entries.lock().map_err(|_| CustodyError::LockStore("poisoned".into()))?;
        let now = Instant::now();
        entries.retain(|_, e| e.live(now));
        Ok(entries)
    }
}

fn wrong_type(key: &str) -> CustodyError { CustodyError::LockStore(format!("WRONGTYPE {}", key)) }

fn list_mut<'a>(entries: &'a mut HashMap<String, Entry>, key: &str) -> CustodyResult<&'a mut VecDeque<String>> {
    let entry = entries
        .entry(key.to_string())
        .or_insert_with(|| Entry { slot: Slot::List(VecDeque::new()), expires: None });
    match &mut entry.slot {
        Slot::List(list) => Ok(list),
        _ => Err(wrong_type(key)),
    }
}

fn zset_mut<'a>(entries: &'a mut HashMap<String, Entry>, key: &str) -> CustodyResult<&'a mut BTreeMap<String, i64>> {
    let entry = entries
        .entry(key.to_string())
        .or_insert_with(|| Entry { slot: Slot::ZSet(BTreeMap::new()), expires: None });
    match &mut entry.slot {
        Slot::ZSet(set) => Ok(set),
        _ => Err(wrong_type(key)),
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> CustodyResult<bool> {
        let mut entries = self.entries()?;
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry { slot: Slot::Str(value.to_string()), expires: Some(Instant::now() + ttl) },
        );
        Ok(true)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> CustodyResult<()> {
        let expires = ttl.map(|ttl| Instant::now() + ttl);
        self.entries()?.insert(key.to_string(), Entry { slot: Slot::Str(value.to_string()), expires });
        Ok(())
    }

    async fn get(&self, key: &str) -> CustodyResult<Option<String>> {
        match self.entries()?.get(key).map(|e| &e.slot) {
            Some(Slot::Str(value)) => Ok(Some(value.clone())),
            Some(_) => Err(wrong_type(key)),
            None => Ok(None),
        }
    }

    async fn exists(&self, key: &str) -> CustodyResult<bool> { Ok(self.entries()?.contains_key(key)) }

    async fn delete(&self, key: &str) -> CustodyResult<bool> { Ok(self.entries()?.remove(key).is_some()) }

    async fn delete_if_eq(&self, key: &str, value: &str) -> CustodyResult<bool> {
        let mut entries = self.entries()?;
        let matches = matches!(entries.get(key).map(|e| &e.slot), Some(Slot::Str(v)) if v == value);
        if matches {
            entries.remove(key);
        }
        Ok(matches)
    }

    async fn list_push(&self, key: &str, value: &str) -> CustodyResult<usize> {
        let mut entries = self.entries()?;
        let list = list_mut(&mut entries, key)?;
        list.push_back(value.to_string());
        Ok(list.len())
    }

    async fn list_pop(&self, key: &str) -> CustodyResult<Option<String>> {
        let mut entries = self.entries()?;
        let popped = match entries.get_mut(key).map(|e| &mut e.slot) {
            Some(Slot::List(list)) => list.pop_front(),
            Some(_) => return Err(wrong_type(key)),
            None => None,
        };
        if matches!(entries.get(key).map(|e| &e.slot), Some(Slot::List(l)) if l.is_empty()) {
            entries.remove(key);
        }
        Ok(popped)
    }

    async fn list_remove(&self, key: &str, value: &str) -> CustodyResult<usize> {
        let mut entries = self.entries()?;
        match entries.get_mut(key).map(|e| &mut e.slot) {
            Some(Slot::List(list)) => {
                let before = list.len();
                list.retain(|v| v != value);
                Ok(before - list.len())
            }
            Some(_) => Err(wrong_type(key)),
            None => Ok(0),
        }
    }

    async fn list_range(&self, key: &str) -> CustodyResult<Vec<String>> {
        match self.entries()?.get(key).map(|e| &e.slot) {
            Some(Slot::List(list)) => Ok(list.iter().cloned().collect()),
            Some(_) => Err(wrong_type(key)),
            None => Ok(Vec::new()),
        }
    }

    async fn list_len(&self, key: &str) -> CustodyResult<usize> {
        match self.entries()?.get(key).map(|e| &e.slot) {
            Some(Slot::List(list)) => Ok(list.len()),
            Some(_) => Err(wrong_type(key)),
            None => Ok(0),
        }
    }

    async fn zadd(&self, key: &str, member: &str, score: i64) -> CustodyResult<()> {
        let mut entries = self.entries()?;
        zset_mut(&mut entries, key)?.insert(member.to_string(), score);
        Ok(())
    }

    async fn zrange_by_score(&self, key: &str, max: i64) -> CustodyResult<Vec<String>> {
        match self.entries()?.get(key).map(|e| &e.slot) {
            Some(Slot::ZSet(set)) => {
                let mut due: Vec<(&String, &i64)> = set.iter().filter(|(_, score)| **score <= max).collect();
                due.sort_by_key(|(_, score)| **score);
                Ok(due.into_iter().map(|(member, _)| member.clone()).collect())
            }
            Some(_) => Err(wrong_type(key)),
            None => Ok(Vec::new()),
        }
    }

    async fn zscore(&self, key: &str, member: &str) -> CustodyResult<Option<i64>> {
        match self.entries()?.get(key).map(|e| &e.slot) {
            Some(Slot::ZSet(set)) => Ok(set.get(member).copied()),
            Some(_) => Err(wrong_type(key)),
            None => Ok(None),
        }
    }

    async fn zrem(&self, key: &str, member: &str) -> CustodyResult<bool> {
        let mut entries = self.entries()?;
        match entries.get_mut(key).map(|e| &mut e.slot) {
            Some(Slot::ZSet(set)) => Ok(set.remove(member).is_some()),
            Some(_) => Err(wrong_type(key)),
            None => Ok(false),
        }
    }

    async fn zcard(&self, key: &str) -> CustodyResult<usize> {
        match self.entries()?.get(key).map(|e| &e.slot) {
            Some(Slot::ZSet(set)) => Ok(set.len()),
            Some(_) => Err(wrong_type(key)),
            None => Ok(0),
        }
    }
}
