//! In-process implementation of the script store.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

use super::{ScriptStore, StoreError};
use crate::clock::{self, Clock};
use crate::ratelimit::distributed::scripts::{
    self, FIXED_PERIOD, LEAKY_BUCKET, SLIDING_WINDOW, TOKEN_BUCKET,
};

type StoreResult<T> = std::result::Result<T, StoreError>;

/// A value held under one key.
#[derive(Debug, Clone, PartialEq)]
pub enum StoredValue {
    /// Counter or timestamp
    Integer(i64),
    /// `(score, member)` pairs ordered by score
    SortedSet(Vec<(i64, String)>),
    /// Token bucket state
    Hash { ts: i64, tokens: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScriptKind {
    FixedPeriod,
    LeakyBucket,
    SlidingWindow,
    TokenBucket,
}

impl ScriptKind {
    fn from_body(body: &str) -> Option<Self> {
        match body {
            FIXED_PERIOD => Some(ScriptKind::FixedPeriod),
            LEAKY_BUCKET => Some(ScriptKind::LeakyBucket),
            SLIDING_WINDOW => Some(ScriptKind::SlidingWindow),
            TOKEN_BUCKET => Some(ScriptKind::TokenBucket),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
struct Slot {
    value: Option<StoredValue>,
    /// Absolute expiry in microseconds on the store clock
    expires_at: Option<i64>,
}

impl Slot {
    fn is_expired(&self, now: i64) -> bool {
        matches!(self.expires_at, Some(at) if now > at)
    }

    fn expire(&mut self, now: i64) {
        if self.is_expired(now) {
            self.clear();
        }
    }

    fn clear(&mut self) {
        self.value = None;
        self.expires_at = None;
    }

    fn expire_in(&mut self, now: i64, span_us: i64) {
        self.expires_at = Some(now + ceil_millis(span_us) * 1_000);
    }
}

/// A script store living in this process.
///
/// It understands the four limiter scripts and runs a native equivalent of
/// each one. A script holds the lock on its key's shard for its whole run,
/// so every evaluation is atomic with respect to other callers of the same
/// key. Key expiry follows the store's own clock.
///
/// Limiters in one process that share a `MemoryStore` and a key enforce one
/// limit together, which also makes it the test double for a real store.
///
/// Expired keys are dropped when they are next read or evaluated; keys that
/// are never touched again stay until [`purge_expired`](Self::purge_expired)
/// runs.
#[derive(Debug)]
pub struct MemoryStore {
    clock: Arc<dyn Clock>,
    scripts: RwLock<HashMap<String, ScriptKind>>,
    keys: DashMap<String, Slot>,
    available: AtomicBool,
    evals: AtomicU64,
}

impl MemoryStore {
    /// Create an empty store on the system clock.
    pub fn new() -> Self {
        Self::with_clock(clock::system())
    }

    /// Create an empty store whose key expiry follows `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            scripts: RwLock::new(HashMap::new()),
            keys: DashMap::new(),
            available: AtomicBool::new(true),
            evals: AtomicU64::new(0),
        }
    }

    /// Simulate the store going away (`false`) or coming back (`true`).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Forget every loaded script, like `SCRIPT FLUSH`.
    pub fn flush_scripts(&self) {
        self.scripts.write().clear();
    }

    /// Current value of a key, if it exists and has not expired.
    pub fn value(&self, key: &str) -> Option<StoredValue> {
        let now = self.now_us();
        if self.prune(key, now) {
            return None;
        }
        self.keys.get(key).and_then(|slot| slot.value.clone())
    }

    /// Time left before a key expires.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = self.now_us();
        if self.prune(key, now) {
            return None;
        }
        let slot = self.keys.get(key)?;
        let remaining = u64::try_from(slot.expires_at? - now).ok()?;
        Some(Duration::from_micros(remaining))
    }

    /// Drop every expired key.
    pub fn purge_expired(&self) {
        let now = self.now_us();
        self.keys.retain(|_, slot| !slot.is_expired(now));
    }

    /// Number of keys held, including expired ones not yet dropped.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Number of script evaluations served.
    pub fn eval_count(&self) -> u64 {
        self.evals.load(Ordering::Relaxed)
    }

    /// Remove `key` if it has expired and report whether it did.
    fn prune(&self, key: &str, now: i64) -> bool {
        self.keys
            .remove_if(key, |_, slot| slot.is_expired(now))
            .is_some()
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store is offline".to_string()))
        }
    }

    fn now_us(&self) -> i64 {
        clock::as_micros(self.clock.now())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ScriptStore for MemoryStore {
    async fn script_exists(&self, sha: &str) -> StoreResult<bool> {
        self.check_available()?;
        Ok(self.scripts.read().contains_key(sha))
    }

    async fn script_load(&self, body: &str) -> StoreResult<String> {
        self.check_available()?;
        let kind = ScriptKind::from_body(body)
            .ok_or_else(|| StoreError::Script("unsupported script".to_string()))?;

        let sha = scripts::sha1_hex(body);
        self.scripts.write().insert(sha.clone(), kind);
        Ok(sha)
    }

    async fn eval_sha(&self, sha: &str, keys: &[&str], args: &[i64]) -> StoreResult<i64> {
        self.check_available()?;
        let kind = self
            .scripts
            .read()
            .get(sha)
            .copied()
            .ok_or_else(|| StoreError::NoScript(sha.to_string()))?;
        let key = *keys
            .first()
            .ok_or_else(|| StoreError::Script("script expects one key".to_string()))?;

        self.evals.fetch_add(1, Ordering::Relaxed);
        let now = self.now_us();

        let reply = {
            let mut slot = self.keys.entry(key.to_string()).or_default();
            slot.expire(now);
            match kind {
                ScriptKind::FixedPeriod => fixed_period(&mut slot, args, now),
                ScriptKind::LeakyBucket => leaky_bucket(&mut slot, args, now),
                ScriptKind::SlidingWindow => sliding_window(&mut slot, args, now),
                ScriptKind::TokenBucket => token_bucket(&mut slot, args, now),
            }
        };
        self.keys.remove_if(key, |_, slot| slot.value.is_none());

        trace!(key = %key, script = ?kind, reply = ?reply, "Evaluated script");
        reply
    }
}

fn fixed_period(slot: &mut Slot, args: &[i64], now: i64) -> StoreResult<i64> {
    let expire_at = arg(args, 0)?;
    let rate = arg(args, 1)?;

    let current = match &slot.value {
        None => 0,
        Some(StoredValue::Integer(count)) => *count,
        Some(_) => return Err(wrong_type()),
    };
    if current >= rate {
        return Ok(0);
    }

    let total = current + 1;
    slot.value = Some(StoredValue::Integer(total));
    if total == 1 {
        let at = (expire_at / 1_000) * 1_000;
        if at <= now {
            slot.clear();
        } else {
            slot.expires_at = Some(at);
        }
    }
    Ok(1)
}

fn leaky_bucket(slot: &mut Slot, args: &[i64], now: i64) -> StoreResult<i64> {
    let interval = arg(args, 0)?;
    let ts = arg(args, 1)?;

    match &slot.value {
        None => {}
        Some(StoredValue::Integer(last)) => {
            if ts < last.saturating_add(interval) {
                return Ok(0);
            }
        }
        Some(_) => return Err(wrong_type()),
    }

    slot.value = Some(StoredValue::Integer(ts));
    slot.expire_in(now, interval);
    Ok(1)
}

fn sliding_window(slot: &mut Slot, args: &[i64], now: i64) -> StoreResult<i64> {
    let window = arg(args, 0)?;
    let rate = arg(args, 1)?;
    let ts = arg(args, 2)?;

    let mut members = match slot.value.take() {
        None => Vec::new(),
        Some(StoredValue::SortedSet(members)) => members,
        Some(other) => {
            slot.value = Some(other);
            return Err(wrong_type());
        }
    };

    let floor = ts - window;
    members.retain(|(score, _)| *score > floor);
    if members.is_empty() {
        slot.clear();
    }

    let total = members.len() as i64;
    if total >= rate {
        slot.value = Some(StoredValue::SortedSet(members));
        return Ok(0);
    }

    let member = format!("{}:{}", ts, total);
    members.retain(|(_, existing)| *existing != member);
    members.push((ts, member));
    members.sort();

    slot.value = Some(StoredValue::SortedSet(members));
    slot.expire_in(now, window);
    Ok(1)
}

fn token_bucket(slot: &mut Slot, args: &[i64], now: i64) -> StoreResult<i64> {
    let window = arg(args, 0)?;
    let rate = arg(args, 1)?;
    let ts = arg(args, 2)?;
    let requested = arg(args, 3)?;

    let (last, tokens) = match &slot.value {
        None => (0, 0.0),
        Some(StoredValue::Hash {
            ts: stored_ts,
            tokens,
        }) => (*stored_ts, *tokens),
        Some(_) => return Err(wrong_type()),
    };

    let interval = window as f64 / rate as f64;
    let elapsed = (ts - last).max(0) as f64;
    let filled = (tokens + elapsed / interval).min(rate as f64);
    if filled < requested as f64 {
        return Ok(0);
    }

    slot.value = Some(StoredValue::Hash {
        ts,
        tokens: filled - requested as f64,
    });
    slot.expire_in(now, window);
    Ok(1)
}

fn arg(args: &[i64], index: usize) -> StoreResult<i64> {
    args.get(index)
        .copied()
        .ok_or_else(|| StoreError::Script(format!("missing argument {}", index + 1)))
}

fn ceil_millis(us: i64) -> i64 {
    ((us + 999) / 1_000).max(1)
}

fn wrong_type() -> StoreError {
    StoreError::Script(
        "WRONGTYPE Operation against a key holding the wrong kind of value".to_string(),
    )
}
