//! Atomic scripts run by the shared store.
//!
//! All times and spans are integer microseconds. Timestamps are written back
//! from the raw argument strings (or with `%d`) because Lua's default number
//! formatting keeps only 14 significant digits.

use sha1::{Digest, Sha1};

/// `KEYS[1]` counter; `ARGV` = (window expiry, rate). Returns 1 allow, 0 deny.
///
/// A denied call leaves the counter untouched. The first increment of a
/// fresh counter sets its absolute expiry so the store retires it.
pub const FIXED_PERIOD: &str = r#"
local key = KEYS[1]
local expire_at = tonumber(ARGV[1])
local rate = tonumber(ARGV[2])
local current = tonumber(redis.call("GET", key) or "0")
if current >= rate then
    return 0
end
local total = redis.call("INCR", key)
if total == 1 then
    redis.call("PEXPIREAT", key, string.format("%d", math.floor(expire_at / 1000)))
end
return 1
"#;

/// `KEYS[1]` last admitted timestamp; `ARGV` = (interval, now).
pub const LEAKY_BUCKET: &str = r#"
local key = KEYS[1]
local interval = tonumber(ARGV[1])
local now = tonumber(ARGV[2])
local last = redis.call("GET", key)
if last and now < tonumber(last) + interval then
    return 0
end
redis.call("SET", key, ARGV[2], "PX", math.max(1, math.ceil(interval / 1000)))
return 1
"#;

/// `KEYS[1]` sorted set of admitted timestamps; `ARGV` = (window, rate, now).
pub const SLIDING_WINDOW: &str = r#"
local key = KEYS[1]
local window = tonumber(ARGV[1])
local rate = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
redis.call("ZREMRANGEBYSCORE", key, "-inf", string.format("%d", now - window))
local total = redis.call("ZCARD", key)
if total >= rate then
    return 0
end
redis.call("ZADD", key, ARGV[3], ARGV[3] .. ":" .. total)
redis.call("PEXPIRE", key, math.max(1, math.ceil(window / 1000)))
return 1
"#;

/// `KEYS[1]` hash of `ts` and `tokens`; `ARGV` = (window, rate, now, requested).
pub const TOKEN_BUCKET: &str = r#"
local key = KEYS[1]
local window = tonumber(ARGV[1])
local rate = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local requested = tonumber(ARGV[4])
local state = redis.call("HMGET", key, "ts", "tokens")
local last = tonumber(state[1]) or 0
local tokens = tonumber(state[2]) or 0
local interval = window / rate
local elapsed = math.max(0, now - last)
local filled = math.min(rate, tokens + elapsed / interval)
if filled < requested then
    return 0
end
redis.call("HSET", key, "ts", ARGV[3], "tokens", tostring(filled - requested))
redis.call("PEXPIRE", key, math.max(1, math.ceil(window / 1000)))
return 1
"#;

/// A script body and its SHA-1 digest, the name stores index it by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Script {
    body: &'static str,
    sha: String,
}

impl Script {
    /// Digest a script body.
    pub fn new(body: &'static str) -> Self {
        Self {
            body,
            sha: sha1_hex(body),
        }
    }

    /// The source sent to the store.
    pub fn body(&self) -> &'static str {
        self.body
    }

    /// Lowercase hex SHA-1 of the body.
    pub fn sha(&self) -> &str {
        &self.sha
    }
}

/// Lowercase hex SHA-1 digest, as the store names scripts.
pub fn sha1_hex(body: &str) -> String {
    Sha1::digest(body.as_bytes())
        .iter()
        .map(|byte| format!("{:02x}", byte))
        .collect()
}
