use std::sync::LazyLock;

use super::script::RedisScript;

/// `KEYS = [key, reentry_key]`, `ARGV = [value, ttl_ms]`.
///
/// Returns `1` on first acquisition, `2` on reentry by the same holder, `0` on contention.
const ACQUIRE_LUA: &str = r#"
if redis.call("EXISTS", KEYS[1]) == 0 then
  redis.call("SET", KEYS[1], ARGV[1], "PX", ARGV[2])
  redis.call("SET", KEYS[2], 1, "PX", ARGV[2])
  return 1
elseif redis.call("GET", KEYS[1]) == ARGV[1] then
  redis.call("INCR", KEYS[2])
  redis.call("PEXPIRE", KEYS[1], ARGV[2])
  redis.call("PEXPIRE", KEYS[2], ARGV[2])
  return 2
else
  return 0
end
"#;

/// `KEYS = [key, reentry_key]`, `ARGV = [value, ttl_ms]`.
///
/// Returns `1` if the lease is still ours and was refreshed, `0` if it was lost or never held.
const RENEW_LUA: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
  redis.call("PEXPIRE", KEYS[1], ARGV[2])
  redis.call("PEXPIRE", KEYS[2], ARGV[2])
  return 1
else
  return 0
end
"#;

/// `KEYS = [key, reentry_key]`, `ARGV = [value]`.
///
/// Returns `-1` if not held by `value`, the remaining reentry depth on a partial release, or
/// `0` once both keys are deleted.
const RELEASE_LUA: &str = r#"
if redis.call("GET", KEYS[1]) ~= ARGV[1] then
  return -1
end
local d = redis.call("DECR", KEYS[2])
if d > 0 then
  return d
end
redis.call("DEL", KEYS[1], KEYS[2])
return 0
"#;

/// `KEYS = [counter_key]`.
///
/// Returns the post-increment value.
const COUNTER_LUA: &str = r#"
return redis.call("INCR", KEYS[1])
"#;

pub(super) static ACQUIRE: LazyLock<RedisScript> = LazyLock::new(|| RedisScript::new(ACQUIRE_LUA));
pub(super) static RENEW: LazyLock<RedisScript> = LazyLock::new(|| RedisScript::new(RENEW_LUA));
pub(super) static RELEASE: LazyLock<RedisScript> = LazyLock::new(|| RedisScript::new(RELEASE_LUA));
pub(super) static COUNTER: LazyLock<RedisScript> = LazyLock::new(|| RedisScript::new(COUNTER_LUA));
