//! Lua bodies for the fixed, enumerated script catalogue. `RedisBackend`
//! runs these server-side via `redis::Script`; `LocalBackend` implements
//! the identical state transitions directly against its in-process map
//! under a critical section, so observable outcomes match byte-for-byte.

pub const RATE_LIMIT_CHECK: &str = r#"
local raw = redis.call('GET', KEYS[1])
local rate = tonumber(ARGV[1])
local burst = tonumber(ARGV[2])
local now = tonumber(ARGV[3])

local tokens
local last
if raw then
  local sep = string.find(raw, ':')
  tokens = tonumber(string.sub(raw, 1, sep - 1))
  last = tonumber(string.sub(raw, sep + 1))
else
  tokens = burst
  last = now
end

local elapsed = now - last
if elapsed < 0 then elapsed = 0 end
local recovered = elapsed * rate
tokens = math.min(burst, tokens + recovered)

if tokens >= 1 then
  tokens = tokens - 1
  redis.call('SETEX', KEYS[1], 60, string.format('%.6f:%.6f', tokens, now))
  return {1, burst, burst - tokens}
else
  return {0, burst, burst}
end
"#;

/// KEYS = {state, failures, success, last_failure, half_open_count}
/// ARGV = {timeout_seconds, half_open_requests, now}
pub const BREAKER_ALLOW: &str = r#"
local state = tonumber(redis.call('GET', KEYS[1]) or '0')
local timeout = tonumber(ARGV[1])
local half_open_requests = tonumber(ARGV[2])
local now = tonumber(ARGV[3])

if state == 0 then
  return {1, 0}
elseif state == 1 then
  local last_failure = tonumber(redis.call('GET', KEYS[4]) or '0')
  if (now - last_failure) > timeout then
    redis.call('SET', KEYS[1], '2')
    redis.call('SET', KEYS[3], '0')
    redis.call('SET', KEYS[5], '0')
    return {1, 2}
  else
    return {0, 1}
  end
else
  local inflight = tonumber(redis.call('GET', KEYS[5]) or '0')
  if inflight < half_open_requests then
    redis.call('INCR', KEYS[5])
    return {1, 2}
  else
    return {0, 2}
  end
end
"#;

/// ARGV = {success_threshold}. Returns {state, failures, success, inflight}.
pub const BREAKER_RECORD_SUCCESS: &str = r#"
local state = tonumber(redis.call('GET', KEYS[1]) or '0')
local threshold = tonumber(ARGV[1])

if state == 0 then
  redis.call('SET', KEYS[2], '0')
  return {0, 0, 0, 0}
elseif state == 2 then
  local success = tonumber(redis.call('INCR', KEYS[3]))
  if success >= threshold then
    redis.call('SET', KEYS[1], '0')
    redis.call('SET', KEYS[2], '0')
    redis.call('SET', KEYS[3], '0')
    redis.call('SET', KEYS[5], '0')
    return {0, 0, 0, 0}
  else
    local inflight = tonumber(redis.call('GET', KEYS[5]) or '0')
    return {2, 0, success, inflight}
  end
else
  local failures = tonumber(redis.call('GET', KEYS[2]) or '0')
  return {1, failures, 0, 0}
end
"#;

/// ARGV = {failure_threshold, now}. Returns {state, failures, success, inflight}.
pub const BREAKER_RECORD_FAILURE: &str = r#"
local state = tonumber(redis.call('GET', KEYS[1]) or '0')
local threshold = tonumber(ARGV[1])
local now = tonumber(ARGV[2])

if state == 0 then
  local failures = tonumber(redis.call('INCR', KEYS[2]))
  if failures >= threshold then
    redis.call('SET', KEYS[1], '1')
    redis.call('SET', KEYS[4], tostring(now))
    return {1, failures, 0, 0}
  else
    return {0, failures, 0, 0}
  end
elseif state == 2 then
  redis.call('SET', KEYS[1], '1')
  redis.call('SET', KEYS[4], tostring(now))
  redis.call('SET', KEYS[5], '0')
  local failures = tonumber(redis.call('GET', KEYS[2]) or '0')
  return {1, failures, 0, 0}
else
  redis.call('SET', KEYS[4], tostring(now))
  local failures = tonumber(redis.call('GET', KEYS[2]) or '0')
  return {1, failures, 0, 0}
end
"#;

/// No-op whenever state is not HALF_OPEN, so a denied/non-admitted caller
/// can never steal another admitted request's slot.
pub const BREAKER_RELEASE_HALF_OPEN_SLOT: &str = r#"
local state = tonumber(redis.call('GET', KEYS[1]) or '0')
if state == 2 then
  local inflight = tonumber(redis.call('GET', KEYS[5]) or '0')
  if inflight > 0 then
    redis.call('DECR', KEYS[5])
  end
end
return 1
"#;
