/// Lua script for sliding window rate limiting
///
/// Keeps one sorted set per key, scored by admission time in milliseconds.
/// Only admitted requests are added, matching the in-process limiter.
///
/// KEYS[1] = the rate limit key
/// ARGV[1] = maximum requests
/// ARGV[2] = window duration (milliseconds)
/// ARGV[3] = current timestamp (milliseconds)
/// ARGV[4] = unique member for this request
///
/// Returns: [allowed (0/1), remaining requests, reset_after (milliseconds)]
pub const SLIDING_WINDOW_SCRIPT: &str = r#"
local key = KEYS[1]
local max_requests = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local member = ARGV[4]

-- Remove entries that have left the window
redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window)

local current_count = redis.call('ZCARD', key)

local allowed = 0
local remaining = max_requests - current_count
local reset_after = window

if current_count < max_requests then
    redis.call('ZADD', key, now, member)
    redis.call('PEXPIRE', key, window)
    allowed = 1
    remaining = remaining - 1
end

local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
if oldest[2] then
    reset_after = tonumber(oldest[2]) + window - now
end

return {allowed, math.max(0, remaining), math.max(1, reset_after)}
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_is_valid() {
        assert!(SLIDING_WINDOW_SCRIPT.contains("ZREMRANGEBYSCORE"));
        assert!(SLIDING_WINDOW_SCRIPT.contains("ZADD"));
        assert!(SLIDING_WINDOW_SCRIPT.contains("PEXPIRE"));
    }
}
