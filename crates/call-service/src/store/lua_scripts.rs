//! Lua scripts for atomic call record writes.
//!
//! Each script performs its write and publishes the change notification in
//! the same atomic step, so a subscriber never sees a notification for a
//! write that did not land (and never misses one that did).
//!
//! # Return Codes
//!
//! - 1: Written (notification published)
//! - 0: Not written (record already exists / write-once field already set)
//! - -1: Record missing

/// Create a call record if none exists.
///
/// Arguments:
/// - KEYS[1]: Record hash (`call:{id}`)
/// - KEYS[2]: Registry index set (`calls`)
/// - KEYS[3]: Per-call change channel (`call:{id}:changes`)
/// - KEYS[4]: Registry change channel (`calls:changes`)
/// - ARGV[1]: Call id (index member)
/// - ARGV[2]: Change notification (JSON)
/// - ARGV[3..]: Hash field-value pairs
pub const CREATE_CALL: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
    return 0
end

for i = 3, #ARGV, 2 do
    redis.call('HSET', KEYS[1], ARGV[i], ARGV[i + 1])
end

redis.call('SADD', KEYS[2], ARGV[1])
redis.call('PUBLISH', KEYS[3], ARGV[2])
redis.call('PUBLISH', KEYS[4], ARGV[2])
return 1
"#;

/// Write a negotiation payload field exactly once.
///
/// Arguments:
/// - KEYS[1]: Record hash (`call:{id}`)
/// - KEYS[2]: Per-call change channel
/// - KEYS[3]: Registry change channel
/// - ARGV[1]: Field name (`offerPayload` or `answerPayload`)
/// - ARGV[2]: Payload
/// - ARGV[3]: Change notification (JSON)
pub const WRITE_ONCE: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
    return -1
end

if redis.call('HSETNX', KEYS[1], ARGV[1], ARGV[2]) == 0 then
    -- Already written by its owner; keep the original
    return 0
end

redis.call('PUBLISH', KEYS[2], ARGV[3])
redis.call('PUBLISH', KEYS[3], ARGV[3])
return 1
"#;

/// Write the call status (last write wins), optionally with `endedAt`.
///
/// Arguments:
/// - KEYS[1]: Record hash (`call:{id}`)
/// - KEYS[2]: Per-call change channel
/// - KEYS[3]: Registry change channel
/// - ARGV[1]: Status
/// - ARGV[2]: `endedAt` timestamp, or empty string to leave it untouched
/// - ARGV[3]: Change notification (JSON)
pub const WRITE_STATUS: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
    return -1
end

redis.call('HSET', KEYS[1], 'status', ARGV[1])
if ARGV[2] ~= '' then
    redis.call('HSET', KEYS[1], 'endedAt', ARGV[2])
end

redis.call('PUBLISH', KEYS[2], ARGV[3])
redis.call('PUBLISH', KEYS[3], ARGV[3])
return 1
"#;
