//! Redis-backed [`SeqKv`].
//!
//! The allocation protocol lives in two server-side Lua scripts so that every
//! state transition on a range key is atomic without any client-side lock
//! service. The lock nonce is picked by the script itself and handed back to
//! the caller, so client identity and restarts are irrelevant.

use std::time::Duration;

use futures::future::BoxFuture;
use redis::aio::ConnectionManager;
use redis::Script;
use tracing::error;

use super::{MallocStep, PublishOutcome, SeqKv};
use crate::error::{SeqError, SeqResult};

/// Allocation step. Tags: 0 ranged, 1 absent (caller holds the returned
/// lock), 2 locked by another holder, 3 exhausted (caller owns the remaining
/// prefix and the returned lock).
const MALLOC_SCRIPT: &str = r#"
local key = KEYS[1]
local size = tonumber(ARGV[1])
local lockSecond = ARGV[2]
local dataSecond = ARGV[3]
local result = {}
if redis.call("EXISTS", key) == 0 then
	local lockValue = math.random(0, 999999999)
	redis.call("HSET", key, "LOCK", lockValue)
	redis.call("EXPIRE", key, lockSecond)
	table.insert(result, 1)
	table.insert(result, lockValue)
	return result
end
if redis.call("HEXISTS", key, "LOCK") == 1 then
	table.insert(result, 2)
	return result
end
local curr_seq = tonumber(redis.call("HGET", key, "CURR"))
local last_seq = tonumber(redis.call("HGET", key, "LAST"))
if size == 0 then
	redis.call("EXPIRE", key, dataSecond)
	table.insert(result, 0)
	table.insert(result, curr_seq)
	table.insert(result, last_seq)
	return result
end
local max_seq = curr_seq + size
if max_seq > last_seq then
	local lockValue = math.random(0, 999999999)
	redis.call("HSET", key, "LOCK", lockValue)
	redis.call("HSET", key, "CURR", last_seq)
	redis.call("EXPIRE", key, lockSecond)
	table.insert(result, 3)
	table.insert(result, curr_seq)
	table.insert(result, last_seq)
	table.insert(result, lockValue)
	return result
end
redis.call("HSET", key, "CURR", max_seq)
redis.call("EXPIRE", key, dataSecond)
table.insert(result, 0)
table.insert(result, curr_seq)
table.insert(result, last_seq)
return result
"#;

/// Range publish. Tags: 0 replaced under our lock, 1 key was absent and got
/// created, 2 lock held by someone else (nothing written).
const PUBLISH_SCRIPT: &str = r#"
local key = KEYS[1]
local lockValue = ARGV[1]
local dataSecond = ARGV[2]
local curr_seq = tonumber(ARGV[3])
local last_seq = tonumber(ARGV[4])
if redis.call("EXISTS", key) == 0 then
	redis.call("HSET", key, "CURR", curr_seq, "LAST", last_seq)
	redis.call("EXPIRE", key, dataSecond)
	return 1
end
if redis.call("HGET", key, "LOCK") ~= lockValue then
	return 2
end
redis.call("HDEL", key, "LOCK")
redis.call("HSET", key, "CURR", curr_seq, "LAST", last_seq)
redis.call("EXPIRE", key, dataSecond)
return 0
"#;

/// Compare-and-delete for soft locks.
const UNLOCK_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
	return redis.call("DEL", KEYS[1])
end
return 0
"#;

/// Number of hash slots in a Redis cluster.
const SLOT_COUNT: u16 = 16384;

/// Redis client for the sequence subsystem.
///
/// Holds a multiplexed connection; cloning the manager per call is an atomic
/// handle copy, not a new connection.
pub struct RedisSeqKv {
    conn: ConnectionManager,
    malloc_script: Script,
    publish_script: Script,
    unlock_script: Script,
}

impl RedisSeqKv {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            malloc_script: Script::new(MALLOC_SCRIPT),
            publish_script: Script::new(PUBLISH_SCRIPT),
            unlock_script: Script::new(UNLOCK_SCRIPT),
        }
    }

    /// Connect to a Redis URL (`redis://…`).
    pub async fn connect(url: &str) -> SeqResult<Self> {
        let client = redis::Client::open(url).map_err(SeqError::kv)?;
        let conn = ConnectionManager::new(client).await.map_err(SeqError::kv)?;
        Ok(Self::new(conn))
    }

    fn parse_malloc_reply(reply: &[i64]) -> SeqResult<MallocStep> {
        let step = match (reply.first().copied(), reply.len()) {
            (Some(0), 3) => MallocStep::Ranged {
                curr: reply[1],
                last: reply[2],
            },
            (Some(1), 2) => MallocStep::MustFill { lock: reply[1] },
            (Some(2), 1) => MallocStep::Locked,
            (Some(3), 4) => MallocStep::Exhausted {
                curr: reply[1],
                last: reply[2],
                lock: reply[3],
            },
            (Some(tag), _) if !(0..=3).contains(&tag) => {
                error!(tag, "allocation script returned unknown tag");
                return Err(SeqError::UnknownState(tag));
            }
            _ => {
                error!(?reply, "allocation script returned malformed reply");
                return Err(SeqError::internal(format!(
                    "malformed malloc reply of {} values",
                    reply.len()
                )));
            }
        };
        Ok(step)
    }

    fn parse_publish_reply(tag: i64) -> SeqResult<PublishOutcome> {
        match tag {
            0 => Ok(PublishOutcome::Replaced),
            1 => Ok(PublishOutcome::Created),
            2 => Ok(PublishOutcome::LockLost),
            other => {
                error!(tag = other, "publish script returned unknown tag");
                Err(SeqError::UnknownState(other))
            }
        }
    }
}

impl SeqKv for RedisSeqKv {
    fn malloc_step(
        &self,
        key: &str,
        size: i64,
        lock_ttl: Duration,
        data_ttl: Duration,
    ) -> BoxFuture<'_, SeqResult<MallocStep>> {
        let key = key.to_owned();
        let mut conn = self.conn.clone();
        Box::pin(async move {
            let reply: Vec<i64> = self
                .malloc_script
                .key(&key)
                .arg(size)
                .arg(lock_ttl.as_secs().max(1))
                .arg(data_ttl.as_secs().max(1))
                .invoke_async(&mut conn)
                .await
                .map_err(SeqError::kv)?;
            Self::parse_malloc_reply(&reply)
        })
    }

    fn publish_range(
        &self,
        key: &str,
        lock: i64,
        data_ttl: Duration,
        curr: i64,
        last: i64,
    ) -> BoxFuture<'_, SeqResult<PublishOutcome>> {
        let key = key.to_owned();
        let mut conn = self.conn.clone();
        Box::pin(async move {
            let tag: i64 = self
                .publish_script
                .key(&key)
                .arg(lock)
                .arg(data_ttl.as_secs().max(1))
                .arg(curr)
                .arg(last)
                .invoke_async(&mut conn)
                .await
                .map_err(SeqError::kv)?;
            Self::parse_publish_reply(tag)
        })
    }

    fn read_currs(&self, keys: &[String]) -> BoxFuture<'_, SeqResult<Vec<Option<i64>>>> {
        let keys = keys.to_vec();
        let mut conn = self.conn.clone();
        Box::pin(async move {
            if keys.is_empty() {
                return Ok(Vec::new());
            }
            let mut pipe = redis::pipe();
            for key in &keys {
                pipe.cmd("HGET").arg(key).arg("CURR");
            }
            let currs: Vec<Option<i64>> = pipe
                .query_async(&mut conn)
                .await
                .map_err(SeqError::kv)?;
            if currs.len() != keys.len() {
                return Err(SeqError::internal(format!(
                    "pipelined read returned {} values for {} keys",
                    currs.len(),
                    keys.len()
                )));
            }
            Ok(currs)
        })
    }

    fn group_keys_by_slot(&self, keys: Vec<String>) -> Vec<Vec<String>> {
        let mut groups: Vec<Vec<String>> = Vec::new();
        let mut slot_index: std::collections::HashMap<u16, usize> = std::collections::HashMap::new();
        for key in keys {
            let slot = key_hash_slot(&key);
            let index = *slot_index.entry(slot).or_insert_with(|| {
                groups.push(Vec::new());
                groups.len() - 1
            });
            groups[index].push(key);
        }
        groups
    }

    fn get_i64(&self, key: &str) -> BoxFuture<'_, SeqResult<Option<i64>>> {
        let key = key.to_owned();
        let mut conn = self.conn.clone();
        Box::pin(async move {
            let value: Option<i64> = redis::cmd("GET")
                .arg(&key)
                .query_async(&mut conn)
                .await
                .map_err(SeqError::kv)?;
            Ok(value)
        })
    }

    fn set_i64(&self, key: &str, value: i64, ttl: Duration) -> BoxFuture<'_, SeqResult<()>> {
        let key = key.to_owned();
        let mut conn = self.conn.clone();
        Box::pin(async move {
            let _: () = redis::cmd("SET")
                .arg(&key)
                .arg(value)
                .arg("EX")
                .arg(ttl.as_secs().max(1))
                .query_async(&mut conn)
                .await
                .map_err(SeqError::kv)?;
            Ok(())
        })
    }

    fn try_lock(&self, key: &str, token: i64, ttl: Duration) -> BoxFuture<'_, SeqResult<bool>> {
        let key = key.to_owned();
        let mut conn = self.conn.clone();
        Box::pin(async move {
            let reply: Option<String> = redis::cmd("SET")
                .arg(&key)
                .arg(token)
                .arg("NX")
                .arg("EX")
                .arg(ttl.as_secs().max(1))
                .query_async(&mut conn)
                .await
                .map_err(SeqError::kv)?;
            Ok(reply.is_some())
        })
    }

    fn unlock(&self, key: &str, token: i64) -> BoxFuture<'_, SeqResult<()>> {
        let key = key.to_owned();
        let mut conn = self.conn.clone();
        Box::pin(async move {
            let _: i64 = self
                .unlock_script
                .key(&key)
                .arg(token)
                .invoke_async(&mut conn)
                .await
                .map_err(SeqError::kv)?;
            Ok(())
        })
    }

    fn del(&self, keys: &[String]) -> BoxFuture<'_, SeqResult<()>> {
        let keys = keys.to_vec();
        let mut conn = self.conn.clone();
        Box::pin(async move {
            if keys.is_empty() {
                return Ok(());
            }
            let _: i64 = redis::cmd("DEL")
                .arg(&keys)
                .query_async(&mut conn)
                .await
                .map_err(SeqError::kv)?;
            Ok(())
        })
    }
}

/// Cluster hash slot of a key, honouring `{…}` hash tags.
fn key_hash_slot(key: &str) -> u16 {
    let bytes = key.as_bytes();
    let hashed = match bytes.iter().position(|&b| b == b'{') {
        Some(open) => match bytes[open + 1..].iter().position(|&b| b == b'}') {
            // Empty tags fall back to hashing the whole key.
            Some(0) | None => bytes,
            Some(close) => &bytes[open + 1..open + 1 + close],
        },
        None => bytes,
    };
    crc16_xmodem(hashed) % SLOT_COUNT
}

/// CRC16/XMODEM (poly 0x1021), the checksum the cluster keyslot is defined on.
fn crc16_xmodem(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
        }
    }
    crc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc16_reference_vector() {
        assert_eq!(crc16_xmodem(b"123456789"), 0x31C3);
    }

    #[test]
    fn hash_tags_pin_keys_to_one_slot() {
        assert_eq!(
            key_hash_slot("{user1000}.following"),
            key_hash_slot("{user1000}.followers"),
        );
        // Empty tag hashes the whole key.
        assert_ne!(key_hash_slot("foo{}a"), key_hash_slot("foo{}b"));
        assert_eq!(key_hash_slot("123456789"), 0x31C3 % SLOT_COUNT);
    }

    #[test]
    fn malloc_reply_parsing() {
        assert_eq!(
            RedisSeqKv::parse_malloc_reply(&[0, 10, 110]).unwrap(),
            MallocStep::Ranged { curr: 10, last: 110 },
        );
        assert_eq!(
            RedisSeqKv::parse_malloc_reply(&[1, 77]).unwrap(),
            MallocStep::MustFill { lock: 77 },
        );
        assert_eq!(
            RedisSeqKv::parse_malloc_reply(&[2]).unwrap(),
            MallocStep::Locked,
        );
        assert_eq!(
            RedisSeqKv::parse_malloc_reply(&[3, 108, 110, 5]).unwrap(),
            MallocStep::Exhausted {
                curr: 108,
                last: 110,
                lock: 5
            },
        );
        assert!(matches!(
            RedisSeqKv::parse_malloc_reply(&[9]),
            Err(SeqError::UnknownState(9)),
        ));
        assert!(matches!(
            RedisSeqKv::parse_malloc_reply(&[0, 10]),
            Err(SeqError::Internal(_)),
        ));
    }

    #[test]
    fn publish_reply_parsing() {
        assert_eq!(
            RedisSeqKv::parse_publish_reply(0).unwrap(),
            PublishOutcome::Replaced,
        );
        assert_eq!(
            RedisSeqKv::parse_publish_reply(1).unwrap(),
            PublishOutcome::Created,
        );
        assert_eq!(
            RedisSeqKv::parse_publish_reply(2).unwrap(),
            PublishOutcome::LockLost,
        );
        assert!(matches!(
            RedisSeqKv::parse_publish_reply(7),
            Err(SeqError::UnknownState(7)),
        ));
    }
}
