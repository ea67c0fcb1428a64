//! spool-redis
//!
//! Redis implementation of [`CoordinationStore`].
//!
//! Ordinary commands go through one [`ConnectionManager`], which reconnects on
//! its own. `BZPOPMAX` blocks the connection it runs on, so each blocking pop
//! opens its own connection instead of stalling the shared one.
//! The server may finish a pop whose caller already gave up; the queue puts
//! such entries back, so nothing here has to handle that.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, RedisError, Script};
use spool_core::ports::{CoordinationStore, ScoredMember, StoreError, WindowAdmission, WindowCount};
use tracing::debug;

/// Deletes the key only while it still holds the caller's token.
const DELETE_IF_EQUALS: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// Purge, count and conditionally record in one server-side step.
/// Replies `{admitted, count, oldest score or nil}`.
const ZADMIT: &str = r#"
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
local count = redis.call('ZCARD', KEYS[1])
local oldest = redis.call('ZRANGE', KEYS[1], 0, 0, 'WITHSCORES')
local admitted = 0
if count < tonumber(ARGV[2]) then
    redis.call('ZADD', KEYS[1], ARGV[3], ARGV[4])
    admitted = 1
end
return {admitted, count, oldest[2] or false}
"#;

pub struct RedisStore {
    client: Client,
    conn: ConnectionManager,
    delete_if_equals: Script,
    zadmit: Script,
}

impl RedisStore {
    /// Connect to `url` (e.g. `redis://127.0.0.1:6379/0`).
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = Client::open(url).map_err(store_error)?;
        let conn = client.get_connection_manager().await.map_err(store_error)?;
        debug!("connected to redis");
        Ok(Self {
            client,
            conn,
            delete_if_equals: Script::new(DELETE_IF_EQUALS),
            zadmit: Script::new(ZADMIT),
        })
    }
}

fn store_error(err: RedisError) -> StoreError {
    if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() || err.is_timeout() {
        StoreError::Unavailable(err.to_string())
    } else {
        StoreError::Backend(err.to_string())
    }
}

fn millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

fn parse_score(raw: &str) -> Result<f64, StoreError> {
    raw.parse()
        .map_err(|_| StoreError::Protocol(format!("score is not a number: {raw}")))
}

/// `[member, score, member, score, ...]` as returned by `WITHSCORES`.
fn scored_pairs(flat: Vec<String>) -> Result<Vec<ScoredMember>, StoreError> {
    if flat.len() % 2 != 0 {
        return Err(StoreError::Protocol(format!(
            "expected member/score pairs, got {} items",
            flat.len()
        )));
    }
    let mut out = Vec::with_capacity(flat.len() / 2);
    let mut items = flat.into_iter();
    while let (Some(member), Some(score)) = (items.next(), items.next()) {
        out.push(ScoredMember::new(member, parse_score(&score)?));
    }
    Ok(out)
}

fn first_pair(flat: Vec<String>) -> Result<Option<ScoredMember>, StoreError> {
    Ok(scored_pairs(flat)?.into_iter().next())
}

#[async_trait]
impl CoordinationStore for RedisStore {
    async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("ZADD")
            .arg(key)
            .arg(score)
            .arg(member)
            .query_async(&mut conn)
            .await
            .map_err(store_error)?;
        Ok(())
    }

    async fn zpop_max(&self, key: &str) -> Result<Option<ScoredMember>, StoreError> {
        let mut conn = self.conn.clone();
        let flat: Vec<String> = redis::cmd("ZPOPMAX")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(store_error)?;
        first_pair(flat)
    }

    async fn bzpop_max(
        &self,
        key: &str,
        timeout: Duration,
    ) -> Result<Option<ScoredMember>, StoreError> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(store_error)?;
        // 0 はサーバー側で「無期限」を意味するので避ける
        let secs = timeout.as_secs_f64().max(0.001);
        let popped: Option<(String, String, String)> = redis::cmd("BZPOPMAX")
            .arg(key)
            .arg(secs)
            .query_async(&mut conn)
            .await
            .map_err(store_error)?;
        match popped {
            Some((_key, member, score)) => Ok(Some(ScoredMember::new(member, parse_score(&score)?))),
            None => Ok(None),
        }
    }

    async fn zpeek_max(&self, key: &str) -> Result<Option<ScoredMember>, StoreError> {
        let mut conn = self.conn.clone();
        let flat: Vec<String> = redis::cmd("ZRANGE")
            .arg(key)
            .arg(-1)
            .arg(-1)
            .arg("WITHSCORES")
            .query_async(&mut conn)
            .await
            .map_err(store_error)?;
        first_pair(flat)
    }

    async fn zcard(&self, key: &str) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        redis::cmd("ZCARD")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(store_error)
    }

    async fn zrange_all(&self, key: &str) -> Result<Vec<ScoredMember>, StoreError> {
        let mut conn = self.conn.clone();
        let flat: Vec<String> = redis::cmd("ZRANGE")
            .arg(key)
            .arg(0)
            .arg(-1)
            .arg("WITHSCORES")
            .query_async(&mut conn)
            .await
            .map_err(store_error)?;
        scored_pairs(flat)
    }

    async fn zpurge_and_count(&self, key: &str, max_score: f64) -> Result<WindowCount, StoreError> {
        let mut conn = self.conn.clone();
        let (count, oldest): (u64, Vec<String>) = redis::pipe()
            .atomic()
            .cmd("ZREMRANGEBYSCORE")
            .arg(key)
            .arg("-inf")
            .arg(max_score)
            .ignore()
            .cmd("ZCARD")
            .arg(key)
            .cmd("ZRANGE")
            .arg(key)
            .arg(0)
            .arg(0)
            .arg("WITHSCORES")
            .query_async(&mut conn)
            .await
            .map_err(store_error)?;
        Ok(WindowCount {
            count,
            oldest: first_pair(oldest)?.map(|m| m.score),
        })
    }

    async fn zadmit(
        &self,
        key: &str,
        max_score: f64,
        limit: u64,
        score: f64,
        member: &str,
    ) -> Result<WindowAdmission, StoreError> {
        let mut conn = self.conn.clone();
        let (admitted, count, oldest): (i64, u64, Option<String>) = self
            .zadmit
            .key(key)
            .arg(max_score)
            .arg(limit)
            .arg(score)
            .arg(member)
            .invoke_async(&mut conn)
            .await
            .map_err(store_error)?;
        Ok(WindowAdmission {
            admitted: admitted == 1,
            window: WindowCount {
                count,
                oldest: oldest.as_deref().map(parse_score).transpose()?,
            },
        })
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let removed: i64 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(store_error)?;
        Ok(removed > 0)
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(store_error)?;
        Ok(reply.is_some())
    }

    async fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let removed: i64 = self
            .delete_if_equals
            .key(key)
            .arg(value)
            .invoke_async(&mut conn)
            .await
            .map_err(store_error)?;
        Ok(removed > 0)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(store_error)?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(store_error)
    }

    async fn incr_ex(&self, key: &str, ttl: Duration) -> Result<i64, StoreError> {
        let mut conn = self.conn.clone();
        let (value,): (i64,) = redis::pipe()
            .atomic()
            .cmd("INCR")
            .arg(key)
            .cmd("PEXPIRE")
            .arg(key)
            .arg(millis(ttl))
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(store_error)?;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spool_core::domain::TaskId;

    #[test]
    fn pairs_are_parsed_in_order() {
        let flat = vec!["a".to_string(), "1".to_string(), "b".to_string(), "2.5".to_string()];
        let pairs = scored_pairs(flat).unwrap();
        assert_eq!(pairs, vec![ScoredMember::new("a", 1.0), ScoredMember::new("b", 2.5)]);
    }

    #[test]
    fn odd_reply_is_protocol_error() {
        let err = scored_pairs(vec!["a".to_string()]).unwrap_err();
        assert!(matches!(err, StoreError::Protocol(_)));
    }

    #[test]
    fn ttl_never_rounds_to_zero() {
        assert_eq!(millis(Duration::from_micros(10)), 1);
        assert_eq!(millis(Duration::from_secs(2)), 2000);
    }

    async fn live_store() -> RedisStore {
        let url = std::env::var("SPOOL_REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into());
        RedisStore::connect(&url).await.unwrap()
    }

    fn unique(name: &str) -> String {
        format!("spool-test:{}:{name}", TaskId::generate())
    }

    #[tokio::test]
    #[ignore = "needs a redis server at SPOOL_REDIS_URL"]
    async fn ordered_set_round_trip() {
        let store = live_store().await;
        let key = unique("queue");

        store.zadd(&key, 300.0, "low").await.unwrap();
        store.zadd(&key, 900.0, "high").await.unwrap();

        assert_eq!(store.zcard(&key).await.unwrap(), 2);
        assert_eq!(store.zpeek_max(&key).await.unwrap().unwrap().member, "high");
        assert_eq!(store.zpop_max(&key).await.unwrap().unwrap().member, "high");
        assert_eq!(
            store.bzpop_max(&key, Duration::from_millis(100)).await.unwrap(),
            Some(ScoredMember::new("low", 300.0))
        );
        assert!(store.bzpop_max(&key, Duration::from_millis(100)).await.unwrap().is_none());
    }

    #[tokio::test]
    #[ignore = "needs a redis server at SPOOL_REDIS_URL"]
    async fn purge_counts_what_is_left() {
        let store = live_store().await;
        let key = unique("window");
        for (score, member) in [(1.0, "a"), (2.0, "b"), (3.0, "c")] {
            store.zadd(&key, score, member).await.unwrap();
        }

        let window = store.zpurge_and_count(&key, 2.0).await.unwrap();
        assert_eq!(window, WindowCount { count: 1, oldest: Some(3.0) });
        store.delete(&key).await.unwrap();
    }

    #[tokio::test]
    #[ignore = "needs a redis server at SPOOL_REDIS_URL"]
    async fn admit_purges_and_respects_limit() {
        let store = live_store().await;
        let key = unique("admit");
        store.zadd(&key, 1.0, "expired").await.unwrap();

        let first = store.zadmit(&key, 5.0, 1, 10.0, "a").await.unwrap();
        assert_eq!(
            first,
            WindowAdmission { admitted: true, window: WindowCount::default() }
        );

        let second = store.zadmit(&key, 5.0, 1, 11.0, "b").await.unwrap();
        assert!(!second.admitted);
        assert_eq!(second.window, WindowCount { count: 1, oldest: Some(10.0) });
        assert_eq!(store.zcard(&key).await.unwrap(), 1);
        store.delete(&key).await.unwrap();
    }

    #[tokio::test]
    #[ignore = "needs a redis server at SPOOL_REDIS_URL"]
    async fn locks_and_counters() {
        let store = live_store().await;
        let lock = unique("lock");
        let counter = unique("count");

        assert!(store.set_nx(&lock, "me", Duration::from_secs(5)).await.unwrap());
        assert!(!store.set_nx(&lock, "you", Duration::from_secs(5)).await.unwrap());
        assert!(!store.delete_if_equals(&lock, "you").await.unwrap());
        assert!(store.delete_if_equals(&lock, "me").await.unwrap());

        assert_eq!(store.incr_ex(&counter, Duration::from_secs(5)).await.unwrap(), 1);
        assert_eq!(store.incr_ex(&counter, Duration::from_secs(5)).await.unwrap(), 2);
        assert_eq!(store.get(&counter).await.unwrap().as_deref(), Some("2"));
        store.delete(&counter).await.unwrap();
    }
}
