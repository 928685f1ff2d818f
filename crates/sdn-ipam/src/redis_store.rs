//! Redis-backed cluster store.
//!
//! Each logical store maps to one Redis hash. The conditional write runs as a
//! server-side script so the compare and the set happen atomically for every
//! node sharing the Redis instance.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use tracing::{debug, instrument};

use crate::error::IpamResult;
use crate::store::{CasOutcome, KvStore};

/// Default prefix for the per-store hashes.
pub const DEFAULT_KEY_PREFIX: &str = "sdn";

/// Compare-and-set on a hash field.
///
/// KEYS[1] = hash, ARGV[1] = field, ARGV[2] = new value,
/// ARGV[3] = "1" when an expected value is supplied, ARGV[4] = expected value.
static CAS_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
local cur = redis.call('HGET', KEYS[1], ARGV[1])
if ARGV[3] == '1' then
  if cur ~= ARGV[4] then return 0 end
elseif cur then
  return 0
end
redis.call('HSET', KEYS[1], ARGV[1], ARGV[2])
return 1
"#,
    )
});

/// Cluster store held in Redis hashes.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    prefix: String,
}

impl RedisStore {
    /// Connects to the Redis server at `url` (e.g. `redis://10.0.0.1:6379/0`).
    #[instrument]
    pub async fn connect(url: &str) -> IpamResult<Self> {
        let client = Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        debug!("Connected to cluster store");

        Ok(Self {
            conn,
            prefix: DEFAULT_KEY_PREFIX.to_string(),
        })
    }

    /// Overrides the hash prefix, letting several clusters share one server.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    fn hash_key(&self, store: &str) -> String {
        format!("{}:{}", self.prefix, store)
    }
}

#[async_trait]
impl KvStore for RedisStore {
    async fn get(&self, store: &str, key: &str) -> IpamResult<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        let value: Option<Vec<u8>> = conn.hget(self.hash_key(store), key).await?;
        Ok(value)
    }

    async fn get_all(&self, store: &str) -> IpamResult<Vec<Vec<u8>>> {
        let mut conn = self.conn.clone();
        let values: Vec<Vec<u8>> = conn.hvals(self.hash_key(store)).await?;
        Ok(values)
    }

    async fn put(
        &self,
        store: &str,
        key: &str,
        value: &[u8],
        expected: Option<&[u8]>,
    ) -> IpamResult<CasOutcome> {
        let mut conn = self.conn.clone();
        let has_expected = if expected.is_some() { "1" } else { "0" };

        let applied: i32 = CAS_SCRIPT
            .key(self.hash_key(store))
            .arg(key)
            .arg(value)
            .arg(has_expected)
            .arg(expected.unwrap_or_default())
            .invoke_async(&mut conn)
            .await?;

        Ok(if applied == 1 {
            CasOutcome::Applied
        } else {
            CasOutcome::Outdated
        })
    }

    async fn delete(&self, store: &str, key: &str) -> IpamResult<bool> {
        let mut conn = self.conn.clone();
        let removed: i32 = conn.hdel(self.hash_key(store), key).await?;
        Ok(removed > 0)
    }
}
