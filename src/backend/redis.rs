use crate::backend::store::RequestCounter;
use crate::backend::RequestKey;
use crate::ValidationError;
use actix_web::{HttpResponse, ResponseError};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Redis error: {0}")]
    Redis(
        #[source]
        #[from]
        redis::RedisError,
    ),
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

impl ResponseError for Error {
    fn error_response(&self) -> HttpResponse {
        HttpResponse::InternalServerError().finish()
    }
}

/// A request log kept in Redis, for use with a [StoreBackend](crate::backend::store::StoreBackend).
///
/// Each key is a sorted set of requests scored by their timestamp. [RequestCounter::count] is a
/// `ZCOUNT` over the window, and the caller writes each admitted request with
/// [RedisRequestLog::record].
#[derive(Clone)]
pub struct RedisRequestLog {
    connection: ConnectionManager,
    key_prefix: Option<String>,
    retention: Duration,
    nonce: u64,
    sequence: Arc<AtomicU64>,
}

impl RedisRequestLog {
    /// Create a RedisRequestLog Builder.
    ///
    /// # Arguments
    ///
    /// * `connection`: A Redis connection manager.
    /// * `retention`: How long recorded requests are kept, at least the longest window that
    ///   will be counted over.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use haira_rate_limit::backend::redis::RedisRequestLog;
    /// # use redis::aio::ConnectionManager;
    /// # use std::time::Duration;
    /// # async fn example() {
    /// let client = redis::Client::open("redis://127.0.0.1/").unwrap();
    /// let manager = ConnectionManager::new(client).await.unwrap();
    /// let log = RedisRequestLog::builder(manager, Duration::from_secs(60)).build();
    /// # };
    /// ```
    pub fn builder(connection: ConnectionManager, retention: Duration) -> Builder {
        Builder {
            connection,
            key_prefix: None,
            retention,
        }
    }

    fn make_key(&self, key: &RequestKey) -> String {
        match &self.key_prefix {
            None => key.storage_key(),
            Some(prefix) => format!("{prefix}{}", key.storage_key()),
        }
    }

    /// Records a request at `now_ms`, and drops requests older than the retention period.
    pub async fn record(&self, identity: &str, resource: &str, now_ms: u64) -> Result<(), Error> {
        let key = self.make_key(&RequestKey::new(identity, resource)?);
        // Members must be unique, even for requests in the same millisecond
        let member = format!(
            "{now_ms}-{:x}-{}",
            self.nonce,
            self.sequence.fetch_add(1, Ordering::Relaxed)
        );
        let retention_ms = self.retention.as_millis() as u64;

        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("ZADD")
            .arg(&key)
            .arg(now_ms)
            .arg(member)
            .ignore()
            .cmd("ZREMRANGEBYSCORE")
            .arg(&key)
            .arg("-inf")
            .arg(now_ms.saturating_sub(retention_ms))
            .ignore()
            .cmd("PEXPIRE")
            .arg(&key)
            .arg(retention_ms)
            .ignore();

        let mut con = self.connection.clone();
        let () = pipe.query_async(&mut con).await?;
        Ok(())
    }

    /// Removes every recorded request for the given identity and resource.
    ///
    /// Note that the key prefix (if set) is automatically included.
    pub async fn remove_key(&self, identity: &str, resource: &str) -> Result<(), Error> {
        let key = self.make_key(&RequestKey::new(identity, resource)?);
        let mut con = self.connection.clone();
        let () = con.del(key).await?;
        Ok(())
    }
}

impl RequestCounter for RedisRequestLog {
    type Error = Error;

    async fn count(&self, resource: &str, identity: &str, window_start: u64) -> Result<u64, Error> {
        let key = self.make_key(&RequestKey::new(identity, resource)?);
        let mut con = self.connection.clone();
        let count: u64 = con.zcount(key, window_start, "+inf").await?;
        Ok(count)
    }
}

pub struct Builder {
    connection: ConnectionManager,
    key_prefix: Option<String>,
    retention: Duration,
}

impl Builder {
    /// Apply an optional prefix to all keys written by this log.
    ///
    /// This may be useful when the Redis instance is being used for other purposes; the prefix is
    /// used as a 'namespace' to avoid collision with other caches or keys inside Redis.
    pub fn key_prefix(mut self, key_prefix: Option<&str>) -> Self {
        self.key_prefix = key_prefix.map(ToOwned::to_owned);
        self
    }

    pub fn build(self) -> RedisRequestLog {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        RedisRequestLog {
            connection: self.connection,
            key_prefix: self.key_prefix,
            retention: self.retention,
            nonce: now.subsec_nanos() as u64 ^ ((std::process::id() as u64) << 32),
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }
}
