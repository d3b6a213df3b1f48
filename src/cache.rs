use async_trait::async_trait;

use crate::config::CacheConfig;

/// Attribute cache lookup key for a value digest.
pub fn attribute_key(value_sig: &str) -> String {
  format!("attribute:{value_sig}")
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
  /// The server rejected the command, e.g. a maxmemory quota on write.
  #[error("cache response: {0}")]
  Response(String),

  #[error("cache unavailable: {0}")]
  Unavailable(String),
}

/// The key-value store both caches live in. The cache is advisory: lookup
/// failures must degrade to absence, never to a wrong verdict. Connections
/// are per-worker and never shared.
#[async_trait]
pub trait KvStore: Send {
  async fn ping(&mut self) -> Result<(), CacheError>;

  /// Values for the given keys, `None` where absent.
  async fn mget(
    &mut self,
    keys: &[String],
  ) -> Result<Vec<Option<Vec<u8>>>, CacheError>;

  /// Store all entries in one round trip.
  async fn mset(
    &mut self,
    entries: &[(String, Vec<u8>)],
  ) -> Result<(), CacheError>;
}

pub struct RedisStore {
  conn: redis::aio::MultiplexedConnection,
}

impl RedisStore {
  pub async fn connect(config: &CacheConfig) -> Result<Self, CacheError> {
    let info = redis::ConnectionInfo {
      addr: redis::ConnectionAddr::Tcp(config.host.clone(), config.port),
      redis: redis::RedisConnectionInfo {
        db: config.database,
        password: config.password.clone(),
        ..Default::default()
      },
    };
    let client = redis::Client::open(info).map_err(from_redis)?;
    let conn = client
      .get_multiplexed_tokio_connection()
      .await
      .map_err(from_redis)?;
    Ok(Self { conn })
  }
}

fn from_redis(err: redis::RedisError) -> CacheError {
  if err.kind() == redis::ErrorKind::ResponseError {
    CacheError::Response(err.to_string())
  } else {
    CacheError::Unavailable(err.to_string())
  }
}

#[async_trait]
impl KvStore for RedisStore {
  async fn ping(&mut self) -> Result<(), CacheError> {
    let _pong: String = redis::cmd("PING")
      .query_async(&mut self.conn)
      .await
      .map_err(from_redis)?;
    Ok(())
  }

  async fn mget(
    &mut self,
    keys: &[String],
  ) -> Result<Vec<Option<Vec<u8>>>, CacheError> {
    if keys.is_empty() {
      return Ok(Vec::new());
    }
    let mut cmd = redis::cmd("MGET");
    for key in keys {
      cmd.arg(key);
    }
    let values: Vec<Option<Vec<u8>>> = cmd
      .query_async(&mut self.conn)
      .await
      .map_err(from_redis)?;
    Ok(values)
  }

  async fn mset(
    &mut self,
    entries: &[(String, Vec<u8>)],
  ) -> Result<(), CacheError> {
    if entries.is_empty() {
      return Ok(());
    }
    let mut cmd = redis::cmd("MSET");
    for (key, value) in entries {
      cmd.arg(key).arg(value.as_slice());
    }
    let () = cmd
      .query_async(&mut self.conn)
      .await
      .map_err(from_redis)?;
    Ok(())
  }
}
