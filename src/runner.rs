use std::{
  collections::BTreeMap,
  path::PathBuf,
  sync::Arc,
  time::Instant,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, error, info};

use crate::{
  digest::Digest,
  error::{Error, Result},
  filter::Filter,
  object::{Object, SessionVars},
  process::{Conn, FilterProcess},
};

/// Filters producing attribute data slower than this (bytes per second of
/// output over execution time) get their output values cached as well as
/// their results.
const ATTRIBUTE_CACHE_THRESHOLD: f64 = (2 << 20) as f64;

/// The recorded outcome of running a processor on an object: the score and
/// digests of the output attributes, together with digests of the input
/// attributes used to produce them. This is the persisted result-cache
/// payload; `cache_output` is derived at execution time and not persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterResult {
  pub input_attrs: BTreeMap<String, String>,
  pub output_attrs: BTreeMap<String, String>,
  pub score: f64,
  #[serde(skip)]
  pub cache_output: bool,
}

impl FilterResult {
  pub fn encode(&self) -> Vec<u8> {
    serde_json::to_vec(self).unwrap_or_default()
  }

  /// Decode a cached payload. Anything short of the full schema reads as
  /// no result.
  pub fn decode(data: &[u8]) -> Option<Self> {
    serde_json::from_slice(data).ok()
  }
}

/// A context for processing objects: the object fetcher at the head of the
/// stack, or one filter runner per filter.
#[async_trait]
pub trait ObjectProcessor: Send {
  fn display_name(&self) -> &str;

  /// Digest preloaded with the object-independent parameters.
  fn cache_digest(&self) -> Digest;

  /// Result-cache lookup key for previous executions on this object.
  fn cache_key(&self, obj: &dyn Object) -> String {
    let mut digest = self.cache_digest();
    digest.update(obj.id());
    format!("result:{}", digest.hex())
  }

  /// Notification that a cached result for this processor was used.
  fn cache_hit(&self, _result: &FilterResult) {}

  /// Run the processor on the object, mutating it as the filter would.
  async fn evaluate(&mut self, obj: &mut dyn Object) -> Result<FilterResult>;

  /// True to accept the object, false to drop it.
  fn threshold(&self, result: &FilterResult) -> bool;
}

/// Head of every stack: loads object data from its source and records the
/// digests of everything that arrived.
pub struct ObjectFetcher {
  digest_prefix: Digest,
}

impl ObjectFetcher {
  pub fn new() -> Self {
    let mut digest_prefix = Digest::new();
    digest_prefix.update("dataretriever ");
    Self { digest_prefix }
  }
}

#[async_trait]
impl ObjectProcessor for ObjectFetcher {
  fn display_name(&self) -> &str {
    "fetcher"
  }

  fn cache_digest(&self) -> Digest {
    self.digest_prefix.clone()
  }

  async fn evaluate(&mut self, obj: &mut dyn Object) -> Result<FilterResult> {
    obj.load().await?;
    let mut result = FilterResult::default();
    for key in obj.keys() {
      if let Some(sig) = obj.signature(&key) {
        result.output_attrs.insert(key, sig);
      }
    }
    Ok(result)
  }

  fn threshold(&self, _result: &FilterResult) -> bool {
    true
  }
}

/// Runs one filter's child process against objects. The process is spawned
/// lazily on first use and persists across objects until it dies.
pub struct FilterRunner {
  filter: Arc<Filter>,
  session_vars: Arc<dyn SessionVars>,
  code_path: PathBuf,
  proc: Option<FilterProcess>,
  initialized: bool,
}

impl FilterRunner {
  pub fn new(
    filter: Arc<Filter>,
    session_vars: Arc<dyn SessionVars>,
    code_path: PathBuf,
  ) -> Self {
    Self {
      filter,
      session_vars,
      code_path,
      proc: None,
      initialized: false,
    }
  }
}

#[async_trait]
impl ObjectProcessor for FilterRunner {
  fn display_name(&self) -> &str {
    self.filter.name()
  }

  fn cache_digest(&self) -> Digest {
    self.filter.cache_digest()
  }

  fn cache_hit(&self, result: &FilterResult) {
    let accepted = self.threshold(result);
    self.filter.stats().record_cache_hit(accepted);
  }

  async fn evaluate(&mut self, obj: &mut dyn Object) -> Result<FilterResult> {
    if self.proc.is_none() {
      self.proc = Some(
        FilterProcess::spawn(
          &self.code_path,
          self.filter.name(),
          self.filter.arguments(),
          self.filter.blob(),
        )
        .await?,
      );
      self.initialized = false;
    }

    let started = Instant::now();
    let mut result = FilterResult::default();
    let outcome = match self.proc.as_mut() {
      Some(proc) => {
        drive_filter(
          proc.conn(),
          &self.filter,
          self.session_vars.as_ref(),
          &mut self.initialized,
          obj,
          &mut result,
        )
        .await
      }
      None => Ok(()),
    };

    let fatal = match outcome {
      Ok(()) => None,
      Err(Error::Io(_)) if !self.initialized => Some(Error::Execution(
        format!("filter {} failed to initialize", self.filter.name()),
      )),
      Err(Error::Io(_)) => {
        // Filter died on an object. The score stays at its default of
        // zero, so this reads as a drop; the next object respawns.
        error!(
          filter = self.filter.name(),
          signature = self.filter.signature(),
          object = %String::from_utf8_lossy(obj.id()),
          "filter died on object",
        );
        self.proc = None;
        None
      }
      Err(err) => Some(err),
    };

    // Statistics and the throughput gate run even when the filter died
    // before emitting a result.
    let elapsed = started.elapsed();
    let accepted = self.threshold(&result);
    self.filter.stats().record_computed(accepted, elapsed);
    let output_bytes: usize = result
      .output_attrs
      .keys()
      .filter_map(|key| obj.get(key))
      .map(<[u8]>::len)
      .sum();
    let throughput = output_bytes as f64 / elapsed.as_secs_f64();
    // A zero-output evaluation always qualifies.
    if !(throughput >= ATTRIBUTE_CACHE_THRESHOLD) {
      result.cache_output = true;
    }

    match fatal {
      Some(err) => Err(err),
      None => Ok(result),
    }
  }

  fn threshold(&self, result: &FilterResult) -> bool {
    result.score >= self.filter.threshold()
  }
}

/// Drive the filter's command loop for one object, until the filter
/// reports a result or the conversation breaks down.
async fn drive_filter<R, W>(
  conn: &mut Conn<R, W>,
  filter: &Filter,
  session_vars: &dyn SessionVars,
  initialized: &mut bool,
  obj: &mut dyn Object,
  result: &mut FilterResult,
) -> Result<()>
where
  R: AsyncRead + Unpin + Send,
  W: AsyncWrite + Unpin + Send,
{
  loop {
    let cmd = conn.tag().await?;
    match cmd.as_str() {
      // May not be the filter's first command; its init function can log.
      "init-success" => *initialized = true,
      "get-attribute" => {
        let key = conn
          .item()
          .await?
          .map(|k| String::from_utf8_lossy(&k).into_owned());
        let value = key
          .as_deref()
          .and_then(|k| obj.get(k))
          .map(<[u8]>::to_vec);
        match (key, value) {
          (Some(key), Some(value)) => {
            conn.send_value(&value).await?;
            conn.flush().await?;
            if let Some(sig) = obj.signature(&key) {
              result.input_attrs.insert(key, sig);
            }
          }
          _ => {
            conn.send_none().await?;
            conn.flush().await?;
          }
        }
      }
      "set-attribute" => {
        let key = string_item(conn, filter).await?;
        let value = required_item(conn, filter).await?;
        obj.set(&key, value);
        if let Some(sig) = obj.signature(&key) {
          result.output_attrs.insert(key, sig);
        }
      }
      "omit-attribute" => {
        let key = string_item(conn, filter).await?;
        conn.send_bool(obj.omit(&key)).await?;
        conn.flush().await?;
      }
      "get-session-variables" => {
        let keys: Vec<String> = conn
          .array()
          .await?
          .into_iter()
          .map(|k| String::from_utf8_lossy(&k).into_owned())
          .collect();
        let values = session_vars.filter_get(&keys);
        let ordered: Vec<String> = keys
          .iter()
          .map(|k| values.get(k).copied().unwrap_or(0.0).to_string())
          .collect();
        conn.send_list(&ordered).await?;
        conn.flush().await?;
      }
      "update-session-variables" => {
        let keys = conn.array().await?;
        let values = conn.array().await?;
        if keys.len() != values.len() {
          return Err(Error::Execution(format!(
            "{}: bad array lengths",
            filter.name()
          )));
        }
        let mut updates = std::collections::HashMap::new();
        for (key, value) in keys.into_iter().zip(values) {
          let value: f64 = String::from_utf8_lossy(&value)
            .trim()
            .parse()
            .map_err(|_| {
              Error::Execution(format!(
                "{}: bad session variable value",
                filter.name()
              ))
            })?;
          updates.insert(String::from_utf8_lossy(&key).into_owned(), value);
        }
        session_vars.filter_update(updates);
      }
      "log" => {
        let level: u32 = String::from_utf8_lossy(
          &required_item(conn, filter).await?,
        )
        .trim()
        .parse()
        .map_err(|_| {
          Error::Execution(format!("{}: bad log level", filter.name()))
        })?;
        let message = required_item(conn, filter).await?;
        let message = String::from_utf8_lossy(&message);
        if level & 0x03 != 0 {
          error!(filter = filter.name(), "{message}");
        } else if level & 0x04 != 0 {
          info!(filter = filter.name(), "{message}");
        } else if level & 0x08 != 0 {
          // Filter trace output is too verbose to keep.
        } else {
          debug!(filter = filter.name(), "{message}");
        }
      }
      "stdout" => {
        let item = required_item(conn, filter).await?;
        emit_stdout(&item).await?;
      }
      "result" => {
        let score = required_item(conn, filter).await?;
        result.score = String::from_utf8_lossy(&score)
          .trim()
          .parse()
          .map_err(|_| {
            Error::Execution(format!("{}: bad result score", filter.name()))
          })?;
        return Ok(());
      }
      _ => {
        return Err(Error::Execution(format!(
          "{}: unknown command",
          filter.name()
        )));
      }
    }
  }
}

async fn string_item<R, W>(
  conn: &mut Conn<R, W>,
  filter: &Filter,
) -> Result<String>
where
  R: AsyncRead + Unpin + Send,
  W: AsyncWrite + Unpin + Send,
{
  let item = required_item(conn, filter).await?;
  Ok(String::from_utf8_lossy(&item).into_owned())
}

async fn required_item<R, W>(
  conn: &mut Conn<R, W>,
  filter: &Filter,
) -> Result<Vec<u8>>
where
  R: AsyncRead + Unpin + Send,
  W: AsyncWrite + Unpin + Send,
{
  conn.item().await?.ok_or_else(|| {
    Error::Execution(format!("{}: missing command argument", filter.name()))
  })
}

/// Pass filter stdout through without adding a newline.
async fn emit_stdout(bytes: &[u8]) -> Result<()> {
  use tokio::io::AsyncWriteExt;
  let mut stdout = tokio::io::stdout();
  stdout.write_all(bytes).await?;
  stdout.flush().await?;
  Ok(())
}
