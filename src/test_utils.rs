use std::{
  collections::{HashMap, VecDeque},
  sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex,
  },
};

use async_trait::async_trait;

use crate::{
  cache::{CacheError, KvStore},
  digest::Digest,
  error::{Error, Result},
  object::{BlastSink, Object, Scope},
  runner::{FilterResult, ObjectProcessor},
};

/// A scriptable processor: returns queued results in order and counts
/// cache hits and evaluations.
pub struct StubRunner {
  name: String,
  threshold: f64,
  digest_prefix: Digest,
  hits: Arc<AtomicU64>,
  evaluations: Arc<AtomicU64>,
  script: Mutex<VecDeque<StubEval>>,
}

pub struct StubEval {
  pub result: FilterResult,
  /// Attributes the fake filter writes into the object.
  pub set_attrs: Vec<(String, Vec<u8>)>,
}

pub fn stub_runner(name: &str, threshold: f64) -> StubRunner {
  let mut digest_prefix = Digest::new();
  digest_prefix.update(name).update(" ");
  StubRunner {
    name: name.to_string(),
    threshold,
    digest_prefix,
    hits: Arc::new(AtomicU64::new(0)),
    evaluations: Arc::new(AtomicU64::new(0)),
    script: Mutex::new(VecDeque::new()),
  }
}

impl StubRunner {
  pub fn hits(&self) -> Arc<AtomicU64> {
    self.hits.clone()
  }

  pub fn evaluations(&self) -> Arc<AtomicU64> {
    self.evaluations.clone()
  }

  pub fn push_eval(&self, eval: StubEval) {
    self.script.lock().unwrap().push_back(eval);
  }
}

#[async_trait]
impl ObjectProcessor for StubRunner {
  fn display_name(&self) -> &str {
    &self.name
  }

  fn cache_digest(&self) -> Digest {
    self.digest_prefix.clone()
  }

  fn cache_hit(&self, _result: &FilterResult) {
    self.hits.fetch_add(1, Ordering::Relaxed);
  }

  async fn evaluate(&mut self, obj: &mut dyn Object) -> Result<FilterResult> {
    self.evaluations.fetch_add(1, Ordering::Relaxed);
    let eval = self.script.lock().unwrap().pop_front();
    match eval {
      Some(eval) => {
        for (key, value) in eval.set_attrs {
          obj.set(&key, value);
        }
        Ok(eval.result)
      }
      None => Ok(FilterResult {
        score: 1.0,
        ..FilterResult::default()
      }),
    }
  }

  fn threshold(&self, result: &FilterResult) -> bool {
    result.score >= self.threshold
  }
}

/// In-memory key-value store; clones share contents.
#[derive(Clone, Default)]
pub struct MemStore {
  data: Arc<Mutex<HashMap<String, Vec<u8>>>>,
  fail_writes: bool,
}

impl MemStore {
  pub fn failing_writes() -> Self {
    Self {
      data: Arc::default(),
      fail_writes: true,
    }
  }

  pub fn insert(&self, key: String, value: Vec<u8>) {
    self.data.lock().unwrap().insert(key, value);
  }

  pub fn get(&self, key: &str) -> Option<Vec<u8>> {
    self.data.lock().unwrap().get(key).cloned()
  }

  pub fn len(&self) -> usize {
    self.data.lock().unwrap().len()
  }
}

#[async_trait]
impl KvStore for MemStore {
  async fn ping(&mut self) -> Result<(), CacheError> {
    Ok(())
  }

  async fn mget(
    &mut self,
    keys: &[String],
  ) -> Result<Vec<Option<Vec<u8>>>, CacheError> {
    let data = self.data.lock().unwrap();
    Ok(keys.iter().map(|k| data.get(k).cloned()).collect())
  }

  async fn mset(
    &mut self,
    entries: &[(String, Vec<u8>)],
  ) -> Result<(), CacheError> {
    if self.fail_writes {
      return Err(CacheError::Response("maxmemory".to_string()));
    }
    let mut data = self.data.lock().unwrap();
    for (key, value) in entries {
      data.insert(key.clone(), value.clone());
    }
    Ok(())
  }
}

/// Scope over a fixed list of objects.
pub struct VecScope {
  objects: Mutex<VecDeque<Box<dyn Object>>>,
}

impl VecScope {
  pub fn new(objects: Vec<Box<dyn Object>>) -> Self {
    Self {
      objects: Mutex::new(objects.into()),
    }
  }
}

#[async_trait]
impl Scope for VecScope {
  async fn next(&self) -> Result<Option<Box<dyn Object>>> {
    Ok(self.objects.lock().unwrap().pop_front())
  }
}

/// Sink collecting accepted object ids; optionally reports a dead peer.
#[derive(Default)]
pub struct CollectSink {
  pub accepted: Mutex<Vec<Vec<u8>>>,
  pub closes: AtomicU64,
  reject_sends: bool,
}

impl CollectSink {
  pub fn rejecting() -> Self {
    Self {
      reject_sends: true,
      ..Self::default()
    }
  }
}

#[async_trait]
impl BlastSink for CollectSink {
  async fn send(&self, obj: Box<dyn Object>) -> Result<()> {
    if self.reject_sends {
      return Err(Error::ConnectionClosed);
    }
    self.accepted.lock().unwrap().push(obj.id().to_vec());
    Ok(())
  }

  async fn close(&self) {
    self.closes.fetch_add(1, Ordering::Relaxed);
  }
}

/// Write an executable shell script for process tests.
#[cfg(unix)]
pub fn write_script(
  dir: &std::path::Path,
  name: &str,
  body: &str,
) -> std::path::PathBuf {
  use std::os::unix::fs::PermissionsExt;

  let path = dir.join(name);
  std::fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();
  std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
    .unwrap();
  path
}
