use std::{collections::HashMap, sync::Arc, time::Instant};

use tracing::{debug, warn};

use crate::{
  cache::{self, KvStore},
  error::Result,
  object::Object,
  resolver,
  runner::{FilterResult, ObjectProcessor},
  stats::SearchStats,
};

/// One worker's evaluation pipeline: the processor chain plus this
/// worker's private cache connection. Handles querying and updating the
/// result and attribute caches around filter execution.
pub struct StackRunner {
  runners: Vec<Box<dyn ObjectProcessor>>,
  store: Option<Box<dyn KvStore>>,
  stats: Arc<SearchStats>,
  warned_cache_update: bool,
}

impl StackRunner {
  pub fn new(
    runners: Vec<Box<dyn ObjectProcessor>>,
    store: Option<Box<dyn KvStore>>,
    stats: Arc<SearchStats>,
  ) -> Self {
    Self {
      runners,
      store,
      stats,
      warned_cache_update: false,
    }
  }

  /// Evaluate the object; true to accept, false to drop.
  pub async fn evaluate(&mut self, obj: &mut dyn Object) -> Result<bool> {
    let started = Instant::now();
    let outcome = self.evaluate_inner(obj).await;
    let accepted = matches!(outcome, Ok(true));
    self.stats.record(accepted, started.elapsed());
    outcome
  }

  async fn evaluate_inner(&mut self, obj: &mut dyn Object) -> Result<bool> {
    debug!(object = %String::from_utf8_lossy(obj.id()), "evaluating");

    let cache_keys: Vec<String> =
      self.runners.iter().map(|r| r.cache_key(obj)).collect();

    let mut cached: HashMap<usize, FilterResult> = HashMap::new();
    if let Some(store) = self.store.as_mut() {
      match store.mget(&cache_keys).await {
        Ok(values) => {
          for (idx, value) in values.into_iter().enumerate() {
            if let Some(result) =
              value.as_deref().and_then(FilterResult::decode)
            {
              cached.insert(idx, result);
            }
          }
        }
        // Treated as a whole-stack cache miss.
        Err(err) => warn!("result cache lookup failed: {err}"),
      }
    }

    if resolver::result_cache_can_drop(obj, &self.runners, &cached) {
      return Ok(false);
    }

    let mut new_results: HashMap<usize, FilterResult> = HashMap::new();
    let mut verdict = Ok(true);
    for idx in 0..self.runners.len() {
      let mut loaded = None;
      if let Some(result) = cached.get(&idx) {
        if self.attribute_cache_try_load(idx, obj, result).await {
          loaded = Some(result.clone());
        }
      }
      let result = match loaded {
        Some(result) => result,
        None => match self.runners[idx].evaluate(obj).await {
          Ok(result) => {
            new_results.insert(idx, result.clone());
            result
          }
          Err(err) => {
            verdict = Err(err);
            break;
          }
        },
      };
      if !self.runners[idx].threshold(&result) {
        verdict = Ok(false);
        break;
      }
    }

    // Record whatever was freshly computed, on every exit path.
    self.write_back(obj, &cache_keys, &new_results).await;
    verdict
  }

  /// Try to install the cached output attributes instead of re-executing
  /// the filter. All recorded inputs must still match the object (a rerun
  /// dependency may have produced different values this time), and every
  /// output value must be present in the attribute cache.
  async fn attribute_cache_try_load(
    &mut self,
    idx: usize,
    obj: &mut dyn Object,
    result: &FilterResult,
  ) -> bool {
    for (key, valsig) in &result.input_attrs {
      if obj.signature(key).as_deref() != Some(valsig.as_str()) {
        debug!(
          filter = self.runners[idx].display_name(),
          key = %key,
          "cached input not satisfied"
        );
        return false;
      }
    }

    let (keys, cache_keys): (Vec<&String>, Vec<String>) = result
      .output_attrs
      .iter()
      .map(|(key, valsig)| (key, cache::attribute_key(valsig)))
      .unzip();
    let values = if cache_keys.is_empty() {
      Vec::new()
    } else {
      let Some(store) = self.store.as_mut() else {
        return false;
      };
      match store.mget(&cache_keys).await {
        Ok(values) => values,
        Err(err) => {
          warn!("attribute cache lookup failed: {err}");
          return false;
        }
      }
    };
    if values.len() != cache_keys.len()
      || values.iter().any(Option::is_none)
    {
      debug!(
        filter = self.runners[idx].display_name(),
        "uncached output value"
      );
      return false;
    }

    for (key, value) in keys.into_iter().zip(values) {
      if let Some(value) = value {
        obj.set(key, value);
      }
    }
    self.runners[idx].cache_hit(result);
    true
  }

  async fn write_back(
    &mut self,
    obj: &dyn Object,
    cache_keys: &[String],
    new_results: &HashMap<usize, FilterResult>,
  ) {
    if new_results.is_empty() {
      return;
    }
    let Some(store) = self.store.as_mut() else {
      return;
    };

    let mut entries: Vec<(String, Vec<u8>)> = Vec::new();
    for (&idx, result) in new_results {
      entries.push((cache_keys[idx].clone(), result.encode()));
      // Attribute values too, if the filter was expensive enough.
      if result.cache_output {
        for (key, valsig) in &result.output_attrs {
          if let Some(value) = obj.get(key) {
            entries.push((cache::attribute_key(valsig), value.to_vec()));
          }
        }
      }
    }

    if let Err(err) = store.mset(&entries).await {
      // Possibly a maxmemory quota; not worth repeating per object.
      if !self.warned_cache_update {
        self.warned_cache_update = true;
        warn!("failed to update cache: {err}");
      }
    }
  }
}

#[cfg(test)]
mod test {
  use std::{collections::BTreeMap, sync::Arc};

  use crate::{
    cache::{attribute_key, KvStore},
    digest,
    object::{MemObject, Object},
    runner::{FilterResult, ObjectFetcher, ObjectProcessor},
    stats::SearchStats,
    test_utils::{stub_runner, MemStore, StubEval, StubRunner},
  };

  use super::StackRunner;

  fn boxed(runners: Vec<StubRunner>) -> Vec<Box<dyn ObjectProcessor>> {
    runners
      .into_iter()
      .map(|r| Box::new(r) as Box<dyn ObjectProcessor>)
      .collect()
  }

  fn eval(
    inputs: &[(&str, &str)],
    outputs: &[(&str, &str)],
    score: f64,
    cache_output: bool,
    set_attrs: &[(&str, &[u8])],
  ) -> StubEval {
    let to_map = |pairs: &[(&str, &str)]| -> BTreeMap<String, String> {
      pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    };
    StubEval {
      result: FilterResult {
        input_attrs: to_map(inputs),
        output_attrs: to_map(outputs),
        score,
        cache_output,
      },
      set_attrs: set_attrs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_vec()))
        .collect(),
    }
  }

  #[tokio::test]
  async fn all_passing_accepts_and_writes_back() {
    let store = MemStore::default();
    let f = stub_runner("f", 0.5);
    let evaluations = f.evaluations();
    let sig = digest::hex_of(b"value");
    f.push_eval(eval(
      &[],
      &[("x", sig.as_str())],
      0.7,
      true,
      &[("x", b"value")],
    ));

    let mut runner = StackRunner::new(
      boxed(vec![f]),
      Some(Box::new(store.clone())),
      Arc::new(SearchStats::default()),
    );
    let mut obj = MemObject::new("obj-1");
    assert!(runner.evaluate(&mut obj).await.unwrap());
    assert_eq!(evaluations.load(std::sync::atomic::Ordering::Relaxed), 1);

    // One result entry and one attribute entry.
    assert_eq!(store.len(), 2);
    assert_eq!(store.get(&attribute_key(&sig)), Some(b"value".to_vec()));
  }

  #[tokio::test]
  async fn threshold_reject_still_writes_back() {
    let store = MemStore::default();
    let f = stub_runner("f", 0.5);
    f.push_eval(eval(&[], &[], 0.2, false, &[]));

    let mut runner = StackRunner::new(
      boxed(vec![f]),
      Some(Box::new(store.clone())),
      Arc::new(SearchStats::default()),
    );
    let mut obj = MemObject::new("obj-1");
    assert!(!runner.evaluate(&mut obj).await.unwrap());
    assert_eq!(store.len(), 1);
  }

  #[tokio::test]
  async fn cached_drop_skips_execution() {
    let store = MemStore::default();
    let f = stub_runner("f", 0.5);
    let evaluations = f.evaluations();
    let hits = f.hits();
    let runners = boxed(vec![f]);

    let obj = MemObject::new("obj-1");
    let key = runners[0].cache_key(&obj);
    let cached = FilterResult {
      score: 0.2,
      ..FilterResult::default()
    };
    store.insert(key, cached.encode());

    let mut runner = StackRunner::new(
      runners,
      Some(Box::new(store)),
      Arc::new(SearchStats::default()),
    );
    let mut obj = MemObject::new("obj-1");
    assert!(!runner.evaluate(&mut obj).await.unwrap());
    assert_eq!(evaluations.load(std::sync::atomic::Ordering::Relaxed), 0);
    assert_eq!(hits.load(std::sync::atomic::Ordering::Relaxed), 1);
  }

  #[tokio::test]
  async fn attribute_cache_hit_installs_outputs() {
    let store = MemStore::default();
    let f = stub_runner("f", 0.5);
    let evaluations = f.evaluations();
    let hits = f.hits();
    let runners = boxed(vec![f]);

    let obj = MemObject::new("obj-1");
    let key = runners[0].cache_key(&obj);
    let sig = digest::hex_of(b"payload");
    let cached = FilterResult {
      output_attrs: BTreeMap::from([("x".to_string(), sig.clone())]),
      score: 0.9,
      ..FilterResult::default()
    };
    store.insert(key, cached.encode());
    store.insert(attribute_key(&sig), b"payload".to_vec());

    let mut runner = StackRunner::new(
      runners,
      Some(Box::new(store.clone())),
      Arc::new(SearchStats::default()),
    );
    let mut obj = MemObject::new("obj-1");
    assert!(runner.evaluate(&mut obj).await.unwrap());
    assert_eq!(obj.get("x"), Some(b"payload".as_slice()));
    assert_eq!(evaluations.load(std::sync::atomic::Ordering::Relaxed), 0);
    assert_eq!(hits.load(std::sync::atomic::Ordering::Relaxed), 1);
    // Nothing was freshly computed, so nothing new was written.
    assert_eq!(store.len(), 2);
  }

  #[tokio::test]
  async fn missing_attribute_value_reexecutes() {
    let store = MemStore::default();
    let f = stub_runner("f", 0.5);
    let evaluations = f.evaluations();
    f.push_eval(eval(&[], &[], 0.9, false, &[]));
    let runners = boxed(vec![f]);

    let obj = MemObject::new("obj-1");
    let key = runners[0].cache_key(&obj);
    let cached = FilterResult {
      output_attrs: BTreeMap::from([(
        "x".to_string(),
        digest::hex_of(b"payload"),
      )]),
      score: 0.9,
      ..FilterResult::default()
    };
    // Result cached, but the attribute value itself is not.
    store.insert(key, cached.encode());

    let mut runner = StackRunner::new(
      runners,
      Some(Box::new(store)),
      Arc::new(SearchStats::default()),
    );
    let mut obj = MemObject::new("obj-1");
    assert!(runner.evaluate(&mut obj).await.unwrap());
    assert_eq!(evaluations.load(std::sync::atomic::Ordering::Relaxed), 1);
  }

  #[tokio::test]
  async fn stale_input_signature_reexecutes() {
    let store = MemStore::default();
    let f = stub_runner("f", 0.5);
    let evaluations = f.evaluations();
    f.push_eval(eval(&[], &[], 0.9, false, &[]));
    let runners = boxed(vec![f]);

    let obj = MemObject::new("obj-1").with_attr("in", b"new-value");
    let key = runners[0].cache_key(&obj);
    let cached = FilterResult {
      input_attrs: BTreeMap::from([(
        "in".to_string(),
        digest::hex_of(b"old-value"),
      )]),
      score: 0.9,
      ..FilterResult::default()
    };
    store.insert(key, cached.encode());

    let mut runner = StackRunner::new(
      runners,
      Some(Box::new(store)),
      Arc::new(SearchStats::default()),
    );
    let mut obj = MemObject::new("obj-1").with_attr("in", b"new-value");
    assert!(runner.evaluate(&mut obj).await.unwrap());
    assert_eq!(evaluations.load(std::sync::atomic::Ordering::Relaxed), 1);
  }

  #[tokio::test]
  async fn undecodable_payload_is_a_miss() {
    let store = MemStore::default();
    let f = stub_runner("f", 0.5);
    let evaluations = f.evaluations();
    f.push_eval(eval(&[], &[], 0.9, false, &[]));
    let runners = boxed(vec![f]);

    let obj = MemObject::new("obj-1");
    store.insert(runners[0].cache_key(&obj), b"{\"score\": 0.1}".to_vec());

    let mut runner = StackRunner::new(
      runners,
      Some(Box::new(store)),
      Arc::new(SearchStats::default()),
    );
    let mut obj = MemObject::new("obj-1");
    assert!(runner.evaluate(&mut obj).await.unwrap());
    assert_eq!(evaluations.load(std::sync::atomic::Ordering::Relaxed), 1);
  }

  #[tokio::test]
  async fn write_failure_is_tolerated() {
    let store = MemStore::failing_writes();
    let f = stub_runner("f", 0.5);
    f.push_eval(eval(&[], &[], 0.9, false, &[]));
    f.push_eval(eval(&[], &[], 0.9, false, &[]));

    let mut runner = StackRunner::new(
      boxed(vec![f]),
      Some(Box::new(store)),
      Arc::new(SearchStats::default()),
    );
    let mut first = MemObject::new("obj-1");
    assert!(runner.evaluate(&mut first).await.unwrap());
    // The warning latch only fires once; the second object still works.
    let mut second = MemObject::new("obj-2");
    assert!(runner.evaluate(&mut second).await.unwrap());
  }

  #[tokio::test]
  async fn no_store_still_evaluates() {
    let f = stub_runner("f", 0.5);
    f.push_eval(eval(&[], &[], 0.9, false, &[]));
    let mut runner = StackRunner::new(
      boxed(vec![f]),
      None,
      Arc::new(SearchStats::default()),
    );
    let mut obj = MemObject::new("obj-1");
    assert!(runner.evaluate(&mut obj).await.unwrap());
  }

  #[tokio::test]
  async fn fetcher_heads_a_real_chain() {
    let store = MemStore::default();
    let f = stub_runner("f", 0.5);
    f.push_eval(eval(&[], &[], 0.9, false, &[]));
    let runners: Vec<Box<dyn ObjectProcessor>> =
      vec![Box::new(ObjectFetcher::new()), Box::new(f)];

    let mut runner = StackRunner::new(
      runners,
      Some(Box::new(store.clone())),
      Arc::new(SearchStats::default()),
    );
    let mut obj = MemObject::new("obj-1").with_initial("", b"data");
    assert!(runner.evaluate(&mut obj).await.unwrap());
    assert!(obj.contains(""));
    // Fetcher result and filter result both written back.
    assert_eq!(store.len(), 2);
  }

  #[tokio::test]
  async fn search_stats_track_verdicts() {
    let stats = Arc::new(SearchStats::default());
    let f = stub_runner("f", 0.5);
    f.push_eval(eval(&[], &[], 0.9, false, &[]));
    f.push_eval(eval(&[], &[], 0.1, false, &[]));
    let mut runner = StackRunner::new(boxed(vec![f]), None, stats.clone());

    let mut first = MemObject::new("obj-1");
    assert!(runner.evaluate(&mut first).await.unwrap());
    let mut second = MemObject::new("obj-2");
    assert!(!runner.evaluate(&mut second).await.unwrap());

    let snap = stats.snapshot();
    assert_eq!(snap.objs_processed, 2);
    assert_eq!(snap.objs_passed, 1);
    assert_eq!(snap.objs_dropped, 1);
  }

  #[tokio::test]
  async fn mget_error_degrades_to_absence() {
    struct FailingReads;
    #[async_trait::async_trait]
    impl KvStore for FailingReads {
      async fn ping(&mut self) -> Result<(), crate::cache::CacheError> {
        Ok(())
      }
      async fn mget(
        &mut self,
        _keys: &[String],
      ) -> Result<Vec<Option<Vec<u8>>>, crate::cache::CacheError> {
        Err(crate::cache::CacheError::Unavailable("gone".to_string()))
      }
      async fn mset(
        &mut self,
        _entries: &[(String, Vec<u8>)],
      ) -> Result<(), crate::cache::CacheError> {
        Err(crate::cache::CacheError::Unavailable("gone".to_string()))
      }
    }

    let f = stub_runner("f", 0.5);
    let evaluations = f.evaluations();
    f.push_eval(eval(&[], &[], 0.9, false, &[]));
    let mut runner = StackRunner::new(
      boxed(vec![f]),
      Some(Box::new(FailingReads)),
      Arc::new(SearchStats::default()),
    );
    let mut obj = MemObject::new("obj-1");
    assert!(runner.evaluate(&mut obj).await.unwrap());
    assert_eq!(evaluations.load(std::sync::atomic::Ordering::Relaxed), 1);
  }
}
