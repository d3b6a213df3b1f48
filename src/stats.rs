use std::{
  sync::atomic::{AtomicU64, Ordering},
  time::Duration,
};

/// Per-filter counters, shared across workers and updated lock-free.
#[derive(Debug)]
pub struct FilterStats {
  name: String,
  objs_processed: AtomicU64,
  objs_computed: AtomicU64,
  objs_dropped: AtomicU64,
  objs_cache_dropped: AtomicU64,
  objs_cache_passed: AtomicU64,
  execution_ns: AtomicU64,
}

impl FilterStats {
  pub fn new(name: &str) -> Self {
    Self {
      name: name.to_string(),
      objs_processed: AtomicU64::new(0),
      objs_computed: AtomicU64::new(0),
      objs_dropped: AtomicU64::new(0),
      objs_cache_dropped: AtomicU64::new(0),
      objs_cache_passed: AtomicU64::new(0),
      execution_ns: AtomicU64::new(0),
    }
  }

  pub fn record_cache_hit(&self, accepted: bool) {
    self.objs_processed.fetch_add(1, Ordering::Relaxed);
    if accepted {
      self.objs_cache_passed.fetch_add(1, Ordering::Relaxed);
    } else {
      self.objs_dropped.fetch_add(1, Ordering::Relaxed);
      self.objs_cache_dropped.fetch_add(1, Ordering::Relaxed);
    }
  }

  pub fn record_computed(&self, accepted: bool, elapsed: Duration) {
    self.objs_processed.fetch_add(1, Ordering::Relaxed);
    self.objs_computed.fetch_add(1, Ordering::Relaxed);
    if !accepted {
      self.objs_dropped.fetch_add(1, Ordering::Relaxed);
    }
    self
      .execution_ns
      .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
  }

  pub fn snapshot(&self) -> FilterStatsSnapshot {
    FilterStatsSnapshot {
      name: self.name.clone(),
      objs_processed: self.objs_processed.load(Ordering::Relaxed),
      objs_computed: self.objs_computed.load(Ordering::Relaxed),
      objs_dropped: self.objs_dropped.load(Ordering::Relaxed),
      objs_cache_dropped: self.objs_cache_dropped.load(Ordering::Relaxed),
      objs_cache_passed: self.objs_cache_passed.load(Ordering::Relaxed),
      execution_ns: self.execution_ns.load(Ordering::Relaxed),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterStatsSnapshot {
  pub name: String,
  pub objs_processed: u64,
  pub objs_computed: u64,
  pub objs_dropped: u64,
  pub objs_cache_dropped: u64,
  pub objs_cache_passed: u64,
  pub execution_ns: u64,
}

/// Whole-search counters.
#[derive(Default)]
pub struct SearchStats {
  objs_processed: AtomicU64,
  objs_passed: AtomicU64,
  objs_dropped: AtomicU64,
  execution_ns: AtomicU64,
}

impl SearchStats {
  pub fn record(&self, accepted: bool, elapsed: Duration) {
    self.objs_processed.fetch_add(1, Ordering::Relaxed);
    if accepted {
      self.objs_passed.fetch_add(1, Ordering::Relaxed);
    } else {
      self.objs_dropped.fetch_add(1, Ordering::Relaxed);
    }
    self
      .execution_ns
      .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
  }

  pub fn snapshot(&self) -> SearchStatsSnapshot {
    SearchStatsSnapshot {
      objs_processed: self.objs_processed.load(Ordering::Relaxed),
      objs_passed: self.objs_passed.load(Ordering::Relaxed),
      objs_dropped: self.objs_dropped.load(Ordering::Relaxed),
      execution_ns: self.execution_ns.load(Ordering::Relaxed),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchStatsSnapshot {
  pub objs_processed: u64,
  pub objs_passed: u64,
  pub objs_dropped: u64,
  pub execution_ns: u64,
}
