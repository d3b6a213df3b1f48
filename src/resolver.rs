use std::collections::{HashMap, HashSet};

use tracing::{debug, error, warn};

use crate::{
  object::Object,
  runner::{FilterResult, ObjectProcessor},
};

/// Decide whether the object can be dropped on cached evidence alone.
///
/// `cached` maps runner positions to results retrieved from the result
/// cache. A cached drop verdict is only reusable if every input attribute
/// it was computed from, transitively, is the recorded output of another
/// cached result with the matching value digest — that chain proves what
/// the filter actually ran on. On success the runners in the witness set
/// are notified via `cache_hit` and the object is dropped.
pub fn result_cache_can_drop(
  obj: &dyn Object,
  runners: &[Box<dyn ObjectProcessor>],
  cached: &HashMap<usize, FilterResult>,
) -> bool {
  // Reverse index: attribute name -> runners claiming to produce it.
  let mut producers: HashMap<&str, Vec<usize>> = HashMap::new();
  for idx in 0..runners.len() {
    if let Some(result) = cached.get(&idx) {
      for key in result.output_attrs.keys() {
        producers.entry(key).or_default().push(idx);
      }
    }
  }

  let mut resolved: HashMap<usize, HashSet<usize>> = HashMap::new();
  let mut inprocess: HashSet<usize> = HashSet::new();
  for idx in 0..runners.len() {
    let Some(result) = cached.get(&idx) else {
      continue;
    };
    if runners[idx].threshold(result) {
      continue;
    }
    // A cached drop decision; try to prove it applies.
    if let Some(deps) = resolve(
      idx,
      obj,
      runners,
      cached,
      &producers,
      &mut resolved,
      &mut inprocess,
    ) {
      debug!(
        filter = runners[idx].display_name(),
        "dropping via cached result"
      );
      for dep in deps {
        if let Some(dep_result) = cached.get(&dep) {
          runners[dep].cache_hit(dep_result);
        }
      }
      return true;
    }
  }
  false
}

/// If this runner's cached result is usable, return the set containing the
/// runner and its transitive dependencies; `None` if any input attribute
/// cannot be traced back to a matching cached producer.
fn resolve(
  idx: usize,
  obj: &dyn Object,
  runners: &[Box<dyn ObjectProcessor>],
  cached: &HashMap<usize, FilterResult>,
  producers: &HashMap<&str, Vec<usize>>,
  resolved: &mut HashMap<usize, HashSet<usize>>,
  inprocess: &mut HashSet<usize>,
) -> Option<HashSet<usize>> {
  if let Some(deps) = resolved.get(&idx) {
    return Some(deps.clone());
  }
  let result = cached.get(&idx)?;
  if !inprocess.insert(idx) {
    // Shouldn't happen; the cached data is corrupt.
    error!(
      object = %String::from_utf8_lossy(obj.id()),
      "circular dependency in cached results"
    );
    return None;
  }

  let mut dependencies = HashSet::from([idx]);
  let mut usable = true;
  'inputs: for (key, valsig) in &result.input_attrs {
    for &candidate in producers.get(key.as_str()).into_iter().flatten() {
      let Some(output_sig) = cached
        .get(&candidate)
        .and_then(|r| r.output_attrs.get(key))
      else {
        continue;
      };
      if output_sig != valsig {
        // The producer recorded the right attribute name with the wrong
        // value digest: its observable output depends on an input not
        // captured in its result-cache key. Filter authors fix this by
        // folding a hash of the dependency's arguments into their own.
        warn!(
          filter = runners[candidate].display_name(),
          "result cache collision"
        );
        continue;
      }
      if let Some(candidate_deps) = resolve(
        candidate, obj, runners, cached, producers, resolved, inprocess,
      ) {
        dependencies.extend(candidate_deps);
        continue 'inputs;
      }
    }
    // No resolvable producer generated this attribute.
    usable = false;
    break;
  }

  inprocess.remove(&idx);
  if !usable {
    return None;
  }
  resolved.insert(idx, dependencies.clone());
  Some(dependencies)
}
