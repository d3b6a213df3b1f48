use std::{
  collections::{HashMap, HashSet},
  sync::Arc,
};

use crate::{
  error::{Error, Result},
  filter::Filter,
  runner::{FilterRunner, ObjectFetcher, ObjectProcessor},
  search::SearchState,
};

/// An ordered set of filters which collectively accept or drop an object.
/// Construction resolves declared dependencies into a stable topological
/// order; independent filters keep their input order.
#[derive(Debug)]
pub struct FilterStack {
  by_name: HashMap<String, Arc<Filter>>,
  order: Vec<Arc<Filter>>,
}

impl FilterStack {
  pub fn new(filters: Vec<Filter>) -> Result<Self> {
    let filters: Vec<Arc<Filter>> = filters.into_iter().map(Arc::new).collect();
    let by_name: HashMap<String, Arc<Filter>> = filters
      .iter()
      .map(|f| (f.name().to_string(), f.clone()))
      .collect();

    let mut order = Vec::new();
    let mut resolved = HashSet::new();
    let mut inprocess = HashSet::new();
    for filter in &filters {
      resolve(&by_name, filter, &mut resolved, &mut inprocess, &mut order)?;
    }

    Ok(Self { by_name, order })
  }

  pub fn from_fspec(data: &str) -> Result<Self> {
    Self::new(Self::parse_fspec(data)?)
  }

  /// Split the fspec into `FILTER`-headed groups and parse each. Exposed
  /// separately so callers can bind blob arguments before ordering.
  pub fn parse_fspec(data: &str) -> Result<Vec<Filter>> {
    let mut filters = Vec::new();
    let mut group: Vec<&str> = Vec::new();
    for line in data.split('\n') {
      if line.trim().is_empty() {
        continue;
      }
      if line.starts_with("FILTER") && !group.is_empty() {
        if let Some(filter) = Filter::from_fspec(&group)? {
          filters.push(filter);
        }
        group.clear();
      }
      group.push(line);
    }
    if !group.is_empty() {
      if let Some(filter) = Filter::from_fspec(&group)? {
        filters.push(filter);
      }
    }
    Ok(filters)
  }

  pub fn len(&self) -> usize {
    self.order.len()
  }

  pub fn is_empty(&self) -> bool {
    self.order.is_empty()
  }

  pub fn get(&self, name: &str) -> Option<&Arc<Filter>> {
    self.by_name.get(name)
  }

  /// Filters in execution order.
  pub fn iter(&self) -> impl Iterator<Item = &Arc<Filter>> {
    self.order.iter()
  }

  /// Build this worker's processor chain: the object fetcher followed by
  /// one runner per filter, in execution order.
  pub fn bind(
    &self,
    state: &SearchState,
  ) -> Result<Vec<Box<dyn ObjectProcessor>>> {
    let mut runners: Vec<Box<dyn ObjectProcessor>> =
      vec![Box::new(ObjectFetcher::new())];
    for filter in &self.order {
      let code_path = state
        .blob_cache
        .executable_path(filter.signature())
        .ok_or_else(|| {
          Error::Execution(format!("missing code for filter {}", filter.name()))
        })?;
      runners.push(Box::new(FilterRunner::new(
        filter.clone(),
        state.session_vars.clone(),
        code_path,
      )));
    }
    Ok(runners)
  }
}

fn resolve(
  by_name: &HashMap<String, Arc<Filter>>,
  filter: &Arc<Filter>,
  resolved: &mut HashSet<String>,
  inprocess: &mut HashSet<String>,
  order: &mut Vec<Arc<Filter>>,
) -> Result<()> {
  if resolved.contains(filter.name()) {
    return Ok(());
  }
  if !inprocess.insert(filter.name().to_string()) {
    return Err(Error::Dependency(format!(
      "circular dependency involving {}",
      filter.name()
    )));
  }
  for dep in filter.dependencies() {
    let dep_filter = by_name
      .get(dep)
      .ok_or_else(|| Error::Dependency(format!("no such filter: {dep}")))?;
    resolve(by_name, dep_filter, resolved, inprocess, order)?;
  }
  inprocess.remove(filter.name());
  order.push(filter.clone());
  resolved.insert(filter.name().to_string());
  Ok(())
}
