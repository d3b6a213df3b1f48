use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{debug, error};

use crate::{
  cache::{KvStore, RedisStore},
  config::CacheConfig,
  error::{Error, Result},
  object::{BlastSink, BlobCache, Scope, SessionVars},
  stack::FilterStack,
  stack_runner::StackRunner,
  stats::SearchStats,
};

/// Everything a search shares between its workers.
pub struct SearchState {
  pub scope: Arc<dyn Scope>,
  pub blast: Arc<dyn BlastSink>,
  pub session_vars: Arc<dyn SessionVars>,
  pub blob_cache: Arc<dyn BlobCache>,
  pub stats: Arc<SearchStats>,
  pub cache: Option<CacheConfig>,
}

/// Run the search: spawn the worker pool, drain the scope, and release
/// the blast sink exactly once when the last worker has exited. The first
/// fatal worker error aborts the remaining workers and is returned.
pub async fn run_search(
  stack: Arc<FilterStack>,
  state: Arc<SearchState>,
  workers: usize,
) -> Result<()> {
  let mut pool = JoinSet::new();
  for index in 0..workers.max(1) {
    let stack = stack.clone();
    let state = state.clone();
    pool.spawn(async move { worker(index, stack, state).await });
  }

  let mut failure = None;
  while let Some(joined) = pool.join_next().await {
    match joined {
      Ok(Ok(())) => {}
      Ok(Err(err)) => {
        error!("worker failed: {err}");
        if failure.is_none() {
          failure = Some(err);
          pool.abort_all();
        }
      }
      Err(err) if err.is_cancelled() => {}
      Err(err) => {
        if failure.is_none() {
          failure = Some(Error::Execution(format!("worker panicked: {err}")));
        }
      }
    }
  }

  state.blast.close().await;
  match failure {
    Some(err) => Err(err),
    None => Ok(()),
  }
}

async fn worker(
  index: usize,
  stack: Arc<FilterStack>,
  state: Arc<SearchState>,
) -> Result<()> {
  // Each worker opens its own cache connection; they are never shared.
  let store: Option<Box<dyn KvStore>> = match &state.cache {
    Some(config) => {
      let mut store = RedisStore::connect(config).await?;
      store.ping().await?;
      Some(Box::new(store))
    }
    None => None,
  };

  let runners = stack.bind(&state)?;
  let mut runner = StackRunner::new(runners, store, state.stats.clone());

  while let Some(mut obj) = state.scope.next().await? {
    if runner.evaluate(obj.as_mut()).await? {
      state.blast.send(obj).await?;
    }
  }
  debug!(worker = index, "scope drained");
  Ok(())
}
