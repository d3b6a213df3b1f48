use std::{
  collections::{BTreeMap, VecDeque},
  path::PathBuf,
  sync::{Arc, Mutex},
};

use async_trait::async_trait;
use clap::Parser;
use tracing::{debug, info, warn};

use crate::{
  config::SearchConfig,
  error::{Error, Result},
  object::{BlastSink, DirBlobCache, MemSessionVars, Object, Scope},
  search::{run_search, SearchState},
  stack::FilterStack,
  stats::SearchStats,
};

#[derive(Parser)]
pub struct Cli {
  /// Search configuration file
  #[clap(long, short)]
  config: PathBuf,

  #[clap(subcommand)]
  subcmd: SubCommand,
}

#[derive(Parser)]
enum SubCommand {
  /// Run a filter stack over a directory of objects
  Search(SearchArgs),
}

#[derive(Parser)]
struct SearchArgs {
  /// Filter stack specification file
  fspec: PathBuf,

  /// Directory of objects to evaluate
  objects: PathBuf,

  /// Directory of per-filter blob arguments, named by filter
  #[clap(long)]
  blobs: Option<PathBuf>,
}

impl Cli {
  fn load_config(&self) -> anyhow::Result<SearchConfig> {
    let f = std::fs::File::open(&self.config)?;
    Ok(serde_yaml::from_reader(f)?)
  }

  pub async fn run(self) -> anyhow::Result<()> {
    let config = self.load_config()?;
    match &self.subcmd {
      SubCommand::Search(args) => search(&config, args).await,
    }
  }
}

async fn search(
  config: &SearchConfig,
  args: &SearchArgs,
) -> anyhow::Result<()> {
  let fspec = std::fs::read_to_string(&args.fspec)?;
  let mut filters = FilterStack::parse_fspec(&fspec)?;
  if let Some(blob_dir) = &args.blobs {
    for filter in &mut filters {
      let path = blob_dir.join(filter.name());
      if path.is_file() {
        filter.set_blob(std::fs::read(&path)?)?;
      }
    }
  }
  let stack = Arc::new(FilterStack::new(filters)?);
  if stack.is_empty() {
    warn!("empty filter stack; every object will be accepted");
  }

  let mut paths: Vec<PathBuf> = std::fs::read_dir(&args.objects)?
    .filter_map(|entry| entry.ok())
    .map(|entry| entry.path())
    .filter(|path| path.is_file())
    .collect();
  paths.sort();
  info!(objects = paths.len(), filters = stack.len(), "starting search");

  let stats = Arc::new(SearchStats::default());
  let state = Arc::new(SearchState {
    scope: Arc::new(DirScope::new(paths)),
    blast: Arc::new(PrintSink),
    session_vars: Arc::new(MemSessionVars::default()),
    blob_cache: Arc::new(DirBlobCache::new(&config.filter_dir)),
    stats: stats.clone(),
    cache: config.cache.clone(),
  });

  run_search(stack.clone(), state, config.workers).await?;

  let snap = stats.snapshot();
  info!(
    processed = snap.objs_processed,
    passed = snap.objs_passed,
    dropped = snap.objs_dropped,
    execution_ms = snap.execution_ns / 1_000_000,
    "search complete"
  );
  for filter in stack.iter() {
    let snap = filter.stats().snapshot();
    info!(
      filter = %snap.name,
      processed = snap.objs_processed,
      computed = snap.objs_computed,
      dropped = snap.objs_dropped,
      cache_dropped = snap.objs_cache_dropped,
      cache_passed = snap.objs_cache_passed,
      execution_ms = snap.execution_ns / 1_000_000,
      "filter statistics"
    );
  }
  Ok(())
}

/// An object backed by a file; `load` pulls in the contents as the data
/// attribute.
struct FileObject {
  path: PathBuf,
  id: Vec<u8>,
  attrs: BTreeMap<String, Vec<u8>>,
}

impl FileObject {
  fn new(path: PathBuf) -> Self {
    let id = path.to_string_lossy().into_owned().into_bytes();
    Self {
      path,
      id,
      attrs: BTreeMap::new(),
    }
  }
}

#[async_trait]
impl Object for FileObject {
  fn id(&self) -> &[u8] {
    &self.id
  }

  async fn load(&mut self) -> Result<()> {
    let data = tokio::fs::read(&self.path).await?;
    self.attrs.insert(String::new(), data);
    if let Some(name) = self.path.file_name() {
      self.attrs.insert(
        "_display_name".to_string(),
        name.to_string_lossy().into_owned().into_bytes(),
      );
    }
    Ok(())
  }

  fn get(&self, key: &str) -> Option<&[u8]> {
    self.attrs.get(key).map(Vec::as_slice)
  }

  fn set(&mut self, key: &str, value: Vec<u8>) {
    self.attrs.insert(key.to_string(), value);
  }

  fn omit(&mut self, key: &str) -> bool {
    self.attrs.remove(key).is_some()
  }

  fn keys(&self) -> Vec<String> {
    self.attrs.keys().cloned().collect()
  }
}

struct DirScope {
  paths: Mutex<VecDeque<PathBuf>>,
}

impl DirScope {
  fn new(paths: Vec<PathBuf>) -> Self {
    Self {
      paths: Mutex::new(paths.into()),
    }
  }
}

#[async_trait]
impl Scope for DirScope {
  async fn next(&self) -> Result<Option<Box<dyn Object>>> {
    let path = self
      .paths
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .pop_front();
    Ok(path.map(|path| Box::new(FileObject::new(path)) as Box<dyn Object>))
  }
}

/// Prints accepted object ids, one per line. A broken pipe reads as the
/// peer going away, which stops the search.
struct PrintSink;

#[async_trait]
impl BlastSink for PrintSink {
  async fn send(&self, obj: Box<dyn Object>) -> Result<()> {
    use std::io::Write;

    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{}", String::from_utf8_lossy(obj.id())).map_err(|err| {
      match err.kind() {
        std::io::ErrorKind::BrokenPipe => Error::ConnectionClosed,
        _ => Error::Io(err),
      }
    })
  }

  async fn close(&self) {
    debug!("blast sink closed");
  }
}
