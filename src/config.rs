use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct SearchConfig {
  /// Directory holding filter binaries, named by signature.
  pub filter_dir: PathBuf,

  /// Result/attribute cache server. Caching is disabled when unset.
  #[serde(default)]
  pub cache: Option<CacheConfig>,

  #[serde(default = "default_workers")]
  pub workers: usize,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct CacheConfig {
  pub host: String,

  #[serde(default = "default_cache_port")]
  pub port: u16,

  #[serde(default)]
  pub database: i64,

  #[serde(default)]
  pub password: Option<String>,
}

fn default_workers() -> usize {
  std::thread::available_parallelism()
    .map(|n| n.get())
    .unwrap_or(1)
}

fn default_cache_port() -> u16 {
  6379
}
