use std::{
  collections::HashMap,
  path::{Path, PathBuf},
  sync::Mutex,
};

#[cfg(test)]
use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::{digest, error::Result};

/// A unit of work: opaque id plus a named attribute map. Implementations
/// are supplied by the scope source; the engine only mutates attributes.
#[async_trait]
pub trait Object: Send + Sync {
  fn id(&self) -> &[u8];

  /// Populate the initial attributes from the external source.
  async fn load(&mut self) -> Result<()>;

  fn get(&self, key: &str) -> Option<&[u8]>;

  fn set(&mut self, key: &str, value: Vec<u8>);

  /// Remove an attribute; false if it was not present.
  fn omit(&mut self, key: &str) -> bool;

  fn keys(&self) -> Vec<String>;

  fn contains(&self, key: &str) -> bool {
    self.get(key).is_some()
  }

  /// Digest of the attribute's current value.
  fn signature(&self, key: &str) -> Option<String> {
    self.get(key).map(digest::hex_of)
  }
}

/// Shared iterator over the objects in scope. Implementations partition
/// objects between workers; an object is yielded to exactly one caller.
#[async_trait]
pub trait Scope: Send + Sync {
  async fn next(&self) -> Result<Option<Box<dyn Object>>>;
}

/// Downstream destination for accepted objects. `send` surfaces a closed
/// peer as `Error::ConnectionClosed`.
#[async_trait]
pub trait BlastSink: Send + Sync {
  async fn send(&self, obj: Box<dyn Object>) -> Result<()>;

  async fn close(&self);
}

/// Shared named real-valued store that filters use to cooperate across
/// objects and workers. Merge semantics on update belong to the store.
pub trait SessionVars: Send + Sync {
  /// Current values for the given keys; unknown keys read as zero.
  fn filter_get(&self, keys: &[String]) -> HashMap<String, f64>;

  fn filter_update(&self, values: HashMap<String, f64>);
}

/// In-memory session variables with accumulating updates.
#[derive(Default)]
pub struct MemSessionVars {
  values: Mutex<HashMap<String, f64>>,
}

impl SessionVars for MemSessionVars {
  fn filter_get(&self, keys: &[String]) -> HashMap<String, f64> {
    let values = self.values.lock().unwrap_or_else(|e| e.into_inner());
    keys
      .iter()
      .map(|k| (k.clone(), values.get(k).copied().unwrap_or(0.0)))
      .collect()
  }

  fn filter_update(&self, updates: HashMap<String, f64>) {
    let mut values = self.values.lock().unwrap_or_else(|e| e.into_inner());
    for (key, value) in updates {
      *values.entry(key).or_insert(0.0) += value;
    }
  }
}

/// Maps a filter signature to its executable. Opaque to the engine.
pub trait BlobCache: Send + Sync {
  fn executable_path(&self, signature: &str) -> Option<PathBuf>;
}

/// Filter binaries laid out in a directory, named by signature.
pub struct DirBlobCache {
  root: PathBuf,
}

impl DirBlobCache {
  pub fn new(root: impl AsRef<Path>) -> Self {
    Self {
      root: root.as_ref().to_path_buf(),
    }
  }
}

impl BlobCache for DirBlobCache {
  fn executable_path(&self, signature: &str) -> Option<PathBuf> {
    let path = self.root.join(signature);
    path.is_file().then_some(path)
  }
}

/// In-memory object whose `load` installs a prepared attribute map.
#[cfg(test)]
pub struct MemObject {
  id: Vec<u8>,
  attrs: BTreeMap<String, Vec<u8>>,
  initial: BTreeMap<String, Vec<u8>>,
}

#[cfg(test)]
impl MemObject {
  pub fn new(id: impl AsRef<[u8]>) -> Self {
    Self {
      id: id.as_ref().to_vec(),
      attrs: BTreeMap::new(),
      initial: BTreeMap::new(),
    }
  }

  pub fn with_initial(mut self, key: &str, value: impl AsRef<[u8]>) -> Self {
    self.initial.insert(key.to_string(), value.as_ref().to_vec());
    self
  }

  pub fn with_attr(mut self, key: &str, value: impl AsRef<[u8]>) -> Self {
    self.attrs.insert(key.to_string(), value.as_ref().to_vec());
    self
  }
}

#[cfg(test)]
#[async_trait]
impl Object for MemObject {
  fn id(&self) -> &[u8] {
    &self.id
  }

  async fn load(&mut self) -> Result<()> {
    self.attrs.extend(std::mem::take(&mut self.initial));
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
