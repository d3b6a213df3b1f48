use std::sync::Arc;

use crate::{
  digest::Digest,
  error::{Error, Result},
  stats::FilterStats,
};

/// An immutable filter definition from the fspec, plus its one-shot blob
/// argument and the open digest carrying its result-cache key prefix.
#[derive(Debug)]
pub struct Filter {
  name: String,
  signature: String,
  threshold: f64,
  arguments: Vec<String>,
  dependencies: Vec<String>,
  blob: Vec<u8>,
  stats: Arc<FilterStats>,
  digest_prefix: Digest,
}

impl Filter {
  pub fn new(
    name: String,
    signature: String,
    threshold: f64,
    arguments: Vec<String>,
    dependencies: Vec<String>,
  ) -> Self {
    // Hash the fixed parameters into the result cache key and keep the
    // open digest around for per-object key derivation.
    let mut parts = vec![signature.clone()];
    parts.extend(arguments.iter().cloned());
    let mut digest_prefix = Digest::new();
    digest_prefix.update(parts.join(" "));
    digest_prefix.update(" ");

    let stats = Arc::new(FilterStats::new(&name));
    Self {
      name,
      signature,
      threshold,
      arguments,
      dependencies,
      blob: Vec::new(),
      stats,
      digest_prefix,
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn signature(&self) -> &str {
    &self.signature
  }

  pub fn threshold(&self) -> f64 {
    self.threshold
  }

  pub fn arguments(&self) -> &[String] {
    &self.arguments
  }

  pub fn dependencies(&self) -> &[String] {
    &self.dependencies
  }

  pub fn blob(&self) -> &[u8] {
    &self.blob
  }

  pub fn stats(&self) -> &Arc<FilterStats> {
    &self.stats
  }

  /// Bind the blob argument. Settable exactly once; an empty blob leaves
  /// both the sentinel and the cache key untouched, so blob-unset and
  /// blob-set-empty produce identical keys.
  pub fn set_blob(&mut self, blob: Vec<u8>) -> Result<()> {
    if !self.blob.is_empty() {
      return Err(Error::Execution(format!(
        "{}: blob has already been set",
        self.name
      )));
    }
    if !blob.is_empty() {
      self.digest_prefix.update(" ");
      self.digest_prefix.update(&blob);
    }
    self.blob = blob;
    Ok(())
  }

  /// Snapshot of the digest with the filter's fixed parameters hashed in.
  pub fn cache_digest(&self) -> Digest {
    self.digest_prefix.clone()
  }

  /// Parse one fspec record (the lines from a `FILTER` marker up to the
  /// next). Returns `None` for the legacy `FILTER APPLICATION` stanza.
  pub fn from_fspec(lines: &[&str]) -> Result<Option<Self>> {
    let mut name = None;
    let mut signature = None;
    let mut threshold = None;
    let mut arguments = Vec::new();
    let mut dependencies = Vec::new();

    for line in lines {
      let Some((k, v)) = line.split_once(char::is_whitespace) else {
        return Err(Error::Spec(format!("malformed fspec line: {line}")));
      };
      let v = v.trim();
      match k {
        "FILTER" => {
          if v == "APPLICATION" {
            // Legacy application-dependency stanza.
            return Ok(None);
          }
          name = Some(v.to_string());
        }
        "ARG" => arguments.push(v.to_string()),
        "THRESHOLD" => {
          let value = v.parse::<f64>().map_err(|_| {
            Error::Spec(format!("threshold is not a number: {v}"))
          })?;
          threshold = Some(value);
        }
        "SIGNATURE" => signature = Some(v.to_string()),
        "REQUIRES" => dependencies.push(v.to_string()),
        // Deprecated.
        "MERIT" => {}
        other => {
          return Err(Error::Spec(format!("unknown fspec key {other}")));
        }
      }
    }

    match (name, signature, threshold) {
      (Some(name), Some(signature), Some(threshold)) => Ok(Some(Self::new(
        name,
        signature,
        threshold,
        arguments,
        dependencies,
      ))),
      _ => Err(Error::Spec("missing mandatory fspec key".to_string())),
    }
  }
}
