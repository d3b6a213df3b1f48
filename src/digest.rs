/// Incremental digest with cheap snapshotting. Every digest in the engine
/// (cache keys, attribute signatures) uses this one algorithm, hex-encoded.
#[derive(Clone, Debug)]
pub struct Digest(blake3::Hasher);

impl Digest {
  pub fn new() -> Self {
    Self(blake3::Hasher::new())
  }

  pub fn update(&mut self, bytes: impl AsRef<[u8]>) -> &mut Self {
    self.0.update(bytes.as_ref());
    self
  }

  pub fn hex(&self) -> String {
    self.0.finalize().to_hex().to_string()
  }
}

impl Default for Digest {
  fn default() -> Self {
    Self::new()
  }
}

/// One-shot digest of a value, as used for attribute signatures.
pub fn hex_of(bytes: impl AsRef<[u8]>) -> String {
  blake3::hash(bytes.as_ref()).to_hex().to_string()
}
