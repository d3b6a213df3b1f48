pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
  /// Malformed filter spec. Aborts stack construction.
  #[error("filter spec: {0}")]
  Spec(String),

  /// Unknown or circular filter dependency. Aborts stack construction.
  #[error("filter dependency: {0}")]
  Dependency(String),

  /// Filter binary missing, failed to initialize, or spoke a malformed
  /// protocol. Kills the current worker.
  #[error("filter execution: {0}")]
  Execution(String),

  #[error("cache server: {0}")]
  Cache(#[from] crate::cache::CacheError),

  /// The blast sink peer went away.
  #[error("blast connection closed")]
  ConnectionClosed,

  #[error(transparent)]
  Io(#[from] std::io::Error),
}
