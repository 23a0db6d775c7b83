//! Error types.

use std::sync::Arc;

use thiserror::Error;

/// An error returned by the cache controller and its accessors.
///
/// The enum is cheaply clonable: a single load result is published to every
/// caller that joined it, so loader failures are kept behind an [`Arc`].
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// The key is not present in the store.
    #[error("entry not found")]
    NotFound,

    /// Keys must be non-empty.
    #[error("invalid cache key: {0:?}")]
    InvalidKey(String),

    /// The loader returned an error and no stale value could be served.
    ///
    /// The original error is kept verbatim and can be downcast by the caller.
    #[error("loader failed: {0}")]
    LoaderFailed(Arc<anyhow::Error>),

    /// The loader panicked. Every caller joined to that load observes this.
    #[error("loader panicked: {0}")]
    LoaderPanicked(String),

    /// A coalesced load produced a value of a different type than the caller
    /// asked for.
    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },

    /// Serializing or deserializing a value failed.
    #[error("encoding error: {0}")]
    Encoding(#[source] Arc<CodecError>),

    /// The backing store rejected a write.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The cache could not be built from the given configuration.
    #[error("invalid cache config: {0}")]
    InvalidConfig(String),

    /// The background janitor thread could not be started.
    #[error("failed to spawn janitor thread: {0}")]
    Spawn(#[source] Arc<std::io::Error>),
}

impl CacheError {
    /// Wraps a loader error, keeping it intact for downcasting.
    pub fn loader<E>(err: E) -> Self
    where
        E: Into<anyhow::Error>,
    {
        Self::LoaderFailed(Arc::new(err.into()))
    }

    /// Returns the loader's error, if this is a loader failure.
    pub fn loader_error(&self) -> Option<&anyhow::Error> {
        match self {
            Self::LoaderFailed(err) => Some(err),
            _ => None,
        }
    }

    /// Whether this error came from the loader itself and is therefore
    /// eligible for the stale-on-failure policy.
    pub fn is_load_failure(&self) -> bool {
        matches!(self, Self::LoaderFailed(_) | Self::LoaderPanicked(_))
    }
}

impl From<CodecError> for CacheError {
    fn from(err: CodecError) -> Self {
        Self::Encoding(Arc::new(err))
    }
}

/// Failure of a value codec.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// An error raised by the backing store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The entry does not fit into a single shard under the hard memory cap.
    #[error("entry of {size} bytes exceeds the shard limit of {limit} bytes")]
    EntryTooLarge { size: usize, limit: usize },
}
