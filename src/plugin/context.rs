//! Per-call state shared between the host and the cache plugin.

use std::collections::HashMap;
use std::fmt;

use crate::cache::LoadOutcome;

/// Metadata key prefix for cache flags, followed by the cache name.
pub const FLAG_METADATA_PREFIX: &str = "rpc_cache_";

/// How the cache served an intercepted call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheFlag {
    /// The call was not cacheable and went straight to the handler.
    Bypassed,
    /// Served from a fresh entry.
    Hit,
    /// Served by the handler, either directly or through a coalesced load.
    Miss,
    /// The handler failed and an expired response was served.
    Stale,
    /// The handler failed with nothing to fall back on.
    Failed,
}

impl CacheFlag {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheFlag::Bypassed => "forbid_cache",
            CacheFlag::Hit => "hit_cache",
            CacheFlag::Miss => "no_hit_cache",
            CacheFlag::Stale => "stale_cache",
            CacheFlag::Failed => "fail_cache",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "forbid_cache" => Some(CacheFlag::Bypassed),
            "hit_cache" => Some(CacheFlag::Hit),
            "no_hit_cache" => Some(CacheFlag::Miss),
            "stale_cache" => Some(CacheFlag::Stale),
            "fail_cache" => Some(CacheFlag::Failed),
            _ => None,
        }
    }
}

impl From<LoadOutcome> for CacheFlag {
    fn from(outcome: LoadOutcome) -> Self {
        match outcome {
            LoadOutcome::Hit => CacheFlag::Hit,
            LoadOutcome::Loaded | LoadOutcome::Joined => CacheFlag::Miss,
            LoadOutcome::Stale => CacheFlag::Stale,
        }
    }
}

impl fmt::Display for CacheFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The RPC being served and its string metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallContext {
    rpc_name: String,
    metadata: HashMap<String, String>,
}

impl CallContext {
    pub fn new(rpc_name: impl Into<String>) -> Self {
        Self {
            rpc_name: rpc_name.into(),
            metadata: HashMap::new(),
        }
    }

    pub fn rpc_name(&self) -> &str {
        &self.rpc_name
    }

    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    pub fn set_metadata(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.metadata.insert(key.into(), value.into());
    }

    /// The flag recorded for `cache_name` on this call, if any.
    pub fn cache_flag(&self, cache_name: &str) -> Option<CacheFlag> {
        self.metadata(&flag_key(cache_name))
            .and_then(CacheFlag::parse)
    }

    pub(super) fn set_cache_flag(&mut self, cache_name: &str, flag: CacheFlag) {
        self.set_metadata(flag_key(cache_name), flag.as_str());
    }
}

fn flag_key(cache_name: &str) -> String {
    format!("{FLAG_METADATA_PREFIX}{cache_name}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_names() {
        for flag in [
            CacheFlag::Bypassed,
            CacheFlag::Hit,
            CacheFlag::Miss,
            CacheFlag::Stale,
            CacheFlag::Failed,
        ] {
            assert_eq!(CacheFlag::parse(flag.as_str()), Some(flag));
        }
        assert_eq!(CacheFlag::Miss.to_string(), "no_hit_cache");
        assert_eq!(CacheFlag::parse("bogus"), None);
    }

    #[test]
    fn test_flag_stored_in_metadata() {
        let mut ctx = CallContext::new("/user.Service/GetUser");
        assert_eq!(ctx.cache_flag("users"), None);

        ctx.set_cache_flag("users", CacheFlag::Hit);
        assert_eq!(ctx.metadata("rpc_cache_users"), Some("hit_cache"));
        assert_eq!(ctx.cache_flag("users"), Some(CacheFlag::Hit));
        assert_eq!(ctx.cache_flag("items"), None);
    }

    #[test]
    fn test_joined_counts_as_miss() {
        assert_eq!(CacheFlag::from(LoadOutcome::Joined), CacheFlag::Miss);
        assert_eq!(CacheFlag::from(LoadOutcome::Stale), CacheFlag::Stale);
    }
}
