//! RPC response caching for a host server.
//!
//! The host wraps each RPC handler with [`RpcCachePlugin::intercept`]. Calls
//! to configured RPCs are served through that RPC's [`LocalCache`], keyed by
//! a per-RPC key function or by a hash of the request. How each call was
//! served is written back into the call metadata as a [`CacheFlag`].

mod context;
mod key_func;

pub use context::{CacheFlag, CallContext, FLAG_METADATA_PREFIX};
pub use key_func::{KeyFunc, default_key};

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::cache::{CacheRegistry, Encoding, LocalCache};
use crate::config::PluginConfig;
use crate::error::CacheError;
use key_func::KeyFuncs;

/// A configured RPC and the cache serving it.
#[derive(Debug)]
struct RpcCache {
    cache_name: String,
    encoding: Encoding,
    cache: Arc<LocalCache>,
}

/// Caches responses of configured RPCs.
#[derive(Debug)]
pub struct RpcCachePlugin {
    rpcs: HashMap<String, RpcCache>,
    key_funcs: KeyFuncs,
}

impl RpcCachePlugin {
    /// Create one cache per configured RPC, registered in `registry` under
    /// the RPC name.
    pub fn setup(config: &PluginConfig, registry: &CacheRegistry) -> Result<Self, CacheError> {
        let mut rpcs = HashMap::with_capacity(config.caches.len());

        for def in &config.caches {
            let cache = registry.register(&def.rpc_name, def.cache_config())?;
            debug!("Caching rpc {} in {}", def.rpc_name, def.name());
            rpcs.insert(
                def.rpc_name.clone(),
                RpcCache {
                    cache_name: def.name().to_owned(),
                    encoding: def.serialization,
                    cache,
                },
            );
        }

        info!(rpcs = rpcs.len(), "RPC cache plugin ready");
        Ok(Self {
            rpcs,
            key_funcs: KeyFuncs::default(),
        })
    }

    /// Use `func` to derive cache keys for `rpc_name`, whose requests are
    /// `Req`. Returning an empty key bypasses the cache for that call.
    pub fn register_key_func<Req, F>(&self, rpc_name: &str, func: F)
    where
        Req: 'static,
        F: Fn(&CallContext, &Req) -> String + Send + Sync + 'static,
    {
        let func: KeyFunc<Req> = Arc::new(func);
        self.key_funcs.register(rpc_name, func);
    }

    /// The cache serving `rpc_name`, if it is configured.
    pub fn cache(&self, rpc_name: &str) -> Option<&Arc<LocalCache>> {
        self.rpcs.get(rpc_name).map(|rpc| &rpc.cache)
    }

    pub fn is_cached(&self, rpc_name: &str) -> bool {
        self.rpcs.contains_key(rpc_name)
    }

    /// Serve one call, running `handler` only when the cache cannot answer.
    ///
    /// Unconfigured RPCs call `handler` directly and get no flag. Handler
    /// errors surface as [`CacheError::LoaderFailed`] unless an expired
    /// response may be served instead.
    pub async fn intercept<Req, Resp, H, Fut, E>(
        &self,
        ctx: &mut CallContext,
        req: &Req,
        handler: H,
    ) -> Result<Resp, CacheError>
    where
        Req: Serialize + 'static,
        Resp: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
        H: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Resp, E>> + Send + 'static,
        E: Into<anyhow::Error>,
    {
        let Some(rpc) = self.rpcs.get(ctx.rpc_name()) else {
            return handler().await.map_err(CacheError::loader);
        };

        let key = match self.key_funcs.get::<Req>(ctx.rpc_name()) {
            Some(func) => func(&*ctx, req),
            None => default_key(req),
        };

        if key.is_empty() {
            ctx.set_cache_flag(&rpc.cache_name, CacheFlag::Bypassed);
            report(ctx, &rpc.cache_name, CacheFlag::Bypassed, None);
            return handler().await.map_err(CacheError::loader);
        }

        let result = rpc.cache.load(&key, rpc.encoding, handler).await;
        let flag = match &result {
            Ok(loaded) => CacheFlag::from(loaded.outcome),
            Err(_) => CacheFlag::Failed,
        };

        ctx.set_cache_flag(&rpc.cache_name, flag);
        report(ctx, &rpc.cache_name, flag, result.as_ref().err());

        result.map(|loaded| loaded.value)
    }
}

/// Emit the monitor event for one intercepted call.
fn report(ctx: &CallContext, cache_name: &str, flag: CacheFlag, error: Option<&CacheError>) {
    info!(
        target: "lcache::monitor",
        cache_name,
        rpc_name = ctx.rpc_name(),
        flag = flag.as_str(),
        error = error.map(tracing::field::display),
        "rpc cache"
    );
}
