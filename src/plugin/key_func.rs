//! Cache key derivation for intercepted calls.

use std::any::{Any, TypeId, type_name};
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use super::CallContext;

/// Derives the cache key of one call. An empty key bypasses the cache.
pub type KeyFunc<Req> = Arc<dyn Fn(&CallContext, &Req) -> String + Send + Sync>;

/// The key used when no key function is registered: hex SHA-256 of the
/// JSON-encoded request, or an empty key if it cannot be encoded.
pub fn default_key<Req: Serialize + ?Sized>(req: &Req) -> String {
    match serde_json::to_vec(req) {
        Ok(body) => hex::encode(Sha256::digest(&body)),
        Err(err) => {
            warn!(error = %err, "Request not encodable, bypassing cache");
            String::new()
        }
    }
}

/// Type-erased key function.
struct Entry {
    func: Box<dyn Any + Send + Sync>,
    type_id: TypeId,
    type_name: &'static str,
}

/// Key functions by RPC name, each bound to the request type of its RPC.
#[derive(Default)]
pub(super) struct KeyFuncs {
    funcs: RwLock<HashMap<String, Entry>>,
}

impl KeyFuncs {
    pub fn register<Req: 'static>(&self, rpc_name: &str, func: KeyFunc<Req>) {
        debug!("Registering key func: {}", rpc_name);
        self.funcs.write().insert(
            rpc_name.to_owned(),
            Entry {
                func: Box::new(func),
                type_id: TypeId::of::<KeyFunc<Req>>(),
                type_name: type_name::<Req>(),
            },
        );
    }

    /// The key function for `rpc_name`, if one was registered for `Req`.
    pub fn get<Req: 'static>(&self, rpc_name: &str) -> Option<KeyFunc<Req>> {
        let funcs = self.funcs.read();
        let entry = funcs.get(rpc_name)?;

        if entry.type_id != TypeId::of::<KeyFunc<Req>>() {
            warn!(
                rpc_name,
                expected = type_name::<Req>(),
                registered = entry.type_name,
                "Key func registered for a different request type, using default key"
            );
            return None;
        }
        entry.func.downcast_ref::<KeyFunc<Req>>().cloned()
    }
}

impl std::fmt::Debug for KeyFuncs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let funcs = self.funcs.read();
        f.debug_struct("KeyFuncs")
            .field("rpc_names", &funcs.keys().collect::<Vec<_>>())
            .finish()
    }
}
