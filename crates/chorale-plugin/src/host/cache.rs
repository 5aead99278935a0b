//! Cache service: a small host-side key-value store with TTL.
//!
//! Entries are namespaced by plugin, so two plugins never see each
//! other's keys. Expiry is lazy; an expired entry is dropped the next
//! time it is touched.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use extism::convert::Json;
use extism::{host_fn, Function, UserData, PTR};
use serde::{Deserialize, Serialize};

use crate::runtime::HostLibrary;

use super::HostContext;

// ─── Store ──────────────────────────────────────────────────────────────

/// Process-wide store shared by every plugin's cache library.
pub struct CacheStore {
    entries: Mutex<HashMap<(String, String), CacheEntry>>,
}

struct CacheEntry {
    value: serde_json::Value,
    expires_at: Option<Instant>,
}

impl Default for CacheStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheStore {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn set(
        &self,
        namespace: &str,
        key: &str,
        value: serde_json::Value,
        ttl: Option<Duration>,
    ) {
        let Ok(mut entries) = self.entries.lock() else { return };
        entries.insert(
            (namespace.to_string(), key.to_string()),
            CacheEntry {
                value,
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
    }

    pub fn get(&self, namespace: &str, key: &str) -> Option<serde_json::Value> {
        let slot = (namespace.to_string(), key.to_string());
        let Ok(mut entries) = self.entries.lock() else { return None };
        match entries.get(&slot) {
            Some(entry) if !expired(entry) => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(&slot);
                None
            }
            None => None,
        }
    }

    pub fn remove(&self, namespace: &str, key: &str) -> bool {
        let Ok(mut entries) = self.entries.lock() else { return false };
        entries
            .remove(&(namespace.to_string(), key.to_string()))
            .is_some()
    }

    /// Drop every entry in a namespace. Runs on plugin unload.
    pub fn clear_namespace(&self, namespace: &str) {
        let Ok(mut entries) = self.entries.lock() else { return };
        entries.retain(|(ns, _), _| ns != namespace);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn expired(entry: &CacheEntry) -> bool {
    entry
        .expires_at
        .map(|at| Instant::now() >= at)
        .unwrap_or(false)
}

// ─── Guest bindings ─────────────────────────────────────────────────────

#[derive(Clone)]
pub struct CacheHost {
    namespace: String,
    store: std::sync::Arc<CacheStore>,
}

#[derive(Debug, Deserialize)]
pub struct CacheSetRequest {
    pub key: String,
    pub value: serde_json::Value,
    #[serde(default)]
    pub ttl_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct CacheKeyRequest {
    pub key: String,
}

#[derive(Debug, Serialize)]
pub struct CacheGetResponse {
    pub value: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
pub struct CacheRemoveResponse {
    pub removed: bool,
}

#[derive(Debug, Serialize)]
pub struct CacheOkResponse {
    pub ok: bool,
}

host_fn!(cache_set(user_data: CacheHost; req: Json<CacheSetRequest>) -> Json<CacheOkResponse> {
    let host = user_data.get()?;
    let host = host.lock().map_err(|_| extism::Error::msg("cache state poisoned"))?;
    let req = req.0;
    host.store.set(
        &host.namespace,
        &req.key,
        req.value,
        req.ttl_secs.map(Duration::from_secs),
    );
    Ok(Json(CacheOkResponse { ok: true }))
});

host_fn!(cache_get(user_data: CacheHost; req: Json<CacheKeyRequest>) -> Json<CacheGetResponse> {
    let host = user_data.get()?;
    let host = host.lock().map_err(|_| extism::Error::msg("cache state poisoned"))?;
    Ok(Json(CacheGetResponse {
        value: host.store.get(&host.namespace, &req.0.key),
    }))
});

host_fn!(cache_remove(user_data: CacheHost; req: Json<CacheKeyRequest>) -> Json<CacheRemoveResponse> {
    let host = user_data.get()?;
    let host = host.lock().map_err(|_| extism::Error::msg("cache state poisoned"))?;
    Ok(Json(CacheRemoveResponse {
        removed: host.store.remove(&host.namespace, &req.0.key),
    }))
});

pub fn library(ctx: &HostContext) -> HostLibrary {
    let state = CacheHost {
        namespace: ctx.owner(),
        store: std::sync::Arc::clone(&ctx.cache_store),
    };
    HostLibrary::new(
        "cache",
        vec![
            "cache_set".to_string(),
            "cache_get".to_string(),
            "cache_remove".to_string(),
        ],
        move || {
            vec![
                Function::new("cache_set", [PTR], [PTR], UserData::new(state.clone()), cache_set),
                Function::new("cache_get", [PTR], [PTR], UserData::new(state.clone()), cache_get),
                Function::new(
                    "cache_remove",
                    [PTR],
                    [PTR],
                    UserData::new(state.clone()),
                    cache_remove,
                ),
            ]
        },
    )
}
