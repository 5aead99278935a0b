//! Host-side service libraries linked into plugin sandboxes.
//!
//! Each granted service contributes one library of host functions. Every
//! function takes a single JSON request and returns a single JSON
//! response, so each binding is one pointer in, one pointer out. The set
//! of linkable services is closed; an unknown grant name simply has no
//! library here.

pub mod artwork;
pub mod cache;
pub mod config;
pub mod http;
pub mod scheduler;
pub mod websocket;

use std::collections::HashMap;
use std::sync::Arc;

pub use cache::CacheStore;

use crate::error::PluginError;
use crate::manifest::{Permissions, PluginId};
use crate::permissions::NetworkPermissions;
use crate::runtime::HostLibrary;
use crate::scheduler::TimerService;
use crate::websocket::WebSocketService;

/// Everything the service libraries need to bind against one plugin.
pub struct HostContext {
    pub plugin: PluginId,
    pub settings: HashMap<String, String>,
    pub permissions: Permissions,
    pub timers: Arc<TimerService>,
    pub sockets: Arc<WebSocketService>,
    pub cache_store: Arc<CacheStore>,
    pub artwork_base_url: String,
    pub handle: tokio::runtime::Handle,
}

impl HostContext {
    /// Ownership key the bindings register timers, sockets, and cache
    /// entries under. Must match the manager's plugin map, which is keyed
    /// by bare name; otherwise unload cleanup and callback delivery would
    /// miss everything a guest registered.
    pub fn owner(&self) -> String {
        self.plugin.name.clone()
    }
}

/// Build the libraries for every granted service.
///
/// Grant presence alone decides inclusion; a grant with no constraints
/// still links its library. Network grants are compiled here, so a
/// malformed http or websocket grant fails the whole construction.
pub fn libraries_for(ctx: &HostContext) -> Result<Vec<HostLibrary>, PluginError> {
    let mut libraries = Vec::new();

    if ctx.permissions.config.is_some() {
        libraries.push(config::library(ctx));
    }
    if ctx.permissions.scheduler.is_some() {
        libraries.push(scheduler::library(ctx));
    }
    if ctx.permissions.cache.is_some() {
        libraries.push(cache::library(ctx));
    }
    if ctx.permissions.artwork.is_some() {
        libraries.push(artwork::library(ctx));
    }
    if let Some(grant) = &ctx.permissions.http {
        let network = Arc::new(NetworkPermissions::from_grant("http", grant)?);
        libraries.push(http::library(ctx, network));
    }
    if let Some(grant) = &ctx.permissions.websocket {
        let network = Arc::new(NetworkPermissions::from_grant("websocket", grant)?);
        libraries.push(websocket::library(ctx, network));
    }

    Ok(libraries)
}

/// Host names the engine may open sockets to, from the network grants.
pub fn allowed_hosts(permissions: &Permissions) -> Result<Vec<String>, PluginError> {
    let mut hosts = Vec::new();
    if let Some(grant) = &permissions.http {
        hosts.extend(NetworkPermissions::from_grant("http", grant)?.allowed_hosts());
    }
    if let Some(grant) = &permissions.websocket {
        hosts.extend(NetworkPermissions::from_grant("websocket", grant)?.allowed_hosts());
    }
    hosts.dedup();
    Ok(hosts)
}
