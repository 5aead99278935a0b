//! Plugin manager: load, unload, and call into plugins.
//!
//! The manager owns the runtime cache, the compilation gate, the per-
//! plugin instance pools, and the callback services. It is also the
//! callback dispatcher: timer and WebSocket events come back here and are
//! routed into the owning plugin, gated on its detected capabilities.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, Weak};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, error, info, warn};

use crate::call;
use crate::callback::PluginCallback;
use crate::capability::{
    detect_capabilities, module_exports, Capability, FUNC_GET_ALBUM_INFO, FUNC_GET_ARTIST_INFO,
    FUNC_NOW_PLAYING, FUNC_ON_INIT, FUNC_SCHEDULER_CALLBACK, FUNC_SCROBBLE,
    FUNC_WEBSOCKET_ON_BINARY, FUNC_WEBSOCKET_ON_CLOSE, FUNC_WEBSOCKET_ON_ERROR,
    FUNC_WEBSOCKET_ON_TEXT,
};
use crate::compile::{CompileHandle, CompileScheduler};
use crate::config::RuntimeConfig;
use crate::error::PluginError;
use crate::host::{self, CacheStore, HostContext};
use crate::lifecycle::LifecycleRegistry;
use crate::manifest::{PluginId, PluginManifest};
use crate::pool::InstancePool;
use crate::runtime::{prepare_engine_cache, RuntimeCache, SandboxRuntime};
use crate::scheduler::TimerService;
use crate::websocket::WebSocketService;

// ─── Agent payloads ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtistInfoRequest {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mbid: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArtistInfoResponse {
    #[serde(default)]
    pub biography: Option<String>,
    #[serde(default)]
    pub mbid: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub similar: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlbumInfoRequest {
    pub id: String,
    pub name: String,
    pub artist: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mbid: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlbumInfoResponse {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub mbid: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayNotification {
    pub user: String,
    pub track: String,
    pub artist: String,
    #[serde(default)]
    pub album: Option<String>,
    pub position_secs: u64,
    pub timestamp: DateTime<Utc>,
}

// ─── Callback payloads ──────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct TimerCallbackPayload<'a> {
    timer_id: &'a str,
    payload: &'a serde_json::Value,
}

#[derive(Debug, Serialize)]
struct WsTextPayload<'a> {
    connection_id: &'a str,
    text: &'a str,
}

#[derive(Debug, Serialize)]
struct WsBinaryPayload<'a> {
    connection_id: &'a str,
    data: &'a [u8],
}

#[derive(Debug, Serialize)]
struct WsErrorPayload<'a> {
    connection_id: &'a str,
    message: &'a str,
}

#[derive(Debug, Serialize)]
struct WsClosePayload<'a> {
    connection_id: &'a str,
    code: u16,
    reason: &'a str,
}

// ─── Loaded plugin ──────────────────────────────────────────────────────

/// A loaded plugin: identity, detected capabilities, and its sandbox
/// machinery.
pub struct LoadedPlugin {
    pub id: PluginId,
    pub manifest: PluginManifest,
    pub capabilities: Vec<Capability>,
    pub sha256: String,
    runtime: Arc<SandboxRuntime>,
    compiled: CompileHandle<extism::CompiledPlugin>,
    pool: Arc<InstancePool<extism::Plugin>>,
}

impl LoadedPlugin {
    pub fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

/// Summary row for plugin listings.
#[derive(Debug, Clone, Serialize)]
pub struct PluginDescriptor {
    pub name: String,
    pub version: String,
    pub capabilities: Vec<String>,
    pub services: Vec<&'static str>,
    pub sha256: String,
}

// ─── Manager ────────────────────────────────────────────────────────────

pub struct PluginManager {
    config: RuntimeConfig,
    plugins: RwLock<HashMap<String, Arc<LoadedPlugin>>>,
    runtimes: RuntimeCache<SandboxRuntime>,
    compiler: CompileScheduler,
    timers: Arc<TimerService>,
    sockets: Arc<WebSocketService>,
    cache_store: Arc<CacheStore>,
    lifecycle: LifecycleRegistry,
    engine_cache_config: Option<PathBuf>,
    artwork_base_url: String,
    self_ref: Weak<PluginManager>,
}

/// Dispatcher handed to the callback services. Holds a weak reference so
/// the services do not keep the manager alive.
struct ManagerDispatcher {
    manager: Weak<PluginManager>,
}

impl PluginManager {
    /// Build a manager inside a running tokio runtime.
    ///
    /// Prunes and prepares the engine cache once, up front.
    pub fn new(config: RuntimeConfig, artwork_base_url: impl Into<String>) -> Arc<Self> {
        let engine_cache_config = prepare_engine_cache(&config.cache_dir, &config.cache_size);

        Arc::new_cyclic(|weak: &Weak<PluginManager>| {
            let dispatcher: Arc<dyn PluginCallback> = Arc::new(ManagerDispatcher {
                manager: weak.clone(),
            });
            Self {
                compiler: CompileScheduler::new(
                    config.max_parallel_compilations,
                    config.compilation_timeout,
                ),
                timers: Arc::new(TimerService::new(Arc::clone(&dispatcher))),
                sockets: Arc::new(WebSocketService::new(dispatcher)),
                cache_store: Arc::new(CacheStore::new()),
                lifecycle: LifecycleRegistry::new(),
                runtimes: RuntimeCache::new(),
                plugins: RwLock::new(HashMap::new()),
                engine_cache_config,
                artwork_base_url: artwork_base_url.into(),
                config,
                self_ref: weak.clone(),
            }
        })
    }

    // ─── Loading ────────────────────────────────────────────────────────

    /// Load a plugin from its manifest and module file.
    ///
    /// Capabilities come from the module's actual exports; the manifest's
    /// claims are logged when they disagree but never trusted. Loading the
    /// same name with unchanged content is a no-op; changed content
    /// replaces the old plugin wholesale.
    pub async fn load(
        &self,
        manifest: PluginManifest,
        wasm_path: &Path,
    ) -> Result<Arc<LoadedPlugin>, PluginError> {
        let id = manifest.id();
        let wasm_bytes = tokio::fs::read(wasm_path).await?;
        let sha256 = format!("{:x}", Sha256::digest(&wasm_bytes));

        if let Some(existing) = self.get(&id.name) {
            if existing.sha256 == sha256 && existing.id == id {
                debug!(plugin = %id, "plugin unchanged, load is a no-op");
                return Ok(existing);
            }
            info!(plugin = %id, "plugin content changed, replacing");
            self.unload(&id.name).await;
        }

        let exports = module_exports(&wasm_bytes)?;
        let capabilities = detect_capabilities(&exports);
        for claimed in &manifest.capabilities {
            if !capabilities.iter().any(|c| c.as_str() == claimed) {
                warn!(plugin = %id, capability = %claimed, "claimed capability not backed by exports");
            }
        }

        let runtime = self.runtimes.get_or_build(&id, || {
            let context = HostContext {
                plugin: id.clone(),
                settings: manifest.config.clone(),
                permissions: manifest.permissions.clone(),
                timers: Arc::clone(&self.timers),
                sockets: Arc::clone(&self.sockets),
                cache_store: Arc::clone(&self.cache_store),
                artwork_base_url: self.artwork_base_url.clone(),
                handle: tokio::runtime::Handle::current(),
            };
            let libraries = host::libraries_for(&context)?;
            let allowed_hosts = host::allowed_hosts(&manifest.permissions)?;
            SandboxRuntime::new(
                id.clone(),
                self.config.clone(),
                libraries,
                allowed_hosts,
                self.engine_cache_config.clone(),
            )
        })?;

        let compiled = {
            let runtime = Arc::clone(&runtime);
            self.compiler
                .spawn(id.to_string(), move || runtime.compile(wasm_bytes))
        };

        let pool = {
            let runtime = Arc::clone(&runtime);
            let compiled = compiled.clone();
            let plugin_name = id.to_string();
            InstancePool::new(
                id.to_string(),
                self.config.pool_size,
                self.config.instance_ttl,
                self.config.get_timeout,
                Arc::new(move || {
                    let module = compiled
                        .try_get()
                        .ok_or_else(|| {
                            PluginError::Compilation(format!("{plugin_name} is not compiled yet"))
                        })??;
                    runtime.instantiate(&module)
                }),
            )
        };

        let loaded = Arc::new(LoadedPlugin {
            id: id.clone(),
            manifest,
            capabilities: capabilities.clone(),
            sha256,
            runtime,
            compiled,
            pool,
        });

        self.write_plugins().insert(id.name.clone(), Arc::clone(&loaded));
        info!(
            plugin = %id,
            capabilities = ?capabilities.iter().map(|c| c.as_str()).collect::<Vec<_>>(),
            "plugin loaded"
        );

        if loaded.has_capability(Capability::LifecycleInit) && self.lifecycle.begin_init(&id) {
            self.spawn_lifecycle_init(Arc::clone(&loaded));
        }

        Ok(loaded)
    }

    /// Unload a plugin and tear down everything it owns: timers, sockets,
    /// cached entries, pooled instances, and its runtime.
    pub async fn unload(&self, name: &str) {
        let Some(plugin) = self.write_plugins().remove(name) else {
            return;
        };
        self.timers.cancel_all(name);
        self.sockets.close_all(name).await;
        self.cache_store.clear_namespace(name);
        plugin.pool.close();
        self.runtimes.remove(&plugin.id);
        info!(plugin = %plugin.id, "plugin unloaded");
    }

    pub fn get(&self, name: &str) -> Option<Arc<LoadedPlugin>> {
        self.read_plugins().get(name).cloned()
    }

    pub fn list(&self) -> Vec<PluginDescriptor> {
        self.read_plugins()
            .values()
            .map(|p| PluginDescriptor {
                name: p.id.name.clone(),
                version: p.id.version.clone(),
                capabilities: p.capabilities.iter().map(|c| c.as_str().to_string()).collect(),
                services: p.runtime.linked_services(),
                sha256: p.sha256.clone(),
            })
            .collect()
    }

    /// Does a loaded plugin hold a capability?
    pub fn has_capability(&self, name: &str, capability: Capability) -> bool {
        self.get(name)
            .map(|p| p.has_capability(capability))
            .unwrap_or(false)
    }

    /// Plugins holding a given capability.
    pub fn with_capability(&self, capability: Capability) -> Vec<Arc<LoadedPlugin>> {
        self.read_plugins()
            .values()
            .filter(|p| p.has_capability(capability))
            .cloned()
            .collect()
    }

    /// Tear the whole subsystem down.
    pub async fn shutdown(&self) {
        let names: Vec<String> = self.read_plugins().keys().cloned().collect();
        for name in names {
            self.unload(&name).await;
        }
        self.timers.shutdown();
        self.sockets.shutdown();
    }

    // ─── Calls ──────────────────────────────────────────────────────────

    /// Call an arbitrary exported function on a loaded plugin.
    ///
    /// Waits for the plugin's compilation first, bounded by the configured
    /// compilation timeout.
    pub async fn invoke<I, O>(&self, name: &str, function: &str, input: &I) -> Result<O, PluginError>
    where
        I: Serialize,
        O: DeserializeOwned,
    {
        let plugin = self
            .get(name)
            .ok_or_else(|| PluginError::NotFound(format!("plugin {name}")))?;
        plugin.compiled.wait(self.compiler.timeout()).await?;
        call::call_plugin(&plugin.pool, name, function, input).await
    }

    pub async fn artist_info(
        &self,
        name: &str,
        request: &ArtistInfoRequest,
    ) -> Result<ArtistInfoResponse, PluginError> {
        self.invoke_with_capability(name, Capability::MetadataAgent, FUNC_GET_ARTIST_INFO, request)
            .await
    }

    pub async fn album_info(
        &self,
        name: &str,
        request: &AlbumInfoRequest,
    ) -> Result<AlbumInfoResponse, PluginError> {
        self.invoke_with_capability(name, Capability::MetadataAgent, FUNC_GET_ALBUM_INFO, request)
            .await
    }

    pub async fn scrobble(
        &self,
        name: &str,
        notification: &PlayNotification,
    ) -> Result<(), PluginError> {
        self.invoke_with_capability(name, Capability::Scrobbler, FUNC_SCROBBLE, notification)
            .await
    }

    pub async fn now_playing(
        &self,
        name: &str,
        notification: &PlayNotification,
    ) -> Result<(), PluginError> {
        self.invoke_with_capability(name, Capability::Scrobbler, FUNC_NOW_PLAYING, notification)
            .await
    }

    async fn invoke_with_capability<I, O>(
        &self,
        name: &str,
        capability: Capability,
        function: &str,
        input: &I,
    ) -> Result<O, PluginError>
    where
        I: Serialize,
        O: DeserializeOwned,
    {
        let plugin = self
            .get(name)
            .ok_or_else(|| PluginError::NotFound(format!("plugin {name}")))?;
        if !plugin.has_capability(capability) {
            return Err(PluginError::NotImplemented(format!(
                "{name} does not provide {capability}"
            )));
        }
        plugin.compiled.wait(self.compiler.timeout()).await?;
        call::call_plugin(&plugin.pool, name, function, input).await
    }

    // ─── Internals ──────────────────────────────────────────────────────

    fn spawn_lifecycle_init(&self, plugin: Arc<LoadedPlugin>) {
        let Some(manager) = self.self_ref.upgrade() else { return };
        tokio::spawn(async move {
            let name = plugin.id.name.clone();
            debug!(plugin = %plugin.id, "running lifecycle init");
            // The hook receives the plugin's own settings.
            let settings = plugin.manifest.config.clone();
            match manager
                .invoke::<_, serde_json::Value>(&name, FUNC_ON_INIT, &settings)
                .await
            {
                Ok(_) => info!(plugin = %plugin.id, "lifecycle init finished"),
                Err(e) => error!(plugin = %plugin.id, error = %e, "lifecycle init failed"),
            }
        });
    }

    async fn dispatch<I: Serialize>(
        &self,
        plugin: &str,
        capability: Capability,
        function: &str,
        payload: &I,
    ) {
        let result = self
            .invoke_with_capability::<_, serde_json::Value>(plugin, capability, function, payload)
            .await;
        if let Err(e) = result {
            if e.is_canonical_miss() {
                debug!(plugin = %plugin, function = %function, "callback declined");
            } else {
                warn!(plugin = %plugin, function = %function, error = %e, "callback failed");
            }
        }
    }

    fn read_plugins(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<LoadedPlugin>>> {
        self.plugins.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_plugins(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<LoadedPlugin>>> {
        self.plugins.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl PluginCallback for ManagerDispatcher {
    async fn on_timer(&self, plugin: &str, timer_id: &str, payload: serde_json::Value) {
        let Some(manager) = self.manager.upgrade() else { return };
        manager
            .dispatch(
                plugin,
                Capability::SchedulerCallback,
                FUNC_SCHEDULER_CALLBACK,
                &TimerCallbackPayload {
                    timer_id,
                    payload: &payload,
                },
            )
            .await;
    }

    async fn on_websocket_text(&self, plugin: &str, connection_id: &str, text: String) {
        let Some(manager) = self.manager.upgrade() else { return };
        manager
            .dispatch(
                plugin,
                Capability::WebSocketCallback,
                FUNC_WEBSOCKET_ON_TEXT,
                &WsTextPayload {
                    connection_id,
                    text: &text,
                },
            )
            .await;
    }

    async fn on_websocket_binary(&self, plugin: &str, connection_id: &str, data: Vec<u8>) {
        let Some(manager) = self.manager.upgrade() else { return };
        manager
            .dispatch(
                plugin,
                Capability::WebSocketCallback,
                FUNC_WEBSOCKET_ON_BINARY,
                &WsBinaryPayload {
                    connection_id,
                    data: &data,
                },
            )
            .await;
    }

    async fn on_websocket_error(&self, plugin: &str, connection_id: &str, message: String) {
        let Some(manager) = self.manager.upgrade() else { return };
        manager
            .dispatch(
                plugin,
                Capability::WebSocketCallback,
                FUNC_WEBSOCKET_ON_ERROR,
                &WsErrorPayload {
                    connection_id,
                    message: &message,
                },
            )
            .await;
    }

    async fn on_websocket_close(&self, plugin: &str, connection_id: &str, code: u16, reason: String) {
        let Some(manager) = self.manager.upgrade() else { return };
        manager
            .dispatch(
                plugin,
                Capability::WebSocketCallback,
                FUNC_WEBSOCKET_ON_CLOSE,
                &WsClosePayload {
                    connection_id,
                    code,
                    reason: &reason,
                },
            )
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn manifest(name: &str, version: &str, extra: &str) -> PluginManifest {
        let raw = format!(
            r#"{{"name": "{name}", "version": "{version}"{}{extra}}}"#,
            if extra.is_empty() { "" } else { "," }
        );
        PluginManifest::parse(&raw).unwrap()
    }

    fn write_wasm(dir: &tempfile::TempDir, file: &str, wat_src: &str) -> PathBuf {
        let bytes = wat::parse_str(wat_src).unwrap();
        let path = dir.path().join(file);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(&bytes).unwrap();
        path
    }

    fn config(dir: &tempfile::TempDir) -> RuntimeConfig {
        RuntimeConfig {
            cache_dir: dir.path().join("cache"),
            ..RuntimeConfig::default()
        }
    }

    const SCROBBLER_WAT: &str = r#"(module
        (func (export "ch_now_playing"))
        (func (export "ch_scrobble")))"#;

    #[tokio::test]
    async fn test_load_detects_capabilities_from_exports() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_wasm(&dir, "p.wasm", SCROBBLER_WAT);
        let manager = PluginManager::new(config(&dir), "https://music.example.com");

        // Manifest claims MetadataAgent, exports say Scrobbler.
        let loaded = manager
            .load(
                manifest("lastfm", "1.0.0", r#""capabilities": ["MetadataAgent"]"#),
                &path,
            )
            .await
            .unwrap();

        assert_eq!(loaded.capabilities, vec![Capability::Scrobbler]);
        assert!(manager.with_capability(Capability::Scrobbler).len() == 1);
        assert!(manager.with_capability(Capability::MetadataAgent).is_empty());
    }

    #[tokio::test]
    async fn test_load_unchanged_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_wasm(&dir, "p.wasm", SCROBBLER_WAT);
        let manager = PluginManager::new(config(&dir), "https://music.example.com");

        let a = manager
            .load(manifest("lastfm", "1.0.0", ""), &path)
            .await
            .unwrap();
        let b = manager
            .load(manifest("lastfm", "1.0.0", ""), &path)
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn test_load_changed_content_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_wasm(&dir, "p.wasm", SCROBBLER_WAT);
        let manager = PluginManager::new(config(&dir), "https://music.example.com");

        let a = manager
            .load(manifest("lastfm", "1.0.0", ""), &path)
            .await
            .unwrap();

        let path2 = write_wasm(
            &dir,
            "p2.wasm",
            r#"(module (func (export "ch_scheduler_callback")))"#,
        );
        let b = manager
            .load(manifest("lastfm", "1.1.0", ""), &path2)
            .await
            .unwrap();

        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(b.capabilities, vec![Capability::SchedulerCallback]);
        assert_eq!(manager.list().len(), 1);
        assert_eq!(manager.list()[0].version, "1.1.0");
    }

    #[tokio::test]
    async fn test_load_invalid_wasm_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.wasm");
        std::fs::write(&path, b"not wasm").unwrap();
        let manager = PluginManager::new(config(&dir), "https://music.example.com");

        let Err(err) = manager.load(manifest("bad", "1.0.0", ""), &path).await else {
            panic!("load should reject invalid wasm");
        };
        assert!(matches!(err, PluginError::WasmValidation(_)));
        assert!(manager.list().is_empty());
    }

    #[tokio::test]
    async fn test_load_malformed_http_grant_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_wasm(&dir, "p.wasm", SCROBBLER_WAT);
        let manager = PluginManager::new(config(&dir), "https://music.example.com");

        let Err(err) = manager
            .load(
                manifest("p", "1.0.0", r#""permissions": {"http": {"reason": "api"}}"#),
                &path,
            )
            .await
        else {
            panic!("load should reject the malformed grant");
        };
        assert!(matches!(err, PluginError::Construction(_)));
    }

    #[tokio::test]
    async fn test_unload_cleans_up_everything() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_wasm(&dir, "p.wasm", SCROBBLER_WAT);
        let manager = PluginManager::new(config(&dir), "https://music.example.com");

        let loaded = manager
            .load(manifest("lastfm", "1.0.0", ""), &path)
            .await
            .unwrap();

        // Owned state across services.
        manager
            .timers
            .schedule_one_time(
                "lastfm",
                Some("retry".into()),
                std::time::Duration::from_secs(600),
                serde_json::json!({}),
            )
            .unwrap();
        manager
            .cache_store
            .set("lastfm", "k", serde_json::json!(1), None);

        manager.unload("lastfm").await;

        assert!(manager.get("lastfm").is_none());
        assert_eq!(manager.timers.armed_count(Some("lastfm")), 0);
        assert!(manager.cache_store.get("lastfm", "k").is_none());
        assert!(loaded.pool.is_closed());
    }

    #[tokio::test]
    async fn test_owner_keyed_state_resolves_and_unloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_wasm(&dir, "p.wasm", SCROBBLER_WAT);
        let manager = PluginManager::new(config(&dir), "https://music.example.com");

        let loaded = manager
            .load(
                manifest(
                    "lastfm",
                    "1.0.0",
                    r#""permissions": {"scheduler": {"reason": "retry queue"}}"#,
                ),
                &path,
            )
            .await
            .unwrap();

        // Arm a timer under the key the scheduler bindings use for this
        // plugin: the bare name, never the name@version rendering.
        let owner = loaded.id.name.clone();
        manager
            .timers
            .schedule_one_time(
                &owner,
                Some("sync".into()),
                std::time::Duration::from_secs(600),
                serde_json::json!({}),
            )
            .unwrap();

        // Callback delivery resolves the same key through the manager.
        assert!(manager.get(&owner).is_some());
        assert!(manager.get(&loaded.id.to_string()).is_none());

        manager.unload(&owner).await;
        assert_eq!(manager.timers.armed_count(Some(&owner)), 0);
    }

    #[tokio::test]
    async fn test_unload_unknown_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let manager = PluginManager::new(config(&dir), "https://music.example.com");
        manager.unload("ghost").await;
    }

    #[tokio::test]
    async fn test_invoke_unknown_plugin_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let manager = PluginManager::new(config(&dir), "https://music.example.com");

        let err = manager
            .invoke::<_, serde_json::Value>("ghost", "anything", &())
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_capability_gate_rejects_wrong_kind() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_wasm(&dir, "p.wasm", SCROBBLER_WAT);
        let manager = PluginManager::new(config(&dir), "https://music.example.com");
        manager
            .load(manifest("lastfm", "1.0.0", ""), &path)
            .await
            .unwrap();

        let err = manager
            .artist_info(
                "lastfm",
                &ArtistInfoRequest {
                    id: "ar-1".into(),
                    name: "Someone".into(),
                    mbid: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::NotImplemented(_)));
    }

    #[tokio::test]
    async fn test_descriptor_lists_services() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_wasm(&dir, "p.wasm", SCROBBLER_WAT);
        let manager = PluginManager::new(config(&dir), "https://music.example.com");
        manager
            .load(
                manifest(
                    "lastfm",
                    "1.0.0",
                    r#""permissions": {"cache": {"reason": "memoize"}}"#,
                ),
                &path,
            )
            .await
            .unwrap();

        let listed = manager.list();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].services, vec!["cache"]);
        assert_eq!(listed[0].capabilities, vec!["Scrobbler"]);
    }

    #[tokio::test]
    async fn test_shutdown_unloads_all() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_wasm(&dir, "p.wasm", SCROBBLER_WAT);
        let manager = PluginManager::new(config(&dir), "https://music.example.com");
        manager
            .load(manifest("a", "1.0.0", ""), &path)
            .await
            .unwrap();
        manager
            .load(manifest("b", "1.0.0", ""), &path)
            .await
            .unwrap();

        manager.shutdown().await;
        assert!(manager.list().is_empty());
    }
}
