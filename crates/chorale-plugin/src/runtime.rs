//! Permission-scoped sandbox runtimes.
//!
//! A runtime is built once per loaded plugin from its permission manifest:
//! every granted service contributes its host-function library, nothing
//! else is linked, and a name collision between libraries is fatal at
//! construction. The runtime then stamps out engine instances on demand.

use std::collections::HashMap;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use tracing::{debug, info};

use crate::config::RuntimeConfig;
use crate::error::PluginError;
use crate::manifest::PluginId;

// ─── Host libraries ─────────────────────────────────────────────────────

/// One granted service's contribution to the sandbox: its function names
/// plus a builder that mints fresh engine bindings for each compilation.
pub struct HostLibrary {
    pub service: &'static str,
    pub names: Vec<String>,
    builder: Box<dyn Fn() -> Vec<extism::Function> + Send + Sync>,
}

impl HostLibrary {
    pub fn new(
        service: &'static str,
        names: Vec<String>,
        builder: impl Fn() -> Vec<extism::Function> + Send + Sync + 'static,
    ) -> Self {
        Self {
            service,
            names,
            builder: Box::new(builder),
        }
    }
}

// ─── Sandbox runtime ────────────────────────────────────────────────────

/// The immutable sandbox blueprint for one loaded plugin.
pub struct SandboxRuntime {
    plugin: PluginId,
    config: RuntimeConfig,
    libraries: Vec<HostLibrary>,
    allowed_hosts: Vec<String>,
    engine_cache_config: Option<PathBuf>,
}

impl SandboxRuntime {
    /// Assemble a runtime from the libraries of the plugin's granted
    /// services. Two libraries exporting the same function name is a
    /// construction error, not a runtime surprise.
    pub fn new(
        plugin: PluginId,
        config: RuntimeConfig,
        libraries: Vec<HostLibrary>,
        allowed_hosts: Vec<String>,
        engine_cache_config: Option<PathBuf>,
    ) -> Result<Self, PluginError> {
        let mut seen: HashMap<&str, &'static str> = HashMap::new();
        for library in &libraries {
            for name in &library.names {
                if let Some(owner) = seen.insert(name.as_str(), library.service) {
                    return Err(PluginError::Construction(format!(
                        "host function {name} is provided by both {owner} and {}",
                        library.service
                    )));
                }
            }
        }

        info!(
            plugin = %plugin,
            services = ?libraries.iter().map(|l| l.service).collect::<Vec<_>>(),
            "sandbox runtime assembled"
        );

        Ok(Self {
            plugin,
            config,
            libraries,
            allowed_hosts,
            engine_cache_config,
        })
    }

    pub fn plugin(&self) -> &PluginId {
        &self.plugin
    }

    /// Names of the services whose libraries are linked in.
    pub fn linked_services(&self) -> Vec<&'static str> {
        self.libraries.iter().map(|l| l.service).collect()
    }

    /// Every host function name reachable from guest code.
    pub fn function_names(&self) -> HashSet<&str> {
        self.libraries
            .iter()
            .flat_map(|l| l.names.iter().map(String::as_str))
            .collect()
    }

    fn build_functions(&self) -> Vec<extism::Function> {
        self.libraries.iter().flat_map(|l| (l.builder)()).collect()
    }

    /// Compile the plugin module against this runtime's bindings.
    ///
    /// Slow on a cold engine cache; callers run this through the
    /// compilation scheduler rather than inline.
    pub fn compile(&self, wasm_bytes: Vec<u8>) -> Result<extism::CompiledPlugin, PluginError> {
        let mut manifest = extism::Manifest::new([extism::Wasm::data(wasm_bytes)])
            .with_memory_max((self.config.memory_limit / 65536) as u32)
            .with_timeout(self.config.call_timeout);
        for host in &self.allowed_hosts {
            manifest = manifest.with_allowed_host(host.clone());
        }

        let mut builder = extism::PluginBuilder::new(manifest)
            .with_wasi(false)
            .with_functions(self.build_functions());
        if let Some(path) = &self.engine_cache_config {
            builder = builder.with_cache_config(path);
        }

        debug!(plugin = %self.plugin, "compiling plugin module");
        extism::CompiledPlugin::new(builder)
            .map_err(|e| PluginError::Compilation(e.to_string()))
    }

    /// Stamp a fresh sandbox instance out of a compiled module.
    pub fn instantiate(
        &self,
        compiled: &extism::CompiledPlugin,
    ) -> Result<extism::Plugin, PluginError> {
        extism::Plugin::new_from_compiled(compiled)
            .map_err(|e| PluginError::Construction(e.to_string()))
    }
}

impl std::fmt::Debug for SandboxRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxRuntime")
            .field("plugin", &self.plugin)
            .field("services", &self.linked_services())
            .field("allowed_hosts", &self.allowed_hosts)
            .finish_non_exhaustive()
    }
}

// ─── Runtime cache ──────────────────────────────────────────────────────

/// Shared cache of built values keyed by plugin identity.
///
/// Two tasks may build for the same key at once; the first insert wins and
/// the loser's build is discarded in favour of the cached value.
pub struct RuntimeCache<V> {
    inner: RwLock<HashMap<PluginId, Arc<V>>>,
}

impl<V> Default for RuntimeCache<V> {
    fn default() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }
}

impl<V> RuntimeCache<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &PluginId) -> Option<Arc<V>> {
        self.read().get(id).cloned()
    }

    /// Fetch the cached value, building it when absent.
    ///
    /// The build runs outside the write lock, so concurrent callers may
    /// both build; whichever inserts first wins and the other result is
    /// dropped.
    pub fn get_or_build<F>(&self, id: &PluginId, build: F) -> Result<Arc<V>, PluginError>
    where
        F: FnOnce() -> Result<V, PluginError>,
    {
        if let Some(existing) = self.get(id) {
            return Ok(existing);
        }

        let built = Arc::new(build()?);
        let mut map = self.write();
        Ok(Arc::clone(map.entry(id.clone()).or_insert(built)))
    }

    pub fn remove(&self, id: &PluginId) -> Option<Arc<V>> {
        self.write().remove(id)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<PluginId, Arc<V>>> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<PluginId, Arc<V>>> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}

/// Convenience: prepare the engine cache directory before first use.
pub fn prepare_engine_cache(dir: &Path, budget_raw: &str) -> Option<PathBuf> {
    if let Some(budget) = crate::cache::parse_cache_budget(budget_raw) {
        if let Err(e) = crate::cache::prune_cache_by_size(dir, budget) {
            tracing::warn!(error = %e, "cache pruning failed, continuing without");
        }
    }
    match crate::cache::write_engine_cache_config(dir) {
        Ok(path) => Some(path),
        Err(e) => {
            tracing::warn!(error = %e, "engine cache unavailable, compiling uncached");
            None
        }
    }
}
