//! Chorale Plugin Runtime
//!
//! WASM-based plugin runtime using Extism (wasmtime) for sandboxed
//! execution. Plugins declare capabilities through their exports, request
//! host services through a permission manifest, and run inside pooled,
//! memory-limited sandboxes. Host services cover config, scheduling,
//! caching, artwork URLs, HTTP, and WebSockets; timer and socket events
//! are dispatched back into the owning plugin.

pub mod cache;
pub mod call;
pub mod callback;
pub mod capability;
pub mod compile;
pub mod config;
pub mod error;
pub mod host;
pub mod lifecycle;
pub mod manager;
pub mod manifest;
pub mod permissions;
pub mod pool;
pub mod runtime;
pub mod scheduler;
pub mod websocket;

pub use callback::PluginCallback;
pub use capability::{detect_capabilities, module_exports, Capability, CAPABILITY_REGISTRY};
pub use config::RuntimeConfig;
pub use error::PluginError;
pub use manager::{
    AlbumInfoRequest, AlbumInfoResponse, ArtistInfoRequest, ArtistInfoResponse, LoadedPlugin,
    PlayNotification, PluginDescriptor, PluginManager,
};
pub use manifest::{Grant, Permissions, PluginId, PluginManifest};
pub use permissions::NetworkPermissions;
pub use pool::{InstancePool, PooledInstance};
pub use runtime::{HostLibrary, RuntimeCache, SandboxRuntime};
pub use scheduler::TimerService;
pub use websocket::WebSocketService;
