//! Plugin runtime error types.
//!
//! Plugin-side errors cross the host/guest boundary as serialized text, so
//! the canonical "not found" / "not implemented" outcomes are recovered by
//! matching well-known sentinel strings rather than structured identity.

use std::time::Duration;

use thiserror::Error;

/// Sentinel emitted by the guest PDK when a lookup produced no result.
pub const NOT_FOUND_SENTINEL: &str = "plugin:not_found";

/// Sentinel emitted by the guest PDK when a function exists but the plugin
/// chose not to implement it.
pub const NOT_IMPLEMENTED_SENTINEL: &str = "plugin:not_implemented";

#[derive(Error, Debug)]
pub enum PluginError {
    #[error("sandbox construction error: {0}")]
    Construction(String),

    #[error("compilation error: {0}")]
    Compilation(String),

    #[error("compilation timed out after {0:?}")]
    CompilationTimeout(Duration),

    #[error("instance pool exhausted for plugin {0}")]
    PoolExhausted(String),

    #[error("instance pool closed for plugin {0}")]
    PoolClosed(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("not implemented: {0}")]
    NotImplemented(String),

    #[error("sandbox error: {0}")]
    Sandbox(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("WASM validation error: {0}")]
    WasmValidation(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PluginError {
    /// Classify a raw error message from a plugin call.
    ///
    /// The sentinel "not found" / "not implemented" strings map to the
    /// canonical variants; anything else is a sandbox (transport) fault.
    pub fn classify_call_failure(message: &str) -> PluginError {
        if message.contains(NOT_FOUND_SENTINEL) {
            PluginError::NotFound(message.to_string())
        } else if message.contains(NOT_IMPLEMENTED_SENTINEL) {
            PluginError::NotImplemented(message.to_string())
        } else {
            PluginError::Sandbox(message.to_string())
        }
    }

    /// True for the canonical not-found / not-implemented outcomes.
    ///
    /// These are expected results of a call; the instance that produced
    /// them is healthy and goes back to its pool.
    pub fn is_canonical_miss(&self) -> bool {
        matches!(
            self,
            PluginError::NotFound(_) | PluginError::NotImplemented(_)
        )
    }
}
