//! Capability detection from a module's export table.
//!
//! A capability is a named contract a plugin satisfies by exporting a fixed
//! set of functions. Detection is exact-match over export names — every
//! required export must be present, no partial credit — and the detected
//! set is authoritative for dispatch regardless of what the manifest claims.

use std::collections::HashSet;

use wasmparser::{ExternalKind, Parser, Payload};

use crate::error::PluginError;

// ─── Entry-point names ──────────────────────────────────────────────────

pub const FUNC_GET_ARTIST_INFO: &str = "ch_get_artist_info";
pub const FUNC_GET_ALBUM_INFO: &str = "ch_get_album_info";
pub const FUNC_NOW_PLAYING: &str = "ch_now_playing";
pub const FUNC_SCROBBLE: &str = "ch_scrobble";
pub const FUNC_SCHEDULER_CALLBACK: &str = "ch_scheduler_callback";
pub const FUNC_WEBSOCKET_ON_TEXT: &str = "ch_websocket_on_text";
pub const FUNC_WEBSOCKET_ON_BINARY: &str = "ch_websocket_on_binary";
pub const FUNC_WEBSOCKET_ON_ERROR: &str = "ch_websocket_on_error";
pub const FUNC_WEBSOCKET_ON_CLOSE: &str = "ch_websocket_on_close";
pub const FUNC_ON_INIT: &str = "ch_on_init";

// ─── Registry ───────────────────────────────────────────────────────────

/// A contract a plugin module can satisfy by exporting functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Supplies artist/album metadata to the library scanner.
    MetadataAgent,
    /// Receives play notifications for external scrobbling services.
    Scrobbler,
    /// Can receive delayed-task callbacks from the scheduler service.
    SchedulerCallback,
    /// Can receive WebSocket event callbacks.
    WebSocketCallback,
    /// Has a one-time initialization hook.
    LifecycleInit,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::MetadataAgent => "MetadataAgent",
            Capability::Scrobbler => "Scrobbler",
            Capability::SchedulerCallback => "SchedulerCallback",
            Capability::WebSocketCallback => "WebSocketCallback",
            Capability::LifecycleInit => "LifecycleInit",
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Capability tag → required export names. Process-lifetime, immutable.
pub const CAPABILITY_REGISTRY: &[(Capability, &[&str])] = &[
    (
        Capability::MetadataAgent,
        &[FUNC_GET_ARTIST_INFO, FUNC_GET_ALBUM_INFO],
    ),
    (Capability::Scrobbler, &[FUNC_NOW_PLAYING, FUNC_SCROBBLE]),
    (Capability::SchedulerCallback, &[FUNC_SCHEDULER_CALLBACK]),
    (
        Capability::WebSocketCallback,
        &[
            FUNC_WEBSOCKET_ON_TEXT,
            FUNC_WEBSOCKET_ON_BINARY,
            FUNC_WEBSOCKET_ON_ERROR,
            FUNC_WEBSOCKET_ON_CLOSE,
        ],
    ),
    (Capability::LifecycleInit, &[FUNC_ON_INIT]),
];

/// Detect which capabilities a module holds, given its export-name set.
///
/// A capability is detected iff every one of its required exports is
/// present. A module may hold several capabilities at once.
pub fn detect_capabilities(exports: &HashSet<String>) -> Vec<Capability> {
    CAPABILITY_REGISTRY
        .iter()
        .filter(|(_, required)| required.iter().all(|name| exports.contains(*name)))
        .map(|(cap, _)| *cap)
        .collect()
}

/// Read the exported function names from raw WASM bytes.
///
/// Only function exports count; memories, globals and tables are ignored.
pub fn module_exports(wasm_bytes: &[u8]) -> Result<HashSet<String>, PluginError> {
    let mut names = HashSet::new();
    for payload in Parser::new(0).parse_all(wasm_bytes) {
        let payload = payload.map_err(|e| PluginError::WasmValidation(e.to_string()))?;
        if let Payload::ExportSection(reader) = payload {
            for export in reader {
                let export = export.map_err(|e| PluginError::WasmValidation(e.to_string()))?;
                if export.kind == ExternalKind::Func {
                    names.insert(export.name.to_string());
                }
            }
        }
    }
    Ok(names)
}
