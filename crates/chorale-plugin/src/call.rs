//! The call adapter: typed host-side calls into pooled sandbox instances.
//!
//! Input is serialized to JSON bytes, the guest call runs on a blocking
//! thread, and the output is deserialized back. Instance disposition
//! follows the outcome: success and the canonical miss results return the
//! instance to its pool; any other failure destroys it, since a trapped
//! sandbox cannot be trusted for reuse.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::PluginError;
use crate::pool::{InstancePool, PooledInstance};

use std::sync::Arc;

/// The slice of a sandbox instance the adapter needs.
pub trait SandboxCall: Send + 'static {
    fn has_function(&self, name: &str) -> bool;
    /// Raw guest call. Errors come back as text because that is all the
    /// guest boundary preserves.
    fn call_raw(&mut self, name: &str, input: &[u8]) -> Result<Vec<u8>, String>;
}

impl SandboxCall for extism::Plugin {
    fn has_function(&self, name: &str) -> bool {
        self.function_exists(name)
    }

    fn call_raw(&mut self, name: &str, input: &[u8]) -> Result<Vec<u8>, String> {
        self.call::<&[u8], Vec<u8>>(name, input)
            .map_err(|e| e.to_string())
    }
}

/// Call `function` on an instance from `pool` with a JSON payload.
///
/// A missing export fails fast with `NotFound` without burning the
/// instance. Empty guest output deserializes as JSON `null`, so `()` and
/// `Option<T>` outputs work without a body.
pub async fn call_plugin<T, I, O>(
    pool: &Arc<InstancePool<T>>,
    plugin: &str,
    function: &str,
    input: &I,
) -> Result<O, PluginError>
where
    T: SandboxCall,
    I: Serialize,
    O: DeserializeOwned,
{
    let payload = serde_json::to_vec(input)?;
    let output = call_raw_pooled(pool, plugin, function, payload).await?;

    if output.is_empty() {
        Ok(serde_json::from_slice(b"null")?)
    } else {
        Ok(serde_json::from_slice(&output)?)
    }
}

/// Like [`call_plugin`] for functions whose output is discarded.
pub async fn call_plugin_no_output<T, I>(
    pool: &Arc<InstancePool<T>>,
    plugin: &str,
    function: &str,
    input: &I,
) -> Result<(), PluginError>
where
    T: SandboxCall,
    I: Serialize,
{
    let payload = serde_json::to_vec(input)?;
    call_raw_pooled(pool, plugin, function, payload).await?;
    Ok(())
}

async fn call_raw_pooled<T: SandboxCall>(
    pool: &Arc<InstancePool<T>>,
    plugin: &str,
    function: &str,
    payload: Vec<u8>,
) -> Result<Vec<u8>, PluginError> {
    let trace = Uuid::new_v4();
    debug!(plugin = %plugin, function = %function, trace = %trace, "plugin call");

    let guard = pool.get().await?;

    if !guard.has_function(function) {
        // The instance never ran: park it again.
        guard.put_back();
        return Err(PluginError::NotFound(format!(
            "{plugin} does not export {function}"
        )));
    }

    let function_name = function.to_string();
    let plugin_name = plugin.to_string();
    let outcome = tokio::task::spawn_blocking(move || run_call(guard, &function_name, &payload))
        .await
        .map_err(|e| PluginError::Sandbox(format!("call task failed: {e}")))?;

    if let Err(e) = &outcome {
        if e.is_canonical_miss() {
            debug!(plugin = %plugin_name, function = %function, trace = %trace, result = %e, "plugin declined");
        } else {
            warn!(plugin = %plugin_name, function = %function, trace = %trace, error = %e, "plugin call failed");
        }
    }
    outcome
}

/// Run the guest call and settle the instance's fate in one place.
fn run_call<T: SandboxCall>(
    mut guard: PooledInstance<T>,
    function: &str,
    payload: &[u8],
) -> Result<Vec<u8>, PluginError> {
    match guard.call_raw(function, payload) {
        Ok(output) => {
            guard.put_back();
            Ok(output)
        }
        Err(message) => {
            let err = PluginError::classify_call_failure(&message);
            if err.is_canonical_miss() {
                guard.put_back();
            } else {
                // Drop destroys the instance.
                drop(guard);
            }
            Err(err)
        }
    }
}
