//! Bounded background compilation.
//!
//! Compilation is CPU-heavy, so a process-wide gate caps how many modules
//! compile at once; everything else queues. Callers get a handle they can
//! await with a deadline. The deadline bounds the wait only — a compilation
//! that outlives it keeps running and its result is kept for later callers.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info};

use crate::error::PluginError;

/// Process-wide compilation gate.
pub struct CompileScheduler {
    gate: Arc<Semaphore>,
    timeout: Duration,
}

/// Await-able handle to a background compilation.
///
/// Cheap to clone; every clone observes the same single outcome.
#[derive(Clone)]
pub struct CompileHandle<T> {
    rx: watch::Receiver<Option<Result<Arc<T>, String>>>,
}

impl CompileScheduler {
    pub fn new(max_parallel: usize, timeout: Duration) -> Self {
        Self {
            gate: Arc::new(Semaphore::new(max_parallel.max(1))),
            timeout,
        }
    }

    /// Queue `work` for compilation and return a handle to its outcome.
    ///
    /// The closure runs on a blocking thread once a gate slot frees up.
    pub fn spawn<T, F>(&self, id: String, work: F) -> CompileHandle<T>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Result<T, PluginError> + Send + 'static,
    {
        let (tx, rx) = watch::channel(None);
        let gate = Arc::clone(&self.gate);

        tokio::spawn(async move {
            // Semaphore is never closed, so acquisition only fails on
            // shutdown teardown; dropping tx reports that as an error.
            let _permit = match gate.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };

            debug!(module = %id, "compilation slot acquired");
            let started = std::time::Instant::now();
            let outcome = tokio::task::spawn_blocking(work).await;

            let result = match outcome {
                Ok(Ok(value)) => {
                    info!(module = %id, elapsed = ?started.elapsed(), "compilation finished");
                    Ok(Arc::new(value))
                }
                Ok(Err(e)) => {
                    error!(module = %id, error = %e, "compilation failed");
                    Err(e.to_string())
                }
                Err(join_err) => {
                    error!(module = %id, error = %join_err, "compilation task panicked");
                    Err(join_err.to_string())
                }
            };
            let _ = tx.send(Some(result));
        });

        CompileHandle { rx }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl<T> CompileHandle<T> {
    /// Wait up to `timeout` for the compilation outcome.
    ///
    /// Expiry returns `CompilationTimeout` without cancelling the work.
    pub async fn wait(&self, timeout: Duration) -> Result<Arc<T>, PluginError> {
        let mut rx = self.rx.clone();
        let settled = tokio::time::timeout(timeout, rx.wait_for(|v| v.is_some())).await;

        match settled {
            Ok(Ok(value)) => match value.as_ref() {
                Some(Ok(compiled)) => Ok(Arc::clone(compiled)),
                Some(Err(msg)) => Err(PluginError::Compilation(msg.clone())),
                None => unreachable!("wait_for guarantees a settled value"),
            },
            Ok(Err(_)) => Err(PluginError::Compilation(
                "compilation task was dropped".to_string(),
            )),
            Err(_) => Err(PluginError::CompilationTimeout(timeout)),
        }
    }

    /// Non-blocking peek at the outcome, if settled.
    pub fn try_get(&self) -> Option<Result<Arc<T>, PluginError>> {
        self.rx.borrow().as_ref().map(|result| match result {
            Ok(compiled) => Ok(Arc::clone(compiled)),
            Err(msg) => Err(PluginError::Compilation(msg.clone())),
        })
    }
}
