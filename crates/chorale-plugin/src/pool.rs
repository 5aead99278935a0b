//! Bounded instance pool with idle expiry.
//!
//! Each plugin owns one pool. Capacity counts live instances, idle and
//! checked out alike; a caller that cannot get a slot within the grace
//! period fails instead of queueing forever. Idle instances expire after a
//! TTL, lazily on checkout and eagerly from a background sweep.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::PluginError;

type Factory<T> = Arc<dyn Fn() -> Result<T, PluginError> + Send + Sync>;

/// Pool of reusable sandbox instances for a single plugin.
pub struct InstancePool<T: Send + 'static> {
    plugin: String,
    capacity: Arc<Semaphore>,
    get_timeout: Duration,
    ttl: Duration,
    factory: Factory<T>,
    state: Arc<Mutex<PoolState<T>>>,
    sweeper: CancellationToken,
}

struct PoolState<T> {
    idle: VecDeque<IdleEntry<T>>,
    closed: bool,
}

struct IdleEntry<T> {
    instance: T,
    parked_at: Instant,
}

/// A checked-out instance. `put_back` returns it for reuse; dropping the
/// guard without calling `put_back` destroys the instance and frees its
/// capacity slot either way.
pub struct PooledInstance<T: Send + 'static> {
    instance: Option<T>,
    state: Arc<Mutex<PoolState<T>>>,
    _permit: OwnedSemaphorePermit,
}

impl<T: Send + 'static> InstancePool<T> {
    pub fn new(
        plugin: String,
        capacity: usize,
        ttl: Duration,
        get_timeout: Duration,
        factory: Factory<T>,
    ) -> Arc<Self> {
        let pool = Arc::new(Self {
            plugin,
            capacity: Arc::new(Semaphore::new(capacity.max(1))),
            get_timeout,
            ttl,
            factory,
            state: Arc::new(Mutex::new(PoolState {
                idle: VecDeque::new(),
                closed: false,
            })),
            sweeper: CancellationToken::new(),
        });
        pool.spawn_sweeper();
        pool
    }

    /// Check an instance out, creating one if no idle instance is fresh.
    ///
    /// Blocks up to the grace period for a capacity slot, then fails with
    /// `PoolExhausted`.
    pub async fn get(self: &Arc<Self>) -> Result<PooledInstance<T>, PluginError> {
        if self.is_closed() {
            return Err(PluginError::PoolClosed(self.plugin.clone()));
        }

        let permit = tokio::time::timeout(
            self.get_timeout,
            Arc::clone(&self.capacity).acquire_owned(),
        )
        .await
        .map_err(|_| PluginError::PoolExhausted(self.plugin.clone()))?
        .map_err(|_| PluginError::PoolClosed(self.plugin.clone()))?;

        // Reuse the freshest idle instance; expired ones are discarded on
        // the way past.
        let reused = {
            let mut state = self
                .state
                .lock()
                .map_err(|_| PluginError::Sandbox("pool state poisoned".to_string()))?;
            if state.closed {
                return Err(PluginError::PoolClosed(self.plugin.clone()));
            }
            loop {
                match state.idle.pop_back() {
                    Some(entry) if entry.parked_at.elapsed() < self.ttl => {
                        break Some(entry.instance)
                    }
                    Some(stale) => {
                        trace!(plugin = %self.plugin, "discarding expired idle instance");
                        drop(stale);
                    }
                    None => break None,
                }
            }
        };

        let instance = match reused {
            Some(instance) => instance,
            None => {
                debug!(plugin = %self.plugin, "creating pool instance");
                (self.factory)()?
            }
        };

        Ok(PooledInstance {
            instance: Some(instance),
            state: Arc::clone(&self.state),
            _permit: permit,
        })
    }

    /// Number of instances currently parked idle.
    pub fn idle_count(&self) -> usize {
        self.state.lock().map(|s| s.idle.len()).unwrap_or(0)
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().map(|s| s.closed).unwrap_or(true)
    }

    /// Close the pool: drop all idle instances and make every later
    /// `put_back` destroy instead of park.
    pub fn close(&self) {
        self.sweeper.cancel();
        let drained = {
            match self.state.lock() {
                Ok(mut state) => {
                    state.closed = true;
                    std::mem::take(&mut state.idle)
                }
                Err(_) => return,
            }
        };
        debug!(plugin = %self.plugin, count = drained.len(), "pool closed");
        drop(drained);
    }

    fn spawn_sweeper(self: &Arc<Self>) {
        let state = Arc::clone(&self.state);
        let ttl = self.ttl;
        let token = self.sweeper.clone();
        let plugin = self.plugin.clone();
        // Sweep at a third of the TTL so nothing idles much past its time.
        let period = (ttl / 3).max(Duration::from_millis(10));

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(period) => {}
                }
                let expired = {
                    let Ok(mut state) = state.lock() else { return };
                    let mut expired = Vec::new();
                    // Oldest entries sit at the front.
                    while let Some(entry) = state.idle.front() {
                        if entry.parked_at.elapsed() >= ttl {
                            if let Some(entry) = state.idle.pop_front() {
                                expired.push(entry);
                            }
                        } else {
                            break;
                        }
                    }
                    expired
                };
                if !expired.is_empty() {
                    trace!(plugin = %plugin, count = expired.len(), "swept expired instances");
                }
            }
        });
    }
}

impl<T: Send + 'static> Drop for InstancePool<T> {
    fn drop(&mut self) {
        self.sweeper.cancel();
    }
}

impl<T: Send + 'static> PooledInstance<T> {
    /// Return the instance to the pool for reuse. No-op destroy when the
    /// pool has been closed in the meantime.
    pub fn put_back(mut self) {
        let Some(instance) = self.instance.take() else {
            return;
        };
        if let Ok(mut state) = self.state.lock() {
            if !state.closed {
                // TTL re-arms from the moment of return, not creation.
                state.idle.push_back(IdleEntry {
                    instance,
                    parked_at: Instant::now(),
                });
            }
        }
        // Guard drop releases the capacity permit.
    }
}

impl<T: Send + 'static> std::ops::Deref for PooledInstance<T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.instance
            .as_ref()
            .unwrap_or_else(|| unreachable!("instance taken only by put_back"))
    }
}

impl<T: Send + 'static> std::ops::DerefMut for PooledInstance<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.instance
            .as_mut()
            .unwrap_or_else(|| unreachable!("instance taken only by put_back"))
    }
}

impl<T: Send + 'static> Drop for PooledInstance<T> {
    fn drop(&mut self) {
        // Instance still present means nobody called put_back: destroy it.
        self.instance.take();
    }
}
