//! One-time lifecycle initialization tracking.
//!
//! A plugin's init hook runs at most once per name+version. The marker is
//! set before the hook runs, so a crashing hook does not retry in a loop;
//! a new version resets the slate.

use std::collections::HashSet;
use std::sync::Mutex;

use tracing::debug;

use crate::manifest::PluginId;

#[derive(Default)]
pub struct LifecycleRegistry {
    initialized: Mutex<HashSet<(String, String)>>,
}

impl LifecycleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the init slot for a plugin version.
    ///
    /// Returns true exactly once per name+version; the caller that gets
    /// true runs the hook. The marker stands even if the hook then fails.
    pub fn begin_init(&self, id: &PluginId) -> bool {
        let Ok(mut set) = self.initialized.lock() else { return false };
        let fresh = set.insert((id.name.clone(), id.version.clone()));
        if fresh {
            debug!(plugin = %id, "lifecycle init claimed");
        }
        fresh
    }

    pub fn is_initialized(&self, id: &PluginId) -> bool {
        self.initialized
            .lock()
            .map(|set| set.contains(&(id.name.clone(), id.version.clone())))
            .unwrap_or(false)
    }

    /// Forget a plugin's marker, forcing init to run again on next load.
    pub fn reset(&self, id: &PluginId) {
        if let Ok(mut set) = self.initialized.lock() {
            set.remove(&(id.name.clone(), id.version.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(name: &str, version: &str) -> PluginId {
        PluginId::new(name, version)
    }

    #[test]
    fn test_init_claimed_once() {
        let registry = LifecycleRegistry::new();
        assert!(registry.begin_init(&id("p", "1.0.0")));
        assert!(!registry.begin_init(&id("p", "1.0.0")));
        assert!(registry.is_initialized(&id("p", "1.0.0")));
    }

    #[test]
    fn test_new_version_inits_again() {
        let registry = LifecycleRegistry::new();
        assert!(registry.begin_init(&id("p", "1.0.0")));
        assert!(registry.begin_init(&id("p", "1.1.0")));
    }

    #[test]
    fn test_reset_allows_reinit() {
        let registry = LifecycleRegistry::new();
        assert!(registry.begin_init(&id("p", "1.0.0")));
        registry.reset(&id("p", "1.0.0"));
        assert!(!registry.is_initialized(&id("p", "1.0.0")));
        assert!(registry.begin_init(&id("p", "1.0.0")));
    }

    #[test]
    fn test_concurrent_claims_one_winner() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let registry = Arc::new(LifecycleRegistry::new());
        let winners = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let winners = Arc::clone(&winners);
                std::thread::spawn(move || {
                    if registry.begin_init(&id("p", "1.0.0")) {
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(winners.load(Ordering::SeqCst), 1);
    }
}
