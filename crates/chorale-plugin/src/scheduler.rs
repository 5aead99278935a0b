//! Timer service: delayed and recurring callbacks into plugins.
//!
//! Every armed timer owns a cancellation token and a registry slot. The
//! registry remove is the single consume point: whichever of cancel and
//! expiry removes the entry first wins, so a one-shot timer fires at most
//! once no matter how the race goes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::callback::PluginCallback;
use crate::error::PluginError;

// ─── Service ────────────────────────────────────────────────────────────

pub struct TimerService {
    timers: Arc<Mutex<HashMap<String, TimerEntry>>>,
    dispatcher: Arc<dyn PluginCallback>,
    /// Parent token; cancelling it stops every outstanding timer.
    root: CancellationToken,
}

struct TimerEntry {
    plugin: String,
    token: CancellationToken,
}

impl TimerService {
    pub fn new(dispatcher: Arc<dyn PluginCallback>) -> Self {
        Self {
            timers: Arc::new(Mutex::new(HashMap::new())),
            dispatcher,
            root: CancellationToken::new(),
        }
    }

    /// Arm a one-shot timer. With no explicit id a fresh one is minted;
    /// an explicit id that is already armed is rejected.
    pub fn schedule_one_time(
        &self,
        plugin: &str,
        timer_id: Option<String>,
        delay: Duration,
        payload: serde_json::Value,
    ) -> Result<String, PluginError> {
        let id = timer_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let token = self.register(plugin, &id)?;
        debug!(plugin = %plugin, timer = %id, delay = ?delay, "one-shot timer armed");

        let timers = Arc::clone(&self.timers);
        let dispatcher = Arc::clone(&self.dispatcher);
        let plugin = plugin.to_string();
        let task_id = id.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            // Removing the entry is what commits the firing; a cancel
            // that got there first leaves nothing to consume.
            let armed = {
                let Ok(mut map) = timers.lock() else { return };
                map.remove(&task_id).is_some()
            };
            if armed {
                dispatcher.on_timer(&plugin, &task_id, payload).await;
            }
        });

        Ok(id)
    }

    /// Arm a recurring timer that fires every `interval` until cancelled.
    pub fn schedule_recurring(
        &self,
        plugin: &str,
        timer_id: Option<String>,
        interval: Duration,
        payload: serde_json::Value,
    ) -> Result<String, PluginError> {
        if interval.is_zero() {
            return Err(PluginError::Construction(
                "recurring timer interval must be non-zero".to_string(),
            ));
        }
        let id = timer_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let token = self.register(plugin, &id)?;
        debug!(plugin = %plugin, timer = %id, interval = ?interval, "recurring timer armed");

        let timers = Arc::clone(&self.timers);
        let dispatcher = Arc::clone(&self.dispatcher);
        let plugin = plugin.to_string();
        let task_id = id.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        let Ok(mut map) = timers.lock() else { return };
                        map.remove(&task_id);
                        return;
                    }
                    _ = tokio::time::sleep(interval) => {}
                }
                // Recurring entries stay registered between firings.
                let armed = {
                    let Ok(map) = timers.lock() else { return };
                    map.contains_key(&task_id)
                };
                if !armed {
                    return;
                }
                dispatcher.on_timer(&plugin, &task_id, payload.clone()).await;
            }
        });

        Ok(id)
    }

    /// Cancel a timer. Returns whether an armed timer was consumed; an id
    /// that already fired or never existed reports `false` and the
    /// callback is guaranteed not to run for a `true`.
    pub fn cancel(&self, timer_id: &str) -> bool {
        let entry = {
            let Ok(mut map) = self.timers.lock() else { return false };
            map.remove(timer_id)
        };
        match entry {
            Some(entry) => {
                entry.token.cancel();
                debug!(plugin = %entry.plugin, timer = %timer_id, "timer cancelled");
                true
            }
            None => false,
        }
    }

    /// Cancel every timer owned by `plugin`. Runs on unload.
    pub fn cancel_all(&self, plugin: &str) {
        let removed: Vec<(String, TimerEntry)> = {
            let Ok(mut map) = self.timers.lock() else { return };
            let ids: Vec<String> = map
                .iter()
                .filter(|(_, e)| e.plugin == plugin)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| map.remove(&id).map(|e| (id, e)))
                .collect()
        };
        for (_, entry) in &removed {
            entry.token.cancel();
        }
        if !removed.is_empty() {
            info!(plugin = %plugin, count = removed.len(), "timers cancelled on unload");
        }
    }

    /// Number of armed timers, optionally scoped to one plugin.
    pub fn armed_count(&self, plugin: Option<&str>) -> usize {
        let Ok(map) = self.timers.lock() else { return 0 };
        match plugin {
            Some(p) => map.values().filter(|e| e.plugin == p).count(),
            None => map.len(),
        }
    }

    /// Stop the whole service. Used at shutdown.
    pub fn shutdown(&self) {
        self.root.cancel();
        let Ok(mut map) = self.timers.lock() else { return };
        for entry in map.values() {
            entry.token.cancel();
        }
        map.clear();
    }

    fn register(&self, plugin: &str, id: &str) -> Result<CancellationToken, PluginError> {
        let mut map = self
            .timers
            .lock()
            .map_err(|_| PluginError::Sandbox("timer registry poisoned".to_string()))?;
        if map.contains_key(id) {
            return Err(PluginError::AlreadyExists(format!("timer {id}")));
        }
        let token = self.root.child_token();
        map.insert(
            id.to_string(),
            TimerEntry {
                plugin: plugin.to_string(),
                token: token.clone(),
            },
        );
        Ok(token)
    }
}

impl Drop for TimerService {
    fn drop(&mut self) {
        self.root.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingCallback {
        fired: StdMutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl PluginCallback for RecordingCallback {
        async fn on_timer(&self, plugin: &str, timer_id: &str, _payload: serde_json::Value) {
            self.fired
                .lock()
                .unwrap()
                .push((plugin.to_string(), timer_id.to_string()));
        }
        async fn on_websocket_text(&self, _: &str, _: &str, _: String) {}
        async fn on_websocket_binary(&self, _: &str, _: &str, _: Vec<u8>) {}
        async fn on_websocket_error(&self, _: &str, _: &str, _: String) {}
        async fn on_websocket_close(&self, _: &str, _: &str, _: u16, _: String) {}
    }

    fn service() -> (TimerService, Arc<RecordingCallback>) {
        let cb = Arc::new(RecordingCallback::default());
        (TimerService::new(cb.clone() as Arc<dyn PluginCallback>), cb)
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_shot_fires_once() {
        let (svc, cb) = service();
        svc.schedule_one_time("p", Some("t1".into()), Duration::from_secs(5), serde_json::json!({}))
            .unwrap();
        assert_eq!(svc.armed_count(Some("p")), 1);

        tokio::time::sleep(Duration::from_secs(6)).await;
        tokio::task::yield_now().await;

        assert_eq!(cb.fired.lock().unwrap().len(), 1);
        assert_eq!(svc.armed_count(Some("p")), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_before_expiry_suppresses_firing() {
        let (svc, cb) = service();
        svc.schedule_one_time("p", Some("t1".into()), Duration::from_secs(5), serde_json::json!({}))
            .unwrap();

        assert!(svc.cancel("t1"));
        tokio::time::sleep(Duration::from_secs(10)).await;
        tokio::task::yield_now().await;

        assert!(cb.fired.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_delay_cancel_never_double_fires() {
        // A zero delay races cancel against immediate expiry. Exactly one
        // side consumes the registry entry: a successful cancel means the
        // callback never runs, a failed one means it ran exactly once.
        let (svc, cb) = service();
        svc.schedule_one_time("p", Some("t0".into()), Duration::ZERO, serde_json::json!({}))
            .unwrap();
        let cancelled = svc.cancel("t0");

        tokio::time::sleep(Duration::from_secs(1)).await;
        tokio::task::yield_now().await;

        let fired = cb.fired.lock().unwrap().len();
        if cancelled {
            assert_eq!(fired, 0);
        } else {
            assert_eq!(fired, 1);
        }
        assert_eq!(svc.armed_count(None), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_after_expiry_is_noop() {
        let (svc, cb) = service();
        svc.schedule_one_time("p", Some("t1".into()), Duration::from_secs(1), serde_json::json!({}))
            .unwrap();

        tokio::time::sleep(Duration::from_secs(2)).await;
        tokio::task::yield_now().await;
        assert_eq!(cb.fired.lock().unwrap().len(), 1);

        // Already consumed; must not fire again or panic.
        assert!(!svc.cancel("t1"));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(cb.fired.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_id_rejected() {
        let (svc, _cb) = service();
        svc.schedule_one_time("p", Some("t1".into()), Duration::from_secs(5), serde_json::json!({}))
            .unwrap();
        let err = svc
            .schedule_one_time("p", Some("t1".into()), Duration::from_secs(5), serde_json::json!({}))
            .unwrap_err();
        assert!(matches!(err, PluginError::AlreadyExists(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_generated_ids_are_unique() {
        let (svc, _cb) = service();
        let a = svc
            .schedule_one_time("p", None, Duration::from_secs(5), serde_json::json!({}))
            .unwrap();
        let b = svc
            .schedule_one_time("p", None, Duration::from_secs(5), serde_json::json!({}))
            .unwrap();
        assert_ne!(a, b);
        assert_eq!(svc.armed_count(None), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recurring_fires_until_cancelled() {
        let (svc, cb) = service();
        svc.schedule_recurring("p", Some("tick".into()), Duration::from_secs(2), serde_json::json!({}))
            .unwrap();

        tokio::time::sleep(Duration::from_secs(7)).await;
        tokio::task::yield_now().await;
        let fired = cb.fired.lock().unwrap().len();
        assert_eq!(fired, 3);

        assert!(svc.cancel("tick"));
        tokio::time::sleep(Duration::from_secs(10)).await;
        tokio::task::yield_now().await;
        assert_eq!(cb.fired.lock().unwrap().len(), fired);
    }

    #[tokio::test]
    async fn test_recurring_zero_interval_rejected() {
        let (svc, _cb) = service();
        let err = svc
            .schedule_recurring("p", None, Duration::ZERO, serde_json::json!({}))
            .unwrap_err();
        assert!(matches!(err, PluginError::Construction(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all_scopes_to_plugin() {
        let (svc, cb) = service();
        svc.schedule_one_time("a", Some("a1".into()), Duration::from_secs(5), serde_json::json!({}))
            .unwrap();
        svc.schedule_one_time("a", Some("a2".into()), Duration::from_secs(5), serde_json::json!({}))
            .unwrap();
        svc.schedule_one_time("b", Some("b1".into()), Duration::from_secs(5), serde_json::json!({}))
            .unwrap();

        svc.cancel_all("a");
        assert_eq!(svc.armed_count(Some("a")), 0);
        assert_eq!(svc.armed_count(Some("b")), 1);

        tokio::time::sleep(Duration::from_secs(6)).await;
        tokio::task::yield_now().await;
        let fired = cb.fired.lock().unwrap();
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].0, "b");
    }
}
