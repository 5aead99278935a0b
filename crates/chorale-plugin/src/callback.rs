//! Host-to-guest callback seam.
//!
//! The timer and WebSocket services do not talk to sandbox pools directly;
//! they dispatch through this trait so the manager owns instance routing
//! and the services stay testable in isolation. Callback failures are the
//! implementor's to log; from the service's side a callback is fire-and-
//! forget.

use async_trait::async_trait;

#[async_trait]
pub trait PluginCallback: Send + Sync {
    /// A scheduled timer fired.
    async fn on_timer(&self, plugin: &str, timer_id: &str, payload: serde_json::Value);

    /// A WebSocket connection received a text frame.
    async fn on_websocket_text(&self, plugin: &str, connection_id: &str, text: String);

    /// A WebSocket connection received a binary frame.
    async fn on_websocket_binary(&self, plugin: &str, connection_id: &str, data: Vec<u8>);

    /// A WebSocket connection failed.
    async fn on_websocket_error(&self, plugin: &str, connection_id: &str, message: String);

    /// A WebSocket connection closed, cleanly or not.
    async fn on_websocket_close(&self, plugin: &str, connection_id: &str, code: u16, reason: String);
}
