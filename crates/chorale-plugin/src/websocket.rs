//! WebSocket service: outbound connections owned by plugins.
//!
//! Every open connection has one registry slot; removing that slot is the
//! single consume point for close handling, so exactly one of the racing
//! paths (explicit close, server close, read failure) delivers the close
//! callback. The entry is removed from the registry before the close
//! handshake starts, which keeps late senders from touching a dying socket.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::callback::PluginCallback;
use crate::error::PluginError;
use crate::permissions::NetworkPermissions;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// A peer that stays silent for this long is treated as dead and its
/// connection is torn down.
const READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Close code reported when the peer vanished without a handshake.
const ABNORMAL_CLOSE: u16 = 1006;

// ─── Service ────────────────────────────────────────────────────────────

pub struct WebSocketService {
    connections: Arc<Mutex<HashMap<String, Connection>>>,
    dispatcher: Arc<dyn PluginCallback>,
    read_timeout: Duration,
    root: CancellationToken,
}

struct Connection {
    plugin: String,
    sink: Arc<tokio::sync::Mutex<WsSink>>,
    token: CancellationToken,
}

impl WebSocketService {
    pub fn new(dispatcher: Arc<dyn PluginCallback>) -> Self {
        Self::with_read_timeout(dispatcher, READ_TIMEOUT)
    }

    /// Build a service with a custom liveness window.
    pub fn with_read_timeout(dispatcher: Arc<dyn PluginCallback>, read_timeout: Duration) -> Self {
        Self {
            connections: Arc::new(Mutex::new(HashMap::new())),
            dispatcher,
            read_timeout,
            root: CancellationToken::new(),
        }
    }

    /// Open a connection on behalf of `plugin` and start its read loop.
    ///
    /// The grant check runs before any network activity. The caller may
    /// supply its own connection id; an id already in use is rejected.
    /// Returns the id used for sends and close.
    pub async fn connect(
        &self,
        plugin: &str,
        url: &str,
        headers: &HashMap<String, String>,
        connection_id: Option<String>,
        permissions: Option<&NetworkPermissions>,
    ) -> Result<String, PluginError> {
        if !url.starts_with("ws://") && !url.starts_with("wss://") {
            return Err(PluginError::WebSocket(format!(
                "URL must use ws or wss scheme: {url}"
            )));
        }
        if let Some(perms) = permissions {
            perms.check_request("GET", url)?;
        }
        let connection_id = connection_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        if self.lock_connections()?.contains_key(&connection_id) {
            return Err(PluginError::AlreadyExists(format!(
                "websocket connection {connection_id}"
            )));
        }

        let mut request = url
            .into_client_request()
            .map_err(|e| PluginError::WebSocket(e.to_string()))?;
        for (name, value) in headers {
            let name: tokio_tungstenite::tungstenite::http::HeaderName = name
                .parse()
                .map_err(|_| PluginError::WebSocket(format!("invalid header name: {name}")))?;
            let value = value
                .parse()
                .map_err(|_| PluginError::WebSocket(format!("invalid header value for {name}")))?;
            request.headers_mut().insert(name, value);
        }

        let (stream, _response) = connect_async(request)
            .await
            .map_err(|e| PluginError::WebSocket(e.to_string()))?;
        let (sink, source) = stream.split();

        let token = self.root.child_token();
        {
            let mut map = self.lock_connections()?;
            map.insert(
                connection_id.clone(),
                Connection {
                    plugin: plugin.to_string(),
                    sink: Arc::new(tokio::sync::Mutex::new(sink)),
                    token: token.clone(),
                },
            );
        }
        info!(plugin = %plugin, connection = %connection_id, url = %url, "websocket connected");

        self.spawn_read_loop(plugin.to_string(), connection_id.clone(), source, token);
        Ok(connection_id)
    }

    /// Send a text frame on an open connection.
    pub async fn send_text(&self, connection_id: &str, text: String) -> Result<(), PluginError> {
        let sink = self.sink_for(connection_id)?;
        let mut sink = sink.lock().await;
        sink.send(Message::Text(text.into()))
            .await
            .map_err(|e| PluginError::WebSocket(e.to_string()))
    }

    /// Send a binary frame on an open connection.
    pub async fn send_binary(&self, connection_id: &str, data: Vec<u8>) -> Result<(), PluginError> {
        let sink = self.sink_for(connection_id)?;
        let mut sink = sink.lock().await;
        sink.send(Message::Binary(data.into()))
            .await
            .map_err(|e| PluginError::WebSocket(e.to_string()))
    }

    /// Close a connection with a code and reason.
    ///
    /// The registry entry goes away before the handshake, so a concurrent
    /// close or a racing server close finds nothing left to consume. The
    /// loser of that race, like any caller naming an unknown id, gets a
    /// not-found error.
    pub async fn close(
        &self,
        connection_id: &str,
        code: u16,
        reason: &str,
    ) -> Result<(), PluginError> {
        let Some(connection) = self.take(connection_id)? else {
            return Err(PluginError::NotFound(format!(
                "websocket connection {connection_id}"
            )));
        };
        connection.token.cancel();

        {
            let mut sink = connection.sink.lock().await;
            let frame = CloseFrame {
                code: CloseCode::from(code),
                reason: reason.to_string().into(),
            };
            if let Err(e) = sink.send(Message::Close(Some(frame))).await {
                debug!(connection = %connection_id, error = %e, "close frame not delivered");
            }
        }

        info!(plugin = %connection.plugin, connection = %connection_id, code, "websocket closed");
        self.dispatcher
            .on_websocket_close(&connection.plugin, connection_id, code, reason.to_string())
            .await;
        Ok(())
    }

    /// Close every connection owned by `plugin`. Runs on unload.
    pub async fn close_all(&self, plugin: &str) {
        let ids: Vec<String> = {
            match self.lock_connections() {
                Ok(map) => map
                    .iter()
                    .filter(|(_, c)| c.plugin == plugin)
                    .map(|(id, _)| id.clone())
                    .collect(),
                Err(_) => return,
            }
        };
        for id in ids {
            match self.close(&id, 1001, "plugin unloaded").await {
                // A racing teardown already consumed the entry.
                Ok(()) | Err(PluginError::NotFound(_)) => {}
                Err(e) => {
                    warn!(plugin = %plugin, connection = %id, error = %e, "close on unload failed");
                }
            }
        }
    }

    /// Number of open connections, optionally scoped to one plugin.
    pub fn open_count(&self, plugin: Option<&str>) -> usize {
        let Ok(map) = self.connections.lock() else { return 0 };
        match plugin {
            Some(p) => map.values().filter(|c| c.plugin == p).count(),
            None => map.len(),
        }
    }

    pub fn shutdown(&self) {
        self.root.cancel();
    }

    // ─── Read loop ──────────────────────────────────────────────────────

    fn spawn_read_loop(
        &self,
        plugin: String,
        connection_id: String,
        mut source: WsSource,
        token: CancellationToken,
    ) {
        let connections = Arc::clone(&self.connections);
        let dispatcher = Arc::clone(&self.dispatcher);
        let read_timeout = self.read_timeout;

        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    _ = token.cancelled() => return,
                    next = tokio::time::timeout(read_timeout, source.next()) => next,
                };
                let message = match next {
                    // Silent past the liveness window: the peer is dead.
                    Err(_) => {
                        if take_entry(&connections, &connection_id).is_some() {
                            warn!(plugin = %plugin, connection = %connection_id, "websocket read timed out");
                            dispatcher
                                .on_websocket_error(
                                    &plugin,
                                    &connection_id,
                                    format!("no data received within {read_timeout:?}"),
                                )
                                .await;
                            dispatcher
                                .on_websocket_close(
                                    &plugin,
                                    &connection_id,
                                    ABNORMAL_CLOSE,
                                    "read timeout".to_string(),
                                )
                                .await;
                        }
                        return;
                    }
                    Ok(Some(Ok(message))) => message,
                    Ok(Some(Err(e))) => {
                        let owned = take_entry(&connections, &connection_id);
                        if owned.is_some() {
                            dispatcher
                                .on_websocket_error(&plugin, &connection_id, e.to_string())
                                .await;
                            dispatcher
                                .on_websocket_close(
                                    &plugin,
                                    &connection_id,
                                    ABNORMAL_CLOSE,
                                    e.to_string(),
                                )
                                .await;
                        }
                        return;
                    }
                    Ok(None) => {
                        if take_entry(&connections, &connection_id).is_some() {
                            dispatcher
                                .on_websocket_close(
                                    &plugin,
                                    &connection_id,
                                    ABNORMAL_CLOSE,
                                    String::new(),
                                )
                                .await;
                        }
                        return;
                    }
                };

                match message {
                    Message::Text(text) => {
                        dispatcher
                            .on_websocket_text(&plugin, &connection_id, text.to_string())
                            .await;
                    }
                    Message::Binary(data) => {
                        dispatcher
                            .on_websocket_binary(&plugin, &connection_id, data.to_vec())
                            .await;
                    }
                    Message::Close(frame) => {
                        if take_entry(&connections, &connection_id).is_some() {
                            let (code, reason) = frame
                                .map(|f| (u16::from(f.code), f.reason.to_string()))
                                .unwrap_or((ABNORMAL_CLOSE, String::new()));
                            dispatcher
                                .on_websocket_close(&plugin, &connection_id, code, reason)
                                .await;
                        }
                        return;
                    }
                    // Pings are answered by the protocol layer.
                    Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
                }
            }
        });
    }

    // ─── Registry access ────────────────────────────────────────────────

    fn sink_for(&self, connection_id: &str) -> Result<Arc<tokio::sync::Mutex<WsSink>>, PluginError> {
        let map = self.lock_connections()?;
        map.get(connection_id)
            .map(|c| Arc::clone(&c.sink))
            .ok_or_else(|| PluginError::NotFound(format!("websocket connection {connection_id}")))
    }

    fn take(&self, connection_id: &str) -> Result<Option<Connection>, PluginError> {
        Ok(self.lock_connections()?.remove(connection_id))
    }

    fn lock_connections(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<String, Connection>>, PluginError> {
        self.connections
            .lock()
            .map_err(|_| PluginError::WebSocket("connection registry poisoned".to_string()))
    }
}

fn take_entry(
    connections: &Arc<Mutex<HashMap<String, Connection>>>,
    connection_id: &str,
) -> Option<Connection> {
    connections.lock().ok()?.remove(connection_id)
}

impl Drop for WebSocketService {
    fn drop(&mut self) {
        self.root.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;
    use tokio::net::TcpListener;

    #[derive(Debug, Clone, PartialEq)]
    enum Event {
        Text(String),
        Binary(Vec<u8>),
        Error(String),
        Close(u16),
    }

    #[derive(Default)]
    struct RecordingCallback {
        events: StdMutex<Vec<(String, Event)>>,
    }

    impl RecordingCallback {
        fn events(&self) -> Vec<(String, Event)> {
            self.events.lock().unwrap().clone()
        }
        fn close_count(&self) -> usize {
            self.events()
                .iter()
                .filter(|(_, e)| matches!(e, Event::Close(_)))
                .count()
        }
    }

    #[async_trait]
    impl PluginCallback for RecordingCallback {
        async fn on_timer(&self, _: &str, _: &str, _: serde_json::Value) {}
        async fn on_websocket_text(&self, plugin: &str, _: &str, text: String) {
            self.events
                .lock()
                .unwrap()
                .push((plugin.to_string(), Event::Text(text)));
        }
        async fn on_websocket_binary(&self, plugin: &str, _: &str, data: Vec<u8>) {
            self.events
                .lock()
                .unwrap()
                .push((plugin.to_string(), Event::Binary(data)));
        }
        async fn on_websocket_error(&self, plugin: &str, _: &str, message: String) {
            self.events
                .lock()
                .unwrap()
                .push((plugin.to_string(), Event::Error(message)));
        }
        async fn on_websocket_close(&self, plugin: &str, _: &str, code: u16, _: String) {
            self.events
                .lock()
                .unwrap()
                .push((plugin.to_string(), Event::Close(code)));
        }
    }

    /// Echo server that mirrors frames back until the client closes.
    async fn spawn_echo_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
                    let (mut sink, mut source) = ws.split();
                    while let Some(Ok(msg)) = source.next().await {
                        match msg {
                            Message::Text(_) | Message::Binary(_) => {
                                sink.send(msg).await.ok();
                            }
                            Message::Close(_) => break,
                            _ => {}
                        }
                    }
                });
            }
        });
        format!("ws://{addr}")
    }

    fn service() -> (WebSocketService, Arc<RecordingCallback>) {
        let cb = Arc::new(RecordingCallback::default());
        (
            WebSocketService::new(cb.clone() as Arc<dyn PluginCallback>),
            cb,
        )
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn test_rejects_non_ws_scheme() {
        let (svc, _cb) = service();
        let err = svc
            .connect("p", "https://example.com", &HashMap::new(), None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::WebSocket(_)));
    }

    #[tokio::test]
    async fn test_echo_text_and_binary() {
        let url = spawn_echo_server().await;
        let (svc, cb) = service();

        let id = svc.connect("p", &url, &HashMap::new(), None, None).await.unwrap();
        assert_eq!(svc.open_count(Some("p")), 1);

        svc.send_text(&id, "hello".to_string()).await.unwrap();
        svc.send_binary(&id, vec![1, 2, 3]).await.unwrap();
        settle().await;

        let events = cb.events();
        assert!(events.contains(&("p".to_string(), Event::Text("hello".to_string()))));
        assert!(events.contains(&("p".to_string(), Event::Binary(vec![1, 2, 3]))));
    }

    #[tokio::test]
    async fn test_close_dispatches_once() {
        let url = spawn_echo_server().await;
        let (svc, cb) = service();

        let id = svc.connect("p", &url, &HashMap::new(), None, None).await.unwrap();
        svc.close(&id, 1000, "done").await.unwrap();
        settle().await;

        assert_eq!(cb.close_count(), 1);
        assert_eq!(svc.open_count(None), 0);

        // Second close finds nothing left to consume.
        let Err(err) = svc.close(&id, 1000, "again").await else {
            panic!("double close should report the missing connection");
        };
        assert!(matches!(err, PluginError::NotFound(_)));
        assert_eq!(cb.close_count(), 1);
    }

    #[tokio::test]
    async fn test_send_after_close_is_not_found() {
        let url = spawn_echo_server().await;
        let (svc, _cb) = service();

        let id = svc.connect("p", &url, &HashMap::new(), None, None).await.unwrap();
        svc.close(&id, 1000, "").await.unwrap();

        let err = svc.send_text(&id, "late".to_string()).await.unwrap_err();
        assert!(matches!(err, PluginError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_server_close_dispatches_once() {
        // Server that closes immediately after accepting.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let (mut sink, mut source) = ws.split();
            sink.send(Message::Close(Some(CloseFrame {
                code: CloseCode::from(1000),
                reason: "bye".to_string().into(),
            })))
            .await
            .unwrap();
            while source.next().await.is_some() {}
        });

        let (svc, cb) = service();
        let id = svc
            .connect("p", &format!("ws://{addr}"), &HashMap::new(), None, None)
            .await
            .unwrap();
        settle().await;

        assert_eq!(cb.close_count(), 1);
        assert_eq!(cb.events(), vec![("p".to_string(), Event::Close(1000))]);
        assert_eq!(svc.open_count(None), 0);

        // The losing side of the close race sees not-found.
        let Err(err) = svc.close(&id, 1000, "").await else {
            panic!("close after server close should report the missing connection");
        };
        assert!(matches!(err, PluginError::NotFound(_)));
        assert_eq!(cb.close_count(), 1);
    }

    #[tokio::test]
    async fn test_silent_peer_is_torn_down_after_read_timeout() {
        // Server that accepts the handshake and then never sends a frame.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let (_sink, mut source) = ws.split();
            while source.next().await.is_some() {}
        });

        let cb = Arc::new(RecordingCallback::default());
        let svc = WebSocketService::with_read_timeout(
            cb.clone() as Arc<dyn PluginCallback>,
            Duration::from_millis(100),
        );
        svc.connect("p", &format!("ws://{addr}"), &HashMap::new(), None, None)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(svc.open_count(None), 0);
        assert_eq!(cb.close_count(), 1);
        let events = cb.events();
        assert!(events
            .iter()
            .any(|(_, e)| matches!(e, Event::Close(code) if *code == 1006)));
        assert!(events.iter().any(|(_, e)| matches!(e, Event::Error(_))));
    }

    #[tokio::test]
    async fn test_caller_supplied_id_must_be_unique() {
        let url = spawn_echo_server().await;
        let (svc, _cb) = service();

        let id = svc
            .connect("p", &url, &HashMap::new(), Some("feed-1".to_string()), None)
            .await
            .unwrap();
        assert_eq!(id, "feed-1");

        let err = svc
            .connect("p", &url, &HashMap::new(), Some("feed-1".to_string()), None)
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_close_all_scopes_to_plugin() {
        let url = spawn_echo_server().await;
        let (svc, cb) = service();

        svc.connect("a", &url, &HashMap::new(), None, None).await.unwrap();
        svc.connect("a", &url, &HashMap::new(), None, None).await.unwrap();
        svc.connect("b", &url, &HashMap::new(), None, None).await.unwrap();

        svc.close_all("a").await;
        settle().await;

        assert_eq!(svc.open_count(Some("a")), 0);
        assert_eq!(svc.open_count(Some("b")), 1);
        assert_eq!(cb.close_count(), 2);
    }

    #[tokio::test]
    async fn test_permission_check_blocks_connect() {
        let grant: crate::manifest::Grant = serde_json::from_str(
            r#"{"reason": "r", "allowedUrls": {"wss://stream.example.com/*": ["GET"]}}"#,
        )
        .unwrap();
        let perms = NetworkPermissions::from_grant("websocket", &grant).unwrap();

        let (svc, _cb) = service();
        let err = svc
            .connect("p", "wss://evil.example.org/feed", &HashMap::new(), None, Some(&perms))
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::PermissionDenied(_)));
    }
}
