//! WebSocket service bindings: guest-facing connection management.
//!
//! Connections opened here are owned by the plugin and torn down with it.
//! The grant check happens inside the service, before any socket opens.

use std::collections::HashMap;
use std::sync::Arc;

use extism::convert::Json;
use extism::{host_fn, Function, UserData, PTR};
use serde::{Deserialize, Serialize};

use crate::permissions::NetworkPermissions;
use crate::runtime::HostLibrary;
use crate::websocket::WebSocketService;

use super::HostContext;

#[derive(Clone)]
pub struct WebSocketHost {
    plugin: String,
    sockets: Arc<WebSocketService>,
    network: Arc<NetworkPermissions>,
    handle: tokio::runtime::Handle,
}

#[derive(Debug, Deserialize)]
pub struct WsConnectRequest {
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Caller-chosen id for the connection; generated when absent.
    #[serde(default)]
    pub connection_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct WsConnectResponse {
    pub connection_id: String,
}

#[derive(Debug, Deserialize)]
pub struct WsSendTextRequest {
    pub connection_id: String,
    pub text: String,
}

#[derive(Debug, Deserialize)]
pub struct WsSendBinaryRequest {
    pub connection_id: String,
    /// Raw bytes as a JSON array; guests without base64 can still send.
    pub data: Vec<u8>,
}

#[derive(Debug, Deserialize)]
pub struct WsCloseRequest {
    pub connection_id: String,
    #[serde(default = "default_close_code")]
    pub code: u16,
    #[serde(default)]
    pub reason: String,
}

fn default_close_code() -> u16 {
    1000
}

#[derive(Debug, Serialize)]
pub struct WsOkResponse {
    pub ok: bool,
}

host_fn!(websocket_connect(user_data: WebSocketHost; req: Json<WsConnectRequest>) -> Json<WsConnectResponse> {
    let host = user_data.get()?;
    let host = host.lock().map_err(|_| extism::Error::msg("websocket state poisoned"))?;
    let req = req.0;
    let connection_id = host.handle.block_on(host.sockets.connect(
        &host.plugin,
        &req.url,
        &req.headers,
        req.connection_id,
        Some(&host.network),
    ))?;
    Ok(Json(WsConnectResponse { connection_id }))
});

host_fn!(websocket_send_text(user_data: WebSocketHost; req: Json<WsSendTextRequest>) -> Json<WsOkResponse> {
    let host = user_data.get()?;
    let host = host.lock().map_err(|_| extism::Error::msg("websocket state poisoned"))?;
    let req = req.0;
    host.handle
        .block_on(host.sockets.send_text(&req.connection_id, req.text))?;
    Ok(Json(WsOkResponse { ok: true }))
});

host_fn!(websocket_send_binary(user_data: WebSocketHost; req: Json<WsSendBinaryRequest>) -> Json<WsOkResponse> {
    let host = user_data.get()?;
    let host = host.lock().map_err(|_| extism::Error::msg("websocket state poisoned"))?;
    let req = req.0;
    host.handle
        .block_on(host.sockets.send_binary(&req.connection_id, req.data))?;
    Ok(Json(WsOkResponse { ok: true }))
});

host_fn!(websocket_close(user_data: WebSocketHost; req: Json<WsCloseRequest>) -> Json<WsOkResponse> {
    let host = user_data.get()?;
    let host = host.lock().map_err(|_| extism::Error::msg("websocket state poisoned"))?;
    let req = req.0;
    host.handle
        .block_on(host.sockets.close(&req.connection_id, req.code, &req.reason))?;
    Ok(Json(WsOkResponse { ok: true }))
});

pub fn library(ctx: &HostContext, network: Arc<NetworkPermissions>) -> HostLibrary {
    let state = WebSocketHost {
        plugin: ctx.owner(),
        sockets: Arc::clone(&ctx.sockets),
        network,
        handle: ctx.handle.clone(),
    };
    HostLibrary::new(
        "websocket",
        vec![
            "websocket_connect".to_string(),
            "websocket_send_text".to_string(),
            "websocket_send_binary".to_string(),
            "websocket_close".to_string(),
        ],
        move || {
            vec![
                Function::new(
                    "websocket_connect",
                    [PTR],
                    [PTR],
                    UserData::new(state.clone()),
                    websocket_connect,
                ),
                Function::new(
                    "websocket_send_text",
                    [PTR],
                    [PTR],
                    UserData::new(state.clone()),
                    websocket_send_text,
                ),
                Function::new(
                    "websocket_send_binary",
                    [PTR],
                    [PTR],
                    UserData::new(state.clone()),
                    websocket_send_binary,
                ),
                Function::new(
                    "websocket_close",
                    [PTR],
                    [PTR],
                    UserData::new(state.clone()),
                    websocket_close,
                ),
            ]
        },
    )
}
