//! HTTP service bindings: permission-checked outbound requests.
//!
//! Every request is checked against the compiled grant before it leaves
//! the process. Responses are capped at 10 MB so a hostile endpoint
//! cannot balloon guest memory.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use extism::convert::Json;
use extism::{host_fn, Function, UserData, PTR};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::permissions::NetworkPermissions;
use crate::runtime::HostLibrary;

use super::HostContext;

/// Maximum response body size accepted from a remote endpoint.
const MAX_RESPONSE_BYTES: usize = 10 * 1024 * 1024;

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct HttpHost {
    plugin: String,
    network: Arc<NetworkPermissions>,
    client: reqwest::Client,
    handle: tokio::runtime::Handle,
}

#[derive(Debug, Deserialize)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: String,
}

host_fn!(http_request(user_data: HttpHost; req: Json<HttpRequest>) -> Json<HttpResponse> {
    let host = user_data.get()?;
    let host = host.lock().map_err(|_| extism::Error::msg("http state poisoned"))?;
    let req = req.0;

    host.network
        .check_request(&req.method, &req.url)
        .map_err(|e| extism::Error::msg(e.to_string()))?;

    debug!(plugin = %host.plugin, method = %req.method, url = %req.url, "plugin http request");

    let method = reqwest::Method::from_bytes(req.method.to_uppercase().as_bytes())
        .map_err(|_| extism::Error::msg(format!("invalid method: {}", req.method)))?;

    let client = host.client.clone();
    let response = host.handle.block_on(async move {
        let mut builder = client.request(method, &req.url);
        for (name, value) in &req.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = req.body {
            builder = builder.body(body);
        }
        let response = builder.send().await?;

        let status = response.status().as_u16();
        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
            .collect();
        let body = response.bytes().await?;
        Ok::<_, reqwest::Error>((status, headers, body))
    });

    let (status, headers, body) = response.map_err(|e| extism::Error::msg(e.to_string()))?;
    if body.len() > MAX_RESPONSE_BYTES {
        return Err(extism::Error::msg(format!(
            "response body exceeds {MAX_RESPONSE_BYTES} bytes"
        )));
    }

    Ok(Json(HttpResponse {
        status,
        headers,
        body: String::from_utf8_lossy(&body).into_owned(),
    }))
});

pub fn library(ctx: &HostContext, network: Arc<NetworkPermissions>) -> HostLibrary {
    let client = reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap_or_default();
    let state = HttpHost {
        plugin: ctx.owner(),
        network,
        client,
        handle: ctx.handle.clone(),
    };
    HostLibrary::new("http", vec!["http_request".to_string()], move || {
        vec![Function::new(
            "http_request",
            [PTR],
            [PTR],
            UserData::new(state.clone()),
            http_request,
        )]
    })
}
