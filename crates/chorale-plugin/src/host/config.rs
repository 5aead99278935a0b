//! Config service: read-only access to the plugin's own settings.

use std::collections::HashMap;

use extism::convert::Json;
use extism::{host_fn, Function, UserData, PTR};
use serde::{Deserialize, Serialize};

use crate::runtime::HostLibrary;

use super::HostContext;

#[derive(Clone)]
pub struct ConfigHost {
    settings: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
pub struct ConfigGetRequest {
    pub key: String,
}

#[derive(Debug, Serialize)]
pub struct ConfigGetResponse {
    pub value: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ConfigAllRequest {}

#[derive(Debug, Serialize)]
pub struct ConfigAllResponse {
    pub settings: HashMap<String, String>,
}

host_fn!(config_get(user_data: ConfigHost; req: Json<ConfigGetRequest>) -> Json<ConfigGetResponse> {
    let host = user_data.get()?;
    let host = host.lock().map_err(|_| extism::Error::msg("config state poisoned"))?;
    Ok(Json(ConfigGetResponse {
        value: host.settings.get(&req.0.key).cloned(),
    }))
});

host_fn!(config_all(user_data: ConfigHost; _req: Json<ConfigAllRequest>) -> Json<ConfigAllResponse> {
    let host = user_data.get()?;
    let host = host.lock().map_err(|_| extism::Error::msg("config state poisoned"))?;
    Ok(Json(ConfigAllResponse {
        settings: host.settings.clone(),
    }))
});

pub fn library(ctx: &HostContext) -> HostLibrary {
    let state = ConfigHost {
        settings: ctx.settings.clone(),
    };
    HostLibrary::new(
        "config",
        vec!["config_get".to_string(), "config_all".to_string()],
        move || {
            vec![
                Function::new(
                    "config_get",
                    [PTR],
                    [PTR],
                    UserData::new(state.clone()),
                    config_get,
                ),
                Function::new(
                    "config_all",
                    [PTR],
                    [PTR],
                    UserData::new(state.clone()),
                    config_all,
                ),
            ]
        },
    )
}
