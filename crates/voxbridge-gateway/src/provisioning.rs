//! Device provisioning (OTA) endpoint.
//!
//! Devices poll this over plain HTTP before opening the WebSocket; the
//! response carries firmware metadata and the WebSocket URL. Always
//! answers 200 with permissive CORS so captive firmware never wedges on
//! an error page.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use serde_json::{Value, json};

use crate::state::GatewayState;

pub async fn ota_handler(State(state): State<Arc<GatewayState>>) -> Json<Value> {
    let config = state.config_snapshot().await;

    let public_base = config
        .server
        .public_url
        .clone()
        .unwrap_or_else(|| format!("http://{}:{}", config.server.bind, config.server.port))
        .trim_end_matches('/')
        .to_string();

    let ws_url = format!("{}{}", http_to_ws(&public_base), config.server.ws_path);

    Json(json!({
        "firmware": {
            "version": config.firmware.version,
            "url": config.firmware.url,
        },
        "websocket": {
            "endpoint": public_base,
            "port": config.server.port,
        },
        "xiaozhi_websocket": {
            "ws_url": ws_url,
            "ws_protocol": "v1",
            "protocol_version": 1,
            "origin": public_base,
        },
    }))
}

fn http_to_ws(base: &str) -> String {
    if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        format!("ws://{base}")
    }
}
