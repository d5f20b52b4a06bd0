//! HTTP endpoints served by every node.
//!
//! All nodes answer `GET /vxlan/mac` and `GET /containers` so peers can pull
//! their overlay state. The master additionally serves `GET /store` and
//! accepts `POST /vxlan/mac` from followers.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use log::{info, warn};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::directory::Directory;
use crate::error::Error;
use crate::types::{parse_mac, Container, Topology};

#[derive(Clone)]
struct ApiState {
    directory: Arc<Directory>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MacReport {
    node_name: String,
    mac: String,
}

pub fn router(directory: Arc<Directory>, master: bool) -> Router {
    let mac_routes = if master {
        get(vxlan_mac).post(report_vxlan_mac)
    } else {
        get(vxlan_mac)
    };
    let mut app = Router::new()
        .route("/vxlan/mac", mac_routes)
        .route("/containers", get(containers));
    if master {
        app = app.route("/store", get(store));
    }
    app.with_state(ApiState { directory })
}

/// Serves `app` on `listener` until `cancel` fires.
pub async fn serve(
    listener: TcpListener,
    app: Router,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("API listening on {}", addr);
    }
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
}

async fn vxlan_mac(State(state): State<ApiState>) -> Response {
    match state.directory.vxlan_mac().await {
        Some(mac) => (StatusCode::OK, mac).into_response(),
        None => (StatusCode::INTERNAL_SERVER_ERROR, "not ready").into_response(),
    }
}

async fn containers(State(state): State<ApiState>) -> Json<Vec<Container>> {
    Json(state.directory.containers().await)
}

async fn store(State(state): State<ApiState>) -> Json<Topology> {
    Json(Topology::clone(&state.directory.store().snapshot()))
}

async fn report_vxlan_mac(
    State(state): State<ApiState>,
    Json(report): Json<MacReport>,
) -> Response {
    if let Err(e) = parse_mac(&report.mac) {
        return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
    }
    match state
        .directory
        .store()
        .set_vxlan_mac(&report.node_name, &report.mac)
        .await
    {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e @ Error::NodeNotFound(_)) => {
            warn!("MAC report for unknown node {}", report.node_name);
            (StatusCode::NOT_FOUND, e.to_string()).into_response()
        }
        Err(e) => (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    }
}
