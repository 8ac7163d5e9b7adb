use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::lodestone::{
    router::{ProxyProtocol, Route, RouteSource, RouteTable},
    telemetry,
};

#[derive(Clone)]
pub struct AdminState {
    pub table: Arc<RouteTable>,
    pub sessions: telemetry::SharedSessions,
    pub prom: telemetry::SharedPrometheusHandle,
    pub reload_tx: watch::Sender<telemetry::ReloadSignal>,
}

pub async fn serve_with_shutdown(
    addr: SocketAddr,
    state: AdminState,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let shared = Arc::new(state);

    let app = Router::new()
        .route("/health", get(health))
        .route("/routes", get(list_routes).post(upsert_route))
        .route("/routes/{serverAddress}", delete(delete_route))
        .route("/defaultRoute", post(set_default_route))
        .route("/conns", get(conns))
        .route("/metrics", get(metrics))
        .route("/reload", post(reload))
        .with_state(shared)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    tracing::info!(admin_addr = %addr, "admin: listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            loop {
                if shutdown.changed().await.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        })
        .await?;

    Ok(())
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    ok: bool,
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(HealthResponse { ok: true }))
}

async fn list_routes(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    (StatusCode::OK, Json(st.table.snapshot().mappings))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpsertRoute {
    server_address: String,
    backend: String,
    waker: Option<String>,
    #[serde(default)]
    proxy_protocol: ProxyProtocol,
}

async fn upsert_route(
    State(st): State<Arc<AdminState>>,
    Json(body): Json<UpsertRoute>,
) -> impl IntoResponse {
    if body.server_address.trim().is_empty() || body.backend.trim().is_empty() {
        return StatusCode::BAD_REQUEST;
    }
    let mut route = Route::new(body.backend.trim(), RouteSource::Api);
    route.waker = body.waker.map(|w| w.trim().to_string()).filter(|w| !w.is_empty());
    route.proxy_protocol = body.proxy_protocol;
    st.table.set(body.server_address.trim(), route);
    StatusCode::CREATED
}

async fn delete_route(
    State(st): State<Arc<AdminState>>,
    Path(server_address): Path<String>,
) -> impl IntoResponse {
    if st.table.delete(&server_address) {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    }
}

#[derive(Debug, Deserialize)]
struct SetDefaultRoute {
    backend: String,
}

async fn set_default_route(
    State(st): State<Arc<AdminState>>,
    Json(body): Json<SetDefaultRoute>,
) -> impl IntoResponse {
    let backend = body.backend.trim();
    if backend.is_empty() {
        st.table.clear_default();
    } else {
        st.table.set_default(Route::new(backend, RouteSource::Api));
    }
    StatusCode::OK
}

async fn conns(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    (StatusCode::OK, Json(st.sessions.snapshot()))
}

async fn metrics(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    (StatusCode::OK, st.prom.render())
}

#[derive(Debug, Serialize)]
struct ReloadResponse {
    seq: u64,
}

async fn reload(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    let mut next = st.reload_tx.borrow().clone();
    next.next();
    let seq = next.seq;

    // Best-effort: if the reload loop is gone, still answer.
    let _ = st.reload_tx.send(next);

    (StatusCode::OK, Json(ReloadResponse { seq }))
}
