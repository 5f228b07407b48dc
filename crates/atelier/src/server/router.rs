//! HTTP Router

use axum::{
    extract::{rejection::JsonRejection, Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::Response,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::handler::handle_websocket;
use super::state::AppState;
use crate::commands::{Command, CommandResponse};
use crate::types::{HostStatus, ManagerState, Plugin};

/// Create the application router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/command", post(run_command))
        .route("/api/status", get(status))
        .route("/api/plugins", get(list_plugins))
        // Event stream and commands over one socket
        .route("/ws", get(ws_upgrade))
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn run_command(
    State(state): State<AppState>,
    payload: Result<Json<Command>, JsonRejection>,
) -> (StatusCode, Json<CommandResponse>) {
    match payload {
        Ok(Json(command)) => (StatusCode::OK, Json(state.manager().execute(command).await)),
        Err(rejection) => (
            StatusCode::BAD_REQUEST,
            Json(CommandResponse::failure(
                "invalid_command",
                rejection.body_text(),
            )),
        ),
    }
}

async fn status(State(state): State<AppState>) -> Json<HostStatus> {
    Json(state.manager().status())
}

#[derive(Debug, Deserialize)]
struct PluginQuery {
    pattern: Option<String>,
}

async fn list_plugins(
    State(state): State<AppState>,
    Query(query): Query<PluginQuery>,
) -> Json<Vec<Plugin>> {
    Json(state.manager().list(query.pattern.as_deref()))
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_websocket(socket, state))
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    worker: ManagerState,
    clients: usize,
}

/// Liveness of the server itself; the worker state is informational
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        worker: state.manager().state(),
        clients: state.client_count(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::HostManager;
    use crate::testing::{manifest, test_config, FakeWorker};
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    fn command(body: Value) -> Request<Body> {
        Request::post("/api/command")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_http_surface() {
        let worker = FakeWorker::new()
            .with_plugin(manifest("tts_kokoro"))
            .with_plugin(manifest("image_resize"));
        let manager = HostManager::with_launcher(test_config(), worker.launcher());
        let router = create_router(AppState::new(manager));

        let (status, body) = send(&router, Request::get("/health").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["worker"]["state"], "uninitialized");

        let (status, body) = send(&router, command(json!({"command": "ipc_start"}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);

        let (_, body) = send(&router, command(json!({"command": "discover_plugins"}))).await;
        assert_eq!(body["data"]["plugins"].as_array().unwrap().len(), 2);

        let (_, body) = send(
            &router,
            Request::get("/api/plugins?pattern=tts_*").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(body.as_array().unwrap().len(), 1);
        assert_eq!(body[0]["manifest"]["id"], "tts_kokoro");

        let (_, body) = send(&router, Request::get("/api/status").body(Body::empty()).unwrap()).await;
        assert_eq!(body["lifecycle_state"]["state"], "running");

        let (_, body) = send(
            &router,
            command(json!({"command": "plugin_load", "name": "nope"})),
        )
        .await;
        assert_eq!(body["success"], false);
        assert_eq!(body["error"]["kind"], "plugin_not_found");

        let (status, body) = send(&router, command(json!({"command": "self_destruct"}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["kind"], "invalid_command");

        send(&router, command(json!({"command": "ipc_stop"}))).await;
    }
}
