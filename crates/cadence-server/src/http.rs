use std::path::Component;
use std::path::PathBuf;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, Request, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};

use cadence_core::{LockMode, STATE_DIR_NAME};
use cadence_types::{Event, EventType};

use crate::AppState;

#[derive(Debug, Deserialize, Default)]
struct WsQuery {
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FileSaveInput {
    path: String,
    content: String,
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods(Any)
        .allow_headers(Any)
        .allow_origin(Any);

    Router::new()
        .route("/api/health", get(health))
        .route("/api/session/token", get(session_token))
        .route("/api/session/lock-state", get(lock_state))
        .route("/api/agents", get(agents))
        .route("/api/files/save", post(save_file))
        .route("/ws", get(ws_upgrade))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            read_only_gate,
        ))
        .layer(cors)
        .with_state(state)
}

/// Mutating verbs are rejected with `423 Locked` while another live
/// process holds the write lock; reads always pass.
async fn read_only_gate(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let method = request.method();
    if method == Method::GET || method == Method::HEAD || method == Method::OPTIONS {
        return next.run(request).await;
    }

    if state.session_lock.is_write_locked_by_other() {
        let lock_state = state.session_lock.get_lock_state();
        let holder = lock_state
            .holder
            .map(|h| h.as_str().to_uppercase())
            .unwrap_or_else(|| "UNKNOWN".to_string());
        tracing::warn!(
            method = %request.method(),
            path = %request.uri().path(),
            holder,
            "write operation rejected: session is read-only"
        );
        return (
            StatusCode::LOCKED,
            Json(json!({
                "error": format!("Session locked by {holder}"),
                "mode": "read-only",
                "message": format!("Exit the {holder} session to enable write operations"),
            })),
        )
            .into_response();
    }

    next.run(request).await
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn session_token(State(state): State<AppState>) -> Json<Value> {
    Json(json!({"token": state.tokens.token()}))
}

async fn lock_state(State(state): State<AppState>) -> Json<Value> {
    let lock_state = state.session_lock.get_lock_state();
    let is_read_only = lock_state.mode == LockMode::Read && lock_state.holder.is_some();
    Json(json!({
        "mode": lock_state.mode.as_str(),
        "isReadOnly": is_read_only,
        "holder": lock_state.holder.map(|h| h.as_str()),
        "timestamp": lock_state.timestamp,
    }))
}

async fn agents() -> Json<Value> {
    Json(json!({
        "agents": [
            {"id": "orchestrator", "name": "Orchestrator", "role": "Workflow Coordinator",
             "description": "Analyzes requests, selects workflows, and coordinates the team"},
            {"id": "analyst", "name": "Analyst", "role": "Business Analyst",
             "description": "Elicits vision, facilitates research, analyzes requirements"},
            {"id": "pm", "name": "PM", "role": "Product Manager",
             "description": "Creates PRDs, defines features, prioritizes work"},
            {"id": "architect", "name": "Architect", "role": "Technical Architect",
             "description": "Designs system architecture and technical specifications"},
            {"id": "ux", "name": "UX", "role": "UX Designer",
             "description": "Creates user experience designs and wireframes"},
            {"id": "scrum", "name": "Scrum", "role": "Scrum Master",
             "description": "Manages stories, coordinates sprints, tracks progress"},
            {"id": "dev", "name": "Dev", "role": "Software Developer",
             "description": "Implements features, writes tests, reviews code"},
            {"id": "qa", "name": "QA", "role": "Test Architect",
             "description": "Designs test strategies and quality assurance processes"},
        ]
    }))
}

async fn save_file(
    State(state): State<AppState>,
    Json(input): Json<FileSaveInput>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let relative = PathBuf::from(&input.path);
    let escapes_root = relative.components().any(|component| {
        matches!(component, Component::ParentDir | Component::RootDir | Component::Prefix(_))
    });
    if escapes_root || relative.starts_with(STATE_DIR_NAME) {
        return Err((
            StatusCode::FORBIDDEN,
            Json(json!({"error": "Access denied"})),
        ));
    }

    let target = state.project_root.join(&relative);
    if let Some(parent) = target.parent() {
        if let Err(error) = tokio::fs::create_dir_all(parent).await {
            return Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": format!("Failed to save file: {error}")})),
            ));
        }
    }
    if let Err(error) = tokio::fs::write(&target, &input.content).await {
        return Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": format!("Failed to save file: {error}")})),
        ));
    }

    state.event_bus.publish(Event::new(
        EventType::FileModified,
        json!({"path": input.path, "agent": "web"}),
    ));
    tracing::info!(path = input.path, "file saved");

    Ok(Json(json!({"status": "success", "path": input.path})))
}

fn extract_ws_token(headers: &HeaderMap, query: &WsQuery) -> Option<String> {
    headers
        .get("X-Session-Token")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| query.token.clone())
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<WsQuery>,
) -> Response {
    let token = extract_ws_token(&headers, &query);
    if !state.tokens.validate(token.as_deref()) {
        tracing::warn!("websocket auth failed");
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "Unauthorized"})),
        )
            .into_response();
    }

    let client_id = headers
        .get("X-Client-Id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let last_sequence = headers
        .get("X-Last-Sequence")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok());

    ws.on_upgrade(move |socket| ws_stream(socket, state, client_id, last_sequence))
}

async fn ws_stream(
    mut socket: WebSocket,
    state: AppState,
    client_id: Option<String>,
    last_sequence: Option<u64>,
) {
    let reconnection = client_id.is_some();
    let mut connection = match state.hub.connect(client_id, last_sequence) {
        Ok(connection) => connection,
        Err(error) => {
            tracing::error!(error = %error, "websocket connection rejected");
            let _ = socket
                .send(WsMessage::Text(
                    json!({"error": error.to_string()}).to_string().into(),
                ))
                .await;
            return;
        }
    };

    let heartbeat = state.hub.stamp(&Event::new(
        EventType::SystemHeartbeat,
        json!({"status": "connected", "client_id": connection.client_id}),
    ));
    if send_event(&mut socket, &heartbeat).await.is_err() {
        state.hub.disconnect(&connection.client_id);
        return;
    }

    for missed in std::mem::take(&mut connection.missed) {
        if send_event(&mut socket, &missed).await.is_err() {
            state.hub.disconnect(&connection.client_id);
            return;
        }
    }
    tracing::info!(
        client_id = connection.client_id,
        reconnection,
        "websocket connection established"
    );

    loop {
        tokio::select! {
            event = connection.receiver.recv() => {
                match event {
                    Some(event) => {
                        if send_event(&mut socket, &event).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    // Client commands are not part of the protocol yet.
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    state.hub.disconnect(&connection.client_id);
}

async fn send_event(
    socket: &mut WebSocket,
    event: &cadence_types::WireEvent,
) -> Result<(), axum::Error> {
    let payload = serde_json::to_string(event).unwrap_or_default();
    socket.send(WsMessage::Text(payload.into())).await
}
