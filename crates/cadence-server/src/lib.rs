use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use cadence_core::{EventBus, SessionLock, SessionTokenManager};
use cadence_types::EventType;

mod http;
mod hub;

pub use http::router;
pub use hub::{ClientConnection, HubConfig, HubError, WebSocketHub};

/// Shared server state: the session lock gates the mutating surface, the
/// token manager gates the WebSocket, and the hub fans bus events out to
/// observers.
#[derive(Clone)]
pub struct AppState {
    pub project_root: PathBuf,
    pub session_lock: Arc<SessionLock>,
    pub tokens: Arc<SessionTokenManager>,
    pub event_bus: EventBus,
    pub hub: Arc<WebSocketHub>,
}

impl AppState {
    pub fn new(
        project_root: PathBuf,
        session_lock: Arc<SessionLock>,
        event_bus: EventBus,
        hub_config: HubConfig,
    ) -> Self {
        let tokens = Arc::new(SessionTokenManager::new(&project_root));
        let hub = Arc::new(WebSocketHub::new(hub_config));

        // Forward every bus topic into the hub; observers see the full
        // closed event set.
        for event_type in EventType::ALL {
            let hub = hub.clone();
            event_bus.subscribe(
                event_type,
                Arc::new(move |event| {
                    hub.publish(event);
                    Ok(())
                }),
            );
        }

        Self {
            project_root,
            session_lock,
            tokens,
            event_bus,
            hub,
        }
    }
}

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    state.tokens.ensure_persisted();
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "observability server listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}
