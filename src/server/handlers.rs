//! HTTP handlers and shared application state.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::hub::{ChannelTransport, NotificationHub, Transport};
use crate::watch::{EntrySnapshot, WatchRegistry, WatchSubscriptions};

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Shared watch table.
    pub registry: WatchRegistry,
    /// Session subscriptions and fan-out.
    pub hub: NotificationHub,
    /// Per-session outbound queues drained by the socket writers.
    pub transport: Arc<ChannelTransport>,
}

impl AppState {
    /// Wire a hub and channel transport around `registry`.
    #[must_use]
    pub fn new(registry: WatchRegistry, case_insensitive: bool) -> Self {
        let transport = Arc::new(ChannelTransport::new());
        let hub = NotificationHub::new(
            Arc::new(registry.clone()) as Arc<dyn WatchSubscriptions>,
            Arc::clone(&transport) as Arc<dyn Transport>,
        )
        .with_case_insensitive(case_insensitive);

        Self {
            registry,
            hub,
            transport,
        }
    }
}

/// Response for `GET /api/health`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub watches: usize,
    pub sessions: usize,
}

/// GET /api/health - Liveness plus watch and session counts.
pub async fn get_health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        watches: state.registry.len(),
        sessions: state.hub.session_count(),
    })
}

/// GET /api/watches - Snapshot of every shared watch.
pub async fn get_watches(State(state): State<AppState>) -> Json<Vec<EntrySnapshot>> {
    Json(state.registry.snapshot())
}
