//! sandgate-proxy — the gateway router.
//!
//! Every request except the liveness route passes the access gate. Proxied
//! requests additionally wait for the backend to be ready, then stream
//! through to it over HTTP or WebSocket.
//!
//! # Routes
//!
//! | Method | Path | Auth | Description |
//! |---|---|---|---|
//! | GET | `/_sandgate/health` | no | Gateway liveness, always 200 |
//! | GET | `/_sandgate/status` | yes | Compute state and sync entry status |
//! | any | everything else | yes | Forwarded to the backend |

pub mod error;
pub mod forward;
pub mod ws;

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Extension, Json, Router};
use serde::Serialize;

use sandgate_auth::{AccessGate, Identity, TokenLocator};
use sandgate_supervisor::{ComputeState, Supervisor};
use sandgate_sync::{EntryStatus, SyncEngine};

pub use error::{GatewayError, ProxyError};
pub use forward::Upstream;

/// Shared state for gateway handlers.
#[derive(Clone)]
pub struct GatewayState {
    pub gate: Arc<AccessGate>,
    pub locator: Arc<TokenLocator>,
    pub supervisor: Supervisor,
    pub sync: Option<Arc<SyncEngine>>,
    pub upstream: Upstream,
}

/// Build the gateway router.
pub fn build_router(state: GatewayState) -> Router {
    Router::new()
        .route("/_sandgate/status", get(status))
        .fallback(proxy)
        .layer(middleware::from_fn_with_state(state.clone(), require_identity))
        .route("/_sandgate/health", get(health))
        .with_state(state)
}

/// Verify the credential and attach the caller's `Identity`.
async fn require_identity(
    State(state): State<GatewayState>,
    mut req: Request,
    next: Next,
) -> Result<Response, GatewayError> {
    let token = state.locator.extract(req.headers());
    let identity = state.gate.verify(token.as_deref()).await?;
    req.extensions_mut().insert(identity);
    Ok(next.run(req).await)
}

/// GET /_sandgate/health
async fn health() -> &'static str {
    "ok"
}

#[derive(Serialize)]
struct StatusBody {
    subject: String,
    compute: ComputeState,
    sync: Vec<EntryStatus>,
}

/// GET /_sandgate/status
async fn status(
    State(state): State<GatewayState>,
    Extension(identity): Extension<Identity>,
) -> Json<StatusBody> {
    Json(StatusBody {
        subject: identity.subject,
        compute: state.supervisor.state(),
        sync: state
            .sync
            .as_ref()
            .map(|engine| engine.status())
            .unwrap_or_default(),
    })
}

/// Fallback: wait for the backend, then forward.
async fn proxy(State(state): State<GatewayState>, req: Request) -> Response {
    if let Err(e) = state.supervisor.ensure_running().await {
        return GatewayError::from(e).into_response();
    }

    let result = if ws::is_upgrade_request(req.headers()) {
        ws::forward_websocket(&state.upstream, &state.locator, req).await
    } else {
        forward::forward_http(&state.upstream, &state.locator, req).await
    };
    result.unwrap_or_else(IntoResponse::into_response)
}
