//! delve-api — REST API for Delve.
//!
//! Game servers post telemetry here; operators read back instances,
//! claims and players.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/api/v1/events` | Submit a telemetry event |
//! | GET | `/api/v1/instances` | List dungeon instances |
//! | GET | `/api/v1/claims` | List claims (`?active=true` for non-terminal only) |
//! | GET | `/api/v1/players/{name}` | Get one player |
//! | GET | `/healthz` | Liveness |

pub mod handlers;

use axum::Router;
use axum::routing::{get, post};
use delve_reactor::EventReactor;
use delve_state::StateStore;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: StateStore,
    pub reactor: EventReactor,
}

/// Build the complete API router.
pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route("/events", post(handlers::submit_event))
        .route("/instances", get(handlers::list_instances))
        .route("/claims", get(handlers::list_claims))
        .route("/players/{name}", get(handlers::get_player))
        .with_state(state);

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/healthz", get(handlers::healthz))
}
