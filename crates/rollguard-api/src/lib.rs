//! rollguard-api — REST API for rollguard.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/api/v1/probes` | Record a probe result |
//! | POST | `/api/v1/targets/{target}/deployments` | Report the live version |
//! | GET | `/api/v1/targets/{target}/authorize` | Deploy gate (200 allowed, 423 blocked) |
//! | GET | `/api/v1/targets/{target}/health` | Verdict, window, known-good versions |
//! | GET | `/api/v1/targets/{target}/episodes` | Rollback history |
//! | POST | `/api/v1/targets/{target}/episodes/acknowledge` | Close a failed rollback |
//! | GET | `/api/v1/cooldown` | Cooldown window |
//! | POST | `/api/v1/cooldown/clear` | Manual cooldown override |
//! | GET | `/api/v1/flags/{*key}` | Raw flag by key |

pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use rollguard_rollout::Guard;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub guard: Arc<Guard>,
}

/// Build the complete API router.
pub fn build_router(guard: Arc<Guard>) -> Router {
    let state = ApiState { guard };

    let api_routes = Router::new()
        .route("/probes", post(handlers::record_probe))
        .route("/targets/{target}/deployments", post(handlers::record_deploy))
        .route("/targets/{target}/authorize", get(handlers::authorize))
        .route("/targets/{target}/health", get(handlers::target_health))
        .route("/targets/{target}/episodes", get(handlers::list_episodes))
        .route(
            "/targets/{target}/episodes/acknowledge",
            post(handlers::acknowledge_episode),
        )
        .route("/cooldown", get(handlers::get_cooldown))
        .route("/cooldown/clear", post(handlers::clear_cooldown))
        .route("/flags/{*key}", get(handlers::get_flag))
        .with_state(state);

    Router::new().nest("/api/v1", api_routes)
}
