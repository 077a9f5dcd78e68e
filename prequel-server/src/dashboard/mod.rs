//! JSON API consumed by the dashboard client.
//!
//! Read endpoints never fail: each analytics query degrades to an empty
//! result on its own. Repository creation and deployment go through the
//! provisioning collaborator.

pub mod handlers;
pub mod types;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use crate::AppState;

pub fn dashboard_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/metrics", get(handlers::get_metrics))
        .route("/api/stale-prs", get(handlers::get_stale_prs))
        .route("/api/stale-prs/refresh", post(handlers::refresh_stale_prs))
        .route(
            "/api/repositories",
            get(handlers::get_repositories).post(handlers::create_repository),
        )
        .route("/api/contributors", get(handlers::get_contributors))
        .route("/api/recent-prs", get(handlers::get_recent_prs))
        .route("/api/stats", get(handlers::get_stats))
        .route(
            "/api/deployment-status",
            get(handlers::get_deployment_status),
        )
        .route("/api/deploy", post(handlers::deploy))
}
