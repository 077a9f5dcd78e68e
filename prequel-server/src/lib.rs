pub mod config;
pub mod dashboard;
pub mod notification;
pub mod provisioning;
pub mod scheduler;
pub mod store;
pub mod webhook;

use axum::{response::Json, routing::get, Router};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use notification::NotificationDispatcher;
use prequel_core::RecordingLogger;
use provisioning::ProvisioningClient;
use store::PrequelRepository;

pub use prequel_core::get_version;

pub const SERVICE_NAME: &str = "prequel";

pub struct AppState {
    pub webhook_secret: String,
    pub repository: PrequelRepository,
    pub dispatcher: NotificationDispatcher,
    pub provisioner: Arc<dyn ProvisioningClient>,
    /// Organization new repositories are created in.
    pub organization: Option<String>,
    pub stale_pr_days: u32,
    /// Upper bound on a single store operation made while serving a request.
    pub db_timeout: Duration,
    pub recording_logger: Option<RecordingLogger>,
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": SERVICE_NAME,
        "version": get_version(),
    }))
}

async fn help_handler() -> Json<Value> {
    Json(json!({
        "service": SERVICE_NAME,
        "version": get_version(),
        "description": "GitHub pull request analytics: webhook ingestion, staleness tracking and repository provisioning",
        "endpoints": [
            {"path": "/health", "method": "GET", "description": "Health check"},
            {"path": "/help", "method": "GET", "description": "This document"},
            {
                "path": "/webhook",
                "method": "POST",
                "description": "GitHub webhook receiver (also served at /)",
                "authentication": "GitHub webhook signature (X-Hub-Signature-256)"
            },
            {"path": "/api/metrics", "method": "GET", "description": "Per-user PR, review and comment counts"},
            {"path": "/api/stale-prs", "method": "GET", "description": "Open PRs flagged stale"},
            {"path": "/api/stale-prs/refresh", "method": "POST", "description": "Recompute staleness now"},
            {"path": "/api/repositories", "method": "GET", "description": "Repositories with rollup counts"},
            {"path": "/api/repositories", "method": "POST", "description": "Create a repository in the configured organization"},
            {"path": "/api/contributors", "method": "GET", "description": "Contributors with rollup counts"},
            {"path": "/api/recent-prs", "method": "GET", "description": "Most recently created PRs (?limit=N, max 100)"},
            {"path": "/api/stats", "method": "GET", "description": "All dashboard data in one response"},
            {"path": "/api/deployment-status", "method": "GET", "description": "Status of the last infrastructure deployment"},
            {"path": "/api/deploy", "method": "POST", "description": "Start an infrastructure deployment"}
        ],
        "configuration": {
            "required_env_vars": ["GITHUB_WEBHOOK_SECRET"],
            "optional_env_vars": [
                "PORT (default: 5001)",
                "STATE_DIR (default: current directory)",
                "STALE_PR_DAYS (default: 7)",
                "STALE_CHECK_INTERVAL_SECS (default: 86400)",
                "SLACK_WEBHOOK_URL",
                "NOTIFICATION_TIMEOUT_SECS (default: 5)",
                "DB_TIMEOUT_SECS (default: 10)",
                "ORGANIZATION_NAME",
                "INFRASTRUCTURE_DIR (default: infrastructure)",
                "PROVISIONING_TIMEOUT_SECS (default: 600)",
                "RECORDING_ENABLED (default: false)",
                "RECORDING_LOG_PATH (default: recordings.jsonl)"
            ]
        }
    }))
}

/// All routes, without transport layers.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/help", get(help_handler))
        .merge(dashboard::dashboard_router())
        .merge(webhook::webhook_router(state.clone()))
        .with_state(state)
}
