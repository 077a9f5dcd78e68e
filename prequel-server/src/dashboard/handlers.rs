//! HTTP handlers for the dashboard API.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use prequel_core::RepositoryRef;
use std::sync::Arc;
use tracing::{error, info, warn};

use super::types::{
    CreateRepositoryRequest, CreateRepositoryResponse, ErrorResponse, RecentQuery,
    RefreshResponse, StatsResponse,
};
use crate::provisioning::{
    DeploymentStatus, ProvisioningError, RepositoryRequest, Visibility,
};
use crate::store::{Contributor, PrMetrics, RecentPullRequest, RepositorySummary, StalePr};
use crate::AppState;

const DEFAULT_BRANCH: &str = "main";

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(ErrorResponse::new(message))).into_response()
}

/// Handler: GET /api/metrics
pub async fn get_metrics(State(state): State<Arc<AppState>>) -> Json<PrMetrics> {
    Json(state.repository.analytics.pr_metrics().await)
}

/// Handler: GET /api/stale-prs
pub async fn get_stale_prs(State(state): State<Arc<AppState>>) -> Json<Vec<StalePr>> {
    Json(state.repository.analytics.stale_prs().await)
}

/// Handler: POST /api/stale-prs/refresh
///
/// Runs the staleness engine now instead of waiting for the scheduler.
pub async fn refresh_stale_prs(State(state): State<Arc<AppState>>) -> Response {
    let run = state
        .repository
        .staleness
        .mark_stale_prs(state.stale_pr_days);

    match tokio::time::timeout(state.db_timeout, run).await {
        Ok(Ok(report)) => Json(RefreshResponse {
            updated: report.updated(),
            newly_stale: report.newly_stale,
            cleared: report.cleared,
        })
        .into_response(),
        Ok(Err(e)) => {
            error!("On-demand staleness run failed: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
        Err(_) => {
            error!("On-demand staleness run timed out");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Staleness refresh timed out",
            )
        }
    }
}

/// Handler: GET /api/repositories
pub async fn get_repositories(
    State(state): State<Arc<AppState>>,
) -> Json<Vec<RepositorySummary>> {
    Json(state.repository.analytics.repositories_with_counts().await)
}

/// Handler: GET /api/contributors
pub async fn get_contributors(State(state): State<Arc<AppState>>) -> Json<Vec<Contributor>> {
    Json(state.repository.analytics.contributors_with_counts().await)
}

/// Handler: GET /api/recent-prs?limit=N
pub async fn get_recent_prs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RecentQuery>,
) -> Json<Vec<RecentPullRequest>> {
    Json(
        state
            .repository
            .analytics
            .recent_prs(query.effective_limit())
            .await,
    )
}

/// Handler: GET /api/stats
pub async fn get_stats(State(state): State<Arc<AppState>>) -> Json<StatsResponse> {
    let analytics = &state.repository.analytics;
    let (metrics, stale_prs, repositories, contributors, recent_prs) = tokio::join!(
        analytics.pr_metrics(),
        analytics.stale_prs(),
        analytics.repositories_with_counts(),
        analytics.contributors_with_counts(),
        analytics.recent_prs(RecentQuery::default().effective_limit()),
    );

    Json(StatsResponse {
        metrics,
        stale_prs,
        repositories,
        contributors,
        recent_prs,
    })
}

/// Handler: POST /api/repositories
///
/// Provisions the repository in the configured organization, then records it
/// locally so it shows up in the dashboard before its first webhook arrives.
pub async fn create_repository(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateRepositoryRequest>,
) -> Response {
    let Some(org) = state.organization.clone() else {
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Organization name not configured",
        );
    };

    let request = RepositoryRequest {
        name: body.name,
        org,
        description: body.description.unwrap_or_default(),
        visibility: body.visibility.unwrap_or(Visibility::Private),
        branch: body
            .branch
            .filter(|b| !b.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_BRANCH.to_string()),
    };

    let repository = match state.provisioner.create_repository(request).await {
        Ok(repository) => repository,
        Err(ProvisioningError::InvalidRequest(msg)) => {
            return error_response(StatusCode::BAD_REQUEST, msg);
        }
        Err(e) => {
            error!("Repository creation failed: {}", e);
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
        }
    };

    // The GitHub id is unknown until the first webhook for this repository.
    let local = RepositoryRef::unresolved(&repository.organization, &repository.name);
    match state.repository.upserts.upsert_repository(local).await {
        Ok(id) => info!("Recorded repository {} as {:?}", repository.full_name, id),
        Err(e) => warn!(
            "Repository {} was created but could not be recorded locally: {}",
            repository.full_name, e
        ),
    }

    let warning = repository.warning.clone();
    let message = if warning.is_some() {
        "Repository created but branch protection failed"
    } else {
        "Repository created successfully"
    };

    Json(CreateRepositoryResponse {
        message: message.to_string(),
        repository,
        warning,
    })
    .into_response()
}

/// Handler: GET /api/deployment-status
pub async fn get_deployment_status(State(state): State<Arc<AppState>>) -> Json<DeploymentStatus> {
    Json(state.provisioner.deployment_status().await)
}

/// Handler: POST /api/deploy
pub async fn deploy(State(state): State<Arc<AppState>>) -> Response {
    match state.provisioner.start_deployment().await {
        Ok(status) => (StatusCode::ACCEPTED, Json(status)).into_response(),
        Err(ProvisioningError::DeploymentInProgress) => error_response(
            StatusCode::CONFLICT,
            "Deployment already in progress",
        ),
        Err(e) => {
            error!("Could not start deployment: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}
