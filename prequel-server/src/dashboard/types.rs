//! Request and response bodies for the dashboard API.

use serde::{Deserialize, Serialize};

use crate::provisioning::{ProvisionedRepository, Visibility};
use crate::store::{Contributor, PrMetrics, RecentPullRequest, RepositorySummary, StalePr};

pub const DEFAULT_RECENT_LIMIT: u32 = 10;
pub const MAX_RECENT_LIMIT: u32 = 100;

/// Query string for `GET /api/recent-prs`.
#[derive(Debug, Default, Deserialize)]
pub struct RecentQuery {
    pub limit: Option<u32>,
}

impl RecentQuery {
    /// The requested limit clamped to `1..=MAX_RECENT_LIMIT`.
    pub fn effective_limit(&self) -> u32 {
        self.limit
            .unwrap_or(DEFAULT_RECENT_LIMIT)
            .clamp(1, MAX_RECENT_LIMIT)
    }
}

/// Body of `POST /api/repositories`. The organization comes from
/// configuration, not the caller.
#[derive(Debug, Deserialize)]
pub struct CreateRepositoryRequest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub visibility: Option<Visibility>,
    #[serde(default)]
    pub branch: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CreateRepositoryResponse {
    pub message: String,
    pub repository: ProvisionedRepository,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RefreshResponse {
    pub updated: u64,
    pub newly_stale: u64,
    pub cleared: u64,
}

/// Everything the dashboard's landing page shows, fetched in one call.
#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub metrics: PrMetrics,
    pub stale_prs: Vec<StalePr>,
    pub repositories: Vec<RepositorySummary>,
    pub contributors: Vec<Contributor>,
    pub recent_prs: Vec<RecentPullRequest>,
}
