//! Read-only dashboard queries.
//!
//! Every public query degrades to an empty or zero-valued result when the
//! database fails, logging the error, so one failing metric never takes down
//! the rest of a dashboard response. Orderings are fully deterministic: ties
//! on a count are broken by name ascending.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use prequel_core::PrState;
use rusqlite::{params, Connection};
use serde::Serialize;
use tracing::error;

use super::{from_epoch, i64_to_u64, Database, StoreError};

const SECONDS_PER_DAY: i64 = 86_400;

/// `(username, count)` pairs, serialized as two-element arrays.
pub type UserCounts = Vec<(String, u64)>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PrMetrics {
    pub pr_authors: UserCounts,
    pub active_reviewers: UserCounts,
    pub comment_users: UserCounts,
    pub stale_pr_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepositorySummary {
    pub id: i64,
    pub github_id: u64,
    pub name: String,
    pub full_name: String,
    pub created_at: DateTime<Utc>,
    pub pr_count: u64,
    pub review_count: u64,
    pub stale_pr_count: u64,
    pub contributor_count: u64,
    pub last_activity: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Contributor {
    pub id: i64,
    pub github_id: u64,
    pub username: String,
    pub avatar_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub pr_count: u64,
    pub review_count: u64,
    pub comment_count: u64,
    /// Names of repositories the user has authored pull requests in, sorted.
    pub repositories: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StalePr {
    pub id: i64,
    pub title: String,
    pub number: u64,
    pub html_url: String,
    pub repository_name: String,
    pub author_name: String,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub days_stale: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecentPullRequest {
    pub id: i64,
    pub title: String,
    pub number: u64,
    pub html_url: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub state: PrState,
    pub repository_name: String,
    pub author_name: String,
}

#[derive(Clone)]
pub struct AnalyticsAggregator {
    db: Database,
}

impl AnalyticsAggregator {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Per-user authored PR, review and comment counts plus the number of
    /// open stale PRs. Each part is queried and degraded independently.
    pub async fn pr_metrics(&self) -> PrMetrics {
        let pr_authors = self
            .db
            .run_read("pr authors", |conn| {
                user_counts(
                    conn,
                    r#"
                    SELECT u.username, COUNT(*) AS c
                    FROM pull_requests p JOIN users u ON u.id = p.author_id
                    GROUP BY u.id
                    ORDER BY c DESC, u.username ASC
                    "#,
                )
            })
            .await;
        let active_reviewers = self
            .db
            .run_read("active reviewers", |conn| {
                user_counts(
                    conn,
                    r#"
                    SELECT u.username, COUNT(*) AS c
                    FROM reviews r JOIN users u ON u.id = r.reviewer_id
                    GROUP BY u.id
                    ORDER BY c DESC, u.username ASC
                    "#,
                )
            })
            .await;
        let comment_users = self
            .db
            .run_read("comment users", |conn| {
                user_counts(
                    conn,
                    r#"
                    SELECT u.username, COUNT(*) AS c
                    FROM review_comments rc JOIN users u ON u.id = rc.author_id
                    GROUP BY u.id
                    ORDER BY c DESC, u.username ASC
                    "#,
                )
            })
            .await;
        let stale_pr_count = self
            .db
            .run_read("stale pr count", |conn| {
                let count: i64 = conn
                    .query_row(
                        "SELECT COUNT(*) FROM pull_requests WHERE is_stale = 1 AND state = 'open'",
                        [],
                        |row| row.get(0),
                    )
                    .map_err(|e| StoreError::storage("count stale pull requests", e.to_string()))?;
                i64_to_u64("stale count", count)
            })
            .await;

        PrMetrics {
            pr_authors: or_default("pr_metrics.pr_authors", pr_authors),
            active_reviewers: or_default("pr_metrics.active_reviewers", active_reviewers),
            comment_users: or_default("pr_metrics.comment_users", comment_users),
            stale_pr_count: or_default("pr_metrics.stale_pr_count", stale_pr_count),
        }
    }

    /// Every repository with its rollup counts, including repositories that
    /// have no pull requests yet.
    pub async fn repositories_with_counts(&self) -> Vec<RepositorySummary> {
        let result = self
            .db
            .run_read("repositories with counts", query_repositories)
            .await;
        or_default("repositories_with_counts", result)
    }

    /// Every known user with activity counts and the repositories they have
    /// authored pull requests in.
    pub async fn contributors_with_counts(&self) -> Vec<Contributor> {
        let result = self
            .db
            .run_read("contributors with counts", query_contributors)
            .await;
        or_default("contributors_with_counts", result)
    }

    pub async fn stale_prs(&self) -> Vec<StalePr> {
        self.stale_prs_at(Utc::now()).await
    }

    /// Currently stale open PRs, longest-idle first, with `days_stale`
    /// computed relative to `now`.
    pub async fn stale_prs_at(&self, now: DateTime<Utc>) -> Vec<StalePr> {
        let result = self
            .db
            .run_read("stale prs", move |conn| query_stale_prs(conn, now))
            .await;
        or_default("stale_prs", result)
    }

    /// The `limit` most recently created PRs, newest first.
    pub async fn recent_prs(&self, limit: u32) -> Vec<RecentPullRequest> {
        let result = self
            .db
            .run_read("recent prs", move |conn| query_recent_prs(conn, limit))
            .await;
        or_default("recent_prs", result)
    }
}

fn or_default<T: Default>(what: &str, result: Result<T, StoreError>) -> T {
    match result {
        Ok(value) => value,
        Err(e) => {
            error!("Analytics query {} failed, returning empty result: {}", what, e);
            T::default()
        }
    }
}

fn query_err(operation: &'static str) -> impl Fn(rusqlite::Error) -> StoreError {
    move |e| StoreError::storage(operation, e.to_string())
}

fn user_counts(conn: &Connection, sql: &str) -> Result<UserCounts, StoreError> {
    let mut stmt = conn.prepare(sql).map_err(query_err("prepare user counts"))?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
        .map_err(query_err("query user counts"))?;

    let mut counts = Vec::new();
    for row in rows {
        let (username, count) = row.map_err(query_err("read user count"))?;
        counts.push((username, i64_to_u64("count", count)?));
    }
    Ok(counts)
}

fn query_repositories(conn: &mut Connection) -> Result<Vec<RepositorySummary>, StoreError> {
    let mut stmt = conn
        .prepare(
            r#"
            SELECT
                r.id, r.github_id, r.name, r.full_name, r.created_at,
                (SELECT COUNT(*) FROM pull_requests p WHERE p.repository_id = r.id) AS pr_count,
                (SELECT COUNT(*) FROM reviews rv
                    JOIN pull_requests p ON p.id = rv.pull_request_id
                    WHERE p.repository_id = r.id) AS review_count,
                (SELECT COUNT(*) FROM pull_requests p
                    WHERE p.repository_id = r.id AND p.is_stale = 1 AND p.state = 'open')
                    AS stale_pr_count,
                (SELECT COUNT(DISTINCT p.author_id) FROM pull_requests p
                    WHERE p.repository_id = r.id) AS contributor_count,
                (SELECT MAX(p.last_activity_at) FROM pull_requests p
                    WHERE p.repository_id = r.id) AS last_activity
            FROM repositories r
            ORDER BY pr_count DESC, r.full_name ASC
            "#,
        )
        .map_err(query_err("prepare repositories"))?;

    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i64>(4)?,
                [
                    row.get::<_, i64>(5)?,
                    row.get::<_, i64>(6)?,
                    row.get::<_, i64>(7)?,
                    row.get::<_, i64>(8)?,
                ],
                row.get::<_, Option<i64>>(9)?,
            ))
        })
        .map_err(query_err("query repositories"))?;

    let mut repositories = Vec::new();
    for row in rows {
        let (id, github_id, name, full_name, created_at, counts, last_activity) =
            row.map_err(query_err("read repository"))?;
        repositories.push(RepositorySummary {
            id,
            github_id: i64_to_u64("repository github_id", github_id)?,
            name,
            full_name,
            created_at: from_epoch("repositories.created_at", created_at)?,
            pr_count: i64_to_u64("pr_count", counts[0])?,
            review_count: i64_to_u64("review_count", counts[1])?,
            stale_pr_count: i64_to_u64("stale_pr_count", counts[2])?,
            contributor_count: i64_to_u64("contributor_count", counts[3])?,
            last_activity: last_activity
                .map(|secs| from_epoch("pull_requests.last_activity_at", secs))
                .transpose()?,
        });
    }
    Ok(repositories)
}

fn query_contributors(conn: &mut Connection) -> Result<Vec<Contributor>, StoreError> {
    let mut repos_by_author: HashMap<i64, BTreeSet<String>> = HashMap::new();
    {
        let mut stmt = conn
            .prepare(
                r#"
                SELECT DISTINCT p.author_id, r.name
                FROM pull_requests p JOIN repositories r ON r.id = p.repository_id
                "#,
            )
            .map_err(query_err("prepare contributor repositories"))?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))
            .map_err(query_err("query contributor repositories"))?;
        for row in rows {
            let (author_id, repo_name) = row.map_err(query_err("read contributor repository"))?;
            repos_by_author.entry(author_id).or_default().insert(repo_name);
        }
    }

    let mut stmt = conn
        .prepare(
            r#"
            SELECT
                u.id, u.github_id, u.username, u.avatar_url, u.created_at,
                (SELECT COUNT(*) FROM pull_requests p WHERE p.author_id = u.id) AS pr_count,
                (SELECT COUNT(*) FROM reviews rv WHERE rv.reviewer_id = u.id) AS review_count,
                (SELECT COUNT(*) FROM review_comments rc WHERE rc.author_id = u.id)
                    AS comment_count
            FROM users u
            ORDER BY pr_count DESC, u.username ASC
            "#,
        )
        .map_err(query_err("prepare contributors"))?;

    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, i64>(4)?,
                [
                    row.get::<_, i64>(5)?,
                    row.get::<_, i64>(6)?,
                    row.get::<_, i64>(7)?,
                ],
            ))
        })
        .map_err(query_err("query contributors"))?;

    let mut contributors = Vec::new();
    for row in rows {
        let (id, github_id, username, avatar_url, created_at, counts) =
            row.map_err(query_err("read contributor"))?;
        contributors.push(Contributor {
            id,
            github_id: i64_to_u64("user github_id", github_id)?,
            username,
            avatar_url,
            created_at: from_epoch("users.created_at", created_at)?,
            pr_count: i64_to_u64("pr_count", counts[0])?,
            review_count: i64_to_u64("review_count", counts[1])?,
            comment_count: i64_to_u64("comment_count", counts[2])?,
            repositories: repos_by_author
                .remove(&id)
                .map(|names| names.into_iter().collect())
                .unwrap_or_default(),
        });
    }
    Ok(contributors)
}

fn query_stale_prs(conn: &mut Connection, now: DateTime<Utc>) -> Result<Vec<StalePr>, StoreError> {
    let mut stmt = conn
        .prepare(
            r#"
            SELECT p.id, p.title, p.number, p.html_url, r.name, u.username,
                   p.created_at, p.last_activity_at
            FROM pull_requests p
            JOIN repositories r ON r.id = p.repository_id
            JOIN users u ON u.id = p.author_id
            WHERE p.is_stale = 1 AND p.state = 'open'
            ORDER BY p.last_activity_at ASC, p.id ASC
            "#,
        )
        .map_err(query_err("prepare stale prs"))?;

    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, i64>(6)?,
                row.get::<_, i64>(7)?,
            ))
        })
        .map_err(query_err("query stale prs"))?;

    let now_secs = now.timestamp();
    let mut stale = Vec::new();
    for row in rows {
        let (id, title, number, html_url, repository_name, author_name, created_at, last_activity) =
            row.map_err(query_err("read stale pr"))?;
        let idle_secs = (now_secs - last_activity).max(0);
        stale.push(StalePr {
            id,
            title,
            number: i64_to_u64("pull request number", number)?,
            html_url,
            repository_name,
            author_name,
            created_at: from_epoch("pull_requests.created_at", created_at)?,
            last_activity_at: from_epoch("pull_requests.last_activity_at", last_activity)?,
            days_stale: i64_to_u64("days_stale", idle_secs / SECONDS_PER_DAY)?,
        });
    }
    Ok(stale)
}

fn query_recent_prs(conn: &mut Connection, limit: u32) -> Result<Vec<RecentPullRequest>, StoreError> {
    let mut stmt = conn
        .prepare(
            r#"
            SELECT p.id, p.title, p.number, p.html_url, p.created_at, p.updated_at, p.state,
                   r.name, u.username
            FROM pull_requests p
            JOIN repositories r ON r.id = p.repository_id
            JOIN users u ON u.id = p.author_id
            ORDER BY p.created_at DESC, p.id DESC
            LIMIT ?1
            "#,
        )
        .map_err(query_err("prepare recent prs"))?;

    let rows = stmt
        .query_map(params![limit], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, i64>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, String>(7)?,
                row.get::<_, String>(8)?,
            ))
        })
        .map_err(query_err("query recent prs"))?;

    let mut recent = Vec::new();
    for row in rows {
        let (id, title, number, html_url, created_at, updated_at, state, repo, author) =
            row.map_err(query_err("read recent pr"))?;
        recent.push(RecentPullRequest {
            id,
            title,
            number: i64_to_u64("pull request number", number)?,
            html_url,
            created_at: from_epoch("pull_requests.created_at", created_at)?,
            updated_at: from_epoch("pull_requests.updated_at", updated_at)?,
            state: PrState::parse(&state)
                .ok_or_else(|| StoreError::corruption(format!("unknown PR state '{}'", state)))?,
            repository_name: repo,
            author_name: author,
        });
    }
    Ok(recent)
}
