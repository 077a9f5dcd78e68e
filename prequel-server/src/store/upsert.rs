//! Idempotent writes for normalized webhook events.
//!
//! Every write is an atomic `INSERT ... ON CONFLICT DO UPDATE` keyed by a
//! unique constraint, so concurrent or repeated deliveries of the same event
//! converge on the same rows. All rows touched by one event are written in a
//! single `IMMEDIATE` transaction.

use chrono::Utc;
use prequel_core::event::{NormalizedEvent, PullRequestEvent, ReviewCommentEvent, ReviewEvent};
use prequel_core::{
    PullRequestId, PullRequestRef, RepositoryId, RepositoryRef, ReviewCommentRef, ReviewRef,
    UserId, UserRef,
};
use rusqlite::{params, Connection, TransactionBehavior};
use tracing::debug;

use super::{github_id_to_i64, to_epoch, Database, StoreError};

#[derive(Clone)]
pub struct UpsertStore {
    db: Database,
}

impl UpsertStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Apply every write implied by `event` atomically.
    ///
    /// Returns the affected pull request, or `None` for events that write
    /// nothing (ping).
    pub async fn apply_event(
        &self,
        event: NormalizedEvent,
    ) -> Result<Option<PullRequestId>, StoreError> {
        if let NormalizedEvent::Ping { .. } = event {
            return Ok(None);
        }

        self.db
            .run("apply event", move |conn| {
                let tx = conn
                    .transaction_with_behavior(TransactionBehavior::Immediate)
                    .map_err(|e| StoreError::storage("begin transaction", e.to_string()))?;

                let pr_id = match &event {
                    NormalizedEvent::PullRequest(e) => apply_pull_request(&tx, e)?,
                    NormalizedEvent::Review(e) => apply_review(&tx, e)?,
                    NormalizedEvent::ReviewComment(e) => apply_review_comment(&tx, e)?,
                    NormalizedEvent::Ping { .. } => return Ok(None),
                };

                tx.commit()
                    .map_err(|e| StoreError::storage("commit transaction", e.to_string()))?;
                Ok(Some(pr_id))
            })
            .await
    }

    /// Upsert a single repository outside of any webhook event, e.g. one
    /// created through provisioning.
    pub async fn upsert_repository(
        &self,
        repository: RepositoryRef,
    ) -> Result<RepositoryId, StoreError> {
        self.db
            .run("upsert repository", move |conn| {
                upsert_repository(conn, &repository)
            })
            .await
    }

    pub async fn upsert_user(&self, user: UserRef) -> Result<UserId, StoreError> {
        self.db
            .run("upsert user", move |conn| upsert_user(conn, &user))
            .await
    }

    pub async fn upsert_pull_request(
        &self,
        repository_id: RepositoryId,
        author_id: UserId,
        pull_request: PullRequestRef,
    ) -> Result<PullRequestId, StoreError> {
        self.db
            .run("upsert pull request", move |conn| {
                upsert_pull_request(conn, repository_id, author_id, &pull_request)
            })
            .await
    }

    /// Record a review and advance its pull request's activity together.
    pub async fn insert_review(
        &self,
        pull_request_id: PullRequestId,
        reviewer_id: UserId,
        review: ReviewRef,
    ) -> Result<(), StoreError> {
        self.db
            .run("insert review", move |conn| {
                in_transaction(conn, |tx| {
                    insert_review(tx, pull_request_id, reviewer_id, &review)
                })
            })
            .await
    }

    pub async fn insert_review_comment(
        &self,
        pull_request_id: PullRequestId,
        author_id: UserId,
        comment: ReviewCommentRef,
    ) -> Result<(), StoreError> {
        self.db
            .run("insert review comment", move |conn| {
                in_transaction(conn, |tx| {
                    insert_review_comment(tx, pull_request_id, author_id, &comment)
                })
            })
            .await
    }
}

fn in_transaction<T>(
    conn: &mut Connection,
    f: impl FnOnce(&Connection) -> Result<T, StoreError>,
) -> Result<T, StoreError> {
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(|e| StoreError::storage("begin transaction", e.to_string()))?;
    let value = f(&tx)?;
    tx.commit()
        .map_err(|e| StoreError::storage("commit transaction", e.to_string()))?;
    Ok(value)
}

fn apply_pull_request(conn: &Connection, event: &PullRequestEvent) -> Result<PullRequestId, StoreError> {
    let repo_id = upsert_repository(conn, &event.repository)?;
    let author_id = upsert_user(conn, &event.author)?;
    let pr_id = upsert_pull_request(conn, repo_id, author_id, &event.pull_request)?;
    debug!(
        "Applied pull_request {} for {}#{}",
        event.action.as_str(),
        event.repository.full_name,
        event.pull_request.number
    );
    Ok(pr_id)
}

fn apply_review(conn: &Connection, event: &ReviewEvent) -> Result<PullRequestId, StoreError> {
    let repo_id = upsert_repository(conn, &event.repository)?;
    let author_id = upsert_user(conn, &event.pr_author)?;
    let pr_id = upsert_pull_request(conn, repo_id, author_id, &event.pull_request)?;
    let reviewer_id = upsert_user(conn, &event.reviewer)?;
    insert_review(conn, pr_id, reviewer_id, &event.review)?;
    Ok(pr_id)
}

fn apply_review_comment(
    conn: &Connection,
    event: &ReviewCommentEvent,
) -> Result<PullRequestId, StoreError> {
    let repo_id = upsert_repository(conn, &event.repository)?;
    let author_id = upsert_user(conn, &event.pr_author)?;
    let pr_id = upsert_pull_request(conn, repo_id, author_id, &event.pull_request)?;
    let commenter_id = upsert_user(conn, &event.commenter)?;
    insert_review_comment(conn, pr_id, commenter_id, &event.comment)?;
    Ok(pr_id)
}

/// Insert or reconcile a repository by `full_name`.
///
/// A stored `github_id` of 0 means "not yet known" and is replaced by the
/// first non-zero id seen; a known id is never overwritten.
pub(crate) fn upsert_repository(
    conn: &Connection,
    repository: &RepositoryRef,
) -> Result<RepositoryId, StoreError> {
    let github_id = github_id_to_i64("repository", repository.github_id)?;
    conn.query_row(
        r#"
        INSERT INTO repositories (github_id, name, full_name, created_at)
        VALUES (?1, ?2, ?3, ?4)
        ON CONFLICT(full_name) DO UPDATE SET
            name = excluded.name,
            github_id = CASE
                WHEN repositories.github_id = 0 THEN excluded.github_id
                ELSE repositories.github_id
            END
        RETURNING id
        "#,
        params![
            github_id,
            repository.name,
            repository.full_name,
            to_epoch(Utc::now())
        ],
        |row| row.get(0),
    )
    .map(RepositoryId)
    .map_err(|e| StoreError::storage("upsert repository", e.to_string()))
}

/// Insert or update a user by `username`. A missing avatar never erases a
/// known one.
pub(crate) fn upsert_user(conn: &Connection, user: &UserRef) -> Result<UserId, StoreError> {
    let github_id = github_id_to_i64("user", user.github_id)?;
    conn.query_row(
        r#"
        INSERT INTO users (github_id, username, avatar_url, created_at)
        VALUES (?1, ?2, ?3, ?4)
        ON CONFLICT(username) DO UPDATE SET
            avatar_url = COALESCE(excluded.avatar_url, users.avatar_url),
            github_id = CASE
                WHEN users.github_id = 0 THEN excluded.github_id
                ELSE users.github_id
            END
        RETURNING id
        "#,
        params![github_id, user.username, user.avatar_url, to_epoch(Utc::now())],
        |row| row.get(0),
    )
    .map(UserId)
    .map_err(|e| StoreError::storage("upsert user", e.to_string()))
}

/// Insert or update a pull request by `(repository_id, number)`.
///
/// Snapshot fields are only replaced by a snapshot that is at least as new as
/// the stored one, so a delayed redelivery cannot roll the title or state
/// back. `updated_at` and `last_activity_at` only move forward. `is_stale`
/// is owned by the staleness engine and never written here.
pub(crate) fn upsert_pull_request(
    conn: &Connection,
    repository_id: RepositoryId,
    author_id: UserId,
    pr: &PullRequestRef,
) -> Result<PullRequestId, StoreError> {
    let github_id = github_id_to_i64("pull request", pr.github_id)?;
    let number = github_id_to_i64("pull request number", pr.number)?;
    conn.query_row(
        r#"
        INSERT INTO pull_requests (
            github_id, repository_id, author_id, title, number, html_url, state,
            created_at, updated_at, closed_at, merged_at, is_stale, last_activity_at
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 0, ?12)
        ON CONFLICT(repository_id, number) DO UPDATE SET
            github_id = CASE
                WHEN pull_requests.github_id = 0 THEN excluded.github_id
                ELSE pull_requests.github_id
            END,
            title = CASE WHEN excluded.updated_at >= pull_requests.updated_at
                THEN excluded.title ELSE pull_requests.title END,
            html_url = CASE WHEN excluded.updated_at >= pull_requests.updated_at
                THEN excluded.html_url ELSE pull_requests.html_url END,
            state = CASE WHEN excluded.updated_at >= pull_requests.updated_at
                THEN excluded.state ELSE pull_requests.state END,
            closed_at = CASE WHEN excluded.updated_at >= pull_requests.updated_at
                THEN excluded.closed_at ELSE pull_requests.closed_at END,
            merged_at = CASE WHEN excluded.updated_at >= pull_requests.updated_at
                THEN excluded.merged_at ELSE pull_requests.merged_at END,
            updated_at = MAX(pull_requests.updated_at, excluded.updated_at),
            last_activity_at = MAX(pull_requests.last_activity_at, excluded.last_activity_at)
        RETURNING id
        "#,
        params![
            github_id,
            repository_id.0,
            author_id.0,
            pr.title,
            number,
            pr.html_url,
            pr.state.as_str(),
            to_epoch(pr.created_at),
            to_epoch(pr.updated_at),
            pr.closed_at.map(to_epoch),
            pr.merged_at.map(to_epoch),
            to_epoch(pr.activity_at),
        ],
        |row| row.get(0),
    )
    .map(PullRequestId)
    .map_err(|e| StoreError::storage("upsert pull request", e.to_string()))
}

/// Record a review and advance the parent's activity to its submission time.
///
/// Keyed by GitHub's review id: a redelivered or edited review updates its
/// row in place.
pub(crate) fn insert_review(
    conn: &Connection,
    pull_request_id: PullRequestId,
    reviewer_id: UserId,
    review: &ReviewRef,
) -> Result<(), StoreError> {
    let github_id = github_id_to_i64("review", review.github_id)?;
    conn.execute(
        r#"
        INSERT INTO reviews (github_id, pull_request_id, reviewer_id, state, html_url, submitted_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        ON CONFLICT(github_id) DO UPDATE SET
            state = excluded.state,
            html_url = excluded.html_url
        "#,
        params![
            github_id,
            pull_request_id.0,
            reviewer_id.0,
            review.state.as_str(),
            review.html_url,
            to_epoch(review.submitted_at),
        ],
    )
    .map_err(|e| StoreError::storage("insert review", e.to_string()))?;

    advance_activity(conn, pull_request_id, to_epoch(review.submitted_at))
}

/// Record a review comment and advance the parent's activity to its creation
/// time. Keyed by GitHub's comment id.
pub(crate) fn insert_review_comment(
    conn: &Connection,
    pull_request_id: PullRequestId,
    author_id: UserId,
    comment: &ReviewCommentRef,
) -> Result<(), StoreError> {
    let github_id = github_id_to_i64("review comment", comment.github_id)?;
    conn.execute(
        r#"
        INSERT INTO review_comments (github_id, pull_request_id, author_id, body, html_url, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        ON CONFLICT(github_id) DO UPDATE SET
            body = excluded.body,
            html_url = excluded.html_url
        "#,
        params![
            github_id,
            pull_request_id.0,
            author_id.0,
            comment.body,
            comment.html_url,
            to_epoch(comment.created_at),
        ],
    )
    .map_err(|e| StoreError::storage("insert review comment", e.to_string()))?;

    advance_activity(conn, pull_request_id, to_epoch(comment.created_at))
}

fn advance_activity(
    conn: &Connection,
    pull_request_id: PullRequestId,
    activity_at: i64,
) -> Result<(), StoreError> {
    conn.execute(
        "UPDATE pull_requests SET last_activity_at = MAX(last_activity_at, ?2) WHERE id = ?1",
        params![pull_request_id.0, activity_at],
    )
    .map_err(|e| StoreError::storage("advance pull request activity", e.to_string()))?;
    Ok(())
}
