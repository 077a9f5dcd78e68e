//! Webhook payload normalization.
//!
//! Raw GitHub payloads are deserialized into permissive structs where every
//! field is optional, then validated into the internal shapes in
//! [`crate::model`]. Missing required fields surface as [`MalformedPayload`]
//! naming the field, rather than as an opaque serde error.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::fmt;

use crate::model::{
    PrState, PullRequestRef, RepositoryRef, ReviewCommentRef, ReviewRef, ReviewState, UserRef,
};

/// Header carrying the event type.
pub const EVENT_HEADER: &str = "x-github-event";
/// Header carrying the unique delivery id.
pub const DELIVERY_HEADER: &str = "x-github-delivery";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullRequestAction {
    Opened,
    Reopened,
    Synchronize,
    Edited,
}

impl PullRequestAction {
    fn parse(action: &str) -> Option<Self> {
        match action {
            "opened" => Some(PullRequestAction::Opened),
            "reopened" => Some(PullRequestAction::Reopened),
            "synchronize" => Some(PullRequestAction::Synchronize),
            "edited" => Some(PullRequestAction::Edited),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PullRequestAction::Opened => "opened",
            PullRequestAction::Reopened => "reopened",
            PullRequestAction::Synchronize => "synchronize",
            PullRequestAction::Edited => "edited",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewAction {
    Submitted,
    Edited,
    Dismissed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequestEvent {
    pub action: PullRequestAction,
    pub repository: RepositoryRef,
    pub author: UserRef,
    pub pull_request: PullRequestRef,
    pub body: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewEvent {
    pub action: ReviewAction,
    pub repository: RepositoryRef,
    pub pr_author: UserRef,
    pub pull_request: PullRequestRef,
    pub reviewer: UserRef,
    pub review: ReviewRef,
    pub body: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewCommentEvent {
    pub repository: RepositoryRef,
    pub pr_author: UserRef,
    pub pull_request: PullRequestRef,
    pub commenter: UserRef,
    pub comment: ReviewCommentRef,
}

/// The internal, validated representation of a webhook delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NormalizedEvent {
    PullRequest(PullRequestEvent),
    Review(ReviewEvent),
    ReviewComment(ReviewCommentEvent),
    Ping { zen: Option<String> },
}

impl NormalizedEvent {
    /// Short label used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            NormalizedEvent::PullRequest(_) => "pull_request",
            NormalizedEvent::Review(_) => "pull_request_review",
            NormalizedEvent::ReviewComment(_) => "pull_request_review_comment",
            NormalizedEvent::Ping { .. } => "ping",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IgnoreReason {
    UnsupportedEvent(String),
    UnsupportedAction { event: String, action: String },
    PendingReview,
}

impl fmt::Display for IgnoreReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IgnoreReason::UnsupportedEvent(event) => write!(f, "unsupported event '{}'", event),
            IgnoreReason::UnsupportedAction { event, action } => {
                write!(f, "unsupported action '{}' for '{}'", action, event)
            }
            IgnoreReason::PendingReview => write!(f, "review is still pending"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Normalized {
    Event(NormalizedEvent),
    Ignored(IgnoreReason),
}

/// A payload that lacks fields required for its event type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedPayload {
    pub event_type: String,
    pub detail: String,
}

impl MalformedPayload {
    fn missing(event_type: &str, field: &str) -> Self {
        Self {
            event_type: event_type.to_string(),
            detail: format!("missing required field '{}'", field),
        }
    }

    fn invalid(event_type: &str, detail: impl fmt::Display) -> Self {
        Self {
            event_type: event_type.to_string(),
            detail: detail.to_string(),
        }
    }
}

impl fmt::Display for MalformedPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "malformed {} payload: {}", self.event_type, self.detail)
    }
}

impl std::error::Error for MalformedPayload {}

#[derive(Debug, Deserialize)]
struct RawPayload {
    action: Option<String>,
    repository: Option<RawRepository>,
    pull_request: Option<RawPullRequest>,
    review: Option<RawReview>,
    comment: Option<RawComment>,
    zen: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawRepository {
    id: Option<u64>,
    name: Option<String>,
    full_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawUser {
    id: Option<u64>,
    login: Option<String>,
    avatar_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawPullRequest {
    id: Option<u64>,
    number: Option<u64>,
    title: Option<String>,
    body: Option<String>,
    html_url: Option<String>,
    state: Option<String>,
    merged: Option<bool>,
    created_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
    closed_at: Option<DateTime<Utc>>,
    merged_at: Option<DateTime<Utc>>,
    user: Option<RawUser>,
}

#[derive(Debug, Deserialize)]
struct RawReview {
    id: Option<u64>,
    body: Option<String>,
    state: Option<String>,
    html_url: Option<String>,
    submitted_at: Option<DateTime<Utc>>,
    user: Option<RawUser>,
}

#[derive(Debug, Deserialize)]
struct RawComment {
    id: Option<u64>,
    body: Option<String>,
    html_url: Option<String>,
    created_at: Option<DateTime<Utc>>,
    user: Option<RawUser>,
}

/// Map a raw webhook payload into a [`NormalizedEvent`], or explain why it
/// was ignored.
pub fn normalize(
    event_type: &str,
    payload: &serde_json::Value,
) -> Result<Normalized, MalformedPayload> {
    match event_type {
        "pull_request" | "pull_request_review" | "pull_request_review_comment" | "ping" => {}
        other => {
            return Ok(Normalized::Ignored(IgnoreReason::UnsupportedEvent(
                other.to_string(),
            )))
        }
    }

    let raw = RawPayload::deserialize(payload)
        .map_err(|e| MalformedPayload::invalid(event_type, e))?;

    match event_type {
        "pull_request" => normalize_pull_request(raw),
        "pull_request_review" => normalize_review(raw),
        "pull_request_review_comment" => normalize_review_comment(raw),
        _ => Ok(Normalized::Event(NormalizedEvent::Ping { zen: raw.zen })),
    }
}

fn unsupported_action(event: &str, action: &str) -> Normalized {
    Normalized::Ignored(IgnoreReason::UnsupportedAction {
        event: event.to_string(),
        action: action.to_string(),
    })
}

fn normalize_pull_request(raw: RawPayload) -> Result<Normalized, MalformedPayload> {
    const EVENT: &str = "pull_request";

    let action_str = raw
        .action
        .as_deref()
        .ok_or_else(|| MalformedPayload::missing(EVENT, "action"))?;
    let Some(action) = PullRequestAction::parse(action_str) else {
        return Ok(unsupported_action(EVENT, action_str));
    };

    let repository = repository_ref(EVENT, raw.repository)?;
    let raw_pr = raw
        .pull_request
        .ok_or_else(|| MalformedPayload::missing(EVENT, "pull_request"))?;
    let body = raw_pr.body.clone();
    let (pull_request, author) = pull_request_ref(EVENT, raw_pr, ActivitySource::UpdatedAt)?;

    Ok(Normalized::Event(NormalizedEvent::PullRequest(
        PullRequestEvent {
            action,
            repository,
            author,
            pull_request,
            body,
        },
    )))
}

fn normalize_review(raw: RawPayload) -> Result<Normalized, MalformedPayload> {
    const EVENT: &str = "pull_request_review";

    let action_str = raw
        .action
        .as_deref()
        .ok_or_else(|| MalformedPayload::missing(EVENT, "action"))?;
    let action = match action_str {
        "submitted" => ReviewAction::Submitted,
        "edited" => ReviewAction::Edited,
        "dismissed" => ReviewAction::Dismissed,
        other => return Ok(unsupported_action(EVENT, other)),
    };

    let raw_review = raw
        .review
        .ok_or_else(|| MalformedPayload::missing(EVENT, "review"))?;
    let state_str = raw_review
        .state
        .as_deref()
        .ok_or_else(|| MalformedPayload::missing(EVENT, "review.state"))?;
    if state_str.eq_ignore_ascii_case("pending") {
        return Ok(Normalized::Ignored(IgnoreReason::PendingReview));
    }
    let state = ReviewState::parse(state_str).ok_or_else(|| {
        MalformedPayload::invalid(EVENT, format!("unknown review state '{}'", state_str))
    })?;

    let repository = repository_ref(EVENT, raw.repository)?;
    let (pull_request, pr_author) = pull_request_ref(
        EVENT,
        raw.pull_request
            .ok_or_else(|| MalformedPayload::missing(EVENT, "pull_request"))?,
        ActivitySource::CreatedAt,
    )?;
    let reviewer = user_ref(EVENT, "review.user", raw_review.user)?;

    let review = ReviewRef {
        github_id: raw_review
            .id
            .ok_or_else(|| MalformedPayload::missing(EVENT, "review.id"))?,
        state,
        html_url: raw_review.html_url.unwrap_or_default(),
        submitted_at: raw_review
            .submitted_at
            .ok_or_else(|| MalformedPayload::missing(EVENT, "review.submitted_at"))?,
    };

    Ok(Normalized::Event(NormalizedEvent::Review(ReviewEvent {
        action,
        repository,
        pr_author,
        pull_request,
        reviewer,
        review,
        body: raw_review.body.filter(|b| !b.is_empty()),
    })))
}

fn normalize_review_comment(raw: RawPayload) -> Result<Normalized, MalformedPayload> {
    const EVENT: &str = "pull_request_review_comment";

    let action_str = raw
        .action
        .as_deref()
        .ok_or_else(|| MalformedPayload::missing(EVENT, "action"))?;
    if action_str != "created" && action_str != "edited" {
        return Ok(unsupported_action(EVENT, action_str));
    }

    let raw_comment = raw
        .comment
        .ok_or_else(|| MalformedPayload::missing(EVENT, "comment"))?;
    let repository = repository_ref(EVENT, raw.repository)?;
    let (pull_request, pr_author) = pull_request_ref(
        EVENT,
        raw.pull_request
            .ok_or_else(|| MalformedPayload::missing(EVENT, "pull_request"))?,
        ActivitySource::CreatedAt,
    )?;
    let commenter = user_ref(EVENT, "comment.user", raw_comment.user)?;

    let comment = ReviewCommentRef {
        github_id: raw_comment
            .id
            .ok_or_else(|| MalformedPayload::missing(EVENT, "comment.id"))?,
        body: raw_comment.body.unwrap_or_default(),
        html_url: raw_comment.html_url.unwrap_or_default(),
        created_at: raw_comment
            .created_at
            .ok_or_else(|| MalformedPayload::missing(EVENT, "comment.created_at"))?,
    };

    Ok(Normalized::Event(NormalizedEvent::ReviewComment(
        ReviewCommentEvent {
            repository,
            pr_author,
            pull_request,
            commenter,
            comment,
        },
    )))
}

fn repository_ref(
    event: &str,
    raw: Option<RawRepository>,
) -> Result<RepositoryRef, MalformedPayload> {
    let raw = raw.ok_or_else(|| MalformedPayload::missing(event, "repository"))?;
    let full_name = raw
        .full_name
        .filter(|n| !n.is_empty())
        .ok_or_else(|| MalformedPayload::missing(event, "repository.full_name"))?;
    let name = match raw.name.filter(|n| !n.is_empty()) {
        Some(name) => name,
        None => full_name
            .rsplit('/')
            .next()
            .unwrap_or(full_name.as_str())
            .to_string(),
    };

    Ok(RepositoryRef {
        github_id: raw.id.unwrap_or(0),
        name,
        full_name,
    })
}

fn user_ref(event: &str, field: &str, raw: Option<RawUser>) -> Result<UserRef, MalformedPayload> {
    let raw = raw.ok_or_else(|| MalformedPayload::missing(event, field))?;
    let username = raw
        .login
        .filter(|l| !l.is_empty())
        .ok_or_else(|| MalformedPayload::missing(event, &format!("{}.login", field)))?;

    Ok(UserRef {
        github_id: raw.id.unwrap_or(0),
        username,
        avatar_url: raw.avatar_url.filter(|u| !u.is_empty()),
    })
}

/// Which pull request timestamp counts as activity for the event carrying it.
#[derive(Clone, Copy)]
enum ActivitySource {
    /// The snapshot itself is the activity (opened, synchronize, edited).
    UpdatedAt,
    /// The snapshot only rides along with a review or comment, which carries
    /// its own activity timestamp.
    CreatedAt,
}

fn pull_request_ref(
    event: &str,
    raw: RawPullRequest,
    activity: ActivitySource,
) -> Result<(PullRequestRef, UserRef), MalformedPayload> {
    let author = user_ref(event, "pull_request.user", raw.user)?;
    let number = raw
        .number
        .ok_or_else(|| MalformedPayload::missing(event, "pull_request.number"))?;
    let created_at = raw
        .created_at
        .ok_or_else(|| MalformedPayload::missing(event, "pull_request.created_at"))?;
    let updated_at = raw.updated_at.unwrap_or(created_at).max(created_at);

    let state = if raw.merged.unwrap_or(false) || raw.merged_at.is_some() {
        PrState::Merged
    } else {
        match raw.state.as_deref().and_then(PrState::parse) {
            Some(state) => state,
            None => {
                return Err(MalformedPayload::missing(event, "pull_request.state"));
            }
        }
    };

    let activity_at = match activity {
        ActivitySource::UpdatedAt => updated_at,
        ActivitySource::CreatedAt => created_at,
    };

    Ok((
        PullRequestRef {
            github_id: raw.id.unwrap_or(0),
            number,
            title: raw.title.unwrap_or_default(),
            html_url: raw.html_url.unwrap_or_default(),
            state,
            created_at,
            updated_at,
            closed_at: raw.closed_at,
            merged_at: raw.merged_at,
            activity_at,
        },
        author,
    ))
}
