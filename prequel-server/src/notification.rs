//! Best-effort outbound notifications.
//!
//! The webhook path hands a [`Notification`] to the [`NotificationDispatcher`],
//! which sends it on a background task under a timeout. Delivery failures are
//! logged and dropped; nothing is retried.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use prequel_core::event::{
    NormalizedEvent, PullRequestAction, PullRequestEvent, ReviewAction, ReviewEvent,
};
use prequel_core::{RecordingLogger, RecordingMiddleware, ReviewState};
use reqwest::Client;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::store::StalePr;

/// Slack rejects section blocks whose text is longer than this.
pub const SECTION_TEXT_LIMIT: usize = 3000;

/// A chat message: a title, a markdown body, labelled fields and link
/// buttons. Fields and actions keep their order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub title: String,
    pub body: String,
    pub fields: Vec<(String, String)>,
    pub actions: Vec<(String, String)>,
}

#[derive(Debug)]
pub enum NotificationError {
    Transport(String),
    Rejected { status: u16, body: String },
}

impl fmt::Display for NotificationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotificationError::Transport(msg) => write!(f, "notification transport error: {}", msg),
            NotificationError::Rejected { status, body } => {
                write!(f, "notification rejected with status {}: {}", status, body)
            }
        }
    }
}

impl std::error::Error for NotificationError {}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> Result<(), NotificationError>;
}

/// Posts Block Kit messages to a Slack incoming webhook.
pub struct SlackNotifier {
    client: ClientWithMiddleware,
    webhook_url: String,
}

impl SlackNotifier {
    pub fn new(
        webhook_url: String,
        timeout: Duration,
        recording_logger: Option<RecordingLogger>,
    ) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("prequel/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .context("Failed to create notification HTTP client")?;

        let mut builder = ClientBuilder::new(client);
        if let Some(logger) = recording_logger {
            builder = builder.with(RecordingMiddleware::new(logger));
        }

        Ok(Self {
            client: builder.build(),
            webhook_url,
        })
    }

    /// Render a notification as a Slack Block Kit payload.
    pub fn payload(notification: &Notification) -> Value {
        let mut blocks = vec![
            json!({
                "type": "header",
                "text": {"type": "plain_text", "text": notification.title, "emoji": true}
            }),
            json!({
                "type": "section",
                "text": {
                    "type": "mrkdwn",
                    "text": truncate_chars(&notification.body, SECTION_TEXT_LIMIT - ELLIPSIS.len())
                }
            }),
        ];

        if !notification.fields.is_empty() {
            let fields: Vec<Value> = notification
                .fields
                .iter()
                .map(|(label, value)| json!({"type": "mrkdwn", "text": format!("*{}:*\n{}", label, value)}))
                .collect();
            blocks.push(json!({"type": "section", "fields": fields}));
        }

        if !notification.actions.is_empty() {
            let elements: Vec<Value> = notification
                .actions
                .iter()
                .map(|(label, url)| {
                    json!({
                        "type": "button",
                        "text": {"type": "plain_text", "text": label, "emoji": true},
                        "url": url
                    })
                })
                .collect();
            blocks.push(json!({"type": "actions", "elements": elements}));
        }

        // `text` is the fallback shown in push notifications.
        json!({"text": notification.title, "blocks": blocks})
    }
}

#[async_trait]
impl Notifier for SlackNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotificationError> {
        let response = self
            .client
            .post(&self.webhook_url)
            .json(&Self::payload(notification))
            .send()
            .await
            .map_err(|e| NotificationError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NotificationError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

/// Fire-and-forget front end to a [`Notifier`].
#[derive(Clone)]
pub struct NotificationDispatcher {
    notifier: Option<Arc<dyn Notifier>>,
    timeout: Duration,
}

impl NotificationDispatcher {
    pub fn new(notifier: Arc<dyn Notifier>, timeout: Duration) -> Self {
        Self {
            notifier: Some(notifier),
            timeout,
        }
    }

    /// A dispatcher that drops every notification.
    pub fn disabled() -> Self {
        Self {
            notifier: None,
            timeout: Duration::ZERO,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.notifier.is_some()
    }

    /// Send `notification` on a background task. Never blocks the caller and
    /// never reports failure; the returned handle is only useful to tests.
    pub fn dispatch(&self, notification: Notification) -> Option<JoinHandle<()>> {
        let notifier = self.notifier.clone()?;
        let timeout = self.timeout;

        Some(tokio::spawn(async move {
            match tokio::time::timeout(timeout, notifier.notify(&notification)).await {
                Ok(Ok(())) => info!("Sent notification: {}", notification.title),
                Ok(Err(e)) => error!("Failed to send notification '{}': {}", notification.title, e),
                Err(_) => warn!(
                    "Notification '{}' timed out after {:?}, dropping",
                    notification.title, timeout
                ),
            }
        }))
    }
}

/// The notification, if any, a stored event should trigger.
pub fn for_event(event: &NormalizedEvent) -> Option<Notification> {
    match event {
        NormalizedEvent::PullRequest(pr) if pr.action == PullRequestAction::Opened => {
            Some(pr_opened(pr))
        }
        NormalizedEvent::Review(review) if review.action == ReviewAction::Submitted => {
            review_submitted(review)
        }
        _ => None,
    }
}

const DESCRIPTION_EXCERPT_CHARS: usize = 2000;

pub fn pr_opened(event: &PullRequestEvent) -> Notification {
    let description = event
        .body
        .as_deref()
        .filter(|b| !b.trim().is_empty())
        .map(|b| truncate_chars(b, DESCRIPTION_EXCERPT_CHARS))
        .unwrap_or_else(|| "No description provided.".to_string());

    Notification {
        title: "🔔 New Pull Request Created".to_string(),
        body: format!("*{}*\n{}", event.pull_request.title, description),
        fields: vec![
            ("Repository".to_string(), event.repository.full_name.clone()),
            ("Created by".to_string(), event.author.username.clone()),
        ],
        actions: vec![(
            "View Pull Request".to_string(),
            event.pull_request.html_url.clone(),
        )],
    }
}

const REVIEW_EXCERPT_CHARS: usize = 150;

/// Dismissed reviews notify nobody.
pub fn review_submitted(event: &ReviewEvent) -> Option<Notification> {
    let (emoji, verb) = match event.review.state {
        ReviewState::Approved => ("✅", "approved"),
        ReviewState::ChangesRequested => ("❌", "requested changes to"),
        ReviewState::Commented => ("💬", "commented on"),
        ReviewState::Dismissed => return None,
    };

    let mut body = format!(
        "{} *{}* {} <{}|#{} {}>",
        emoji,
        event.reviewer.username,
        verb,
        event.pull_request.html_url,
        event.pull_request.number,
        event.pull_request.title
    );
    if let Some(comment) = event.body.as_deref().filter(|b| !b.trim().is_empty()) {
        body.push_str("\n> ");
        body.push_str(&truncate_chars(comment, REVIEW_EXCERPT_CHARS));
    }

    Some(Notification {
        title: "Pull Request Reviewed".to_string(),
        body,
        fields: vec![
            ("Repository".to_string(), event.repository.full_name.clone()),
            ("Author".to_string(), event.pr_author.username.clone()),
        ],
        actions: vec![("View Review".to_string(), event.review.html_url.clone())],
    })
}

/// Slack allows a limited number of buttons per actions block.
const MAX_DIGEST_ACTIONS: usize = 5;
const MAX_DIGEST_LINES: usize = 20;
const DIGEST_TITLE_CHARS: usize = 80;
/// Room left for the trailing "and N more" line.
const DIGEST_OVERFLOW_RESERVE: usize = 32;

pub fn stale_digest(stale: &[StalePr], threshold_days: u32) -> Option<Notification> {
    if stale.is_empty() {
        return None;
    }

    let mut body = format!(
        "The following PRs have had no activity for more than {} days:",
        threshold_days
    );
    let mut body_chars = body.chars().count();
    let mut shown = 0;
    for pr in stale.iter().take(MAX_DIGEST_LINES) {
        let indicator = match pr.days_stale {
            21.. => "🔴",
            14..=20 => "🟠",
            _ => "🟡",
        };
        let line = format!(
            "\n{} <{}|#{} {}> in *{}* by *{}*, idle for *{}* days",
            indicator,
            pr.html_url,
            pr.number,
            truncate_chars(&pr.title, DIGEST_TITLE_CHARS),
            pr.repository_name,
            pr.author_name,
            pr.days_stale
        );
        let line_chars = line.chars().count();
        if body_chars + line_chars + DIGEST_OVERFLOW_RESERVE > SECTION_TEXT_LIMIT {
            break;
        }
        body.push_str(&line);
        body_chars += line_chars;
        shown += 1;
    }
    if shown < stale.len() {
        body.push_str(&format!("\n…and {} more", stale.len() - shown));
    }

    Some(Notification {
        title: "⚠️ Stale Pull Requests Alert".to_string(),
        body,
        fields: vec![("Stale PRs".to_string(), stale.len().to_string())],
        actions: stale
            .iter()
            .take(MAX_DIGEST_ACTIONS)
            .map(|pr| (format!("Review #{}", pr.number), pr.html_url.clone()))
            .collect(),
    })
}

const ELLIPSIS: &str = "...";

fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}{}", &s[..idx], ELLIPSIS),
        None => s.to_string(),
    }
}
