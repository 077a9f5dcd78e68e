use axum::{
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::post,
    Router,
};
use prequel_core::event::{DELIVERY_HEADER, EVENT_HEADER};
use prequel_core::signature::{self, SIGNATURE_HEADER};
use prequel_core::{
    normalize, CorrelationId, Direction, EventType, Normalized, NormalizedEvent, RecordedEvent,
    Sanitizer,
};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::notification;
use crate::AppState;

/// GitHub caps webhook payloads at 25 MB.
pub const MAX_WEBHOOK_BODY_BYTES: usize = 25 * 1024 * 1024;

#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    pub status: &'static str,
    pub message: String,
}

impl WebhookResponse {
    fn success(message: impl Into<String>) -> (StatusCode, Json<Self>) {
        (
            StatusCode::OK,
            Json(Self {
                status: "success",
                message: message.into(),
            }),
        )
    }

    fn error(status: StatusCode, message: impl Into<String>) -> (StatusCode, Json<Self>) {
        (
            status,
            Json(Self {
                status: "error",
                message: message.into(),
            }),
        )
    }
}

async fn verify_webhook_signature(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let correlation_id = CorrelationId::generate();

    let (parts, body) = request.into_parts();
    let bytes = match axum::body::to_bytes(body, MAX_WEBHOOK_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!("Rejecting webhook body: {}", e);
            return WebhookResponse::error(
                StatusCode::PAYLOAD_TOO_LARGE,
                "Request body too large",
            )
            .into_response();
        }
    };

    let header = parts
        .headers
        .get(SIGNATURE_HEADER)
        .and_then(|h| h.to_str().ok());

    if !signature::verify(&bytes, header, &state.webhook_secret) {
        error!("Invalid webhook signature");
        return WebhookResponse::error(StatusCode::BAD_REQUEST, "Invalid signature")
            .into_response();
    }

    if let Some(ref logger) = state.recording_logger {
        let headers_map = headers_to_hashmap(&parts.headers);
        let body = serde_json::from_slice::<serde_json::Value>(&bytes)
            .map(|v| Sanitizer::sanitize_json(&v))
            .unwrap_or(serde_json::Value::Null);
        logger.record(RecordedEvent {
            timestamp: chrono::Utc::now().to_rfc3339(),
            correlation_id: correlation_id.0.clone(),
            event_type: EventType::WebhookReceived,
            direction: Direction::Request,
            operation: "webhook".to_string(),
            data: serde_json::json!({
                "headers": Sanitizer::sanitize_headers(&headers_map),
                "body": body,
            }),
            metadata: HashMap::new(),
        });
    }

    let mut request = Request::from_parts(parts, axum::body::Body::from(bytes));
    request.extensions_mut().insert(correlation_id);

    next.run(request).await
}

fn headers_to_hashmap(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.to_string(), v.to_string()))
        })
        .collect()
}

fn success_message(event: &NormalizedEvent) -> &'static str {
    match event {
        NormalizedEvent::PullRequest(_) => "PR processed",
        NormalizedEvent::Review(_) => "Review processed",
        NormalizedEvent::ReviewComment(_) => "Comment processed",
        NormalizedEvent::Ping { .. } => "Pong!",
    }
}

pub async fn github_webhook_handler(
    State(state): State<Arc<AppState>>,
    request: Request,
) -> (StatusCode, Json<WebhookResponse>) {
    let correlation_id = request
        .extensions()
        .get::<CorrelationId>()
        .map(|id| id.0.clone())
        .unwrap_or_default();

    let (parts, body) = request.into_parts();
    let delivery = parts
        .headers
        .get(DELIVERY_HEADER)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("unknown")
        .to_string();

    let Some(event_type) = parts
        .headers
        .get(EVENT_HEADER)
        .and_then(|h| h.to_str().ok())
        .map(str::to_string)
    else {
        info!("Delivery {} has no event type header, ignoring", delivery);
        return WebhookResponse::success("Event received");
    };

    info!(
        "Received {} webhook (delivery {}, correlation {})",
        event_type, delivery, correlation_id
    );

    // Already size-limited by the signature middleware.
    let bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(e) => {
            error!("Failed to read verified webhook body: {}", e);
            return WebhookResponse::error(StatusCode::BAD_REQUEST, "Unreadable body");
        }
    };

    let payload: serde_json::Value = match serde_json::from_slice(&bytes) {
        Ok(payload) => payload,
        Err(e) => {
            warn!("Delivery {} is not valid JSON: {}", delivery, e);
            return WebhookResponse::success("Malformed payload ignored");
        }
    };

    let event = match normalize(&event_type, &payload) {
        Ok(Normalized::Event(event)) => event,
        Ok(Normalized::Ignored(reason)) => {
            info!("Ignoring delivery {}: {}", delivery, reason);
            return WebhookResponse::success("Event received");
        }
        Err(e) => {
            warn!("Delivery {}: {}", delivery, e);
            return WebhookResponse::success("Malformed payload ignored");
        }
    };

    if let NormalizedEvent::Ping { zen } = &event {
        info!("Ping received: {}", zen.as_deref().unwrap_or(""));
        return WebhookResponse::success(success_message(&event));
    }

    let message = success_message(&event);
    let kind = event.kind();
    let notification = notification::for_event(&event);

    match tokio::time::timeout(state.db_timeout, state.repository.upserts.apply_event(event))
        .await
    {
        Ok(Ok(pr_id)) => {
            info!(
                "Stored {} from delivery {} (pull request {:?})",
                kind,
                delivery,
                pr_id.map(|id| id.0)
            );
        }
        Ok(Err(e)) => {
            error!("Failed to store {} from delivery {}: {}", kind, delivery, e);
            return WebhookResponse::error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to process event",
            );
        }
        Err(_) => {
            error!(
                "Storing {} from delivery {} timed out after {:?}",
                kind, delivery, state.db_timeout
            );
            return WebhookResponse::error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Timed out processing event",
            );
        }
    }

    if let Some(notification) = notification {
        state.dispatcher.dispatch(notification);
    }

    WebhookResponse::success(message)
}

pub fn webhook_router(middleware_state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/webhook", post(github_webhook_handler))
        .route("/", post(github_webhook_handler))
        .route_layer(middleware::from_fn_with_state(
            middleware_state,
            verify_webhook_signature,
        ))
}
