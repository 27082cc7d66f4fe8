//! Webhook Handlers
//!
//! Registration surface plus the manual event-publish endpoint.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::models::event::{CustomEvent, Event, EventKind};
use crate::models::webhook::{
    CreateWebhookRequest, PatchWebhookRequest, PublishEventRequest, TestWebhookRequest,
    WebhookSubscription,
};
use crate::AppState;

pub async fn create(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateWebhookRequest>,
) -> CoreResult<(StatusCode, Json<WebhookSubscription>)> {
    let subscription = state.webhooks.create(&req.url, req.events).await?;
    Ok((StatusCode::CREATED, Json(subscription)))
}

pub async fn list(
    State(state): State<Arc<AppState>>,
) -> CoreResult<Json<Vec<WebhookSubscription>>> {
    Ok(Json(state.webhooks.list().await?))
}

pub async fn get(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> CoreResult<Json<WebhookSubscription>> {
    Ok(Json(state.webhooks.get(id).await?))
}

pub async fn delete(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> CoreResult<StatusCode> {
    state.webhooks.delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn patch(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<PatchWebhookRequest>,
) -> CoreResult<Json<WebhookSubscription>> {
    Ok(Json(state.webhooks.patch(id, req).await?))
}

pub async fn test(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TestWebhookRequest>,
) -> CoreResult<Json<serde_json::Value>> {
    let attempts = state.webhooks.send_test(&req.url).await?;
    Ok(Json(serde_json::json!({
        "delivered": true,
        "attempts": attempts,
    })))
}

/// Inject an event onto the bus by hand. The kind must be one of the closed
/// set; subscribers and webhooks see it like any core-published event.
pub async fn publish_event(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PublishEventRequest>,
) -> CoreResult<(StatusCode, Json<serde_json::Value>)> {
    let kind: EventKind = req
        .event_type
        .parse()
        .map_err(CoreError::Validation)?;

    state.bus.publish(Event::Custom(CustomEvent {
        kind,
        data: req.event_data,
        ts: Utc::now().timestamp_millis(),
    }));

    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "published": true, "event_type": kind.to_string() })),
    ))
}

pub async fn event_types() -> Json<Vec<String>> {
    Json(EventKind::ALL.iter().map(|k| k.to_string()).collect())
}
