//! Webhook Registry and Delivery
//!
//! Registry CRUD over the shared store plus the outbound delivery worker:
//! a wildcard bus subscriber that POSTs matching events to every active
//! subscription. Delivery retries with exponential backoff, at most three
//! attempts by default, and never blocks the bus — each delivery runs as
//! its own task.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::db::Database;
use crate::error::{CoreError, CoreResult};
use crate::models::event::{Event, EventFilter};
use crate::models::webhook::{validate_event_list, PatchWebhookRequest, WebhookSubscription};
use crate::services::events::EventBus;

const DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);
const BACKOFF_BASE: Duration = Duration::from_millis(500);

pub struct WebhookService {
    db: Database,
    client: reqwest::Client,
    max_attempts: u32,
}

impl WebhookService {
    pub fn new(db: Database, max_attempts: u32) -> Self {
        Self {
            db,
            client: reqwest::Client::new(),
            max_attempts: max_attempts.max(1),
        }
    }

    // ========================================================================
    // Registry
    // ========================================================================

    pub async fn create(&self, url: &str, events: Vec<String>) -> CoreResult<WebhookSubscription> {
        Self::validate_url(url)?;
        validate_event_list(&events).map_err(CoreError::Validation)?;

        let subscription = WebhookSubscription {
            id: Uuid::new_v4(),
            url: url.to_string(),
            events,
            active: true,
            created_at: Utc::now().timestamp_millis(),
        };

        sqlx::query(
            "INSERT INTO webhooks (id, url, events, active, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(subscription.id.to_string())
        .bind(&subscription.url)
        .bind(serde_json::to_string(&subscription.events).unwrap_or_default())
        .bind(subscription.active as i64)
        .bind(subscription.created_at)
        .execute(&self.db.pool)
        .await?;

        info!(webhook = %subscription.id, url = %subscription.url, "webhook registered");
        Ok(subscription)
    }

    pub async fn list(&self) -> CoreResult<Vec<WebhookSubscription>> {
        let rows: Vec<(String, String, String, i64, i64)> =
            sqlx::query_as("SELECT id, url, events, active, created_at FROM webhooks ORDER BY created_at")
                .fetch_all(&self.db.pool)
                .await?;
        rows.into_iter().map(Self::row_to_subscription).collect()
    }

    pub async fn get(&self, id: Uuid) -> CoreResult<WebhookSubscription> {
        let row: Option<(String, String, String, i64, i64)> = sqlx::query_as(
            "SELECT id, url, events, active, created_at FROM webhooks WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(&self.db.pool)
        .await?;

        row.map(Self::row_to_subscription)
            .transpose()?
            .ok_or_else(|| CoreError::NotFound(format!("unknown webhook: {}", id)))
    }

    pub async fn delete(&self, id: Uuid) -> CoreResult<()> {
        let result = sqlx::query("DELETE FROM webhooks WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.db.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("unknown webhook: {}", id)));
        }
        info!(webhook = %id, "webhook deleted");
        Ok(())
    }

    pub async fn patch(
        &self,
        id: Uuid,
        patch: PatchWebhookRequest,
    ) -> CoreResult<WebhookSubscription> {
        let mut subscription = self.get(id).await?;

        if let Some(url) = patch.url {
            Self::validate_url(&url)?;
            subscription.url = url;
        }
        if let Some(events) = patch.events {
            validate_event_list(&events).map_err(CoreError::Validation)?;
            subscription.events = events;
        }
        if let Some(active) = patch.active {
            subscription.active = active;
        }

        sqlx::query("UPDATE webhooks SET url = ?, events = ?, active = ? WHERE id = ?")
            .bind(&subscription.url)
            .bind(serde_json::to_string(&subscription.events).unwrap_or_default())
            .bind(subscription.active as i64)
            .bind(id.to_string())
            .execute(&self.db.pool)
            .await?;

        Ok(subscription)
    }

    fn validate_url(url: &str) -> CoreResult<()> {
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(CoreError::Validation(format!(
                "url must be http(s): {}",
                url
            )));
        }
        Ok(())
    }

    fn row_to_subscription(
        row: (String, String, String, i64, i64),
    ) -> CoreResult<WebhookSubscription> {
        let (id, url, events, active, created_at) = row;
        Ok(WebhookSubscription {
            id: Uuid::parse_str(&id)
                .map_err(|e| CoreError::internal(format!("bad webhook id in store: {}", e)))?,
            url,
            events: serde_json::from_str(&events)
                .map_err(|e| CoreError::internal(format!("bad webhook events in store: {}", e)))?,
            active: active != 0,
            created_at,
        })
    }

    // ========================================================================
    // Delivery
    // ========================================================================

    /// POST one payload with exponential backoff. Returns the attempts used,
    /// or the last error if every attempt failed.
    pub async fn deliver(&self, url: &str, payload: &serde_json::Value) -> CoreResult<u32> {
        let mut last_error = String::new();
        for attempt in 1..=self.max_attempts {
            if attempt > 1 {
                tokio::time::sleep(BACKOFF_BASE * 2u32.pow(attempt - 2)).await;
            }
            let result = self
                .client
                .post(url)
                .timeout(DELIVERY_TIMEOUT)
                .json(payload)
                .send()
                .await;
            match result {
                Ok(response) if response.status().is_success() => {
                    debug!(url, attempt, "webhook delivered");
                    return Ok(attempt);
                }
                Ok(response) => {
                    last_error = format!("status {}", response.status());
                    warn!(url, attempt, "webhook delivery rejected: {}", last_error);
                }
                Err(e) => {
                    last_error = e.to_string();
                    warn!(url, attempt, "webhook delivery failed: {}", last_error);
                }
            }
        }
        Err(CoreError::internal(format!(
            "webhook delivery to {} failed after {} attempts: {}",
            url, self.max_attempts, last_error
        )))
    }

    /// Fire a probe payload at a URL (the registration test surface)
    pub async fn send_test(&self, url: &str) -> CoreResult<u32> {
        Self::validate_url(url)?;
        let payload = serde_json::json!({
            "event_type": "TEST",
            "event_data": { "message": "webhook connectivity test" },
            "ts": Utc::now().timestamp_millis(),
        });
        self.deliver(url, &payload).await
    }
}

/// Consume the bus and fan events out to registered webhooks. Each delivery
/// runs detached so one slow endpoint cannot stall the subscription queue.
pub fn spawn_delivery_worker(service: Arc<WebhookService>, bus: EventBus) {
    tokio::spawn(async move {
        let mut subscription = bus.subscribe(EventFilter::all());
        info!("webhook delivery worker started");

        while let Some(event) = subscription.recv().await {
            if event.is_overflow() {
                error!("webhook delivery worker overflowed its queue; restarting subscription");
                subscription = bus.subscribe(EventFilter::all());
                continue;
            }
            let kind = match event.kind() {
                Some(kind) => kind,
                // Internal notices are not webhook-subscribable
                None => continue,
            };

            let targets = match service.list().await {
                Ok(subscriptions) => subscriptions,
                Err(e) => {
                    error!("webhook registry read failed: {}", e);
                    continue;
                }
            };

            let payload = serde_json::json!({
                "event_type": kind.to_string(),
                "event_data": event,
                "ts": Utc::now().timestamp_millis(),
            });

            for target in targets.into_iter().filter(|t| t.wants(kind)) {
                let service = Arc::clone(&service);
                let payload = payload.clone();
                tokio::spawn(async move {
                    if let Err(e) = service.deliver(&target.url, &payload).await {
                        error!(webhook = %target.id, "giving up on delivery: {}", e);
                    }
                });
            }
        }

        warn!("webhook delivery worker stopped");
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn service() -> WebhookService {
        let db = Database::connect_ephemeral().await.unwrap();
        WebhookService::new(db, 3)
    }

    #[tokio::test]
    async fn test_create_list_get_delete() {
        let service = service().await;
        let created = service
            .create("http://localhost:9000/hook", vec!["ORDER_EXECUTED".to_string()])
            .await
            .unwrap();

        let listed = service.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, created.id);

        let fetched = service.get(created.id).await.unwrap();
        assert!(fetched.active);
        assert_eq!(fetched.events, vec!["ORDER_EXECUTED".to_string()]);

        service.delete(created.id).await.unwrap();
        assert_eq!(service.get(created.id).await.unwrap_err().code(), "NOT_FOUND");
        assert_eq!(service.delete(created.id).await.unwrap_err().code(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_create_validations() {
        let service = service().await;
        assert_eq!(
            service
                .create("ftp://example.com", vec!["*".to_string()])
                .await
                .unwrap_err()
                .code(),
            "VALIDATION"
        );
        assert_eq!(
            service
                .create("http://example.com", vec!["NOT_A_KIND".to_string()])
                .await
                .unwrap_err()
                .code(),
            "VALIDATION"
        );
        assert_eq!(
            service
                .create("http://example.com", vec![])
                .await
                .unwrap_err()
                .code(),
            "VALIDATION"
        );
    }

    #[tokio::test]
    async fn test_patch_updates_fields() {
        let service = service().await;
        let created = service
            .create("http://localhost:9000/hook", vec!["*".to_string()])
            .await
            .unwrap();

        let patched = service
            .patch(
                created.id,
                PatchWebhookRequest {
                    url: None,
                    events: Some(vec!["PRICE_UPDATE".to_string()]),
                    active: Some(false),
                },
            )
            .await
            .unwrap();
        assert!(!patched.active);
        assert_eq!(patched.events, vec!["PRICE_UPDATE".to_string()]);
        assert_eq!(patched.url, "http://localhost:9000/hook");

        let reloaded = service.get(created.id).await.unwrap();
        assert!(!reloaded.active);
    }
}
