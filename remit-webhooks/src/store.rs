use std::collections::HashMap;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use tokio::sync::Mutex;

use crate::TenantId;
use crate::WebhookError;
use crate::WebhookRecord;
use crate::WebhookResult;
use crate::WebhookStatus;

#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    Inserted(WebhookRecord),
    /// Unique (tenant, event_id) violation; the stored record is returned
    /// and the caller answers `duplicate=true` without further work.
    Duplicate(WebhookRecord),
}

#[async_trait]
pub trait WebhookStore: Send + Sync {
    async fn insert(&self, record: WebhookRecord) -> WebhookResult<InsertOutcome>;
    async fn get(&self, tenant: &TenantId, event_id: &str) -> WebhookResult<WebhookRecord>;
    async fn update(&self, record: WebhookRecord) -> WebhookResult<WebhookRecord>;
    /// Failed, not dead, and due: `next_attempt_at <= now`.
    async fn due_for_retry(&self, now: DateTime<Utc>) -> WebhookResult<Vec<WebhookRecord>>;
    async fn dead_letters(&self, tenant: &TenantId) -> WebhookResult<Vec<WebhookRecord>>;
    /// Admin-only backward transition: clears `dead_at`, stamps the audit
    /// fields, and makes the record due immediately.
    async fn revive(
        &self,
        tenant: &TenantId,
        event_id: &str,
        actor: &str,
        now: DateTime<Utc>,
    ) -> WebhookResult<WebhookRecord>;
    async fn list(&self, tenant: &TenantId) -> WebhookResult<Vec<WebhookRecord>>;
}

#[derive(Default)]
pub struct InMemoryWebhookStore {
    records: Mutex<HashMap<(TenantId, String), WebhookRecord>>,
}

impl InMemoryWebhookStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WebhookStore for InMemoryWebhookStore {
    async fn insert(&self, record: WebhookRecord) -> WebhookResult<InsertOutcome> {
        let mut records = self.records.lock().await;
        let record_key = (record.tenant_id.clone(), record.event_id.clone());
        if let Some(existing) = records.get(&record_key) {
            return Ok(InsertOutcome::Duplicate(existing.clone()));
        }
        records.insert(record_key, record.clone());
        Ok(InsertOutcome::Inserted(record))
    }

    async fn get(&self, tenant: &TenantId, event_id: &str) -> WebhookResult<WebhookRecord> {
        let records = self.records.lock().await;
        records
            .get(&(tenant.clone(), event_id.to_string()))
            .cloned()
            .ok_or_else(|| WebhookError::NotFound(format!("webhook {event_id}")))
    }

    async fn update(&self, record: WebhookRecord) -> WebhookResult<WebhookRecord> {
        let mut records = self.records.lock().await;
        let record_key = (record.tenant_id.clone(), record.event_id.clone());
        if !records.contains_key(&record_key) {
            return Err(WebhookError::NotFound(format!(
                "webhook {}",
                record.event_id
            )));
        }
        records.insert(record_key, record.clone());
        Ok(record)
    }

    async fn due_for_retry(&self, now: DateTime<Utc>) -> WebhookResult<Vec<WebhookRecord>> {
        let records = self.records.lock().await;
        let mut due: Vec<WebhookRecord> = records
            .values()
            .filter(|record| record.status == WebhookStatus::Failed)
            .filter(|record| record.dead_at.is_none())
            .filter(|record| record.next_attempt_at.is_some_and(|at| at <= now))
            .cloned()
            .collect();
        // Serial per tenant: group tenants together, oldest first within.
        due.sort_by(|a, b| {
            a.tenant_id
                .cmp(&b.tenant_id)
                .then(a.received_at.cmp(&b.received_at))
        });
        Ok(due)
    }

    async fn dead_letters(&self, tenant: &TenantId) -> WebhookResult<Vec<WebhookRecord>> {
        let records = self.records.lock().await;
        let mut dead: Vec<WebhookRecord> = records
            .values()
            .filter(|record| &record.tenant_id == tenant && record.is_dead())
            .cloned()
            .collect();
        dead.sort_by(|a, b| a.received_at.cmp(&b.received_at));
        Ok(dead)
    }

    async fn revive(
        &self,
        tenant: &TenantId,
        event_id: &str,
        actor: &str,
        now: DateTime<Utc>,
    ) -> WebhookResult<WebhookRecord> {
        let mut records = self.records.lock().await;
        let record = records
            .get_mut(&(tenant.clone(), event_id.to_string()))
            .ok_or_else(|| WebhookError::NotFound(format!("webhook {event_id}")))?;
        if !record.is_dead() {
            return Err(WebhookError::InvalidState(format!(
                "webhook {event_id} is not dead-lettered"
            )));
        }
        record.dead_at = None;
        record.next_attempt_at = Some(now);
        record.revived_at = Some(now);
        record.revived_by = Some(actor.to_string());
        tracing::info!(
            tenant_id = %tenant,
            event_id = %event_id,
            actor = %actor,
            "dead-lettered webhook revived"
        );
        Ok(record.clone())
    }

    async fn list(&self, tenant: &TenantId) -> WebhookResult<Vec<WebhookRecord>> {
        let records = self.records.lock().await;
        let mut list: Vec<WebhookRecord> = records
            .values()
            .filter(|record| &record.tenant_id == tenant)
            .cloned()
            .collect();
        list.sort_by(|a, b| a.received_at.cmp(&b.received_at));
        Ok(list)
    }
}
