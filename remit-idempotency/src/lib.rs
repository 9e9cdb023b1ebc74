#![deny(clippy::print_stdout, clippy::print_stderr)]

//! HTTP idempotency registry.
//!
//! This is one of three dedupe layers: the registry here covers the
//! `Idempotency-Key` header; charges and refunds additionally carry a
//! tenant-unique `reference_id` enforced by the store, and processor events
//! dedupe on their event id. Replaying a stored response returns the exact
//! bytes of the first answer; reusing a key with a different payload is a
//! conflict.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Duration;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use sha2::Digest;
use sha2::Sha256;
use tokio::sync::RwLock;

pub const DEFAULT_TTL_DAYS: i64 = 30;

pub type TenantId = String;
pub type IdempotencyResult<T> = Result<T, IdempotencyError>;

#[derive(Debug, thiserror::Error)]
pub enum IdempotencyError {
    #[error("idempotency key reused with a different request")]
    KeyReuseMismatch,
    #[error("storage error: {0}")]
    Storage(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub tenant_id: TenantId,
    pub key: String,
    pub request_hash: String,
    pub status_code: u16,
    pub response_body: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    /// No live record for this (tenant, key); the caller should handle the
    /// request and store the outcome.
    Miss,
    /// Same key, same request hash: replay the stored response verbatim.
    Replay(IdempotencyRecord),
    /// Same key, different request hash.
    Mismatch,
}

#[async_trait]
pub trait IdempotencyRegistry: Send + Sync {
    async fn lookup(
        &self,
        tenant: &TenantId,
        key: &str,
        request_hash: &str,
        now: DateTime<Utc>,
    ) -> IdempotencyResult<Lookup>;

    /// Stores the handled response. Unique on (tenant, key): when a
    /// concurrent request stored first, the winner's record is returned so
    /// both callers answer with identical bytes; a hash mismatch at this
    /// point is a key-reuse conflict.
    async fn store(
        &self,
        record: IdempotencyRecord,
    ) -> IdempotencyResult<IdempotencyRecord>;

    /// Drops expired records; returns how many were removed.
    async fn purge_expired(&self, now: DateTime<Utc>) -> IdempotencyResult<usize>;
}

/// SHA-256 over method, path, and the canonical form of the JSON body.
#[must_use]
pub fn request_hash(method: &str, path: &str, body: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(method.to_ascii_uppercase().as_bytes());
    hasher.update(b"|");
    hasher.update(path.as_bytes());
    hasher.update(b"|");
    hasher.update(canonical_json(body).as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Renders JSON with object keys sorted recursively so that two payloads
/// that differ only in key order hash identically.
#[must_use]
pub fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .filter_map(|k| {
                    map.get(k)
                        .map(|v| format!("{}:{}", serde_json::Value::from(k.as_str()), canonical_json(v)))
                })
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        serde_json::Value::Array(items) => {
            let rendered: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", rendered.join(","))
        }
        other => other.to_string(),
    }
}

#[must_use]
pub fn expiry_for(created_at: DateTime<Utc>, ttl_days: i64) -> DateTime<Utc> {
    created_at + Duration::days(ttl_days.max(0))
}

#[derive(Default)]
pub struct InMemoryIdempotencyRegistry {
    records: RwLock<HashMap<(TenantId, String), IdempotencyRecord>>,
}

impl InMemoryIdempotencyRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IdempotencyRegistry for InMemoryIdempotencyRegistry {
    async fn lookup(
        &self,
        tenant: &TenantId,
        key: &str,
        request_hash: &str,
        now: DateTime<Utc>,
    ) -> IdempotencyResult<Lookup> {
        let records = self.records.read().await;
        match records.get(&(tenant.clone(), key.to_string())) {
            None => Ok(Lookup::Miss),
            Some(record) if record.expires_at <= now => Ok(Lookup::Miss),
            Some(record) if record.request_hash == request_hash => {
                Ok(Lookup::Replay(record.clone()))
            }
            Some(_) => Ok(Lookup::Mismatch),
        }
    }

    async fn store(
        &self,
        record: IdempotencyRecord,
    ) -> IdempotencyResult<IdempotencyRecord> {
        let mut records = self.records.write().await;
        let map_key = (record.tenant_id.clone(), record.key.clone());
        if let Some(existing) = records.get(&map_key) {
            if existing.expires_at > record.created_at {
                if existing.request_hash != record.request_hash {
                    return Err(IdempotencyError::KeyReuseMismatch);
                }
                return Ok(existing.clone());
            }
        }
        records.insert(map_key, record.clone());
        Ok(record)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> IdempotencyResult<usize> {
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|_, record| record.expires_at > now);
        Ok(before - records.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn record(tenant: &str, key: &str, hash: &str, body: &str, now: DateTime<Utc>) -> IdempotencyRecord {
        IdempotencyRecord {
            tenant_id: tenant.into(),
            key: key.into(),
            request_hash: hash.into(),
            status_code: 201,
            response_body: body.into(),
            created_at: now,
            expires_at: expiry_for(now, DEFAULT_TTL_DAYS),
        }
    }

    #[test]
    fn canonical_json_is_key_order_independent() {
        let a = json!({"amount_cents": 2000, "reference_id": "r-42", "nested": {"b": 1, "a": 2}});
        let b = json!({"nested": {"a": 2, "b": 1}, "reference_id": "r-42", "amount_cents": 2000});
        assert_eq!(canonical_json(&a), canonical_json(&b));
        assert_eq!(
            request_hash("POST", "/charges", &a),
            request_hash("POST", "/charges", &b)
        );
    }

    #[test]
    fn request_hash_differs_by_payload_and_path() {
        let body = json!({"reference_id": "r-42"});
        let other = json!({"reference_id": "r-43"});
        assert_ne!(
            request_hash("POST", "/charges", &body),
            request_hash("POST", "/charges", &other)
        );
        assert_ne!(
            request_hash("POST", "/charges", &body),
            request_hash("POST", "/refunds", &body)
        );
    }

    #[tokio::test]
    async fn replay_returns_stored_bytes() {
        let registry = InMemoryIdempotencyRegistry::new();
        let now = Utc::now();
        registry
            .store(record("acme", "key-1", "hash-1", r#"{"id":"ch-1"}"#, now))
            .await
            .expect("store");

        let lookup = registry
            .lookup(&"acme".to_string(), "key-1", "hash-1", now)
            .await
            .expect("lookup");
        match lookup {
            Lookup::Replay(stored) => {
                assert_eq!(stored.response_body, r#"{"id":"ch-1"}"#);
                assert_eq!(stored.status_code, 201);
            }
            other => panic!("expected replay, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn key_reuse_with_different_hash_is_mismatch() {
        let registry = InMemoryIdempotencyRegistry::new();
        let now = Utc::now();
        registry
            .store(record("acme", "key-1", "hash-1", "{}", now))
            .await
            .expect("store");

        let lookup = registry
            .lookup(&"acme".to_string(), "key-1", "hash-2", now)
            .await
            .expect("lookup");
        assert_eq!(lookup, Lookup::Mismatch);

        let err = registry
            .store(record("acme", "key-1", "hash-2", "{}", now))
            .await
            .unwrap_err();
        assert!(matches!(err, IdempotencyError::KeyReuseMismatch));
    }

    #[tokio::test]
    async fn store_race_returns_first_writers_record() {
        let registry = InMemoryIdempotencyRegistry::new();
        let now = Utc::now();
        registry
            .store(record("acme", "key-1", "hash-1", r#"{"id":"ch-1"}"#, now))
            .await
            .expect("store");

        // The losing racer re-stores with the same hash and must observe the
        // winner's body, not its own.
        let stored = registry
            .store(record("acme", "key-1", "hash-1", r#"{"id":"ch-2"}"#, now))
            .await
            .expect("second store");
        assert_eq!(stored.response_body, r#"{"id":"ch-1"}"#);
    }

    #[tokio::test]
    async fn keys_are_tenant_scoped() {
        let registry = InMemoryIdempotencyRegistry::new();
        let now = Utc::now();
        registry
            .store(record("acme", "key-1", "hash-1", "{}", now))
            .await
            .expect("store");

        let lookup = registry
            .lookup(&"globex".to_string(), "key-1", "hash-1", now)
            .await
            .expect("lookup");
        assert_eq!(lookup, Lookup::Miss);
    }

    #[tokio::test]
    async fn expired_records_are_purged_and_invisible() {
        let registry = InMemoryIdempotencyRegistry::new();
        let created = Utc::now() - Duration::days(DEFAULT_TTL_DAYS + 1);
        registry
            .store(record("acme", "key-1", "hash-1", "{}", created))
            .await
            .expect("store");

        let now = Utc::now();
        let lookup = registry
            .lookup(&"acme".to_string(), "key-1", "hash-1", now)
            .await
            .expect("lookup");
        assert_eq!(lookup, Lookup::Miss);

        let purged = registry.purge_expired(now).await.expect("purge");
        assert_eq!(purged, 1);
    }
}
