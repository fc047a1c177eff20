//! Entities backing the Pub/Sub Service: publications, subscriptions, and
//! the delivery edge that enforces at-most-once fan-out.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{Result, StorageError};
use crate::pattern::compile_pattern;

pub const DEFAULT_PUBLICATION_TTL_SECS: i64 = 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublicationKind {
    StatusChange,
    Event,
    Metric,
    Alert,
    Broadcast,
}

impl Default for PublicationKind {
    fn default() -> Self {
        Self::Event
    }
}

/// A durable broadcast event, immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Publication {
    #[serde(rename = "_key")]
    pub id: String,
    pub publisher_agent_id: String,
    pub publisher_agent_type: String,
    pub publication_type: PublicationKind,
    pub event_name: String,
    pub payload: HashMap<String, Value>,
    pub published_at: DateTime<Utc>,
    pub ttl_seconds: i64,
    pub expires_at: DateTime<Utc>,
    pub metadata: Option<HashMap<String, Value>>,
}

#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    pub kind: Option<PublicationKind>,
    pub ttl_secs: Option<i64>,
    pub metadata: Option<HashMap<String, Value>>,
}

impl Publication {
    pub fn new(
        publisher_id: &str,
        publisher_type: &str,
        event_name: &str,
        payload: HashMap<String, Value>,
        opts: PublishOptions,
    ) -> Result<Self> {
        if publisher_id.is_empty() {
            return Err(StorageError::invalid_argument("publisher id must not be empty"));
        }
        if event_name.is_empty() {
            return Err(StorageError::invalid_argument("event name must not be empty"));
        }
        if payload.is_empty() {
            return Err(StorageError::invalid_argument("publication payload must not be empty"));
        }
        let ttl = opts.ttl_secs.unwrap_or(DEFAULT_PUBLICATION_TTL_SECS);
        if ttl < 0 {
            return Err(StorageError::invalid_argument("ttl_seconds must not be negative"));
        }

        let now = Utc::now();
        Ok(Self {
            id: format!("pub-{}", Uuid::new_v4()),
            publisher_agent_id: publisher_id.to_string(),
            publisher_agent_type: publisher_type.to_string(),
            publication_type: opts.kind.unwrap_or_default(),
            event_name: event_name.to_string(),
            payload,
            published_at: now,
            ttl_seconds: ttl,
            expires_at: now + Duration::seconds(ttl),
            metadata: opts.metadata,
        })
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }
}

/// A durable matching rule owned by the subscribing agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    #[serde(rename = "_key")]
    pub id: String,
    pub subscriber_agent_id: String,
    pub subscriber_agent_type: String,
    pub event_pattern: String,
    pub publisher_agent_id: Option<String>,
    pub publisher_agent_type: Option<String>,
    pub publication_types: Option<Vec<PublicationKind>>,
    pub filter_conditions: Option<HashMap<String, Value>>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_matched_at: Option<DateTime<Utc>>,
    pub metadata: Option<HashMap<String, Value>>,
}

#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    pub publisher_agent_id: Option<String>,
    pub publisher_agent_type: Option<String>,
    pub publication_types: Option<Vec<PublicationKind>>,
    pub filter_conditions: Option<HashMap<String, Value>>,
    pub metadata: Option<HashMap<String, Value>>,
}

impl Subscription {
    pub fn new(
        subscriber_id: &str,
        subscriber_type: &str,
        event_pattern: &str,
        opts: SubscribeOptions,
    ) -> Result<Self> {
        if subscriber_id.is_empty() {
            return Err(StorageError::invalid_argument("subscriber id must not be empty"));
        }
        if event_pattern.is_empty() {
            return Err(StorageError::invalid_argument("event pattern must not be empty"));
        }
        // Validated at creation time; invalid patterns compile to
        // "never match" rather than rejecting the subscription outright,
        // matching the pattern matcher's no-panic contract.
        let _ = compile_pattern(event_pattern);

        let now = Utc::now();
        Ok(Self {
            id: format!("sub-{}", Uuid::new_v4()),
            subscriber_agent_id: subscriber_id.to_string(),
            subscriber_agent_type: subscriber_type.to_string(),
            event_pattern: event_pattern.to_string(),
            publisher_agent_id: opts.publisher_agent_id,
            publisher_agent_type: opts.publisher_agent_type,
            publication_types: opts.publication_types,
            filter_conditions: opts.filter_conditions,
            active: true,
            created_at: now,
            updated_at: now,
            last_matched_at: None,
            metadata: opts.metadata,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingResult {
    Pending,
    Success,
    Failed,
    Skipped,
}

impl Default for ProcessingResult {
    fn default() -> Self {
        Self::Pending
    }
}

/// The at-most-once token recording that a publication was handed to a
/// given agent via a given matching subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delivery {
    #[serde(rename = "_key")]
    pub id: String,
    #[serde(rename = "_from")]
    pub source: String,
    #[serde(rename = "_to")]
    pub target: String,
    pub subscription_id: String,
    pub delivered_at: DateTime<Utc>,
    pub acknowledged: bool,
    pub processed: bool,
    pub processing_result: ProcessingResult,
    pub metadata: Option<HashMap<String, Value>>,
}

impl Delivery {
    /// The `_key` is derived deterministically from the (publication,
    /// subscription) pair rather than a fresh random id: it is this crate's
    /// only at-most-once synchronization point (§9), so the backend's
    /// native uniqueness constraint on `_key` must be the thing that
    /// refuses a duplicate, not a read-then-write check.
    pub fn new(publication_id: &str, agent_id: &str, subscription_id: &str) -> Self {
        Self {
            id: format!("del-{publication_id}-{subscription_id}"),
            source: publication_id.to_string(),
            target: agent_id.to_string(),
            subscription_id: subscription_id.to_string(),
            delivered_at: Utc::now(),
            acknowledged: false,
            processed: false,
            processing_result: ProcessingResult::Pending,
            metadata: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> HashMap<String, Value> {
        HashMap::from([("severity".to_string(), Value::String("high".to_string()))])
    }

    #[test]
    fn new_publication_computes_expiry_from_ttl() {
        let pubn = Publication::new("p1", "sensor", "reading.temp", payload(), PublishOptions::default())
            .unwrap();
        assert_eq!(
            (pubn.expires_at - pubn.published_at).num_seconds(),
            DEFAULT_PUBLICATION_TTL_SECS
        );
    }

    #[test]
    fn rejects_empty_payload() {
        assert!(Publication::new("p1", "sensor", "reading.temp", HashMap::new(), PublishOptions::default())
            .is_err());
    }

    #[test]
    fn subscription_defaults_to_active() {
        let sub = Subscription::new("x1", "controller", "zone.*.pump.efficiency", SubscribeOptions::default())
            .unwrap();
        assert!(sub.active);
        assert!(sub.last_matched_at.is_none());
    }
}
