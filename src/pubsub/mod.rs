//! Topic-pattern publish/subscribe: publication creation, subscription
//! lifecycle, matching fan-out, and delivery-edge recording.

pub mod types;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, StorageError};
use crate::pattern::matching_subscriptions;
use crate::storage::{Collection, StorageAdapter};

pub use types::{
    Delivery, Publication, PublicationKind, PublishOptions, Subscription, SubscribeOptions,
};

/// Publication creation, subscription lifecycle, matching fan-out, and
/// delivery recording, scoped to one tenant.
pub struct PubSubService {
    storage: Arc<dyn StorageAdapter>,
    tenant: String,
}

impl PubSubService {
    pub fn new(storage: Arc<dyn StorageAdapter>, tenant: impl Into<String>) -> Self {
        Self {
            storage,
            tenant: tenant.into(),
        }
    }

    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    /// Persists a publication. Does not fan out synchronously: consumers
    /// discover it on their own next `matching` poll.
    pub async fn publish(
        &self,
        publisher_id: &str,
        publisher_type: &str,
        event_name: &str,
        payload: HashMap<String, Value>,
        opts: PublishOptions,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let publication = Publication::new(publisher_id, publisher_type, event_name, payload, opts)?;
        let id = publication.id.clone();
        self.storage.create_publication(&self.tenant, &publication, cancel).await?;
        Ok(id)
    }

    /// Validates and persists a subscription with `active=true`.
    pub async fn subscribe(
        &self,
        subscriber_id: &str,
        subscriber_type: &str,
        event_pattern: &str,
        opts: SubscribeOptions,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let subscription = Subscription::new(subscriber_id, subscriber_type, event_pattern, opts)?;
        let id = subscription.id.clone();
        self.storage
            .create_subscription(&self.tenant, &subscription, cancel)
            .await?;
        Ok(id)
    }

    /// Soft deactivation. Idempotent: deactivating an already-inactive
    /// subscription succeeds silently.
    pub async fn unsubscribe(&self, sub_id: &str, cancel: &CancellationToken) -> Result<()> {
        match self.storage.deactivate_subscription(&self.tenant, sub_id, cancel).await {
            Ok(()) => Ok(()),
            Err(StorageError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn delete_subscription(&self, sub_id: &str, cancel: &CancellationToken) -> Result<()> {
        self.storage.delete_subscription(&self.tenant, sub_id, cancel).await
    }

    pub async fn active_subscriptions(&self, subscriber: &str, cancel: &CancellationToken) -> Result<Vec<Subscription>> {
        self.storage
            .list_active_subscriptions(&self.tenant, subscriber, cancel)
            .await
    }

    /// Reads `agent`'s active subscriptions, fetches candidate
    /// publications newer than `since` not yet delivered against any of
    /// them, runs the pattern matcher, then for every subscription a
    /// publication matches, tries to record a delivery edge. A
    /// duplicate-key result from `create_delivery` means another poller
    /// already delivered this (publication, subscription) pair; it is
    /// swallowed, not surfaced, per the at-most-once contract.
    pub async fn matching(
        &self,
        agent: &str,
        since: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<Vec<Publication>> {
        let subs = self.active_subscriptions(agent, cancel).await?;
        if subs.is_empty() {
            return Ok(Vec::new());
        }
        let sub_ids: Vec<String> = subs.iter().map(|s| s.id.clone()).collect();

        let candidates = self
            .storage
            .list_candidate_publications(&self.tenant, &sub_ids, since, cancel)
            .await?;

        let mut delivered = Vec::new();
        for publication in candidates {
            let matches = matching_subscriptions(&publication, &subs);
            if matches.is_empty() {
                continue;
            }
            let mut any_new_delivery = false;
            for sub in &matches {
                match self
                    .storage
                    .create_delivery(&self.tenant, &publication.id, agent, &sub.id, cancel)
                    .await
                {
                    Ok(_) => {
                        any_new_delivery = true;
                        if let Err(e) = self
                            .storage
                            .update_subscription_last_matched(&self.tenant, &sub.id, Utc::now(), cancel)
                            .await
                        {
                            tracing::warn!(
                                tenant = %self.tenant,
                                subscription = %sub.id,
                                error = %e,
                                "failed to update subscription last_matched_at"
                            );
                        }
                    }
                    Err(StorageError::DuplicateKey(_)) => continue,
                    Err(e) => return Err(e),
                }
            }
            // A publication that matched only already-delivered subscriptions
            // this round (every create_delivery hit DuplicateKey) has nothing
            // new to report; re-pushing it would re-deliver it forever to an
            // agent whose other subscriptions never match this event.
            if any_new_delivery {
                delivered.push(publication);
            }
        }
        Ok(delivered)
    }

    /// Deletes every publication with `expires_at < now`. Best-effort:
    /// errors are logged and the count returned is `0` rather than
    /// propagating a failure.
    pub async fn sweep_expired_publications(&self, cancel: &CancellationToken) -> u64 {
        match self
            .storage
            .delete_expired(&self.tenant, Collection::Publications, Utc::now(), cancel)
            .await
        {
            Ok(count) => count,
            Err(e) => {
                tracing::warn!(tenant = %self.tenant, error = %e, "publication TTL sweep failed");
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::InMemoryStorage;
    use std::time::Duration as StdDuration;

    fn service() -> PubSubService {
        PubSubService::new(Arc::new(InMemoryStorage::new()), "t1")
    }

    fn payload(key: &str, value: &str) -> HashMap<String, Value> {
        HashMap::from([(key.to_string(), Value::String(value.to_string()))])
    }

    #[tokio::test]
    async fn subscription_pattern_match_scenario() {
        let svc = service();
        let cancel = CancellationToken::new();
        let t0 = Utc::now() - chrono::Duration::seconds(1);

        svc.subscribe("X", "controller", "zone.*.pump.efficiency", SubscribeOptions::default(), &cancel)
            .await
            .unwrap();

        svc.publish(
            "Y",
            "sensor",
            "zone.north.pump.efficiency",
            payload("pump", "P2"),
            PublishOptions::default(),
            &cancel,
        )
        .await
        .unwrap();
        svc.publish(
            "Y",
            "sensor",
            "zone.north.pump.vibration",
            payload("pump", "P2"),
            PublishOptions::default(),
            &cancel,
        )
        .await
        .unwrap();

        let first = svc.matching("X", t0, &cancel).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].event_name, "zone.north.pump.efficiency");

        let second = svc.matching("X", t0, &cancel).await.unwrap();
        assert!(second.is_empty(), "re-polling the same window must be deduped by the delivery edge");
    }

    #[tokio::test]
    async fn publication_matching_only_some_of_an_agents_subscriptions_is_not_redelivered() {
        let svc = service();
        let cancel = CancellationToken::new();
        let t0 = Utc::now() - chrono::Duration::seconds(1);

        // X has two subscriptions; only "alert.*" matches the event below, so
        // "metric.*" never gets a delivery edge of its own. A naive
        // implementation that requires every subscription to have an edge
        // before excluding a candidate would keep re-returning it forever.
        svc.subscribe("X", "controller", "alert.*", SubscribeOptions::default(), &cancel)
            .await
            .unwrap();
        svc.subscribe("X", "controller", "metric.*", SubscribeOptions::default(), &cancel)
            .await
            .unwrap();
        svc.publish("Y", "sensor", "alert.critical", payload("level", "5"), PublishOptions::default(), &cancel)
            .await
            .unwrap();

        let first = svc.matching("X", t0, &cancel).await.unwrap();
        assert_eq!(first.len(), 1);

        let second = svc.matching("X", t0, &cancel).await.unwrap();
        assert!(second.is_empty(), "a publication already delivered via one subscription must not repeat forever");
    }

    #[tokio::test]
    async fn fan_out_to_multiple_subscribers() {
        let svc = service();
        let cancel = CancellationToken::new();
        let t0 = Utc::now() - chrono::Duration::seconds(1);

        svc.subscribe("X1", "controller", "alert.*", SubscribeOptions::default(), &cancel)
            .await
            .unwrap();
        svc.subscribe("X2", "controller", "*.critical", SubscribeOptions::default(), &cancel)
            .await
            .unwrap();
        svc.publish("Y", "sensor", "alert.critical", payload("level", "5"), PublishOptions::default(), &cancel)
            .await
            .unwrap();

        let for_x1 = svc.matching("X1", t0, &cancel).await.unwrap();
        let for_x2 = svc.matching("X2", t0, &cancel).await.unwrap();
        assert_eq!(for_x1.len(), 1);
        assert_eq!(for_x2.len(), 1);
    }

    #[tokio::test]
    async fn filter_conditions_scope_delivery() {
        let svc = service();
        let cancel = CancellationToken::new();
        let t0 = Utc::now() - chrono::Duration::seconds(1);

        svc.subscribe(
            "X",
            "controller",
            "reading.*",
            SubscribeOptions {
                filter_conditions: Some(HashMap::from([(
                    "severity".to_string(),
                    Value::String("high".to_string()),
                )])),
                ..Default::default()
            },
            &cancel,
        )
        .await
        .unwrap();

        svc.publish("Y", "sensor", "reading.temp", payload("severity", "high"), PublishOptions::default(), &cancel)
            .await
            .unwrap();
        svc.publish("Y", "sensor", "reading.temp", payload("severity", "low"), PublishOptions::default(), &cancel)
            .await
            .unwrap();

        let matched = svc.matching("X", t0, &cancel).await.unwrap();
        assert_eq!(matched.len(), 1);
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent_and_removes_from_active_list() {
        let svc = service();
        let cancel = CancellationToken::new();
        let sub_id = svc
            .subscribe("X", "controller", "alert.*", SubscribeOptions::default(), &cancel)
            .await
            .unwrap();
        svc.unsubscribe(&sub_id, &cancel).await.unwrap();
        svc.unsubscribe(&sub_id, &cancel).await.unwrap();
        let active = svc.active_subscriptions("X", &cancel).await.unwrap();
        assert!(active.iter().all(|s| s.id != sub_id));
    }

    #[tokio::test]
    async fn sweep_expired_publications_removes_ttl_expired_rows() {
        let svc = service();
        let cancel = CancellationToken::new();
        svc.publish(
            "Y",
            "sensor",
            "reading.temp",
            payload("severity", "high"),
            PublishOptions {
                ttl_secs: Some(0),
                ..Default::default()
            },
            &cancel,
        )
        .await
        .unwrap();
        tokio::time::sleep(StdDuration::from_millis(5)).await;
        let removed = svc.sweep_expired_publications(&cancel).await;
        assert_eq!(removed, 1);
    }
}
