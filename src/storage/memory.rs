//! In-memory [`StorageAdapter`] fake used by this crate's own tests and
//! available to embedders for their own test suites.
//!
//! Modeled on the corpus's `InMemoryCache`: dashmap-backed, no background
//! eviction thread, synchronous under the hood but exposed through the
//! same async trait as the real backend.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, StorageError};
use crate::message::types::{Message, MessageStatus};
use crate::pubsub::types::{Delivery, Publication, Subscription};

use super::{Collection, StorageAdapter};

type TenantKey = (String, String);

/// An in-process, non-persistent implementation of [`StorageAdapter`].
///
/// Intended for unit and integration tests; does not enforce per-tenant
/// database isolation beyond namespacing keys by tenant id.
#[derive(Default)]
pub struct InMemoryStorage {
    provisioned: DashMap<String, ()>,
    messages: DashMap<TenantKey, Message>,
    publications: DashMap<TenantKey, Publication>,
    subscriptions: DashMap<TenantKey, Subscription>,
    deliveries: DashMap<TenantKey, Delivery>,
    /// Uniqueness index on (tenant, publication_id, subscription_id).
    delivery_index: DashMap<(String, String, String), String>,
    delivery_seq: AtomicU64,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn check_cancelled(cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            Err(StorageError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl StorageAdapter for InMemoryStorage {
    async fn provision_tenant(&self, tenant: &str, cancel: &CancellationToken) -> Result<()> {
        Self::check_cancelled(cancel)?;
        self.provisioned.insert(tenant.to_string(), ());
        Ok(())
    }

    async fn deprovision_tenant(&self, tenant: &str, cancel: &CancellationToken) -> Result<()> {
        Self::check_cancelled(cancel)?;
        self.provisioned.remove(tenant);
        self.messages.retain(|(t, _), _| t != tenant);
        self.publications.retain(|(t, _), _| t != tenant);
        self.subscriptions.retain(|(t, _), _| t != tenant);
        self.deliveries.retain(|(t, _), _| t != tenant);
        self.delivery_index.retain(|(t, _, _), _| t != tenant);
        Ok(())
    }

    async fn create_message(&self, tenant: &str, message: &Message, cancel: &CancellationToken) -> Result<()> {
        Self::check_cancelled(cancel)?;
        let key = (tenant.to_string(), message.id.clone());
        if self.messages.contains_key(&key) {
            return Err(StorageError::DuplicateKey(message.id.clone()));
        }
        self.messages.insert(key, message.clone());
        Ok(())
    }

    async fn get_message(&self, tenant: &str, id: &str, cancel: &CancellationToken) -> Result<Message> {
        Self::check_cancelled(cancel)?;
        self.messages
            .get(&(tenant.to_string(), id.to_string()))
            .map(|m| m.clone())
            .ok_or_else(|| StorageError::not_found(format!("message {id}")))
    }

    async fn list_pending_messages(
        &self,
        tenant: &str,
        agent: &str,
        limit: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<Message>> {
        Self::check_cancelled(cancel)?;
        let now = Utc::now();
        let mut matches: Vec<Message> = self
            .messages
            .iter()
            .filter(|entry| {
                let (t, _) = entry.key();
                let m = entry.value();
                t == tenant
                    && m.to_agent_id == agent
                    && m.status == MessageStatus::Pending
                    && !m.is_expired(now)
            })
            .map(|entry| entry.value().clone())
            .collect();
        matches.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
        });
        matches.truncate(limit);
        Ok(matches)
    }

    async fn list_correlated(
        &self,
        tenant: &str,
        correlation_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<Message>> {
        Self::check_cancelled(cancel)?;
        let mut matches: Vec<Message> = self
            .messages
            .iter()
            .filter(|entry| {
                let (t, _) = entry.key();
                t == tenant && entry.value().correlation_id.as_deref() == Some(correlation_id)
            })
            .map(|entry| entry.value().clone())
            .collect();
        matches.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(matches)
    }

    async fn update_message_status(
        &self,
        tenant: &str,
        id: &str,
        status: MessageStatus,
        delivered_at: Option<DateTime<Utc>>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        Self::check_cancelled(cancel)?;
        let mut entry = self
            .messages
            .get_mut(&(tenant.to_string(), id.to_string()))
            .ok_or_else(|| StorageError::not_found(format!("message {id}")))?;
        entry.status = status;
        if let Some(at) = delivered_at {
            entry.delivered_at = Some(at);
        }
        Ok(())
    }

    async fn update_message_ack(
        &self,
        tenant: &str,
        id: &str,
        ack_at: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        Self::check_cancelled(cancel)?;
        let mut entry = self
            .messages
            .get_mut(&(tenant.to_string(), id.to_string()))
            .ok_or_else(|| StorageError::not_found(format!("message {id}")))?;
        entry.acknowledged_at = Some(ack_at);
        Ok(())
    }

    async fn create_publication(
        &self,
        tenant: &str,
        publication: &Publication,
        cancel: &CancellationToken,
    ) -> Result<()> {
        Self::check_cancelled(cancel)?;
        let key = (tenant.to_string(), publication.id.clone());
        if self.publications.contains_key(&key) {
            return Err(StorageError::DuplicateKey(publication.id.clone()));
        }
        self.publications.insert(key, publication.clone());
        Ok(())
    }

    async fn get_publication(&self, tenant: &str, id: &str, cancel: &CancellationToken) -> Result<Publication> {
        Self::check_cancelled(cancel)?;
        self.publications
            .get(&(tenant.to_string(), id.to_string()))
            .map(|p| p.clone())
            .ok_or_else(|| StorageError::not_found(format!("publication {id}")))
    }

    async fn list_candidate_publications(
        &self,
        tenant: &str,
        subs: &[String],
        since: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<Vec<Publication>> {
        Self::check_cancelled(cancel)?;
        let now = Utc::now();
        let mut matches: Vec<Publication> = self
            .publications
            .iter()
            .filter(|entry| {
                let (t, _) = entry.key();
                let p = entry.value();
                if t != tenant || p.published_at <= since || p.is_expired(now) {
                    return false;
                }
                // Over-fetch then anti-join: skip only if every subscription
                // already has a delivery recorded for this publication.
                !subs.iter().all(|sub_id| {
                    self.delivery_index
                        .contains_key(&(tenant.to_string(), p.id.clone(), sub_id.clone()))
                })
            })
            .map(|entry| entry.value().clone())
            .collect();
        matches.sort_by(|a, b| a.published_at.cmp(&b.published_at));
        Ok(matches)
    }

    async fn create_subscription(
        &self,
        tenant: &str,
        subscription: &Subscription,
        cancel: &CancellationToken,
    ) -> Result<()> {
        Self::check_cancelled(cancel)?;
        let key = (tenant.to_string(), subscription.id.clone());
        if self.subscriptions.contains_key(&key) {
            return Err(StorageError::DuplicateKey(subscription.id.clone()));
        }
        self.subscriptions.insert(key, subscription.clone());
        Ok(())
    }

    async fn get_subscription(&self, tenant: &str, id: &str, cancel: &CancellationToken) -> Result<Subscription> {
        Self::check_cancelled(cancel)?;
        self.subscriptions
            .get(&(tenant.to_string(), id.to_string()))
            .map(|s| s.clone())
            .ok_or_else(|| StorageError::not_found(format!("subscription {id}")))
    }

    async fn list_active_subscriptions(
        &self,
        tenant: &str,
        subscriber: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<Subscription>> {
        Self::check_cancelled(cancel)?;
        Ok(self
            .subscriptions
            .iter()
            .filter(|entry| {
                let (t, _) = entry.key();
                let s = entry.value();
                t == tenant && s.subscriber_agent_id == subscriber && s.active
            })
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn list_subscriptions(
        &self,
        tenant: &str,
        subscriber: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<Subscription>> {
        Self::check_cancelled(cancel)?;
        Ok(self
            .subscriptions
            .iter()
            .filter(|entry| {
                let (t, _) = entry.key();
                t == tenant && entry.value().subscriber_agent_id == subscriber
            })
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn deactivate_subscription(&self, tenant: &str, id: &str, cancel: &CancellationToken) -> Result<()> {
        Self::check_cancelled(cancel)?;
        let mut entry = self
            .subscriptions
            .get_mut(&(tenant.to_string(), id.to_string()))
            .ok_or_else(|| StorageError::not_found(format!("subscription {id}")))?;
        entry.active = false;
        entry.updated_at = Utc::now();
        Ok(())
    }

    async fn delete_subscription(&self, tenant: &str, id: &str, cancel: &CancellationToken) -> Result<()> {
        Self::check_cancelled(cancel)?;
        self.subscriptions
            .remove(&(tenant.to_string(), id.to_string()))
            .ok_or_else(|| StorageError::not_found(format!("subscription {id}")))?;
        Ok(())
    }

    async fn update_subscription_last_matched(
        &self,
        tenant: &str,
        id: &str,
        ts: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        Self::check_cancelled(cancel)?;
        let mut entry = self
            .subscriptions
            .get_mut(&(tenant.to_string(), id.to_string()))
            .ok_or_else(|| StorageError::not_found(format!("subscription {id}")))?;
        entry.last_matched_at = Some(ts);
        Ok(())
    }

    async fn create_delivery(
        &self,
        tenant: &str,
        publication_id: &str,
        agent_id: &str,
        subscription_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Delivery> {
        Self::check_cancelled(cancel)?;
        let index_key = (
            tenant.to_string(),
            publication_id.to_string(),
            subscription_id.to_string(),
        );
        let delivery = Delivery::new(publication_id, agent_id, subscription_id);
        match self.delivery_index.entry(index_key) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(StorageError::DuplicateKey(format!(
                    "delivery for ({publication_id}, {subscription_id})"
                )));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(delivery.id.clone());
            }
        }
        self.delivery_seq.fetch_add(1, Ordering::Relaxed);
        self.deliveries
            .insert((tenant.to_string(), delivery.id.clone()), delivery.clone());
        Ok(delivery)
    }

    async fn delete_expired(
        &self,
        tenant: &str,
        collection: Collection,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        Self::check_cancelled(cancel)?;
        let count = match collection {
            Collection::Messages => {
                let before = self.messages.len();
                self.messages
                    .retain(|(t, _), m| t != tenant || !m.is_expired(now));
                before - self.messages.len()
            }
            Collection::Publications => {
                let before = self.publications.len();
                self.publications
                    .retain(|(t, _), p| t != tenant || !p.is_expired(now));
                before - self.publications.len()
            }
            Collection::Subscriptions | Collection::PublicationDeliveries => 0,
        };
        Ok(count as u64)
    }

    async fn health_check(&self, cancel: &CancellationToken) -> Result<()> {
        Self::check_cancelled(cancel)
    }
}
