//! Storage abstraction over the per-tenant document+edge backend.
//!
//! Generalizes the corpus's per-backend repository traits
//! (`AnalyticsRepository` / `TransactionalRepository`) into a single
//! `StorageAdapter` trait with one implementation per backend: an HTTP
//! client against the document+edge store in production, and an in-memory
//! fake for tests.

pub mod client;
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::message::types::Message;
use crate::pubsub::types::{Delivery, Publication, Subscription};

/// The set of durable collections this crate provisions per tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Collection {
    Messages,
    Publications,
    Subscriptions,
    PublicationDeliveries,
}

impl Collection {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Messages => "agent_messages",
            Self::Publications => "agent_publications",
            Self::Subscriptions => "agent_subscriptions",
            Self::PublicationDeliveries => "agent_publication_deliveries",
        }
    }

    pub fn all() -> [Collection; 4] {
        [
            Self::Messages,
            Self::Publications,
            Self::Subscriptions,
            Self::PublicationDeliveries,
        ]
    }

    pub fn is_edge(&self) -> bool {
        matches!(self, Self::PublicationDeliveries)
    }
}

/// Per-tenant document+edge persistence, indexed queries, and TTL sweeps.
///
/// Every method is cancellation-aware: implementations must propagate the
/// supplied token to the underlying backend call rather than checking it
/// only at entry, so a `Stop`-triggered cancellation unblocks an in-flight
/// request promptly.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Idempotently create the tenant's database and every collection and
    /// index in §4.1. Must complete before any other method is called
    /// against `tenant`.
    async fn provision_tenant(&self, tenant: &str, cancel: &CancellationToken) -> Result<()>;

    /// Drop all per-tenant collections. Used when an agency is deleted.
    async fn deprovision_tenant(&self, tenant: &str, cancel: &CancellationToken) -> Result<()>;

    // ---- messages ----

    async fn create_message(&self, tenant: &str, message: &Message, cancel: &CancellationToken) -> Result<()>;
    async fn get_message(&self, tenant: &str, id: &str, cancel: &CancellationToken) -> Result<Message>;

    /// Pending, not-expired messages for `agent`, ordered priority desc
    /// then created-at asc.
    async fn list_pending_messages(
        &self,
        tenant: &str,
        agent: &str,
        limit: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<Message>>;

    /// All messages sharing `correlation_id`, ordered by created-at asc.
    async fn list_correlated(
        &self,
        tenant: &str,
        correlation_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<Message>>;

    async fn update_message_status(
        &self,
        tenant: &str,
        id: &str,
        status: crate::message::types::MessageStatus,
        delivered_at: Option<DateTime<Utc>>,
        cancel: &CancellationToken,
    ) -> Result<()>;

    async fn update_message_ack(
        &self,
        tenant: &str,
        id: &str,
        ack_at: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<()>;

    // ---- publications ----

    async fn create_publication(&self, tenant: &str, publication: &Publication, cancel: &CancellationToken) -> Result<()>;
    async fn get_publication(&self, tenant: &str, id: &str, cancel: &CancellationToken) -> Result<Publication>;

    /// Candidate publications for the given subscriptions, published after
    /// `since` and not yet expired. May over-fetch; the adapter filters out
    /// publications already delivered against every one of `subs` via an
    /// anti-join with the delivery-edge collection, but callers still run
    /// the pattern matcher over the result (§4.2 is authoritative).
    async fn list_candidate_publications(
        &self,
        tenant: &str,
        subs: &[String],
        since: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<Vec<Publication>>;

    // ---- subscriptions ----

    async fn create_subscription(&self, tenant: &str, subscription: &Subscription, cancel: &CancellationToken) -> Result<()>;
    async fn get_subscription(&self, tenant: &str, id: &str, cancel: &CancellationToken) -> Result<Subscription>;
    async fn list_active_subscriptions(
        &self,
        tenant: &str,
        subscriber: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<Subscription>>;
    async fn list_subscriptions(
        &self,
        tenant: &str,
        subscriber: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<Subscription>>;
    async fn deactivate_subscription(&self, tenant: &str, id: &str, cancel: &CancellationToken) -> Result<()>;
    async fn delete_subscription(&self, tenant: &str, id: &str, cancel: &CancellationToken) -> Result<()>;
    async fn update_subscription_last_matched(
        &self,
        tenant: &str,
        id: &str,
        ts: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<()>;

    // ---- deliveries ----

    /// Atomically refuses a duplicate (publication, subscription) pair
    /// with [`crate::error::StorageError::DuplicateKey`].
    async fn create_delivery(
        &self,
        tenant: &str,
        publication_id: &str,
        agent_id: &str,
        subscription_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Delivery>;

    // ---- maintenance ----

    /// Deletes every row in `collection` with `expires_at < now`. Returns
    /// the number removed.
    async fn delete_expired(
        &self,
        tenant: &str,
        collection: Collection,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<u64>;

    async fn health_check(&self, cancel: &CancellationToken) -> Result<()>;
}
