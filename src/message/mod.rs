//! Direct, point-to-point messaging between agents within one tenant.

pub mod types;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::storage::{Collection, StorageAdapter};

pub use types::{Message, MessageKind, MessageStatus, SendOptions, DEFAULT_PENDING_LIMIT};

/// Direct-message create/read/ack/fail, priority ordering, TTL, correlation.
///
/// One instance is wired per tenant; it holds no per-agent state of its
/// own, so it is cheap to share across every agent in that tenant's
/// pollers.
pub struct MessageService {
    storage: Arc<dyn StorageAdapter>,
    tenant: String,
}

impl MessageService {
    pub fn new(storage: Arc<dyn StorageAdapter>, tenant: impl Into<String>) -> Self {
        Self {
            storage,
            tenant: tenant.into(),
        }
    }

    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    /// Validates and persists a new pending message, returning its id.
    pub async fn send(
        &self,
        from: &str,
        to: &str,
        kind: MessageKind,
        payload: HashMap<String, Value>,
        opts: SendOptions,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let message = Message::new(from, to, kind, payload, opts)?;
        let id = message.id.clone();
        self.storage.create_message(&self.tenant, &message, cancel).await?;
        Ok(id)
    }

    pub async fn get(&self, id: &str, cancel: &CancellationToken) -> Result<Message> {
        self.storage.get_message(&self.tenant, id, cancel).await
    }

    /// Unexpired pending messages for `agent`, ordered priority desc then
    /// created-at asc. Defaults to [`DEFAULT_PENDING_LIMIT`].
    pub async fn pending(
        &self,
        agent: &str,
        limit: Option<usize>,
        cancel: &CancellationToken,
    ) -> Result<Vec<Message>> {
        self.storage
            .list_pending_messages(&self.tenant, agent, limit.unwrap_or(DEFAULT_PENDING_LIMIT), cancel)
            .await
    }

    pub async fn mark_delivered(&self, id: &str, cancel: &CancellationToken) -> Result<()> {
        self.storage
            .update_message_status(&self.tenant, id, MessageStatus::Delivered, Some(Utc::now()), cancel)
            .await
    }

    pub async fn mark_failed(&self, id: &str, cancel: &CancellationToken) -> Result<()> {
        self.storage
            .update_message_status(&self.tenant, id, MessageStatus::Failed, None, cancel)
            .await
    }

    /// Sets `acknowledged_at`, independent of the message's current
    /// status: acknowledging a non-delivered message is allowed, since the
    /// acknowledger is taking responsibility for it regardless.
    pub async fn acknowledge(&self, id: &str, cancel: &CancellationToken) -> Result<()> {
        self.storage
            .update_message_ack(&self.tenant, id, Utc::now(), cancel)
            .await
    }

    /// Messages sharing `correlation_id`, ordered by created-at asc.
    pub async fn conversation(&self, correlation_id: &str, cancel: &CancellationToken) -> Result<Vec<Message>> {
        self.storage.list_correlated(&self.tenant, correlation_id, cancel).await
    }

    /// Deletes every message with `expires_at < now`. Errors are logged
    /// and swallowed: TTL sweeps are best-effort maintenance and must
    /// never propagate a failure to the caller's other work.
    pub async fn sweep_expired(&self, cancel: &CancellationToken) -> u64 {
        match self
            .storage
            .delete_expired(&self.tenant, Collection::Messages, Utc::now(), cancel)
            .await
        {
            Ok(count) => count,
            Err(e) => {
                tracing::warn!(tenant = %self.tenant, error = %e, "message TTL sweep failed");
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::InMemoryStorage;

    fn service() -> MessageService {
        MessageService::new(Arc::new(InMemoryStorage::new()), "t1")
    }

    fn payload() -> HashMap<String, Value> {
        HashMap::from([("k".to_string(), Value::String("v".to_string()))])
    }

    #[tokio::test]
    async fn send_then_get_round_trips() {
        let svc = service();
        let cancel = CancellationToken::new();
        let id = svc
            .send("a", "b", MessageKind::Command, payload(), SendOptions::default(), &cancel)
            .await
            .unwrap();
        let msg = svc.get(&id, &cancel).await.unwrap();
        assert_eq!(msg.status, MessageStatus::Pending);
        assert_eq!(msg.to_agent_id, "b");
    }

    #[tokio::test]
    async fn pending_orders_by_priority_then_time() {
        let svc = service();
        let cancel = CancellationToken::new();
        for priority in [3u8, 8, 5] {
            svc.send(
                "a",
                "b",
                MessageKind::Notification,
                payload(),
                SendOptions {
                    priority: Some(priority),
                    ..Default::default()
                },
                &cancel,
            )
            .await
            .unwrap();
        }
        let pending = svc.pending("b", Some(10), &cancel).await.unwrap();
        let priorities: Vec<u8> = pending.iter().map(|m| m.priority).collect();
        assert_eq!(priorities, vec![8, 5, 3]);
    }

    #[tokio::test]
    async fn mark_delivered_sets_status_and_timestamp() {
        let svc = service();
        let cancel = CancellationToken::new();
        let id = svc
            .send("a", "b", MessageKind::Command, payload(), SendOptions::default(), &cancel)
            .await
            .unwrap();
        svc.mark_delivered(&id, &cancel).await.unwrap();
        let msg = svc.get(&id, &cancel).await.unwrap();
        assert_eq!(msg.status, MessageStatus::Delivered);
        assert!(msg.delivered_at.is_some());
    }

    #[tokio::test]
    async fn acknowledge_is_independent_of_status() {
        let svc = service();
        let cancel = CancellationToken::new();
        let id = svc
            .send("a", "b", MessageKind::Command, payload(), SendOptions::default(), &cancel)
            .await
            .unwrap();
        svc.acknowledge(&id, &cancel).await.unwrap();
        let msg = svc.get(&id, &cancel).await.unwrap();
        assert_eq!(msg.status, MessageStatus::Pending);
        assert!(msg.acknowledged_at.is_some());
    }

    #[tokio::test]
    async fn conversation_returns_only_matching_correlation_id() {
        let svc = service();
        let cancel = CancellationToken::new();
        for i in 0..3 {
            svc.send(
                "a",
                "b",
                MessageKind::DataShare,
                payload(),
                SendOptions {
                    correlation_id: Some("conv-42".to_string()),
                    ..Default::default()
                },
                &cancel,
            )
            .await
            .unwrap();
            let _ = i;
        }
        svc.send("a", "b", MessageKind::DataShare, payload(), SendOptions::default(), &cancel)
            .await
            .unwrap();

        let conv = svc.conversation("conv-42", &cancel).await.unwrap();
        assert_eq!(conv.len(), 3);
    }

    #[tokio::test]
    async fn sweep_expired_removes_only_expired_messages() {
        let svc = service();
        let cancel = CancellationToken::new();
        svc.send(
            "a",
            "b",
            MessageKind::Command,
            payload(),
            SendOptions {
                ttl_secs: Some(0),
                ..Default::default()
            },
            &cancel,
        )
        .await
        .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let removed = svc.sweep_expired(&cancel).await;
        assert_eq!(removed, 1);
        assert!(svc.pending("b", None, &cancel).await.unwrap().is_empty());
    }
}
