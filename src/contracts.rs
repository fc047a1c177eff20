//! Surface exposed to the agent runtime: wiring, polling lifecycle, and
//! convenience forwarders. Not part of the durable core itself, but
//! defined here so the runtime has a single, stable attachment point.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, StorageError};
use crate::message::{MessageKind, MessageService, SendOptions};
use crate::poller::{CommunicationHandler, CommunicationPoller, DefaultHandler};
use crate::pubsub::{PubSubService, PublishOptions, SubscribeOptions};

/// The services and poller wired onto one agent instance.
struct CommunicationHandle {
    agent_id: String,
    agent_type: String,
    messages: Arc<MessageService>,
    pubsub: Arc<PubSubService>,
    handler: Arc<dyn CommunicationHandler>,
    poller: Option<Arc<CommunicationPoller>>,
}

/// The attachment point an agent instance embeds. Starts empty; exactly
/// one [`attach`](CommunicationSlot::attach) call may succeed.
pub struct CommunicationSlot {
    inner: Mutex<Option<CommunicationHandle>>,
}

impl Default for CommunicationSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl CommunicationSlot {
    pub fn new() -> Self {
        Self { inner: Mutex::new(None) }
    }

    /// Installs `messages` and `pubsub` on this agent. `handler` defaults
    /// to [`DefaultHandler`] (ack-on-receive, no-op on publication) when
    /// `None`. Attaching twice is an error.
    pub fn attach(
        &self,
        agent_id: impl Into<String>,
        agent_type: impl Into<String>,
        messages: Arc<MessageService>,
        pubsub: Arc<PubSubService>,
        handler: Option<Arc<dyn CommunicationHandler>>,
    ) -> Result<()> {
        let mut slot = self.inner.lock();
        if slot.is_some() {
            return Err(StorageError::conflict("communication already attached to this agent"));
        }
        let handler = handler.unwrap_or_else(|| Arc::new(DefaultHandler::new(Arc::clone(&messages))) as Arc<dyn CommunicationHandler>);
        *slot = Some(CommunicationHandle {
            agent_id: agent_id.into(),
            agent_type: agent_type.into(),
            messages,
            pubsub,
            handler,
            poller: None,
        });
        Ok(())
    }

    pub fn is_attached(&self) -> bool {
        self.inner.lock().is_some()
    }

    /// Starts a [`CommunicationPoller`] for this agent. A no-op if one is
    /// already running.
    pub fn start_polling(&self, message_interval: Option<Duration>, publication_interval: Option<Duration>) -> Result<()> {
        let mut slot = self.inner.lock();
        let handle = slot
            .as_mut()
            .ok_or_else(|| StorageError::not_found("communication not attached"))?;

        if let Some(poller) = &handle.poller {
            if poller.is_running() {
                tracing::warn!(agent = %handle.agent_id, "start_polling called while already polling; ignoring");
                return Ok(());
            }
        }

        let poller = Arc::new(CommunicationPoller::new(
            handle.agent_id.clone(),
            Arc::clone(&handle.messages),
            Arc::clone(&handle.pubsub),
            Arc::clone(&handle.handler),
            message_interval,
            publication_interval,
        ));
        poller.start();
        handle.poller = Some(poller);
        Ok(())
    }

    /// Stops this agent's poller, if any. Idempotent.
    pub async fn stop_polling(&self) -> Result<()> {
        let poller = {
            let mut slot = self.inner.lock();
            let handle = slot
                .as_mut()
                .ok_or_else(|| StorageError::not_found("communication not attached"))?;
            handle.poller.take()
        };
        if let Some(poller) = poller {
            poller.stop().await;
        }
        Ok(())
    }

    fn handle(&self) -> Result<(String, String, Arc<MessageService>, Arc<PubSubService>)> {
        let slot = self.inner.lock();
        let handle = slot
            .as_ref()
            .ok_or_else(|| StorageError::not_found("communication not attached"))?;
        Ok((
            handle.agent_id.clone(),
            handle.agent_type.clone(),
            Arc::clone(&handle.messages),
            Arc::clone(&handle.pubsub),
        ))
    }

    pub async fn send(
        &self,
        to: &str,
        kind: MessageKind,
        payload: HashMap<String, Value>,
        opts: SendOptions,
    ) -> Result<String> {
        let (agent_id, _, messages, _) = self.handle()?;
        messages.send(&agent_id, to, kind, payload, opts, &CancellationToken::new()).await
    }

    pub async fn subscribe(&self, event_pattern: &str, opts: SubscribeOptions) -> Result<String> {
        let (agent_id, agent_type, _, pubsub) = self.handle()?;
        pubsub
            .subscribe(&agent_id, &agent_type, event_pattern, opts, &CancellationToken::new())
            .await
    }

    pub async fn unsubscribe(&self, sub_id: &str) -> Result<()> {
        let (_, _, _, pubsub) = self.handle()?;
        pubsub.unsubscribe(sub_id, &CancellationToken::new()).await
    }

    pub async fn publish(
        &self,
        event_name: &str,
        payload: HashMap<String, Value>,
        opts: PublishOptions,
    ) -> Result<String> {
        let (agent_id, agent_type, _, pubsub) = self.handle()?;
        pubsub
            .publish(&agent_id, &agent_type, event_name, payload, opts, &CancellationToken::new())
            .await
    }
}

/// Implemented by the runtime's agent type to expose the convenience
/// forwarders (`send`, `subscribe`, `unsubscribe`, `publish`) directly on
/// the agent, each routed through its [`CommunicationSlot`].
#[async_trait]
pub trait AgentCommunication: Send + Sync {
    fn communication(&self) -> &CommunicationSlot;

    async fn send(&self, to: &str, kind: MessageKind, payload: HashMap<String, Value>, opts: SendOptions) -> Result<String> {
        self.communication().send(to, kind, payload, opts).await
    }

    async fn subscribe(&self, event_pattern: &str, opts: SubscribeOptions) -> Result<String> {
        self.communication().subscribe(event_pattern, opts).await
    }

    async fn unsubscribe(&self, sub_id: &str) -> Result<()> {
        self.communication().unsubscribe(sub_id).await
    }

    async fn publish(&self, event_name: &str, payload: HashMap<String, Value>, opts: PublishOptions) -> Result<String> {
        self.communication().publish(event_name, payload, opts).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::InMemoryStorage;

    fn wired_slot() -> (CommunicationSlot, Arc<MessageService>, Arc<PubSubService>) {
        let storage = Arc::new(InMemoryStorage::new());
        let messages = Arc::new(MessageService::new(Arc::clone(&storage) as Arc<dyn crate::storage::StorageAdapter>, "t1"));
        let pubsub = Arc::new(PubSubService::new(storage as Arc<dyn crate::storage::StorageAdapter>, "t1"));
        let slot = CommunicationSlot::new();
        slot.attach("agent-a", "controller", Arc::clone(&messages), Arc::clone(&pubsub), None)
            .unwrap();
        (slot, messages, pubsub)
    }

    #[tokio::test]
    async fn attach_twice_is_rejected() {
        let (slot, messages, pubsub) = wired_slot();
        let err = slot
            .attach("agent-a", "controller", messages, pubsub, None)
            .unwrap_err();
        assert!(matches!(err, StorageError::Conflict(_)));
    }

    #[tokio::test]
    async fn start_polling_twice_is_a_no_op() {
        let (slot, _messages, _pubsub) = wired_slot();
        slot.start_polling(Some(Duration::from_millis(20)), Some(Duration::from_millis(20)))
            .unwrap();
        slot.start_polling(Some(Duration::from_millis(20)), Some(Duration::from_millis(20)))
            .unwrap();
        slot.stop_polling().await.unwrap();
    }

    #[tokio::test]
    async fn forwarders_route_through_attached_services() {
        let (slot, messages, _pubsub) = wired_slot();
        let id = slot
            .send(
                "agent-b",
                MessageKind::Command,
                HashMap::from([("k".to_string(), Value::Null)]),
                SendOptions::default(),
            )
            .await
            .unwrap();
        let msg = messages.get(&id, &CancellationToken::new()).await.unwrap();
        assert_eq!(msg.from_agent_id, "agent-a");
    }
}
