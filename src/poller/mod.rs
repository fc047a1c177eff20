//! Per-agent cooperative loops bridging durable storage to in-process
//! handlers.
//!
//! Lifecycle and cancellation are modeled the same way the corpus's
//! `ShutdownService`/`PubSubBridge` pair does: a `watch::Sender<bool>`
//! signals stop, a `parking_lot::Mutex`-guarded flag makes Start/Stop
//! idempotent, and a stored `JoinHandle` lets Stop wait for the in-flight
//! poll to actually finish before returning.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::message::{Message, MessageService};
use crate::pubsub::{Publication, PubSubService};

/// Default poll interval for both poller kinds, per §4.5.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
/// Default batch size for the message poller.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// The capability an agent implementation supplies to its pollers.
///
/// Represented as a plain trait rather than reflection-driven dispatch:
/// the runtime hands the composite poller one implementation with two
/// methods, one per primitive.
#[async_trait]
pub trait CommunicationHandler: Send + Sync {
    async fn handle_message(&self, message: &Message) -> Result<()>;
    async fn handle_publication(&self, publication: &Publication) -> Result<()>;
}

/// The handler installed when the runtime attaches no custom one:
/// acknowledges every message it receives and treats every publication as
/// successfully processed.
pub struct DefaultHandler {
    messages: Arc<MessageService>,
}

impl DefaultHandler {
    pub fn new(messages: Arc<MessageService>) -> Self {
        Self { messages }
    }
}

#[async_trait]
impl CommunicationHandler for DefaultHandler {
    async fn handle_message(&self, message: &Message) -> Result<()> {
        self.messages.acknowledge(&message.id, &CancellationToken::new()).await
    }

    async fn handle_publication(&self, _publication: &Publication) -> Result<()> {
        Ok(())
    }
}

/// Shared Start/Stop bookkeeping used by both poller kinds.
struct PollerState {
    stop_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
    running: Mutex<bool>,
}

impl PollerState {
    fn new() -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            stop_tx,
            task: Mutex::new(None),
            running: Mutex::new(false),
        }
    }

    fn start(&self, spawn: impl FnOnce(watch::Receiver<bool>) -> JoinHandle<()>) {
        let mut running = self.running.lock();
        if *running {
            tracing::warn!("poller already running; ignoring duplicate start");
            return;
        }
        // A prior stop may have left the watch channel in the `true`
        // state; reset it so the new task's select loop doesn't observe
        // a stale cancellation on its first iteration.
        let _ = self.stop_tx.send(false);
        let rx = self.stop_tx.subscribe();
        *self.task.lock() = Some(spawn(rx));
        *running = true;
    }

    async fn stop(&self) {
        let handle = {
            let mut running = self.running.lock();
            if !*running {
                return;
            }
            *running = false;
            self.task.lock().take()
        };
        let _ = self.stop_tx.send(true);
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    fn is_running(&self) -> bool {
        *self.running.lock()
    }
}

type HandlerRef = Arc<dyn CommunicationHandler>;

/// Bridges the Message Service to a per-agent handler.
pub struct MessagePoller {
    agent: String,
    interval: Duration,
    batch_size: usize,
    messages: Arc<MessageService>,
    handler: HandlerRef,
    state: PollerState,
}

impl MessagePoller {
    pub fn new(agent: impl Into<String>, messages: Arc<MessageService>, handler: HandlerRef) -> Self {
        Self {
            agent: agent.into(),
            interval: DEFAULT_POLL_INTERVAL,
            batch_size: DEFAULT_BATCH_SIZE,
            messages,
            handler,
            state: PollerState::new(),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn is_running(&self) -> bool {
        self.state.is_running()
    }

    /// Spawns the cooperative loop. Idempotent: a second call while
    /// already running logs a warning and does nothing.
    pub fn start(self: &Arc<Self>) {
        let this = Arc::clone(self);
        self.state.start(move |mut stop_rx| {
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(this.interval);
                // Poll immediately, then every `interval`.
                interval.tick().await;
                loop {
                    let cancel = CancellationToken::new();
                    tokio::select! {
                        biased;
                        _ = stop_rx.changed() => {
                            if *stop_rx.borrow() {
                                cancel.cancel();
                                break;
                            }
                        }
                        _ = this.poll_once(&cancel) => {}
                    }
                    tokio::select! {
                        biased;
                        _ = stop_rx.changed() => {
                            if *stop_rx.borrow() {
                                break;
                            }
                        }
                        _ = interval.tick() => {}
                    }
                }
            })
        });
    }

    pub async fn stop(&self) {
        self.state.stop().await;
    }

    async fn poll_once(&self, cancel: &CancellationToken) {
        let batch = match self.messages.pending(&self.agent, Some(self.batch_size), cancel).await {
            Ok(batch) => batch,
            Err(e) => {
                tracing::warn!(agent = %self.agent, error = %e, "message poll failed");
                return;
            }
        };
        for message in batch {
            let outcome = self.handler.handle_message(&message).await;
            let result = match outcome {
                Ok(()) => self.messages.mark_delivered(&message.id, cancel).await,
                Err(e) => {
                    tracing::warn!(agent = %self.agent, message = %message.id, error = %e, "message handler failed");
                    self.messages.mark_failed(&message.id, cancel).await
                }
            };
            if let Err(e) = result {
                tracing::warn!(agent = %self.agent, message = %message.id, error = %e, "failed to record message outcome");
            }
        }
    }
}

/// Bridges the Pub/Sub Service's `matching` fan-out to a per-agent handler.
pub struct PublicationPoller {
    agent: String,
    interval: Duration,
    pubsub: Arc<PubSubService>,
    handler: HandlerRef,
    last_poll: Mutex<chrono::DateTime<Utc>>,
    state: PollerState,
}

impl PublicationPoller {
    pub fn new(agent: impl Into<String>, pubsub: Arc<PubSubService>, handler: HandlerRef) -> Self {
        Self {
            agent: agent.into(),
            interval: DEFAULT_POLL_INTERVAL,
            pubsub,
            handler,
            last_poll: Mutex::new(Utc::now()),
            state: PollerState::new(),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn is_running(&self) -> bool {
        self.state.is_running()
    }

    pub fn start(self: &Arc<Self>) {
        let this = Arc::clone(self);
        self.state.start(move |mut stop_rx| {
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(this.interval);
                interval.tick().await;
                loop {
                    let cancel = CancellationToken::new();
                    tokio::select! {
                        biased;
                        _ = stop_rx.changed() => {
                            if *stop_rx.borrow() {
                                cancel.cancel();
                                break;
                            }
                        }
                        _ = this.poll_once(&cancel) => {}
                    }
                    tokio::select! {
                        biased;
                        _ = stop_rx.changed() => {
                            if *stop_rx.borrow() {
                                break;
                            }
                        }
                        _ = interval.tick() => {}
                    }
                }
            })
        });
    }

    pub async fn stop(&self) {
        self.state.stop().await;
    }

    async fn poll_once(&self, cancel: &CancellationToken) {
        // Advance the watermark before the query so a publication seen
        // during this call is only ever protected against re-delivery by
        // the delivery-edge dedup, never by the watermark itself.
        let since = {
            let mut last_poll = self.last_poll.lock();
            let since = *last_poll;
            *last_poll = Utc::now();
            since
        };
        let publications = match self.pubsub.matching(&self.agent, since, cancel).await {
            Ok(pubs) => pubs,
            Err(e) => {
                tracing::warn!(agent = %self.agent, error = %e, "publication poll failed");
                return;
            }
        };
        for publication in publications {
            if let Err(e) = self.handler.handle_publication(&publication).await {
                tracing::warn!(
                    agent = %self.agent,
                    publication = %publication.id,
                    error = %e,
                    "publication handler failed"
                );
            }
        }
    }
}

/// Starts and stops a [`MessagePoller`] and [`PublicationPoller`] for the
/// same agent together.
pub struct CommunicationPoller {
    pub messages: Arc<MessagePoller>,
    pub publications: Arc<PublicationPoller>,
}

impl CommunicationPoller {
    /// `message_interval`/`publication_interval` default to
    /// [`DEFAULT_POLL_INTERVAL`] when `None`, matching `start_polling`'s
    /// external contract.
    pub fn new(
        agent: impl Into<String>,
        message_service: Arc<MessageService>,
        pubsub_service: Arc<PubSubService>,
        handler: HandlerRef,
        message_interval: Option<Duration>,
        publication_interval: Option<Duration>,
    ) -> Self {
        let agent = agent.into();
        let messages = MessagePoller::new(agent.clone(), message_service, Arc::clone(&handler))
            .with_interval(message_interval.unwrap_or(DEFAULT_POLL_INTERVAL));
        let publications = PublicationPoller::new(agent, pubsub_service, handler)
            .with_interval(publication_interval.unwrap_or(DEFAULT_POLL_INTERVAL));
        Self {
            messages: Arc::new(messages),
            publications: Arc::new(publications),
        }
    }

    pub fn start(&self) {
        self.messages.start();
        self.publications.start();
    }

    pub async fn stop(&self) {
        self.messages.stop().await;
        self.publications.stop().await;
    }

    pub fn is_running(&self) -> bool {
        self.messages.is_running() || self.publications.is_running()
    }
}
