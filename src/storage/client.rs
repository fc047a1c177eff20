//! HTTP-backed [`StorageAdapter`] implementation.
//!
//! Talks to a document+edge store over its REST surface: per-database
//! collection CRUD plus an AQL-style cursor endpoint for queries, with
//! basic authentication. No off-the-shelf driver crate covers this kind
//! of backend, so this is a thin `reqwest` wrapper kept as narrow as the
//! operations in the storage adapter trait require.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::config::SubstrateConfig;
use crate::error::{Result, StorageError};
use crate::message::types::{Message, MessageStatus};
use crate::pubsub::types::{Delivery, Publication, Subscription};
use crate::util::retry::retry_with_backoff;

use super::{Collection, StorageAdapter};

/// Thin REST client against a document+edge store, scoped to the
/// substrate's own collections.
pub struct HttpStorageClient {
    http: Client,
    base_url: String,
    username: String,
    password: String,
    max_retry_attempts: u32,
    retry_base_delay: Duration,
}

impl HttpStorageClient {
    pub fn new(config: &SubstrateConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| StorageError::Config(e.to_string()))?;

        Ok(Self {
            http,
            base_url: config.url.trim_end_matches('/').to_string(),
            username: config.username.clone(),
            password: config.password.clone(),
            max_retry_attempts: config.max_retry_attempts,
            retry_base_delay: config.retry_base_delay,
        })
    }

    fn collection_url(&self, tenant: &str, collection: Collection) -> String {
        format!(
            "{}/_db/{}/_api/document/{}",
            self.base_url,
            tenant,
            collection.name()
        )
    }

    fn document_url(&self, tenant: &str, collection: Collection, key: &str) -> String {
        format!("{}/{key}", self.collection_url(tenant, collection))
    }

    fn cursor_url(&self, tenant: &str) -> String {
        format!("{}/_db/{}/_api/cursor", self.base_url, tenant)
    }

    async fn run_query<T: DeserializeOwned>(
        &self,
        tenant: &str,
        query: &str,
        bind_vars: Value,
        cancel: &CancellationToken,
    ) -> Result<Vec<T>> {
        retry_with_backoff(self.max_retry_attempts, self.retry_base_delay, || {
            let url = self.cursor_url(tenant);
            let body = json!({ "query": query, "bindVars": bind_vars });
            async move {
                if cancel.is_cancelled() {
                    return Err(StorageError::Cancelled);
                }
                let resp = self
                    .http
                    .post(&url)
                    .basic_auth(&self.username, Some(&self.password))
                    .json(&body)
                    .send()
                    .await?;
                let resp = raise_for_status(resp).await?;
                let decoded: CursorResponse<T> = resp.json().await?;
                Ok(decoded.result)
            }
        })
        .await
    }

    async fn insert_document<T: Serialize + Sync>(
        &self,
        tenant: &str,
        collection: Collection,
        key: &str,
        document: &T,
        cancel: &CancellationToken,
    ) -> Result<()> {
        retry_with_backoff(self.max_retry_attempts, self.retry_base_delay, || {
            let url = self.collection_url(tenant, collection);
            async move {
                if cancel.is_cancelled() {
                    return Err(StorageError::Cancelled);
                }
                let resp = self
                    .http
                    .post(&url)
                    .basic_auth(&self.username, Some(&self.password))
                    .json(document)
                    .send()
                    .await?;
                if resp.status() == StatusCode::CONFLICT {
                    return Err(StorageError::DuplicateKey(key.to_string()));
                }
                raise_for_status(resp).await?;
                Ok(())
            }
        })
        .await
    }

    async fn get_document<T: DeserializeOwned>(
        &self,
        tenant: &str,
        collection: Collection,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<T> {
        retry_with_backoff(self.max_retry_attempts, self.retry_base_delay, || {
            let url = self.document_url(tenant, collection, key);
            async move {
                if cancel.is_cancelled() {
                    return Err(StorageError::Cancelled);
                }
                let resp = self
                    .http
                    .get(&url)
                    .basic_auth(&self.username, Some(&self.password))
                    .send()
                    .await?;
                if resp.status() == StatusCode::NOT_FOUND {
                    return Err(StorageError::not_found(format!(
                        "{} {key}",
                        collection.name()
                    )));
                }
                let resp = raise_for_status(resp).await?;
                Ok(resp.json::<T>().await?)
            }
        })
        .await
    }

    async fn patch_document(
        &self,
        tenant: &str,
        collection: Collection,
        key: &str,
        patch: Value,
        cancel: &CancellationToken,
    ) -> Result<()> {
        retry_with_backoff(self.max_retry_attempts, self.retry_base_delay, || {
            let url = self.document_url(tenant, collection, key);
            let patch = patch.clone();
            async move {
                if cancel.is_cancelled() {
                    return Err(StorageError::Cancelled);
                }
                let resp = self
                    .http
                    .patch(&url)
                    .basic_auth(&self.username, Some(&self.password))
                    .json(&patch)
                    .send()
                    .await?;
                if resp.status() == StatusCode::NOT_FOUND {
                    return Err(StorageError::not_found(format!(
                        "{} {key}",
                        collection.name()
                    )));
                }
                raise_for_status(resp).await?;
                Ok(())
            }
        })
        .await
    }

    async fn delete_document(
        &self,
        tenant: &str,
        collection: Collection,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        retry_with_backoff(self.max_retry_attempts, self.retry_base_delay, || {
            let url = self.document_url(tenant, collection, key);
            async move {
                if cancel.is_cancelled() {
                    return Err(StorageError::Cancelled);
                }
                let resp = self
                    .http
                    .delete(&url)
                    .basic_auth(&self.username, Some(&self.password))
                    .send()
                    .await?;
                if resp.status() == StatusCode::NOT_FOUND {
                    return Err(StorageError::not_found(format!(
                        "{} {key}",
                        collection.name()
                    )));
                }
                raise_for_status(resp).await?;
                Ok(())
            }
        })
        .await
    }
}

#[derive(serde::Deserialize)]
struct CursorResponse<T> {
    result: Vec<T>,
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use httpmock::Method::{DELETE, GET, POST};
    use httpmock::MockServer;
    use serde_json::json;

    use super::*;
    use crate::message::types::{Message, MessageKind, SendOptions};
    use crate::pubsub::types::{Publication, PublishOptions};

    fn config_for(server: &MockServer) -> SubstrateConfig {
        SubstrateConfig {
            url: server.base_url(),
            username: "root".to_string(),
            password: "".to_string(),
            max_retry_attempts: 3,
            retry_base_delay: Duration::from_millis(1),
            ..SubstrateConfig::default()
        }
    }

    fn payload() -> HashMap<String, Value> {
        HashMap::from([("k".to_string(), Value::String("v".to_string()))])
    }

    #[tokio::test]
    async fn create_message_posts_to_the_collection_endpoint() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/_db/t1/_api/document/agent_messages");
                then.status(201).json_body(json!({"_key": "msg-1"}));
            })
            .await;

        let client = HttpStorageClient::new(&config_for(&server)).unwrap();
        let message = Message::new("a", "b", MessageKind::Command, payload(), SendOptions::default()).unwrap();
        client
            .create_message("t1", &message, &CancellationToken::new())
            .await
            .unwrap();

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn create_message_conflict_maps_to_duplicate_key() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/_db/t1/_api/document/agent_messages");
                then.status(409);
            })
            .await;

        let client = HttpStorageClient::new(&config_for(&server)).unwrap();
        let message = Message::new("a", "b", MessageKind::Command, payload(), SendOptions::default()).unwrap();
        let err = client
            .create_message("t1", &message, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::DuplicateKey(_)));
    }

    #[tokio::test]
    async fn get_publication_not_found_maps_to_not_found() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/_db/t1/_api/document/agent_publications/pub-missing");
                then.status(404);
            })
            .await;

        let client = HttpStorageClient::new(&config_for(&server)).unwrap();
        let err = client
            .get_publication("t1", "pub-missing", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[tokio::test]
    async fn service_unavailable_is_retried_then_surfaced() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/_db/t1/_api/document/agent_publications");
                then.status(503);
            })
            .await;

        let client = HttpStorageClient::new(&config_for(&server)).unwrap();
        let publication = Publication::new("y", "sensor", "reading.temp", payload(), PublishOptions::default()).unwrap();
        let err = client
            .create_publication("t1", &publication, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::BackendUnavailable(_)));
        // One initial attempt plus two retries, per `max_retry_attempts: 3`.
        mock.assert_hits_async(3).await;
    }

    #[tokio::test]
    async fn provision_tenant_tolerates_already_existing_database_and_collections() {
        let server = MockServer::start_async().await;
        let db_mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/_api/database");
                then.status(409);
            })
            .await;
        let collection_mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/_db/t1/_api/collection");
                then.status(409);
            })
            .await;

        let client = HttpStorageClient::new(&config_for(&server)).unwrap();
        client.provision_tenant("t1", &CancellationToken::new()).await.unwrap();

        db_mock.assert_async().await;
        collection_mock.assert_hits_async(4).await;
    }

    #[tokio::test]
    async fn deprovision_tenant_is_a_no_op_when_database_already_gone() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(DELETE).path("/_api/database/t1");
                then.status(404);
            })
            .await;

        let client = HttpStorageClient::new(&config_for(&server)).unwrap();
        client.deprovision_tenant("t1", &CancellationToken::new()).await.unwrap();
    }
}

async fn raise_for_status(resp: reqwest::Response) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        Ok(resp)
    } else if status == StatusCode::SERVICE_UNAVAILABLE || status == StatusCode::GATEWAY_TIMEOUT {
        Err(StorageError::BackendUnavailable(format!("status {status}")))
    } else {
        let body = resp.text().await.unwrap_or_default();
        Err(StorageError::Transport(format!("status {status}: {body}")))
    }
}

#[async_trait]
impl StorageAdapter for HttpStorageClient {
    async fn provision_tenant(&self, tenant: &str, cancel: &CancellationToken) -> Result<()> {
        retry_with_backoff(self.max_retry_attempts, self.retry_base_delay, || {
            let url = format!("{}/_api/database", self.base_url);
            async move {
                if cancel.is_cancelled() {
                    return Err(StorageError::Cancelled);
                }
                let resp = self
                    .http
                    .post(&url)
                    .basic_auth(&self.username, Some(&self.password))
                    .json(&json!({ "name": tenant }))
                    .send()
                    .await?;
                // A database that already exists is not an error: provisioning is idempotent.
                if resp.status() != StatusCode::CONFLICT {
                    raise_for_status(resp).await?;
                }
                Ok(())
            }
        })
        .await?;

        for collection in Collection::all() {
            retry_with_backoff(self.max_retry_attempts, self.retry_base_delay, || {
                let url = format!("{}/_db/{}/_api/collection", self.base_url, tenant);
                async move {
                    if cancel.is_cancelled() {
                        return Err(StorageError::Cancelled);
                    }
                    let collection_type = if collection.is_edge() { 3 } else { 2 };
                    let resp = self
                        .http
                        .post(&url)
                        .basic_auth(&self.username, Some(&self.password))
                        .json(&json!({ "name": collection.name(), "type": collection_type }))
                        .send()
                        .await?;
                    if resp.status() != StatusCode::CONFLICT {
                        raise_for_status(resp).await?;
                    }
                    Ok(())
                }
            })
            .await?;
        }
        Ok(())
    }

    async fn deprovision_tenant(&self, tenant: &str, cancel: &CancellationToken) -> Result<()> {
        retry_with_backoff(self.max_retry_attempts, self.retry_base_delay, || {
            let url = format!("{}/_api/database/{}", self.base_url, tenant);
            async move {
                if cancel.is_cancelled() {
                    return Err(StorageError::Cancelled);
                }
                let resp = self
                    .http
                    .delete(&url)
                    .basic_auth(&self.username, Some(&self.password))
                    .send()
                    .await?;
                if resp.status() != StatusCode::NOT_FOUND {
                    raise_for_status(resp).await?;
                }
                Ok(())
            }
        })
        .await
    }

    async fn create_message(&self, tenant: &str, message: &Message, cancel: &CancellationToken) -> Result<()> {
        self.insert_document(tenant, Collection::Messages, &message.id, message, cancel)
            .await
    }

    async fn get_message(&self, tenant: &str, id: &str, cancel: &CancellationToken) -> Result<Message> {
        self.get_document(tenant, Collection::Messages, id, cancel).await
    }

    async fn list_pending_messages(
        &self,
        tenant: &str,
        agent: &str,
        limit: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<Message>> {
        let query = format!(
            "FOR m IN {} FILTER m.to_agent_id == @agent AND m.status == 'pending' \
             AND (m.expires_at == null OR m.expires_at > @now) \
             SORT m.priority DESC, m.created_at ASC LIMIT @limit RETURN m",
            Collection::Messages.name()
        );
        let bind_vars = json!({ "agent": agent, "now": Utc::now(), "limit": limit });
        self.run_query(tenant, &query, bind_vars, cancel).await
    }

    async fn list_correlated(
        &self,
        tenant: &str,
        correlation_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<Message>> {
        let query = format!(
            "FOR m IN {} FILTER m.correlation_id == @cid SORT m.created_at ASC RETURN m",
            Collection::Messages.name()
        );
        let bind_vars = json!({ "cid": correlation_id });
        self.run_query(tenant, &query, bind_vars, cancel).await
    }

    async fn update_message_status(
        &self,
        tenant: &str,
        id: &str,
        status: MessageStatus,
        delivered_at: Option<DateTime<Utc>>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut patch = HashMap::new();
        patch.insert("status", json!(status));
        if let Some(at) = delivered_at {
            patch.insert("delivered_at", json!(at));
        }
        self.patch_document(tenant, Collection::Messages, id, json!(patch), cancel)
            .await
    }

    async fn update_message_ack(
        &self,
        tenant: &str,
        id: &str,
        ack_at: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.patch_document(
            tenant,
            Collection::Messages,
            id,
            json!({ "acknowledged_at": ack_at }),
            cancel,
        )
        .await
    }

    async fn create_publication(
        &self,
        tenant: &str,
        publication: &Publication,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.insert_document(tenant, Collection::Publications, &publication.id, publication, cancel)
            .await
    }

    async fn get_publication(&self, tenant: &str, id: &str, cancel: &CancellationToken) -> Result<Publication> {
        self.get_document(tenant, Collection::Publications, id, cancel).await
    }

    async fn list_candidate_publications(
        &self,
        tenant: &str,
        subs: &[String],
        since: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<Vec<Publication>> {
        // Over-fetch by time window; the anti-join against delivered
        // (publication, subscription) pairs and the final pattern match
        // happen in-process (§4.1/§9 "over-fetch then filter").
        let query = format!(
            "FOR p IN {} FILTER p.published_at > @since AND p.expires_at > @now \
             SORT p.published_at ASC RETURN p",
            Collection::Publications.name()
        );
        let bind_vars = json!({ "since": since, "now": Utc::now() });
        let candidates: Vec<Publication> = self.run_query(tenant, &query, bind_vars, cancel).await?;

        if subs.is_empty() {
            return Ok(candidates);
        }

        let delivered_query = format!(
            "FOR d IN {} FILTER d.subscription_id IN @subs RETURN {{ pub: d._from, sub: d.subscription_id }}",
            Collection::PublicationDeliveries.name()
        );
        let delivered: Vec<DeliveredPair> = self
            .run_query(tenant, &delivered_query, json!({ "subs": subs }), cancel)
            .await?;

        Ok(candidates
            .into_iter()
            .filter(|p| {
                !subs.iter().all(|sub_id| {
                    delivered
                        .iter()
                        .any(|d| d.sub == *sub_id && d.publication_matches(&p.id))
                })
            })
            .collect())
    }

    async fn create_subscription(
        &self,
        tenant: &str,
        subscription: &Subscription,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.insert_document(tenant, Collection::Subscriptions, &subscription.id, subscription, cancel)
            .await
    }

    async fn get_subscription(&self, tenant: &str, id: &str, cancel: &CancellationToken) -> Result<Subscription> {
        self.get_document(tenant, Collection::Subscriptions, id, cancel).await
    }

    async fn list_active_subscriptions(
        &self,
        tenant: &str,
        subscriber: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<Subscription>> {
        let query = format!(
            "FOR s IN {} FILTER s.subscriber_agent_id == @subscriber AND s.active == true RETURN s",
            Collection::Subscriptions.name()
        );
        self.run_query(tenant, &query, json!({ "subscriber": subscriber }), cancel)
            .await
    }

    async fn list_subscriptions(
        &self,
        tenant: &str,
        subscriber: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<Subscription>> {
        let query = format!(
            "FOR s IN {} FILTER s.subscriber_agent_id == @subscriber RETURN s",
            Collection::Subscriptions.name()
        );
        self.run_query(tenant, &query, json!({ "subscriber": subscriber }), cancel)
            .await
    }

    async fn deactivate_subscription(&self, tenant: &str, id: &str, cancel: &CancellationToken) -> Result<()> {
        self.patch_document(
            tenant,
            Collection::Subscriptions,
            id,
            json!({ "active": false, "updated_at": Utc::now() }),
            cancel,
        )
        .await
    }

    async fn delete_subscription(&self, tenant: &str, id: &str, cancel: &CancellationToken) -> Result<()> {
        self.delete_document(tenant, Collection::Subscriptions, id, cancel).await
    }

    async fn update_subscription_last_matched(
        &self,
        tenant: &str,
        id: &str,
        ts: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.patch_document(
            tenant,
            Collection::Subscriptions,
            id,
            json!({ "last_matched_at": ts }),
            cancel,
        )
        .await
    }

    async fn create_delivery(
        &self,
        tenant: &str,
        publication_id: &str,
        agent_id: &str,
        subscription_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Delivery> {
        let delivery = Delivery::new(publication_id, agent_id, subscription_id);
        self.insert_document(tenant, Collection::PublicationDeliveries, &delivery.id, &delivery, cancel)
            .await?;
        Ok(delivery)
    }

    async fn delete_expired(
        &self,
        tenant: &str,
        collection: Collection,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let query = format!(
            "FOR d IN {} FILTER d.expires_at < @now REMOVE d IN {} RETURN 1",
            collection.name(),
            collection.name()
        );
        let removed: Vec<i64> = self.run_query(tenant, &query, json!({ "now": now }), cancel).await?;
        Ok(removed.len() as u64)
    }

    async fn health_check(&self, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(StorageError::Cancelled);
        }
        let url = format!("{}/_api/version", self.base_url);
        let resp = self
            .http
            .get(&url)
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await?;
        raise_for_status(resp).await?;
        Ok(())
    }
}

#[derive(serde::Deserialize)]
struct DeliveredPair {
    #[serde(rename = "pub")]
    publication_path: String,
    sub: String,
}

impl DeliveredPair {
    fn publication_matches(&self, publication_id: &str) -> bool {
        self.publication_path.ends_with(publication_id)
    }
}
