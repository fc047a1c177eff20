//! The `Message` entity and its supporting types.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{Result, StorageError};

/// The default time-to-live applied to a message when the caller doesn't
/// specify one.
pub const DEFAULT_MESSAGE_TTL_SECS: i64 = 3600;
/// The default priority applied when the caller doesn't specify one.
pub const DEFAULT_PRIORITY: u8 = 5;
/// The default page size for [`crate::message::MessageService::pending`].
pub const DEFAULT_PENDING_LIMIT: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    TaskRequest,
    DataShare,
    Command,
    Response,
    Notification,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Delivered,
    Failed,
    Expired,
}

/// A durable, point-to-point envelope between two agents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "_key")]
    pub id: String,
    pub from_agent_id: String,
    pub to_agent_id: String,
    pub message_type: MessageKind,
    pub payload: HashMap<String, Value>,
    pub priority: u8,
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub metadata: Option<HashMap<String, Value>>,
}

/// Optional fields accepted by [`crate::message::MessageService::send`].
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub priority: Option<u8>,
    pub ttl_secs: Option<i64>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub metadata: Option<HashMap<String, Value>>,
}

impl Message {
    /// Build a new pending message, applying defaults and validating the
    /// required fields per the send-time invariants.
    pub fn new(
        from: &str,
        to: &str,
        kind: MessageKind,
        payload: HashMap<String, Value>,
        opts: SendOptions,
    ) -> Result<Self> {
        if from.is_empty() {
            return Err(StorageError::invalid_argument("from-agent id must not be empty"));
        }
        if to.is_empty() {
            return Err(StorageError::invalid_argument("to-agent id must not be empty"));
        }
        let priority = opts.priority.unwrap_or(DEFAULT_PRIORITY);
        if !(1..=10).contains(&priority) {
            return Err(StorageError::invalid_argument(format!(
                "priority {priority} out of range [1,10]"
            )));
        }

        let now = Utc::now();
        let ttl = opts.ttl_secs.unwrap_or(DEFAULT_MESSAGE_TTL_SECS);
        if ttl < 0 {
            return Err(StorageError::invalid_argument("ttl_secs must not be negative"));
        }

        Ok(Self {
            id: format!("msg-{}", Uuid::new_v4()),
            from_agent_id: from.to_string(),
            to_agent_id: to.to_string(),
            message_type: kind,
            payload,
            priority,
            status: MessageStatus::Pending,
            created_at: now,
            delivered_at: None,
            acknowledged_at: None,
            expires_at: Some(now + Duration::seconds(ttl)),
            correlation_id: opts.correlation_id,
            reply_to: opts.reply_to,
            metadata: opts.metadata,
        })
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at < now)
    }
}
