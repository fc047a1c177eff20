//! Durable multi-tenant agent communication substrate.
//!
//! Provides two messaging primitives for agents running inside isolated
//! tenant ("agency") databases: addressed direct messages via
//! [`message::MessageService`] and topic-pattern publish/subscribe via
//! [`pubsub::PubSubService`], bridged to in-process handlers through
//! [`poller`]. [`agency::TenantRegistry`] resolves an agency id to its
//! storage handle and provisions per-tenant collections on creation.
//!
//! This crate has no network surface or CLI of its own: it is embedded by
//! an agent runtime, which talks to it exclusively through the types in
//! this module tree and [`contracts`].

pub mod agency;
pub mod config;
pub mod contracts;
pub mod error;
pub mod message;
pub mod pattern;
pub mod poller;
pub mod pubsub;
pub mod storage;
mod util;

pub use error::{Result, StorageError};
