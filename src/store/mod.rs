//! Coordination store access.
//!
//! The worker needs a small slice of an etcd-like store:
//! - **Prefix reads** that report the store revision they observed
//! - **Prefix watches** resumable from a given revision
//! - **Leases** (TTL handles) that delete their keys on expiry or revoke
//! - **Create-if-absent** writes for mutual exclusion
//!
//! # Implementations
//!
//! - [`EtcdStore`]: etcd v3 over gRPC, used in production
//! - [`MemoryStore`]: in-process store with the same revision and lease
//!   semantics, used by tests
//!
//! A [`WatchStream`] that ends, or yields an `Err`, is broken: the caller is
//! expected to re-read and re-subscribe.

use std::pin::Pin;

use async_trait::async_trait;
use tokio_stream::Stream;

use crate::error::Result;

pub mod etcd;
pub mod memory;

pub use etcd::EtcdStore;
pub use memory::MemoryStore;

pub type LeaseId = i64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
}

/// Result of a prefix read: every matching key plus the store revision at
/// the time of the read.
#[derive(Debug, Clone, Default)]
pub struct PrefixSnapshot {
    pub revision: i64,
    pub kvs: Vec<KeyValue>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Put(KeyValue),
    Delete { key: String },
}

impl WatchEvent {
    pub fn key(&self) -> &str {
        match self {
            WatchEvent::Put(kv) => &kv.key,
            WatchEvent::Delete { key } => key,
        }
    }
}

/// Events delivered together by one watch response, in store order.
#[derive(Debug, Clone, Default)]
pub struct WatchBatch {
    /// Store revision of the last event in the batch.
    pub revision: i64,
    pub events: Vec<WatchEvent>,
}

pub type WatchStream = Pin<Box<dyn Stream<Item = Result<WatchBatch>> + Send>>;

/// Open renewal channel for one lease, kept for as long as the lease is held.
#[async_trait]
pub trait LeaseKeepAlive: Send {
    /// Renew the lease once. Returns the remaining TTL in seconds; a value
    /// `<= 0` means the lease no longer exists.
    async fn renew(&mut self) -> Result<i64>;
}

#[async_trait]
pub trait CoordinationStore: Send + Sync + 'static {
    /// Read every key under `prefix` together with the current revision.
    async fn get_prefix(&self, prefix: &str) -> Result<PrefixSnapshot>;

    /// Watch `prefix`. With `start_revision` the stream first replays every
    /// change at or after that revision; without it only future changes are
    /// delivered.
    async fn watch_prefix(&self, prefix: &str, start_revision: Option<i64>)
        -> Result<WatchStream>;

    /// Unconditional write. Returns the previous value, if any.
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<Option<Vec<u8>>>;

    /// Delete a single key. Returns the previous value, if any.
    async fn delete(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn grant_lease(&self, ttl_secs: i64) -> Result<LeaseId>;

    /// Open a renewal channel for `lease`. A channel that returns `Err` is
    /// broken and should be dropped and reopened.
    async fn keep_alive(&self, lease: LeaseId) -> Result<Box<dyn LeaseKeepAlive>>;

    /// Revoke a lease, deleting every key attached to it.
    async fn revoke_lease(&self, lease: LeaseId) -> Result<()>;

    /// Unconditional write of a key attached to `lease`.
    async fn put_with_lease(&self, key: &str, value: Vec<u8>, lease: LeaseId) -> Result<()>;

    /// Atomically create `key` attached to `lease` only if it does not exist.
    /// Returns whether this call created the key.
    async fn put_if_absent(&self, key: &str, value: Vec<u8>, lease: LeaseId) -> Result<bool>;
}
