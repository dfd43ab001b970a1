pub mod craq;
pub mod redis;

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use thiserror::Error;

use crate::types::{Entry, ObjectId, ServerId};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(String),

    #[error("store request timed out after {0:?}")]
    Timeout(Duration),

    #[error("store connection closed")]
    ConnectionClosed,

    #[error("malformed store value: {0}")]
    MalformedValue(String),
}

impl StoreError {
    /// Whether the bounded retry runner should try this call again.
    /// A malformed value will not get better on re-read.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, StoreError::MalformedValue(_))
    }
}

/// Result of a directory read. `NotFound` is a normal transient outcome (the
/// owning server's registration may simply not have propagated yet) and is
/// distinct from I/O failure.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StoreResult {
    Found(Entry),
    NotFound,
}

/// Result of a directory write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreAck {
    Stored,
    /// `if_absent` write refused because a registration already exists.
    AlreadyExists,
}

/// Async get/set adapter over the backing KV store.
///
/// Calls never block the caller's thread; completion is delivered by awaiting
/// the returned future on a store-I/O task. This trait exists so the
/// resolution logic can be unit-tested against deterministic scripted
/// replies, and so the chain-store and Redis clients stay interchangeable
/// behind one seam.
pub trait DirectoryStore: Send + Sync {
    fn get(&self, key: StoreKey) -> BoxFuture<'_, Result<StoreResult, StoreError>>;

    /// With `if_absent`, the write must not overwrite an existing
    /// registration and reports `StoreAck::AlreadyExists` instead.
    fn set(
        &self,
        key: StoreKey,
        entry: Entry,
        if_absent: bool,
    ) -> BoxFuture<'_, Result<StoreAck, StoreError>>;
}

impl<T> DirectoryStore for Arc<T>
where
    T: DirectoryStore + ?Sized,
{
    fn get(&self, key: StoreKey) -> BoxFuture<'_, Result<StoreResult, StoreError>> {
        (**self).get(key)
    }

    fn set(
        &self,
        key: StoreKey,
        entry: Entry,
        if_absent: bool,
    ) -> BoxFuture<'_, Result<StoreAck, StoreError>> {
        (**self).set(key, entry, if_absent)
    }
}

/// Persisted key: one namespace prefix byte followed by the object id's 32
/// lowercase hex characters. The only key layout the core depends on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StoreKey(String);

impl StoreKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

pub fn object_key(prefix: u8, id: ObjectId) -> StoreKey {
    StoreKey(format!("{}{}", prefix as char, id.to_hex()))
}

/// Persisted value: `"<server>:<radius>"`.
pub fn encode_entry(entry: Entry) -> String {
    format!("{}:{}", entry.server, entry.radius)
}

pub fn decode_entry(raw: &str) -> Result<Entry, StoreError> {
    let (server, radius) = raw
        .split_once(':')
        .ok_or_else(|| StoreError::MalformedValue(raw.to_string()))?;
    let server: ServerId = server
        .parse()
        .map_err(|_| StoreError::MalformedValue(raw.to_string()))?;
    let radius: f64 = radius
        .parse()
        .map_err(|_| StoreError::MalformedValue(raw.to_string()))?;
    Ok(Entry::new(server, radius))
}
