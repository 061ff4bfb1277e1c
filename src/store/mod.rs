// Copyright 2020 Joyent, Inc.

//! Durable record of every submitted request.
//!
//! The store is the single source of truth for request state.  Sessions only
//! hold identifiers; whatever a fetch returns comes from here.  Two backings
//! are provided: [`MemoryStore`] for development and tests, and
//! [`JournalStore`], which appends every mutation to a file on disk and
//! replays it on open.

mod journal;
mod memory;

pub use journal::{JournalStore, INTERRUPTED};
pub use memory::MemoryStore;

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_derive::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::protocol::RequestId;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("request store unavailable: {0}")]
    Unavailable(String),
    #[error("request {0} already exists")]
    AlreadyExists(RequestId),
    #[error("request {0} does not exist")]
    UnknownRequest(RequestId),
    #[error("request {0} is already complete")]
    AlreadyCompleted(RequestId),
    #[error("journal line {line} is corrupt: {source}")]
    Corrupt {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Done,
}

/// Terminal outcome of a request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Completion {
    Processed(Value),
    Failed(String),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RequestRecord {
    pub id: RequestId,
    pub payload: Value,
    pub status: RequestStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion: Option<Completion>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl RequestRecord {
    pub fn new(id: RequestId, payload: Value) -> RequestRecord {
        RequestRecord {
            id,
            payload,
            status: RequestStatus::Pending,
            completion: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.status == RequestStatus::Done
    }
}

/// Keyed store of request records.
///
/// Implementations serialize conflicting writes internally; callers never
/// lock around these operations.
#[async_trait]
pub trait RequestStore: Send + Sync {
    /// Persist a new pending record.  Creating an identifier that already
    /// exists is an error, never an overwrite.
    async fn create(
        &self,
        id: &RequestId,
        payload: Value,
    ) -> Result<(), StoreError>;

    /// Move a pending record to done.  A record is completed at most once.
    async fn complete(
        &self,
        id: &RequestId,
        completion: Completion,
    ) -> Result<(), StoreError>;

    /// Current state of a record, without waiting for it to complete.
    async fn get(
        &self,
        id: &RequestId,
    ) -> Result<Option<RequestRecord>, StoreError>;

    /// Identifiers of every pending record, in creation order.
    async fn list_pending(&self) -> Result<Vec<RequestId>, StoreError>;
}

/// Run a store operation under a deadline.  Expiry is reported as the store
/// being unavailable.
pub async fn bounded<T, F>(limit: Duration, op: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(limit, op).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Unavailable(format!(
            "operation timed out after {:?}",
            limit
        ))),
    }
}

/// In-memory index shared by both backings.
#[derive(Default)]
struct RecordTable {
    records: HashMap<RequestId, RequestRecord>,
    order: Vec<RequestId>,
}

impl RecordTable {
    fn check_absent(&self, id: &RequestId) -> Result<(), StoreError> {
        if self.records.contains_key(id) {
            Err(StoreError::AlreadyExists(id.clone()))
        } else {
            Ok(())
        }
    }

    fn check_pending(&self, id: &RequestId) -> Result<(), StoreError> {
        match self.records.get(id) {
            None => Err(StoreError::UnknownRequest(id.clone())),
            Some(r) if r.is_done() => {
                Err(StoreError::AlreadyCompleted(id.clone()))
            }
            Some(_) => Ok(()),
        }
    }

    fn insert(&mut self, record: RequestRecord) -> Result<(), StoreError> {
        self.check_absent(&record.id)?;
        self.order.push(record.id.clone());
        self.records.insert(record.id.clone(), record);
        Ok(())
    }

    fn complete(
        &mut self,
        id: &RequestId,
        completion: Completion,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.check_pending(id)?;
        if let Some(record) = self.records.get_mut(id) {
            record.status = RequestStatus::Done;
            record.completion = Some(completion);
            record.completed_at = Some(at);
        }
        Ok(())
    }

    fn get(&self, id: &RequestId) -> Option<RequestRecord> {
        self.records.get(id).cloned()
    }

    fn pending(&self) -> Vec<RequestId> {
        self.order
            .iter()
            .filter(|id| {
                self.records.get(*id).map_or(false, |r| !r.is_done())
            })
            .cloned()
            .collect()
    }
}
