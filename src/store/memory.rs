// Copyright 2020 Joyent, Inc.

use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;

use super::{
    Completion, RecordTable, RequestRecord, RequestStore, StoreError,
};
use crate::protocol::RequestId;

/// Non-durable store.  Records live only as long as the process.
#[derive(Default)]
pub struct MemoryStore {
    table: Mutex<RecordTable>,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore::default()
    }

    fn table(&self) -> Result<MutexGuard<'_, RecordTable>, StoreError> {
        self.table
            .lock()
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }
}

#[async_trait]
impl RequestStore for MemoryStore {
    async fn create(
        &self,
        id: &RequestId,
        payload: Value,
    ) -> Result<(), StoreError> {
        self.table()?
            .insert(RequestRecord::new(id.clone(), payload))
    }

    async fn complete(
        &self,
        id: &RequestId,
        completion: Completion,
    ) -> Result<(), StoreError> {
        self.table()?.complete(id, completion, Utc::now())
    }

    async fn get(
        &self,
        id: &RequestId,
    ) -> Result<Option<RequestRecord>, StoreError> {
        Ok(self.table()?.get(id))
    }

    async fn list_pending(&self) -> Result<Vec<RequestId>, StoreError> {
        Ok(self.table()?.pending())
    }
}
