//! The storage adapter contract consumed by the engine.

use async_trait::async_trait;

use crate::error::Result;
use crate::query::QueryDescriptor;
use crate::schema::EntityType;
use crate::types::{ChangeMessage, Key, Record};

/// Raw result of [`StorageAdapter::execute_query`].
#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutput {
    One(Option<Record>),
    Many(Vec<Record>),
}

impl QueryOutput {
    pub fn into_records(self) -> Vec<Record> {
        match self {
            QueryOutput::One(record) => record.into_iter().collect(),
            QueryOutput::Many(records) => records,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            QueryOutput::One(record) => usize::from(record.is_some()),
            QueryOutput::Many(records) => records.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Durable storage behind a [`Store`](crate::store::Store).
///
/// `delete` must fix up entities that reference the deleted one according to
/// their declared delete policy, and return one change message per entity it
/// deleted or rewrote so the caller can notify subscribers.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    async fn get(&self, entity_type: &EntityType, key: &Key) -> Result<Option<Record>>;

    async fn set(&self, entity_type: &EntityType, record: Record, reason: Option<&str>)
        -> Result<()>;

    /// Write several records; `reasons` is matched positionally.
    async fn set_many(
        &self,
        entity_type: &EntityType,
        records: Vec<Record>,
        reasons: &[Option<String>],
    ) -> Result<()> {
        for (i, record) in records.into_iter().enumerate() {
            let reason = reasons.get(i).and_then(|r| r.as_deref());
            self.set(entity_type, record, reason).await?;
        }
        Ok(())
    }

    async fn delete(
        &self,
        entity_type: &EntityType,
        key: &Key,
        reason: Option<&str>,
    ) -> Result<Vec<ChangeMessage>>;

    async fn execute_query(&self, query: &QueryDescriptor) -> Result<QueryOutput>;

    /// Called when a live subscription for `query` starts.
    fn on_subscription_start(&self, _query: &QueryDescriptor) {}

    /// Called when the last consumer of a live subscription goes away.
    fn on_subscription_stop(&self, _query: &QueryDescriptor) {}
}
