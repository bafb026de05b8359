//! Fluent query construction.
//!
//! ```ignore
//! let open = Query::new(&tasks)
//!     .filter("done").equals(false)
//!     .and("priority").greater_than(2)
//!     .sort("priority").desc()
//!     .all(&store)
//!     .await?;
//! ```

use std::sync::Arc;

use serde_json::Value;

use super::descriptor::{Filter, Operator, QueryDescriptor, SortDirection};
use crate::entity::Entity;
use crate::error::Result;
use crate::reactive::{LiveBinding, QueryUpdate, SubscriptionHandle};
use crate::schema::EntityType;
use crate::storage::QueryOutput;
use crate::store::Store;

// ============================================================================
// Query
// ============================================================================

/// Entry point for building a query over one entity type.
#[derive(Debug, Clone)]
pub struct Query {
    descriptor: QueryDescriptor,
}

impl Query {
    pub fn new(entity_type: &Arc<EntityType>) -> Self {
        Self {
            descriptor: QueryDescriptor::new(entity_type),
        }
    }

    /// Start a filter on `field`.
    pub fn filter(self, field: impl Into<String>) -> Where {
        Where {
            descriptor: self.descriptor,
            field: field.into(),
        }
    }

    /// Add one equality filter per `(field, value)` pair.
    pub fn matching<K, V>(self, pairs: impl IntoIterator<Item = (K, V)>) -> Collection
    where
        K: Into<String>,
        V: Into<Value>,
    {
        let descriptor = pairs.into_iter().fold(self.descriptor, |d, (k, v)| {
            d.with_filter(Filter::new(k, Operator::Eq, v.into()))
        });
        Collection { descriptor }
    }

    /// Every entity of the type, unfiltered.
    pub fn collection(self) -> Collection {
        Collection {
            descriptor: self.descriptor,
        }
    }
}

// ============================================================================
// Where
// ============================================================================

/// A pending filter on one field.
#[derive(Debug, Clone)]
pub struct Where {
    descriptor: QueryDescriptor,
    field: String,
}

impl Where {
    fn finish(self, operator: Operator, value: Value) -> Collection {
        Collection {
            descriptor: self
                .descriptor
                .with_filter(Filter::new(self.field, operator, value)),
        }
    }

    pub fn equals(self, value: impl Into<Value>) -> Collection {
        self.finish(Operator::Eq, value.into())
    }

    pub fn not_equals(self, value: impl Into<Value>) -> Collection {
        self.finish(Operator::Ne, value.into())
    }

    /// Greater than or equal.
    pub fn greater_than(self, value: impl Into<Value>) -> Collection {
        self.finish(Operator::Gte, value.into())
    }

    /// Lower than or equal.
    pub fn lower_than(self, value: impl Into<Value>) -> Collection {
        self.finish(Operator::Lte, value.into())
    }

    /// Field value is one of `values`.
    pub fn one_of<V: Into<Value>>(self, values: impl IntoIterator<Item = V>) -> Collection {
        let values = values.into_iter().map(Into::into).collect();
        self.finish(Operator::In, Value::Array(values))
    }

    /// Array field contains `value`.
    pub fn contains(self, value: impl Into<Value>) -> Collection {
        self.finish(Operator::Any, value.into())
    }

    /// Inclusive range.
    pub fn between(self, from: impl Into<Value>, to: impl Into<Value>) -> Collection {
        self.finish(Operator::Between, Value::Array(vec![from.into(), to.into()]))
    }
}

// ============================================================================
// Sort
// ============================================================================

#[derive(Debug, Clone)]
pub struct Sort {
    descriptor: QueryDescriptor,
    field: String,
}

impl Sort {
    pub fn asc(self) -> Collection {
        Collection {
            descriptor: self.descriptor.with_sort(self.field, SortDirection::Asc),
        }
    }

    pub fn desc(self) -> Collection {
        Collection {
            descriptor: self.descriptor.with_sort(self.field, SortDirection::Desc),
        }
    }
}

// ============================================================================
// Collection
// ============================================================================

/// A query with at least its filters decided; can be refined, sorted, and
/// executed once or as a live subscription.
#[derive(Debug, Clone)]
pub struct Collection {
    descriptor: QueryDescriptor,
}

impl Collection {
    pub fn and(self, field: impl Into<String>) -> Where {
        Where {
            descriptor: self.descriptor,
            field: field.into(),
        }
    }

    pub fn sort(self, field: impl Into<String>) -> Sort {
        Sort {
            descriptor: self.descriptor,
            field: field.into(),
        }
    }

    /// Restrict results to one scope.
    pub fn scope(mut self, scope: impl Into<String>) -> Self {
        self.descriptor = self.descriptor.with_scope(Some(scope.into()));
        self
    }

    /// Mark the query as single-result.
    pub fn single(mut self) -> Self {
        self.descriptor = self.descriptor.with_first(true);
        self
    }

    pub fn descriptor(&self) -> &QueryDescriptor {
        &self.descriptor
    }

    pub fn into_descriptor(self) -> QueryDescriptor {
        self.descriptor
    }

    // ------------------------------------------------------------------
    // One-shot execution
    // ------------------------------------------------------------------

    pub async fn all(self, store: &Store) -> Result<Vec<Arc<Entity>>> {
        let descriptor = self.descriptor.with_first(false);
        Ok(store.fetch(&descriptor).await?.into_vec())
    }

    pub async fn first(self, store: &Store) -> Result<Option<Arc<Entity>>> {
        let descriptor = self.descriptor.with_first(true);
        Ok(store.fetch(&descriptor).await?.into_first())
    }

    /// Execute against the adapter and return plain records.
    pub async fn raw(self, store: &Store) -> Result<QueryOutput> {
        store.fetch_raw(&self.descriptor).await
    }

    // ------------------------------------------------------------------
    // Live execution
    // ------------------------------------------------------------------

    pub async fn subscribe_all(
        self,
        store: &Store,
        callback: impl Fn(&QueryUpdate) + Send + Sync + 'static,
    ) -> Result<SubscriptionHandle> {
        store
            .subscribe(&self.descriptor.with_first(false), callback)
            .await
    }

    pub async fn subscribe_first(
        self,
        store: &Store,
        callback: impl Fn(&QueryUpdate) + Send + Sync + 'static,
    ) -> Result<SubscriptionHandle> {
        store
            .subscribe(&self.descriptor.with_first(true), callback)
            .await
    }

    /// Bind the live result to a watched value.
    pub async fn bind(self, store: &Store) -> Result<LiveBinding> {
        store.bind(&self.descriptor).await
    }
}

impl From<Collection> for QueryDescriptor {
    fn from(collection: Collection) -> Self {
        collection.descriptor
    }
}
