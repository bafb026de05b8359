use std::sync::Arc;

use crate::entity::Entity;

/// A materialized query result: one optional entity for single-result
/// queries, an ordered list otherwise.
#[derive(Debug, Clone)]
pub enum QueryResult {
    One(Option<Arc<Entity>>),
    Many(Vec<Arc<Entity>>),
}

impl QueryResult {
    /// Shape a list of entities according to the query cardinality.
    pub fn from_entities(entities: Vec<Arc<Entity>>, first: bool) -> Self {
        if first {
            QueryResult::One(entities.into_iter().next())
        } else {
            QueryResult::Many(entities)
        }
    }

    pub fn empty(first: bool) -> Self {
        Self::from_entities(Vec::new(), first)
    }

    pub fn into_vec(self) -> Vec<Arc<Entity>> {
        match self {
            QueryResult::One(entity) => entity.into_iter().collect(),
            QueryResult::Many(entities) => entities,
        }
    }

    pub fn into_first(self) -> Option<Arc<Entity>> {
        match self {
            QueryResult::One(entity) => entity,
            QueryResult::Many(entities) => entities.into_iter().next(),
        }
    }

    pub fn first(&self) -> Option<&Arc<Entity>> {
        match self {
            QueryResult::One(entity) => entity.as_ref(),
            QueryResult::Many(entities) => entities.first(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            QueryResult::One(entity) => usize::from(entity.is_some()),
            QueryResult::Many(entities) => entities.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Identifiers in result order.
    pub fn ids(&self) -> Vec<String> {
        match self {
            QueryResult::One(entity) => entity.iter().map(|e| e.id().to_string()).collect(),
            QueryResult::Many(entities) => entities.iter().map(|e| e.id().to_string()).collect(),
        }
    }
}
