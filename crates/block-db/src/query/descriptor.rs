//! QueryDescriptor: the immutable description of a query.
//!
//! A descriptor names its target entity type, an ordered list of conjunctive
//! filters, an ordered list of sort clauses, a single-result flag and an
//! optional scope. [`QueryDescriptor::canonical`] gives the string used to
//! deduplicate subscriptions; [`QueryDescriptor::matches`] tests a record
//! without touching storage.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use super::compare::{compare_values, evaluate};
use crate::error::{QueryError, Result, SchemaError};
use crate::schema::entity_type::{EntityType, SCOPE_FIELD};
use crate::types::{Key, Record};

// ============================================================================
// Filters
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    /// Field equals the value (or, for arrays, contains it).
    Eq,
    Ne,
    /// Greater than or equal.
    Gte,
    /// Lower than or equal.
    Lte,
    /// Field value is one of the listed values.
    In,
    /// Array field contains the value.
    Any,
    /// Inclusive range `[from, to]`.
    Between,
}

impl Operator {
    pub fn symbol(self) -> &'static str {
        match self {
            Operator::Eq => "=",
            Operator::Ne => "!=",
            Operator::Gte => ">=",
            Operator::Lte => "<=",
            Operator::In => "in",
            Operator::Any => "any",
            Operator::Between => "between",
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// How a filter joins the ones before it. Only conjunction is supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Conjunction {
    #[default]
    And,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub field: String,
    pub operator: Operator,
    pub value: Value,
    pub conjunction: Conjunction,
}

impl Filter {
    pub fn new(field: impl Into<String>, operator: Operator, value: Value) -> Self {
        Self {
            field: field.into(),
            operator,
            value,
            conjunction: Conjunction::And,
        }
    }

    pub fn matches(&self, record: &Record) -> bool {
        evaluate(self.operator, record.get(&self.field), &self.value)
    }

    fn validate(&self) -> Result<(), QueryError> {
        let expected = match self.operator {
            Operator::In if !self.value.is_array() => Some("a list of values"),
            Operator::Between
                if self.value.as_array().map(Vec::len) != Some(2) =>
            {
                Some("a lower and an upper bound")
            }
            _ => None,
        };
        match expected {
            Some(expected) => Err(QueryError::InvalidOperand {
                field: self.field.clone(),
                operator: self.operator.symbol(),
                expected,
            }),
            None => Ok(()),
        }
    }
}

// ============================================================================
// Sorting
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortClause {
    pub field: String,
    pub direction: SortDirection,
}

impl SortClause {
    pub fn compare(&self, a: &Value, b: &Value) -> Ordering {
        match self.direction {
            SortDirection::Asc => compare_values(a, b),
            SortDirection::Desc => compare_values(b, a),
        }
    }
}

/// Order `items` the way every query result is ordered: by primary key, then
/// one stable pass per sort clause in reverse declaration order, so the
/// first-declared clause dominates and later clauses break ties.
pub fn sort_by_clauses<T>(
    items: Vec<T>,
    clauses: &[SortClause],
    key_of: impl Fn(&T) -> Option<Key>,
    value_of: impl Fn(&T, &str) -> Value,
) -> Vec<T> {
    let mut decorated: Vec<(Option<Key>, Vec<Value>, T)> = items
        .into_iter()
        .map(|item| {
            let values = clauses.iter().map(|c| value_of(&item, &c.field)).collect();
            (key_of(&item), values, item)
        })
        .collect();

    decorated.sort_by(|a, b| match (&a.0, &b.0) {
        (Some(x), Some(y)) => x.cmp(y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    });
    for (i, clause) in clauses.iter().enumerate().rev() {
        decorated.sort_by(|a, b| clause.compare(&a.1[i], &b.1[i]));
    }
    decorated.into_iter().map(|(_, _, item)| item).collect()
}

/// Sort serialized records of `ty` by `clauses`.
pub fn sort_records(ty: &EntityType, records: Vec<Record>, clauses: &[SortClause]) -> Vec<Record> {
    sort_by_clauses(
        records,
        clauses,
        |record| ty.derive_key(record).ok(),
        |record, field| record.get(field).cloned().unwrap_or(Value::Null),
    )
}

// ============================================================================
// QueryDescriptor
// ============================================================================

#[derive(Debug, Clone)]
pub struct QueryDescriptor {
    entity_type: Arc<EntityType>,
    filters: Vec<Filter>,
    sort: Vec<SortClause>,
    first: bool,
    scope: Option<String>,
}

impl QueryDescriptor {
    pub fn new(entity_type: &Arc<EntityType>) -> Self {
        Self {
            entity_type: Arc::clone(entity_type),
            filters: Vec::new(),
            sort: Vec::new(),
            first: false,
            scope: None,
        }
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn with_sort(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.sort.push(SortClause {
            field: field.into(),
            direction,
        });
        self
    }

    pub fn with_first(mut self, first: bool) -> Self {
        self.first = first;
        self
    }

    pub fn with_scope(mut self, scope: Option<String>) -> Self {
        self.scope = scope;
        self
    }

    pub fn entity_type(&self) -> &Arc<EntityType> {
        &self.entity_type
    }

    pub fn store(&self) -> &str {
        &self.entity_type.store
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    pub fn sort(&self) -> &[SortClause] {
        &self.sort
    }

    pub fn is_first(&self) -> bool {
        self.first
    }

    pub fn scope(&self) -> Option<&str> {
        self.scope.as_deref()
    }

    /// Declared filters plus the implicit scope equality.
    pub fn effective_filters(&self) -> Vec<Filter> {
        let mut filters = self.filters.clone();
        if let Some(scope) = &self.scope {
            filters.push(Filter::new(
                SCOPE_FIELD,
                Operator::Eq,
                Value::String(scope.clone()),
            ));
        }
        filters
    }

    /// Check that every referenced field exists and operands are well formed.
    pub fn validate(&self) -> Result<()> {
        let ty = &self.entity_type;
        let fields = self
            .filters
            .iter()
            .map(|f| &f.field)
            .chain(self.sort.iter().map(|s| &s.field));
        for field in fields {
            if ty.field(field).is_none() {
                return Err(SchemaError::UnknownField {
                    store: ty.store.clone(),
                    field: field.clone(),
                }
                .into());
            }
        }
        for filter in &self.filters {
            filter.validate()?;
        }
        Ok(())
    }

    /// Deterministic string identifying this query.
    pub fn canonical(&self) -> String {
        let mut parts: Vec<String> = self
            .filters
            .iter()
            .map(|f| format!("{}[{}]={}", f.field, f.operator.symbol(), f.value))
            .collect();
        parts.extend(self.sort.iter().map(|s| {
            let direction = match s.direction {
                SortDirection::Asc => "asc",
                SortDirection::Desc => "desc",
            };
            format!("sort.{direction}={}", s.field)
        }));
        if let Some(scope) = &self.scope {
            parts.push(format!("scope={}", Value::String(scope.clone())));
        }
        if self.first {
            parts.push("first=true".to_string());
        }

        let mut out = format!("{}:{}", self.entity_type.collection, self.entity_type.store);
        if !parts.is_empty() {
            out.push('?');
            out.push_str(&parts.join("&"));
        }
        out
    }

    /// Whether `record` of `store` currently satisfies this query.
    pub fn matches(&self, store: &str, record: &Record) -> bool {
        if store != self.entity_type.store {
            return false;
        }
        if let Some(scope) = &self.scope {
            if record.get(SCOPE_FIELD).and_then(Value::as_str) != Some(scope.as_str()) {
                return false;
            }
        }
        self.filters.iter().all(|f| f.matches(record))
    }
}

impl fmt::Display for QueryDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}
