//! Index query planner: decides how the indexed store answers a descriptor.
//!
//! Every single-field index is multi-entry (array values index each scalar
//! element) and skips nulls, so a filter is index-usable only when its
//! operand is a scalar the index can represent. Anything else is kept as a
//! residual predicate applied after the indexed pass.

use std::collections::HashSet;

use crate::query::{Filter, Operator, QueryDescriptor, SortDirection};
use crate::schema::EntityType;
use crate::types::IndexableValue;

// ============================================================================
// QueryPlan
// ============================================================================

/// How one index is probed.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    Exact(IndexableValue),
    /// Inclusive on both ends; an open end is unbounded.
    Range {
        lower: Option<IndexableValue>,
        upper: Option<IndexableValue>,
    },
    /// Sorted, deduplicated values walked alongside the index.
    AnyOf(Vec<IndexableValue>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Access {
    FullScan,
    /// Walk one field's index in order; satisfies a single sort clause.
    OrderedScan {
        field: String,
        direction: SortDirection,
    },
    Index {
        field: String,
        lookup: Lookup,
    },
    /// Exact lookup on a composite group index, values in group order.
    Composite {
        group: String,
        values: Vec<IndexableValue>,
    },
    /// One lookup per filter, intersected by primary key.
    Intersect(Vec<(String, Lookup)>),
}

/// The output of the query planner: how to execute a query.
#[derive(Debug, Clone)]
pub struct QueryPlan {
    pub access: Access,
    /// Filters not covered by the index access.
    pub residual: Vec<Filter>,
    /// Whether the access already yields rows in the requested order.
    pub provides_sort: bool,
    pub limit: Option<usize>,
}

// ============================================================================
// Condition extraction
// ============================================================================

/// Convert a filter into an index lookup, or `None` if it must stay residual.
fn to_lookup(filter: &Filter) -> Option<Lookup> {
    let scalar = || IndexableValue::from_value(&filter.value);
    match filter.operator {
        Operator::Eq | Operator::Any => scalar().map(Lookup::Exact),
        Operator::Gte => scalar().map(|v| Lookup::Range {
            lower: Some(v),
            upper: None,
        }),
        Operator::Lte => scalar().map(|v| Lookup::Range {
            lower: None,
            upper: Some(v),
        }),
        Operator::Between => match filter.value.as_array().map(Vec::as_slice) {
            Some([lower, upper]) => {
                let lower = IndexableValue::from_value(lower)?;
                let upper = IndexableValue::from_value(upper)?;
                Some(Lookup::Range {
                    lower: Some(lower),
                    upper: Some(upper),
                })
            }
            _ => None,
        },
        Operator::In => {
            let options = filter.value.as_array()?;
            let mut values: Vec<IndexableValue> = options
                .iter()
                .filter(|v| !v.is_null())
                .map(IndexableValue::from_value)
                .collect::<Option<Vec<_>>>()?;
            values.sort();
            values.dedup();
            Some(Lookup::AnyOf(values))
        }
        Operator::Ne => None,
    }
}

fn is_exact_eq(filter: &Filter) -> bool {
    filter.operator == Operator::Eq && IndexableValue::from_value(&filter.value).is_some()
}

/// A composite group whose every field is pinned by an exact equality.
fn composite_for(ty: &EntityType, filters: &[Filter]) -> Option<(String, Vec<IndexableValue>)> {
    ty.groups.iter().find_map(|(group, fields)| {
        let values = fields
            .iter()
            .map(|field| {
                filters
                    .iter()
                    .find(|f| &f.field == field && is_exact_eq(f))
                    .and_then(|f| IndexableValue::from_value(&f.value))
            })
            .collect::<Option<Vec<_>>>()?;
        Some((group.clone(), values))
    })
}

// ============================================================================
// Query Planning
// ============================================================================

/// Plan execution of `query` against the indexes declared by its type.
pub fn plan_query(query: &QueryDescriptor) -> QueryPlan {
    let ty = query.entity_type();
    let filters = query.effective_filters();
    let limit = query.is_first().then_some(1);

    let mut usable: Vec<(Filter, Lookup)> = Vec::new();
    let mut residual: Vec<Filter> = Vec::new();
    for filter in filters {
        let indexed = ty.field(&filter.field).map(|f| f.has_index()).unwrap_or(false);
        match indexed.then(|| to_lookup(&filter)).flatten() {
            Some(lookup) => usable.push((filter, lookup)),
            None => residual.push(filter),
        }
    }

    if usable.is_empty() {
        if let [clause] = query.sort() {
            if ty.field(&clause.field).map(|f| f.has_index()).unwrap_or(false) {
                return QueryPlan {
                    access: Access::OrderedScan {
                        field: clause.field.clone(),
                        direction: clause.direction,
                    },
                    residual,
                    provides_sort: true,
                    limit,
                };
            }
        }
        return QueryPlan {
            access: Access::FullScan,
            residual,
            provides_sort: false,
            limit,
        };
    }

    if usable.len() == 1 {
        let (filter, lookup) = usable.remove(0);
        return QueryPlan {
            access: Access::Index {
                field: filter.field,
                lookup,
            },
            residual,
            provides_sort: false,
            limit,
        };
    }

    let pinned: Vec<Filter> = usable.iter().map(|(f, _)| f.clone()).collect();
    if let Some((group, values)) = composite_for(ty, &pinned) {
        let covered: HashSet<&str> = ty
            .groups
            .iter()
            .find(|(name, _)| name == &group)
            .map(|(_, fields)| fields.iter().map(String::as_str).collect())
            .unwrap_or_default();
        let mut consumed: HashSet<&str> = HashSet::new();
        for (filter, _) in &usable {
            // Each group field consumes one equality; duplicates stay residual.
            if is_exact_eq(filter)
                && covered.contains(filter.field.as_str())
                && consumed.insert(filter.field.as_str())
            {
                continue;
            }
            residual.push(filter.clone());
        }
        return QueryPlan {
            access: Access::Composite { group, values },
            residual,
            provides_sort: false,
            limit,
        };
    }

    tracing::debug!(
        store = %ty.store,
        filters = usable.len(),
        "no composite index covers the filters, intersecting per-field lookups"
    );
    QueryPlan {
        access: Access::Intersect(
            usable
                .into_iter()
                .map(|(filter, lookup)| (filter.field, lookup))
                .collect(),
        ),
        residual,
        provides_sort: false,
        limit,
    }
}

// ============================================================================
// Explain
// ============================================================================

fn describe_lookup(lookup: &Lookup) -> String {
    match lookup {
        Lookup::Exact(v) => format!("= {v}"),
        Lookup::Range { lower, upper } => {
            let parts: Vec<String> = [
                lower.as_ref().map(|v| format!(">= {v}")),
                upper.as_ref().map(|v| format!("<= {v}")),
            ]
            .into_iter()
            .flatten()
            .collect();
            parts.join(" AND ")
        }
        Lookup::AnyOf(values) => {
            let values: Vec<String> = values.iter().map(ToString::to_string).collect();
            format!("IN ({})", values.join(", "))
        }
    }
}

/// Format a query plan as a human-readable string for debugging.
pub fn explain_plan(plan: &QueryPlan) -> String {
    let mut lines: Vec<String> = Vec::new();
    match &plan.access {
        Access::FullScan => lines.push("Full table scan".to_string()),
        Access::OrderedScan { field, direction } => {
            lines.push(format!("Ordered scan: {field} {direction:?}"))
        }
        Access::Index { field, lookup } => {
            lines.push(format!("Index: {field} {}", describe_lookup(lookup)))
        }
        Access::Composite { group, values } => {
            let values: Vec<String> = values.iter().map(ToString::to_string).collect();
            lines.push(format!("Composite: {group} = ({})", values.join(", ")))
        }
        Access::Intersect(lookups) => {
            for (field, lookup) in lookups {
                lines.push(format!("Intersect: {field} {}", describe_lookup(lookup)));
            }
        }
    }
    lines.push(format!("Residual filters: {}", plan.residual.len()));
    lines.push(format!(
        "Index provides sort: {}",
        if plan.provides_sort { "yes" } else { "no" }
    ));
    if let Some(limit) = plan.limit {
        lines.push(format!("Limit: {limit}"));
    }
    lines.join("\n")
}
