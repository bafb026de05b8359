//! Query layer: descriptors, the fluent builder, and value comparison.

pub mod builder;
pub mod compare;
pub mod descriptor;
pub mod result;

pub use builder::{Collection, Query, Sort, Where};
pub use compare::compare_values;
pub use descriptor::{
    sort_by_clauses, sort_records, Conjunction, Filter, Operator, QueryDescriptor, SortClause,
    SortDirection,
};
pub use result::QueryResult;
