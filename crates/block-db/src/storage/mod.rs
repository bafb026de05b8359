pub mod adapter;
pub mod indexed;
pub mod planner;
pub mod references;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use adapter::{QueryOutput, StorageAdapter};
pub use indexed::IndexedStore;
pub use planner::{explain_plan, plan_query, QueryPlan};
pub use references::{fix_up_references, ReferenceAccess};
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;
