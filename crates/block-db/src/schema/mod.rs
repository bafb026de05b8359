//! Schema layer: field definitions, entity types, and the registry.

pub mod entity_type;
pub mod field;
pub mod registry;

pub use entity_type::{entity_type, EntityType, EntityTypeBuilder, CREATED_FIELD, ID_FIELD, SCOPE_FIELD};
pub use field::{DeletePolicy, FieldDef, RelationDef, ValueType};
pub use registry::{Referrer, SchemaRegistry};
