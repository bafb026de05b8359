pub mod error;
pub mod types;

pub mod audit;
pub mod diff;
pub mod entity;
pub mod query;
pub mod reactive;
pub mod schema;
pub mod storage;
pub mod store;
