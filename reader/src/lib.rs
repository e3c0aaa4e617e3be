//! QueryReader - read-only OpenCRUD GraphQL service over PostgreSQL
//!
//! Derives a query API (filtering, ordering, relay pagination, fulltext
//! search) from a user-supplied entity schema and answers each GraphQL
//! request with a single relational statement per top-level field.

pub mod db;
pub mod error;
pub mod fields;
pub mod http;
pub mod model;
pub mod planner;
pub mod scalar;
pub mod shape;
pub mod sql;
