//! # cross-cloud-types
//!
//! Shared foundation types for the CrossCloudKit service crates: the
//! [`Primitive`] value union, database keys, the condition expression tree
//! used for conditional writes, and the uniform error taxonomy.

pub mod condition;
pub mod error;
pub mod key;
pub mod primitive;

pub use condition::{Condition, ConditionLeaf};
pub use error::{ServiceError, ServiceResult};
pub use key::DbKey;
pub use primitive::Primitive;

/// A database item: a JSON object mapping attribute names to values.
pub type Item = serde_json::Map<String, serde_json::Value>;
