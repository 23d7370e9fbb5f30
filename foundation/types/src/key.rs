use crate::error::{ServiceError, ServiceResult};
use crate::primitive::Primitive;

/// The primary key of a database item: an attribute name paired with a
/// primitive value. A table keeps a single key attribute name for its
/// lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DbKey {
    name: String,
    value: Primitive,
}

impl DbKey {
    /// new builds a key, rejecting empty or all-whitespace names.
    pub fn new(name: impl Into<String>, value: impl Into<Primitive>) -> ServiceResult<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(ServiceError::InvalidInput(
                "key name must not be empty or whitespace".to_string(),
            ));
        }
        Ok(Self {
            name,
            value: value.into(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &Primitive {
        &self.value
    }
}

impl std::fmt::Display for DbKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.name, self.value)
    }
}
