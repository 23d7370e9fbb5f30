use cross_cloud_types::{ServiceError, ServiceResult};

/// A compiled namespace for memory operations.
///
/// Scopes are opaque: two scopes refer to the same storage exactly when
/// their compiled strings are equal. The compiled string is also the
/// topic name change notifications are published on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MemoryScope {
    compiled: String,
}

impl MemoryScope {
    /// new joins the given parts with `:` into the compiled string.
    /// Every part must be non-empty.
    pub fn new(parts: &[&str]) -> ServiceResult<Self> {
        if parts.is_empty() || parts.iter().any(|p| p.trim().is_empty()) {
            return Err(ServiceError::InvalidInput(
                "scope parts must be non-empty".to_string(),
            ));
        }
        Ok(Self {
            compiled: parts.join(":"),
        })
    }

    /// from_compiled wraps an already-compiled scope string.
    pub fn from_compiled(compiled: impl Into<String>) -> ServiceResult<Self> {
        let compiled = compiled.into();
        if compiled.trim().is_empty() {
            return Err(ServiceError::InvalidInput(
                "scope must not be empty".to_string(),
            ));
        }
        Ok(Self { compiled })
    }

    pub fn compiled(&self) -> &str {
        &self.compiled
    }
}

impl std::fmt::Display for MemoryScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.compiled)
    }
}
