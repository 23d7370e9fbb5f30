use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use cross_cloud_types::{Primitive, ServiceResult};

use crate::scope::MemoryScope;

/// The scoped key/value + ordered-list memory contract.
///
/// Every mutating operation takes `publish_change`; when true, a
/// structured [`crate::MemoryChange`] message is published on the scope's
/// topic unless the operation turned out to be a no-op.
///
/// The failure model is uniform: parameter problems (empty key lists,
/// empty value sets) are invalid input, backend trouble is a backend
/// error, and nothing panics across the boundary.
#[async_trait]
pub trait MemoryService: Send + Sync {
    // Key/value operations.

    /// set_key_value upserts every pair in the scope. When `ttl` is
    /// given, the whole scope's expiry is reset to it.
    async fn set_key_value(
        &self,
        scope: &MemoryScope,
        pairs: &[(String, Primitive)],
        ttl: Option<Duration>,
        publish_change: bool,
    ) -> ServiceResult<()>;

    /// set_key_value_conditionally sets the key only when absent and
    /// reports whether the set happened.
    async fn set_key_value_conditionally(
        &self,
        scope: &MemoryScope,
        key: &str,
        value: &Primitive,
        publish_change: bool,
    ) -> ServiceResult<bool>;

    /// set_key_value_conditionally_and_return_value_regardless sets the
    /// key only when absent and always returns the value now stored,
    /// along with whether this call stored it.
    async fn set_key_value_conditionally_and_return_value_regardless(
        &self,
        scope: &MemoryScope,
        key: &str,
        value: &Primitive,
        publish_change: bool,
    ) -> ServiceResult<(Primitive, bool)>;

    async fn get_key_value(
        &self,
        scope: &MemoryScope,
        key: &str,
    ) -> ServiceResult<Option<Primitive>>;

    async fn get_key_values(
        &self,
        scope: &MemoryScope,
        keys: &[String],
    ) -> ServiceResult<HashMap<String, Primitive>>;

    async fn get_keys(&self, scope: &MemoryScope) -> ServiceResult<Vec<String>>;

    async fn get_key_count(&self, scope: &MemoryScope) -> ServiceResult<u64>;

    /// increment_key_values adds each delta to its integer counter
    /// (absent counters start at zero) and returns the new values.
    async fn increment_key_values(
        &self,
        scope: &MemoryScope,
        deltas: &[(String, i64)],
        publish_change: bool,
    ) -> ServiceResult<HashMap<String, i64>>;

    async fn delete_key(
        &self,
        scope: &MemoryScope,
        key: &str,
        publish_change: bool,
    ) -> ServiceResult<bool>;

    async fn delete_all_keys(
        &self,
        scope: &MemoryScope,
        publish_change: bool,
    ) -> ServiceResult<bool>;

    // Scope expiry. The TTL is an aggregate over every key and list in
    // the scope; an expired scope reads as empty.

    async fn set_scope_expire_time(&self, scope: &MemoryScope, ttl: Duration)
        -> ServiceResult<()>;

    async fn get_scope_expire_time(&self, scope: &MemoryScope)
        -> ServiceResult<Option<Duration>>;

    // List operations.

    async fn push_to_list_head(
        &self,
        scope: &MemoryScope,
        list: &str,
        values: &[Primitive],
        publish_change: bool,
    ) -> ServiceResult<()>;

    async fn push_to_list_tail(
        &self,
        scope: &MemoryScope,
        list: &str,
        values: &[Primitive],
        publish_change: bool,
    ) -> ServiceResult<()>;

    /// push_to_list_tail_if_not_exists pushes only the values not already
    /// present and returns the subset actually pushed.
    async fn push_to_list_tail_if_not_exists(
        &self,
        scope: &MemoryScope,
        list: &str,
        values: &[Primitive],
        publish_change: bool,
    ) -> ServiceResult<Vec<Primitive>>;

    async fn pop_first_element_of_list(
        &self,
        scope: &MemoryScope,
        list: &str,
        publish_change: bool,
    ) -> ServiceResult<Option<Primitive>>;

    async fn pop_last_element_of_list(
        &self,
        scope: &MemoryScope,
        list: &str,
        publish_change: bool,
    ) -> ServiceResult<Option<Primitive>>;

    async fn remove_elements_from_list(
        &self,
        scope: &MemoryScope,
        list: &str,
        values: &[Primitive],
        publish_change: bool,
    ) -> ServiceResult<bool>;

    async fn get_all_elements_of_list(
        &self,
        scope: &MemoryScope,
        list: &str,
    ) -> ServiceResult<Vec<Primitive>>;

    async fn get_list_size(&self, scope: &MemoryScope, list: &str) -> ServiceResult<u64>;

    async fn list_contains(
        &self,
        scope: &MemoryScope,
        list: &str,
        value: &Primitive,
    ) -> ServiceResult<bool>;

    async fn empty_list(
        &self,
        scope: &MemoryScope,
        list: &str,
        publish_change: bool,
    ) -> ServiceResult<bool>;

    /// empty_list_and_sublists drops the named list and every list whose
    /// name extends it.
    async fn empty_list_and_sublists(
        &self,
        scope: &MemoryScope,
        list_prefix: &str,
        publish_change: bool,
    ) -> ServiceResult<()>;

    // The lease mutex primitive.

    /// mutex_lock tries to take the named lock. `Some(lease)` on
    /// acquisition, `None` while another holder's lease is live. The lock
    /// auto-expires when `ttl` elapses without renewal.
    async fn mutex_lock(
        &self,
        scope: &MemoryScope,
        key: &str,
        ttl: Duration,
    ) -> ServiceResult<Option<String>>;

    /// mutex_unlock releases the lock only when `lease_id` is still the
    /// current holder; a stale lease is a silent no-op.
    async fn mutex_unlock(
        &self,
        scope: &MemoryScope,
        key: &str,
        lease_id: &str,
    ) -> ServiceResult<()>;
}
