use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use cross_cloud_pubsub::PubSubService;
use cross_cloud_types::{Primitive, ServiceError, ServiceResult};

use crate::notify::MemoryChange;
use crate::scope::MemoryScope;
use crate::service::MemoryService;

#[derive(Default)]
struct ScopeState {
    entries: HashMap<String, Primitive>,
    lists: HashMap<String, VecDeque<Primitive>>,
    expires_at: Option<Instant>,
}

impl ScopeState {
    fn purge_if_expired(&mut self) {
        if let Some(deadline) = self.expires_at {
            if Instant::now() >= deadline {
                self.entries.clear();
                self.lists.clear();
                self.expires_at = None;
            }
        }
    }
}

struct LockEntry {
    lease_id: String,
    deadline: Instant,
}

/// The in-process reference implementation of [`MemoryService`].
///
/// State lives in maps guarded by a process mutex; scope TTLs are
/// enforced lazily on access. When constructed with a pub/sub service,
/// mutations requested with `publish_change` emit [`MemoryChange`]
/// messages on the scope's topic.
pub struct InMemoryMemoryService {
    scopes: Mutex<HashMap<String, ScopeState>>,
    locks: Mutex<HashMap<(String, String), LockEntry>>,
    pubsub: Option<Arc<dyn PubSubService>>,
}

impl InMemoryMemoryService {
    pub fn new() -> Self {
        Self {
            scopes: Mutex::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
            pubsub: None,
        }
    }

    /// with_pubsub enables change notifications on the given bus.
    pub fn with_pubsub(pubsub: Arc<dyn PubSubService>) -> Self {
        Self {
            scopes: Mutex::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
            pubsub: Some(pubsub),
        }
    }

    fn with_scope<R>(&self, scope: &MemoryScope, f: impl FnOnce(&mut ScopeState) -> R) -> R {
        let mut scopes = self.scopes.lock();
        let state = scopes.entry(scope.compiled().to_string()).or_default();
        state.purge_if_expired();
        f(state)
    }

    async fn notify(&self, publish_change: bool, scope: &MemoryScope, change: MemoryChange) {
        if !publish_change {
            return;
        }
        let Some(pubsub) = &self.pubsub else {
            return;
        };
        let topic = scope.compiled();
        let message = change.to_message(scope);
        let result = match pubsub.ensure_topic_exists(topic).await {
            Ok(()) => pubsub.publish(topic, &message).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            tracing::warn!("failed to publish change notification on {topic}: {e}");
        }
    }

    fn require_non_empty<T>(values: &[T], what: &str) -> ServiceResult<()> {
        if values.is_empty() {
            return Err(ServiceError::InvalidInput(format!(
                "{what} must not be empty"
            )));
        }
        Ok(())
    }
}

impl Default for InMemoryMemoryService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MemoryService for InMemoryMemoryService {
    async fn set_key_value(
        &self,
        scope: &MemoryScope,
        pairs: &[(String, Primitive)],
        ttl: Option<Duration>,
        publish_change: bool,
    ) -> ServiceResult<()> {
        Self::require_non_empty(pairs, "key/value pairs")?;
        self.with_scope(scope, |state| {
            for (key, value) in pairs {
                state.entries.insert(key.clone(), value.clone());
            }
            if let Some(ttl) = ttl {
                state.expires_at = Some(Instant::now() + ttl);
            }
        });
        self.notify(
            publish_change,
            scope,
            MemoryChange::SetKeyValue {
                values: pairs.to_vec(),
            },
        )
        .await;
        Ok(())
    }

    async fn set_key_value_conditionally(
        &self,
        scope: &MemoryScope,
        key: &str,
        value: &Primitive,
        publish_change: bool,
    ) -> ServiceResult<bool> {
        let (_, newly_set) = self
            .set_key_value_conditionally_and_return_value_regardless(
                scope,
                key,
                value,
                publish_change,
            )
            .await?;
        Ok(newly_set)
    }

    async fn set_key_value_conditionally_and_return_value_regardless(
        &self,
        scope: &MemoryScope,
        key: &str,
        value: &Primitive,
        publish_change: bool,
    ) -> ServiceResult<(Primitive, bool)> {
        let (stored, newly_set) = self.with_scope(scope, |state| {
            if let Some(existing) = state.entries.get(key) {
                (existing.clone(), false)
            } else {
                state.entries.insert(key.to_string(), value.clone());
                (value.clone(), true)
            }
        });
        if newly_set {
            self.notify(
                publish_change,
                scope,
                MemoryChange::SetKeyValue {
                    values: vec![(key.to_string(), stored.clone())],
                },
            )
            .await;
        }
        Ok((stored, newly_set))
    }

    async fn get_key_value(
        &self,
        scope: &MemoryScope,
        key: &str,
    ) -> ServiceResult<Option<Primitive>> {
        Ok(self.with_scope(scope, |state| state.entries.get(key).cloned()))
    }

    async fn get_key_values(
        &self,
        scope: &MemoryScope,
        keys: &[String],
    ) -> ServiceResult<HashMap<String, Primitive>> {
        Self::require_non_empty(keys, "keys")?;
        Ok(self.with_scope(scope, |state| {
            keys.iter()
                .filter_map(|k| state.entries.get(k).map(|v| (k.clone(), v.clone())))
                .collect()
        }))
    }

    async fn get_keys(&self, scope: &MemoryScope) -> ServiceResult<Vec<String>> {
        Ok(self.with_scope(scope, |state| {
            let mut keys: Vec<String> = state.entries.keys().cloned().collect();
            keys.sort();
            keys
        }))
    }

    async fn get_key_count(&self, scope: &MemoryScope) -> ServiceResult<u64> {
        Ok(self.with_scope(scope, |state| state.entries.len() as u64))
    }

    async fn increment_key_values(
        &self,
        scope: &MemoryScope,
        deltas: &[(String, i64)],
        publish_change: bool,
    ) -> ServiceResult<HashMap<String, i64>> {
        Self::require_non_empty(deltas, "deltas")?;
        let new_values = self.with_scope(scope, |state| {
            let mut result = HashMap::with_capacity(deltas.len());
            for (key, delta) in deltas {
                let current = match state.entries.get(key) {
                    Some(Primitive::Integer(i)) => *i,
                    Some(other) => {
                        return Err(ServiceError::InvalidInput(format!(
                            "key {key} holds a {} value, not an integer counter",
                            other.kind()
                        )))
                    }
                    None => 0,
                };
                let next = current + delta;
                state
                    .entries
                    .insert(key.clone(), Primitive::Integer(next));
                result.insert(key.clone(), next);
            }
            Ok(result)
        })?;
        self.notify(
            publish_change,
            scope,
            MemoryChange::SetKeyValue {
                values: new_values
                    .iter()
                    .map(|(k, v)| (k.clone(), Primitive::Integer(*v)))
                    .collect(),
            },
        )
        .await;
        Ok(new_values)
    }

    async fn delete_key(
        &self,
        scope: &MemoryScope,
        key: &str,
        publish_change: bool,
    ) -> ServiceResult<bool> {
        let removed = self.with_scope(scope, |state| state.entries.remove(key).is_some());
        if removed {
            self.notify(
                publish_change,
                scope,
                MemoryChange::DeleteKey {
                    key: key.to_string(),
                },
            )
            .await;
        }
        Ok(removed)
    }

    async fn delete_all_keys(
        &self,
        scope: &MemoryScope,
        publish_change: bool,
    ) -> ServiceResult<bool> {
        let removed = self.with_scope(scope, |state| {
            let had_entries = !state.entries.is_empty();
            state.entries.clear();
            had_entries
        });
        if removed {
            self.notify(publish_change, scope, MemoryChange::DeleteAllKeys)
                .await;
        }
        Ok(removed)
    }

    async fn set_scope_expire_time(
        &self,
        scope: &MemoryScope,
        ttl: Duration,
    ) -> ServiceResult<()> {
        self.with_scope(scope, |state| {
            state.expires_at = Some(Instant::now() + ttl);
        });
        Ok(())
    }

    async fn get_scope_expire_time(
        &self,
        scope: &MemoryScope,
    ) -> ServiceResult<Option<Duration>> {
        Ok(self.with_scope(scope, |state| {
            state
                .expires_at
                .map(|deadline| deadline.saturating_duration_since(Instant::now()))
        }))
    }

    async fn push_to_list_head(
        &self,
        scope: &MemoryScope,
        list: &str,
        values: &[Primitive],
        publish_change: bool,
    ) -> ServiceResult<()> {
        Self::require_non_empty(values, "values")?;
        self.with_scope(scope, |state| {
            let deque = state.lists.entry(list.to_string()).or_default();
            for value in values.iter().rev() {
                deque.push_front(value.clone());
            }
        });
        self.notify(
            publish_change,
            scope,
            MemoryChange::PushToListHead {
                list: list.to_string(),
                values: values.to_vec(),
            },
        )
        .await;
        Ok(())
    }

    async fn push_to_list_tail(
        &self,
        scope: &MemoryScope,
        list: &str,
        values: &[Primitive],
        publish_change: bool,
    ) -> ServiceResult<()> {
        Self::require_non_empty(values, "values")?;
        self.with_scope(scope, |state| {
            let deque = state.lists.entry(list.to_string()).or_default();
            deque.extend(values.iter().cloned());
        });
        self.notify(
            publish_change,
            scope,
            MemoryChange::PushToListTail {
                list: list.to_string(),
                values: values.to_vec(),
            },
        )
        .await;
        Ok(())
    }

    async fn push_to_list_tail_if_not_exists(
        &self,
        scope: &MemoryScope,
        list: &str,
        values: &[Primitive],
        publish_change: bool,
    ) -> ServiceResult<Vec<Primitive>> {
        Self::require_non_empty(values, "values")?;
        let pushed = self.with_scope(scope, |state| {
            let deque = state.lists.entry(list.to_string()).or_default();
            let mut pushed = Vec::new();
            for value in values {
                if !deque.contains(value) && !pushed.contains(value) {
                    deque.push_back(value.clone());
                    pushed.push(value.clone());
                }
            }
            pushed
        });
        if !pushed.is_empty() {
            self.notify(
                publish_change,
                scope,
                MemoryChange::PushToListTailIfNotExists {
                    list: list.to_string(),
                    values: pushed.clone(),
                },
            )
            .await;
        }
        Ok(pushed)
    }

    async fn pop_first_element_of_list(
        &self,
        scope: &MemoryScope,
        list: &str,
        publish_change: bool,
    ) -> ServiceResult<Option<Primitive>> {
        let popped = self.with_scope(scope, |state| {
            state.lists.get_mut(list).and_then(|d| d.pop_front())
        });
        if let Some(value) = &popped {
            self.notify(
                publish_change,
                scope,
                MemoryChange::PopFirstElementOfList {
                    list: list.to_string(),
                    value: value.clone(),
                },
            )
            .await;
        }
        Ok(popped)
    }

    async fn pop_last_element_of_list(
        &self,
        scope: &MemoryScope,
        list: &str,
        publish_change: bool,
    ) -> ServiceResult<Option<Primitive>> {
        let popped = self.with_scope(scope, |state| {
            state.lists.get_mut(list).and_then(|d| d.pop_back())
        });
        if let Some(value) = &popped {
            self.notify(
                publish_change,
                scope,
                MemoryChange::PopLastElementOfList {
                    list: list.to_string(),
                    value: value.clone(),
                },
            )
            .await;
        }
        Ok(popped)
    }

    async fn remove_elements_from_list(
        &self,
        scope: &MemoryScope,
        list: &str,
        values: &[Primitive],
        publish_change: bool,
    ) -> ServiceResult<bool> {
        Self::require_non_empty(values, "values")?;
        let removed = self.with_scope(scope, |state| {
            let Some(deque) = state.lists.get_mut(list) else {
                return Vec::new();
            };
            let before = deque.len();
            deque.retain(|v| !values.contains(v));
            if deque.len() == before {
                Vec::new()
            } else {
                values.to_vec()
            }
        });
        if removed.is_empty() {
            return Ok(false);
        }
        self.notify(
            publish_change,
            scope,
            MemoryChange::RemoveElementsFromList {
                list: list.to_string(),
                values: removed,
            },
        )
        .await;
        Ok(true)
    }

    async fn get_all_elements_of_list(
        &self,
        scope: &MemoryScope,
        list: &str,
    ) -> ServiceResult<Vec<Primitive>> {
        Ok(self.with_scope(scope, |state| {
            state
                .lists
                .get(list)
                .map(|d| d.iter().cloned().collect())
                .unwrap_or_default()
        }))
    }

    async fn get_list_size(&self, scope: &MemoryScope, list: &str) -> ServiceResult<u64> {
        Ok(self.with_scope(scope, |state| {
            state.lists.get(list).map(|d| d.len() as u64).unwrap_or(0)
        }))
    }

    async fn list_contains(
        &self,
        scope: &MemoryScope,
        list: &str,
        value: &Primitive,
    ) -> ServiceResult<bool> {
        Ok(self.with_scope(scope, |state| {
            state
                .lists
                .get(list)
                .map(|d| d.contains(value))
                .unwrap_or(false)
        }))
    }

    async fn empty_list(
        &self,
        scope: &MemoryScope,
        list: &str,
        publish_change: bool,
    ) -> ServiceResult<bool> {
        let removed = self.with_scope(scope, |state| state.lists.remove(list).is_some());
        if removed {
            self.notify(
                publish_change,
                scope,
                MemoryChange::EmptyList {
                    list: list.to_string(),
                },
            )
            .await;
        }
        Ok(removed)
    }

    async fn empty_list_and_sublists(
        &self,
        scope: &MemoryScope,
        list_prefix: &str,
        publish_change: bool,
    ) -> ServiceResult<()> {
        let removed_any = self.with_scope(scope, |state| {
            let before = state.lists.len();
            state
                .lists
                .retain(|name, _| name != list_prefix && !name.starts_with(list_prefix));
            state.lists.len() != before
        });
        if removed_any {
            self.notify(
                publish_change,
                scope,
                MemoryChange::EmptyListAndSublists {
                    prefix: list_prefix.to_string(),
                },
            )
            .await;
        }
        Ok(())
    }

    async fn mutex_lock(
        &self,
        scope: &MemoryScope,
        key: &str,
        ttl: Duration,
    ) -> ServiceResult<Option<String>> {
        if key.trim().is_empty() {
            return Err(ServiceError::InvalidInput(
                "mutex key must not be empty".to_string(),
            ));
        }
        let mut locks = self.locks.lock();
        let slot = (scope.compiled().to_string(), key.to_string());
        let now = Instant::now();
        if let Some(entry) = locks.get(&slot) {
            if entry.deadline > now {
                return Ok(None);
            }
        }
        let lease_id = uuid::Uuid::new_v4().to_string();
        locks.insert(
            slot,
            LockEntry {
                lease_id: lease_id.clone(),
                deadline: now + ttl,
            },
        );
        Ok(Some(lease_id))
    }

    async fn mutex_unlock(
        &self,
        scope: &MemoryScope,
        key: &str,
        lease_id: &str,
    ) -> ServiceResult<()> {
        let mut locks = self.locks.lock();
        let slot = (scope.compiled().to_string(), key.to_string());
        // Conditional delete: only the current holder releases. A stale
        // lease means the TTL already expired and someone else may hold
        // the lock now, so it must be a no-op.
        if let Some(entry) = locks.get(&slot) {
            if entry.lease_id == lease_id {
                locks.remove(&slot);
            }
        }
        Ok(())
    }
}
