use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use cross_cloud_memory::{DistributedMutex, MemoryScope, MemoryService};
use cross_cloud_pubsub::PubSubService;
use cross_cloud_types::{Condition, DbKey, Item, Primitive, ServiceError, ServiceResult};

use crate::backend::DatabaseBackend;
use crate::service::{DatabaseService, ReturnItemBehavior, ScanPage};
use crate::{
    BACKUP_CHECK_TOPIC, BACKUP_ENDED_MESSAGE, BACKUP_MUTEX_KEY, BACKUP_MUTEX_SCOPE,
    BACKUP_MUTEX_TTL, BACKUP_STARTED_MESSAGE, ENTITY_MUTEX_TTL, SYSTEM_TABLE_BASE_NAME,
    SYSTEM_TABLE_KEYS_ATTRIBUTE, SYSTEM_TABLE_KEY_NAME,
};

/// Construction options for [`DatabaseClient`].
#[derive(Debug, Clone)]
pub struct DatabaseClientConfig {
    /// Appended to the system table's base name, letting test fleets
    /// share a backend without sharing bookkeeping.
    pub system_table_postfix: Option<String>,
    /// Prefix of every entity and master mutex key.
    pub mutex_prefix: String,
    /// Compiled scope the entity and master mutexes live in.
    pub mutex_scope: String,
}

impl Default for DatabaseClientConfig {
    fn default() -> Self {
        Self {
            system_table_postfix: None,
            mutex_prefix: "DatabaseService".to_string(),
            mutex_scope: "DatabaseService:EntityMutex".to_string(),
        }
    }
}

/// The base database client over a [`DatabaseBackend`].
///
/// Every public operation runs the same cross-cutting sequence:
/// cancellation check, disposal check, backup-freeze wait, entity or
/// master mutex acquisition, the backend call, system-table bookkeeping,
/// and mutex release on every exit path. Concurrent operations on the
/// same (table, key) therefore serialize globally, and whole-table
/// operations serialize per table.
pub struct DatabaseClient {
    backend: Arc<dyn DatabaseBackend>,
    memory: Arc<dyn MemoryService>,
    mutex_scope: MemoryScope,
    backup_scope: MemoryScope,
    mutex_prefix: String,
    system_table: String,
    backup_frozen: Arc<AtomicBool>,
    guard_suspended: AtomicUsize,
    disposed: AtomicBool,
    lifetime: CancellationToken,
}

impl DatabaseClient {
    /// new wires the client to its backend and coordination services and
    /// subscribes to the backup-check topic for the lifetime of the
    /// client.
    pub async fn new(
        backend: Arc<dyn DatabaseBackend>,
        memory: Arc<dyn MemoryService>,
        pubsub: Arc<dyn PubSubService>,
        config: DatabaseClientConfig,
    ) -> ServiceResult<Self> {
        let mutex_scope = MemoryScope::from_compiled(config.mutex_scope)?;
        let backup_scope = MemoryScope::from_compiled(BACKUP_MUTEX_SCOPE)?;
        let system_table = match &config.system_table_postfix {
            Some(postfix) => format!("{SYSTEM_TABLE_BASE_NAME}{postfix}"),
            None => SYSTEM_TABLE_BASE_NAME.to_string(),
        };

        pubsub.ensure_topic_exists(BACKUP_CHECK_TOPIC).await?;
        let subscription = pubsub.subscribe(BACKUP_CHECK_TOPIC).await?;
        let backup_frozen = Arc::new(AtomicBool::new(false));
        let lifetime = CancellationToken::new();

        let frozen = Arc::clone(&backup_frozen);
        tokio::spawn(subscription.receive(
            move |message| {
                let frozen = Arc::clone(&frozen);
                async move {
                    match message.payload.as_str() {
                        BACKUP_STARTED_MESSAGE => frozen.store(true, Ordering::SeqCst),
                        BACKUP_ENDED_MESSAGE => frozen.store(false, Ordering::SeqCst),
                        other => tracing::warn!("unexpected backup-check payload: {other}"),
                    }
                }
            },
            lifetime.clone(),
        ));

        Ok(Self {
            backend,
            memory,
            mutex_scope,
            backup_scope,
            mutex_prefix: config.mutex_prefix,
            system_table,
            backup_frozen,
            guard_suspended: AtomicUsize::new(0),
            disposed: AtomicBool::new(false),
            lifetime,
        })
    }

    pub fn system_table_name(&self) -> &str {
        &self.system_table
    }

    /// guard runs the checks every operation starts with: cancellation,
    /// disposal, and the freeze gate — while a backup is in progress the
    /// call queues on the backup mutex until the backup releases it.
    async fn guard(&self, cancel: &CancellationToken) -> ServiceResult<()> {
        if cancel.is_cancelled() {
            return Err(ServiceError::Cancelled);
        }
        if self.disposed.load(Ordering::SeqCst) {
            return Err(ServiceError::Disposed);
        }
        if self.backup_frozen.load(Ordering::SeqCst)
            && self.guard_suspended.load(Ordering::SeqCst) == 0
        {
            tracing::debug!("backup in progress, stalling behind the backup mutex");
            let mut mutex = DistributedMutex::acquire(
                Arc::clone(&self.memory),
                &self.backup_scope,
                BACKUP_MUTEX_KEY,
                BACKUP_MUTEX_TTL,
                cancel,
            )
            .await?;
            mutex.release().await;
        }
        Ok(())
    }

    fn validate_table(table: &str) -> ServiceResult<()> {
        if table.trim().is_empty() {
            return Err(ServiceError::InvalidInput(
                "table name must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    async fn entity_mutex(
        &self,
        table: &str,
        key: &DbKey,
        cancel: &CancellationToken,
    ) -> ServiceResult<DistributedMutex> {
        let mutex_key = format!(
            "{}:{}:{}:{}",
            self.mutex_prefix,
            table,
            key.name(),
            key.value().to_key_string()
        );
        DistributedMutex::acquire(
            Arc::clone(&self.memory),
            &self.mutex_scope,
            &mutex_key,
            ENTITY_MUTEX_TTL,
            cancel,
        )
        .await
    }

    async fn master_mutex(
        &self,
        table: &str,
        cancel: &CancellationToken,
    ) -> ServiceResult<DistributedMutex> {
        let mutex_key = format!("{}:{}", self.mutex_prefix, table);
        DistributedMutex::acquire(
            Arc::clone(&self.memory),
            &self.mutex_scope,
            &mutex_key,
            ENTITY_MUTEX_TTL,
            cancel,
        )
        .await
    }

    fn system_key(&self, table: &str) -> ServiceResult<DbKey> {
        DbKey::new(SYSTEM_TABLE_KEY_NAME, Primitive::String(table.to_string()))
    }

    /// declared_key_names reads the `keys` array of the table's system
    /// row.
    async fn declared_key_names(&self, table: &str) -> ServiceResult<Vec<String>> {
        if table == self.system_table {
            return Ok(vec![SYSTEM_TABLE_KEY_NAME.to_string()]);
        }
        let system_key = self.system_key(table)?;
        let row = self.backend.get_item(&self.system_table, &system_key).await?;
        Ok(row
            .and_then(|row| {
                row.get(SYSTEM_TABLE_KEYS_ATTRIBUTE)
                    .and_then(|v| v.as_array())
                    .map(|names| {
                        names
                            .iter()
                            .filter_map(|v| v.as_str().map(String::from))
                            .collect()
                    })
            })
            .unwrap_or_default())
    }

    /// check_attribute_sanity rejects a put whose non-key attribute name
    /// is registered as a key attribute of the table: key names and
    /// non-key names must stay disjoint per table.
    async fn check_attribute_sanity(
        &self,
        table: &str,
        key: &DbKey,
        item: &Item,
    ) -> ServiceResult<()> {
        let declared: HashSet<String> =
            self.declared_key_names(table).await?.into_iter().collect();
        if declared.is_empty() {
            return Ok(());
        }
        for attribute in item.keys() {
            if attribute != key.name() && declared.contains(attribute) {
                return Err(ServiceError::InvalidInput(format!(
                    "attribute {attribute} is a key attribute of table {table} and cannot be used as a non-key attribute"
                )));
            }
        }
        Ok(())
    }

    /// register_key_attribute records the key name in the table's system
    /// row, creating the row on the table's first put. The array add is
    /// set-like, so repeated inserts are no-ops.
    async fn register_key_attribute(&self, table: &str, key_name: &str) -> ServiceResult<()> {
        let system_key = self.system_key(table)?;
        if self
            .backend
            .get_item(&self.system_table, &system_key)
            .await?
            .is_none()
        {
            let mut row = Item::new();
            row.insert(
                SYSTEM_TABLE_KEY_NAME.to_string(),
                Value::String(table.to_string()),
            );
            row.insert(
                SYSTEM_TABLE_KEYS_ATTRIBUTE.to_string(),
                Value::Array(vec![Value::String(key_name.to_string())]),
            );
            match self
                .backend
                .put_item(&self.system_table, &system_key, &row, false)
                .await
            {
                Ok(_) => return Ok(()),
                // Lost the creation race; fall through to the array add.
                Err(ServiceError::PreconditionFailed(_)) => {}
                Err(e) => return Err(e),
            }
        }
        self.backend
            .add_elements_to_array(
                &self.system_table,
                &system_key,
                SYSTEM_TABLE_KEYS_ATTRIBUTE,
                &[Primitive::String(key_name.to_string())],
                &Condition::Empty,
            )
            .await
    }

    /// unregister_table removes the table's system row and drops the
    /// system table itself once its last row is gone.
    async fn unregister_table(&self, table: &str) -> ServiceResult<()> {
        let system_key = self.system_key(table)?;
        self.backend
            .delete_item(&self.system_table, &system_key, &Condition::Empty)
            .await?;
        if self.backend.scan_table(&self.system_table).await?.is_empty() {
            self.backend.drop_table(&self.system_table).await?;
        }
        Ok(())
    }

    fn project(item: Item, attributes: Option<&[String]>) -> Item {
        match attributes {
            None => item,
            Some(attrs) => item
                .into_iter()
                .filter(|(name, _)| attrs.iter().any(|a| a == name))
                .collect(),
        }
    }

    fn condition_or_empty(condition: Option<&Condition>) -> Condition {
        condition.cloned().unwrap_or_default()
    }

    async fn put_item_locked(
        &self,
        table: &str,
        key: &DbKey,
        item: &Item,
        return_behavior: ReturnItemBehavior,
        overwrite_if_exists: bool,
    ) -> ServiceResult<Option<Item>> {
        let user_table = table != self.system_table;
        if user_table {
            self.check_attribute_sanity(table, key, item).await?;
        }

        let mut stored = item.clone();
        stored.insert(key.name().to_string(), key.value().to_json());
        let old = self
            .backend
            .put_item(table, key, &stored, overwrite_if_exists)
            .await?;

        if user_table {
            self.register_key_attribute(table, key.name()).await?;
        }
        Ok(match return_behavior {
            ReturnItemBehavior::DoNotReturn => None,
            ReturnItemBehavior::ReturnOldValues => old,
            ReturnItemBehavior::ReturnNewValues => Some(stored),
        })
    }

    async fn drop_table_locked(&self, table: &str) -> ServiceResult<bool> {
        let dropped = self.backend.drop_table(table).await?;
        if dropped && table != self.system_table {
            self.unregister_table(table).await?;
        }
        Ok(dropped)
    }
}

impl Drop for DatabaseClient {
    fn drop(&mut self) {
        self.lifetime.cancel();
    }
}

#[async_trait]
impl DatabaseService for DatabaseClient {
    async fn item_exists(
        &self,
        table: &str,
        key: &DbKey,
        condition: Option<&Condition>,
        cancel: &CancellationToken,
    ) -> ServiceResult<bool> {
        Self::validate_table(table)?;
        self.guard(cancel).await?;
        let mut mutex = self.entity_mutex(table, key, cancel).await?;
        let result = self
            .backend
            .item_exists(table, key, &Self::condition_or_empty(condition))
            .await;
        mutex.release().await;
        result
    }

    async fn get_item(
        &self,
        table: &str,
        key: &DbKey,
        attributes: Option<&[String]>,
        cancel: &CancellationToken,
    ) -> ServiceResult<Option<Item>> {
        Self::validate_table(table)?;
        self.guard(cancel).await?;
        let mut mutex = self.entity_mutex(table, key, cancel).await?;
        let result = self.backend.get_item(table, key).await;
        mutex.release().await;
        Ok(result?.map(|item| Self::project(item, attributes)))
    }

    async fn get_items(
        &self,
        table: &str,
        keys: &[DbKey],
        attributes: Option<&[String]>,
        cancel: &CancellationToken,
    ) -> ServiceResult<Vec<Item>> {
        Self::validate_table(table)?;
        self.guard(cancel).await?;
        if keys.is_empty() {
            return Ok(vec![]);
        }

        // Acquire in a deterministic ordinal order to stay deadlock-free
        // against other multi-key readers.
        let mut ordered: Vec<&DbKey> = keys.iter().collect();
        ordered.sort_by(|a, b| {
            a.name()
                .cmp(b.name())
                .then_with(|| a.value().to_key_string().cmp(&b.value().to_key_string()))
        });
        ordered.dedup_by(|a, b| {
            a.name() == b.name() && a.value().to_key_string() == b.value().to_key_string()
        });

        let mut held = Vec::with_capacity(ordered.len());
        for key in ordered {
            match self.entity_mutex(table, key, cancel).await {
                Ok(mutex) => held.push(mutex),
                Err(e) => {
                    for mut mutex in held {
                        mutex.release().await;
                    }
                    return Err(e);
                }
            }
        }

        let mut items = Vec::with_capacity(keys.len());
        let mut failure = None;
        for key in keys {
            match self.backend.get_item(table, key).await {
                Ok(Some(item)) => items.push(Self::project(item, attributes)),
                Ok(None) => {}
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        for mut mutex in held {
            mutex.release().await;
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(items),
        }
    }

    async fn put_item(
        &self,
        table: &str,
        key: &DbKey,
        item: &Item,
        return_behavior: ReturnItemBehavior,
        overwrite_if_exists: bool,
        cancel: &CancellationToken,
    ) -> ServiceResult<Option<Item>> {
        Self::validate_table(table)?;
        self.guard(cancel).await?;
        let mut mutex = self.entity_mutex(table, key, cancel).await?;
        let result = self
            .put_item_locked(table, key, item, return_behavior, overwrite_if_exists)
            .await;
        mutex.release().await;
        result
    }

    async fn update_item(
        &self,
        table: &str,
        key: &DbKey,
        patch: &Item,
        return_behavior: ReturnItemBehavior,
        condition: Option<&Condition>,
        cancel: &CancellationToken,
    ) -> ServiceResult<Option<Item>> {
        Self::validate_table(table)?;
        self.guard(cancel).await?;
        let mut mutex = self.entity_mutex(table, key, cancel).await?;
        let result = self
            .backend
            .update_item(table, key, patch, &Self::condition_or_empty(condition))
            .await;
        mutex.release().await;
        let (old, new) = result?;
        Ok(match return_behavior {
            ReturnItemBehavior::DoNotReturn => None,
            ReturnItemBehavior::ReturnOldValues => old,
            ReturnItemBehavior::ReturnNewValues => Some(new),
        })
    }

    async fn delete_item(
        &self,
        table: &str,
        key: &DbKey,
        return_behavior: ReturnItemBehavior,
        condition: Option<&Condition>,
        cancel: &CancellationToken,
    ) -> ServiceResult<Option<Item>> {
        Self::validate_table(table)?;
        self.guard(cancel).await?;
        let mut mutex = self.entity_mutex(table, key, cancel).await?;
        let result = self
            .backend
            .delete_item(table, key, &Self::condition_or_empty(condition))
            .await;
        mutex.release().await;
        let old = result?;
        Ok(match return_behavior {
            ReturnItemBehavior::ReturnOldValues => old,
            _ => None,
        })
    }

    async fn add_elements_to_array(
        &self,
        table: &str,
        key: &DbKey,
        attribute: &str,
        elements: &[Primitive],
        condition: Option<&Condition>,
        cancel: &CancellationToken,
    ) -> ServiceResult<()> {
        Self::validate_table(table)?;
        self.guard(cancel).await?;
        let mut mutex = self.entity_mutex(table, key, cancel).await?;
        let result = self
            .backend
            .add_elements_to_array(
                table,
                key,
                attribute,
                elements,
                &Self::condition_or_empty(condition),
            )
            .await;
        mutex.release().await;
        result
    }

    async fn remove_elements_from_array(
        &self,
        table: &str,
        key: &DbKey,
        attribute: &str,
        elements: &[Primitive],
        condition: Option<&Condition>,
        cancel: &CancellationToken,
    ) -> ServiceResult<()> {
        Self::validate_table(table)?;
        self.guard(cancel).await?;
        let mut mutex = self.entity_mutex(table, key, cancel).await?;
        let result = self
            .backend
            .remove_elements_from_array(
                table,
                key,
                attribute,
                elements,
                &Self::condition_or_empty(condition),
            )
            .await;
        mutex.release().await;
        result
    }

    async fn increment_attribute(
        &self,
        table: &str,
        key: &DbKey,
        attribute: &str,
        delta: f64,
        condition: Option<&Condition>,
        cancel: &CancellationToken,
    ) -> ServiceResult<f64> {
        Self::validate_table(table)?;
        self.guard(cancel).await?;
        let mut mutex = self.entity_mutex(table, key, cancel).await?;
        let result = self
            .backend
            .increment_attribute(
                table,
                key,
                attribute,
                delta,
                &Self::condition_or_empty(condition),
            )
            .await;
        mutex.release().await;
        result
    }

    async fn scan_table(
        &self,
        table: &str,
        cancel: &CancellationToken,
    ) -> ServiceResult<(Vec<String>, Vec<Item>)> {
        Self::validate_table(table)?;
        self.guard(cancel).await?;
        let mut mutex = self.master_mutex(table, cancel).await?;
        let result = async {
            let key_names = self.declared_key_names(table).await?;
            let items = self.backend.scan_table(table).await?;
            Ok((key_names, items))
        }
        .await;
        mutex.release().await;
        result
    }

    async fn scan_table_paginated(
        &self,
        table: &str,
        page_size: usize,
        page_token: Option<&str>,
        cancel: &CancellationToken,
    ) -> ServiceResult<ScanPage> {
        Self::validate_table(table)?;
        self.guard(cancel).await?;
        let mut mutex = self.master_mutex(table, cancel).await?;
        let result = self
            .backend
            .scan_table_paginated(table, page_size, page_token)
            .await;
        mutex.release().await;
        result
    }

    async fn scan_table_with_filter(
        &self,
        table: &str,
        condition: &Condition,
        cancel: &CancellationToken,
    ) -> ServiceResult<(Vec<String>, Vec<Item>)> {
        Self::validate_table(table)?;
        self.guard(cancel).await?;
        let mut mutex = self.master_mutex(table, cancel).await?;
        let result = async {
            let key_names = self.declared_key_names(table).await?;
            let items = self.backend.scan_table_with_filter(table, condition).await?;
            Ok((key_names, items))
        }
        .await;
        mutex.release().await;
        result
    }

    async fn table_names(&self, cancel: &CancellationToken) -> ServiceResult<Vec<String>> {
        self.guard(cancel).await?;
        Ok(self
            .backend
            .table_names()
            .await?
            .into_iter()
            .filter(|name| name != &self.system_table)
            .collect())
    }

    async fn drop_table(&self, table: &str, cancel: &CancellationToken) -> ServiceResult<bool> {
        Self::validate_table(table)?;
        self.guard(cancel).await?;
        let mut mutex = self.master_mutex(table, cancel).await?;
        let result = self.drop_table_locked(table).await;
        mutex.release().await;
        result
    }

    fn memory_service(&self) -> Arc<dyn MemoryService> {
        Arc::clone(&self.memory)
    }

    fn suspend_backup_guard(&self) {
        self.guard_suspended.fetch_add(1, Ordering::SeqCst);
    }

    fn resume_backup_guard(&self) {
        let _ = self
            .guard_suspended
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                Some(v.saturating_sub(1))
            });
    }

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.lifetime.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::in_memory::InMemoryDatabaseBackend;
    use cross_cloud_memory::InMemoryMemoryService;
    use cross_cloud_pubsub::InMemoryPubSubService;
    use serde_json::json;
    use std::time::Duration;

    #[ctor::ctor]
    fn init() {
        let _ = tracing_subscriber::fmt().try_init();
    }

    struct Fixture {
        client: Arc<DatabaseClient>,
        backend: Arc<InMemoryDatabaseBackend>,
        memory: Arc<dyn MemoryService>,
        pubsub: Arc<InMemoryPubSubService>,
        cancel: CancellationToken,
    }

    async fn fixture() -> Fixture {
        let backend = Arc::new(InMemoryDatabaseBackend::new());
        let memory: Arc<dyn MemoryService> = Arc::new(InMemoryMemoryService::new());
        let pubsub = Arc::new(InMemoryPubSubService::new());
        let client = DatabaseClient::new(
            backend.clone(),
            memory.clone(),
            pubsub.clone(),
            DatabaseClientConfig::default(),
        )
        .await
        .unwrap();
        Fixture {
            client: Arc::new(client),
            backend,
            memory,
            pubsub,
            cancel: CancellationToken::new(),
        }
    }

    fn key(value: &str) -> DbKey {
        DbKey::new("Id", value).unwrap()
    }

    fn item(value: serde_json::Value) -> Item {
        value.as_object().unwrap().clone()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn put_get_exists_agree() -> Result<(), anyhow::Error> {
        let f = fixture().await;
        let row = item(json!({"Name": "John Doe", "Age": 30}));
        f.client
            .put_item(
                "Users",
                &key("user1"),
                &row,
                ReturnItemBehavior::DoNotReturn,
                false,
                &f.cancel,
            )
            .await?;

        assert!(f.client.item_exists("Users", &key("user1"), None, &f.cancel).await?);
        assert!(!f.client.item_exists("Users", &key("user2"), None, &f.cancel).await?);

        let fetched = f
            .client
            .get_item("Users", &key("user1"), None, &f.cancel)
            .await?
            .unwrap();
        assert_eq!(fetched["Id"], json!("user1"));
        assert_eq!(fetched["Age"], json!(30));

        let projected = f
            .client
            .get_item(
                "Users",
                &key("user1"),
                Some(&["Name".to_string()]),
                &f.cancel,
            )
            .await?
            .unwrap();
        assert_eq!(projected.len(), 1);
        assert_eq!(projected["Name"], json!("John Doe"));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn put_without_overwrite_fails_on_existing() -> Result<(), anyhow::Error> {
        let f = fixture().await;
        let row = item(json!({"Name": "a"}));
        f.client
            .put_item(
                "Users",
                &key("u"),
                &row,
                ReturnItemBehavior::DoNotReturn,
                false,
                &f.cancel,
            )
            .await?;
        let err = f
            .client
            .put_item(
                "Users",
                &key("u"),
                &row,
                ReturnItemBehavior::DoNotReturn,
                false,
                &f.cancel,
            )
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 412);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn return_behaviors() -> Result<(), anyhow::Error> {
        let f = fixture().await;
        f.client
            .put_item(
                "Users",
                &key("u"),
                &item(json!({"Name": "old"})),
                ReturnItemBehavior::DoNotReturn,
                false,
                &f.cancel,
            )
            .await?;

        let old = f
            .client
            .put_item(
                "Users",
                &key("u"),
                &item(json!({"Name": "new"})),
                ReturnItemBehavior::ReturnOldValues,
                true,
                &f.cancel,
            )
            .await?
            .unwrap();
        assert_eq!(old["Name"], json!("old"));

        let new = f
            .client
            .update_item(
                "Users",
                &key("u"),
                &item(json!({"Age": 7})),
                ReturnItemBehavior::ReturnNewValues,
                None,
                &f.cancel,
            )
            .await?
            .unwrap();
        assert_eq!(new["Name"], json!("new"));
        assert_eq!(new["Age"], json!(7));

        let old = f
            .client
            .delete_item(
                "Users",
                &key("u"),
                ReturnItemBehavior::ReturnOldValues,
                None,
                &f.cancel,
            )
            .await?
            .unwrap();
        assert_eq!(old["Age"], json!(7));
        assert!(!f.client.item_exists("Users", &key("u"), None, &f.cancel).await?);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn conditions_gate_writes() -> Result<(), anyhow::Error> {
        let f = fixture().await;
        f.client
            .put_item(
                "Users",
                &key("u"),
                &item(json!({"Age": 30})),
                ReturnItemBehavior::DoNotReturn,
                false,
                &f.cancel,
            )
            .await?;

        let err = f
            .client
            .update_item(
                "Users",
                &key("u"),
                &item(json!({"Age": 31})),
                ReturnItemBehavior::DoNotReturn,
                Some(&Condition::attribute_equals("Age", 99i64)),
                &f.cancel,
            )
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 412);

        // Condition over an attribute the item does not carry fails too.
        let err = f
            .client
            .delete_item(
                "Users",
                &key("u"),
                ReturnItemBehavior::DoNotReturn,
                Some(&Condition::attribute_equals("Missing", 1i64)),
                &f.cancel,
            )
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 412);

        f.client
            .update_item(
                "Users",
                &key("u"),
                &item(json!({"Age": 31})),
                ReturnItemBehavior::DoNotReturn,
                Some(&Condition::attribute_equals("Age", 30i64)),
                &f.cancel,
            )
            .await?;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn get_items_keeps_request_order() -> Result<(), anyhow::Error> {
        let f = fixture().await;
        for name in ["a", "b", "c"] {
            f.client
                .put_item(
                    "Users",
                    &key(name),
                    &item(json!({"Name": name})),
                    ReturnItemBehavior::DoNotReturn,
                    false,
                    &f.cancel,
                )
                .await?;
        }
        let items = f
            .client
            .get_items(
                "Users",
                &[key("c"), key("a"), key("missing")],
                None,
                &f.cancel,
            )
            .await?;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0]["Id"], json!("c"));
        assert_eq!(items[1]["Id"], json!("a"));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn attribute_sanity_rejects_key_name_collisions() -> Result<(), anyhow::Error> {
        let f = fixture().await;
        f.client
            .put_item(
                "Users",
                &key("u1"),
                &item(json!({"Name": "a"})),
                ReturnItemBehavior::DoNotReturn,
                false,
                &f.cancel,
            )
            .await?;

        // "Id" is now a registered key name; using it as a non-key
        // attribute under another key name must be rejected.
        let other = DbKey::new("Name", "b").unwrap();
        let err = f
            .client
            .put_item(
                "Users",
                &other,
                &item(json!({"Id": "sneaky"})),
                ReturnItemBehavior::DoNotReturn,
                false,
                &f.cancel,
            )
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 400);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn system_table_bookkeeping_lifecycle() -> Result<(), anyhow::Error> {
        let f = fixture().await;
        f.client
            .put_item(
                "Users",
                &key("u1"),
                &item(json!({"Name": "a"})),
                ReturnItemBehavior::DoNotReturn,
                false,
                &f.cancel,
            )
            .await?;

        let system_table = f.client.system_table_name().to_string();
        let system_key = DbKey::new("table", "Users").unwrap();
        let row = f.backend.get_item(&system_table, &system_key).await?.unwrap();
        assert_eq!(row["keys"], json!(["Id"]));

        // User-facing table list hides the system table.
        assert_eq!(f.client.table_names(&f.cancel).await?, vec!["Users"]);

        assert!(f.client.drop_table("Users", &f.cancel).await?);
        assert_eq!(f.backend.get_item(&system_table, &system_key).await?, None);
        // Last row gone: the system table dropped itself.
        assert!(f.backend.table_names().await?.is_empty());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn scan_returns_declared_key_names() -> Result<(), anyhow::Error> {
        let f = fixture().await;
        for name in ["a", "b"] {
            f.client
                .put_item(
                    "Users",
                    &key(name),
                    &item(json!({"Name": name})),
                    ReturnItemBehavior::DoNotReturn,
                    false,
                    &f.cancel,
                )
                .await?;
        }
        let (key_names, items) = f.client.scan_table("Users", &f.cancel).await?;
        assert_eq!(key_names, vec!["Id"]);
        assert_eq!(items.len(), 2);

        let page = f
            .client
            .scan_table_paginated("Users", 1, None, &f.cancel)
            .await?;
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.total_count, Some(2));
        assert!(page.next_page_token.is_some());

        let (_, filtered) = f
            .client
            .scan_table_with_filter(
                "Users",
                &Condition::attribute_equals("Name", "a"),
                &f.cancel,
            )
            .await?;
        assert_eq!(filtered.len(), 1);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn frozen_client_stalls_behind_the_backup_mutex() -> Result<(), anyhow::Error> {
        let f = fixture().await;
        let backup_scope = MemoryScope::from_compiled(BACKUP_MUTEX_SCOPE).unwrap();
        let mut held = DistributedMutex::acquire(
            f.memory.clone(),
            &backup_scope,
            BACKUP_MUTEX_KEY,
            BACKUP_MUTEX_TTL,
            &f.cancel,
        )
        .await?;

        f.pubsub
            .publish(BACKUP_CHECK_TOPIC, BACKUP_STARTED_MESSAGE)
            .await?;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let client = f.client.clone();
        let cancel = f.cancel.clone();
        let blocked = tokio::spawn(async move {
            client.get_item("Users", &key("u"), None, &cancel).await
        });
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!blocked.is_finished());

        // Suspended clients (the backup engine itself) pass through.
        f.client.suspend_backup_guard();
        assert!(f
            .client
            .get_item("Users", &key("u"), None, &f.cancel)
            .await?
            .is_none());
        f.client.resume_backup_guard();

        held.release().await;
        let fetched = blocked.await??;
        assert!(fetched.is_none());

        f.pubsub
            .publish(BACKUP_CHECK_TOPIC, BACKUP_ENDED_MESSAGE)
            .await?;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(f
            .client
            .get_item("Users", &key("u"), None, &f.cancel)
            .await?
            .is_none());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cancelled_token_fails_fast() {
        let f = fixture().await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = f
            .client
            .get_item("Users", &key("u"), None, &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn disposed_client_refuses_operations() -> Result<(), anyhow::Error> {
        let f = fixture().await;
        f.client
            .put_item(
                "Users",
                &key("u"),
                &item(json!({"Name": "a"})),
                ReturnItemBehavior::DoNotReturn,
                false,
                &f.cancel,
            )
            .await?;

        f.client.dispose();
        f.client.dispose();

        let err = f
            .client
            .get_item("Users", &key("u"), None, &f.cancel)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 503);
        let err = f.client.table_names(&f.cancel).await.unwrap_err();
        assert_eq!(err.status_code(), 503);
        let err = f
            .client
            .put_item(
                "Users",
                &key("v"),
                &item(json!({"Name": "b"})),
                ReturnItemBehavior::DoNotReturn,
                false,
                &f.cancel,
            )
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 503);
        Ok(())
    }
}
