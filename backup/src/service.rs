use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use chrono_tz::Tz;
use cron::Schedule;
use futures_util::future::join_all;
use futures_util::Stream;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use cross_cloud_database::{
    DatabaseService, ReturnItemBehavior, BACKUP_CHECK_TOPIC, BACKUP_ENDED_MESSAGE,
    BACKUP_MUTEX_KEY, BACKUP_MUTEX_SCOPE, BACKUP_MUTEX_TTL, BACKUP_STARTED_MESSAGE,
};
use cross_cloud_memory::{DistributedMutex, MemoryScope};
use cross_cloud_pubsub::PubSubService;
use cross_cloud_storage::{FileService, FileSource, ListFilesRequest};
use cross_cloud_types::{DbKey, Primitive, ServiceError, ServiceResult};

use crate::artifact::{normalize_root_path, timestamp_file_name, BackupCursor, TableBackup};
use crate::{
    DEFAULT_CRON_EXPRESSION, QUIESCENCE_WAIT, SCHEDULER_MAX_FAILURES, SCHEDULER_RETRY_BACKOFF,
};

/// Callback invoked with background error descriptions; errors are
/// swallowed when no callback is configured.
pub type ErrorCallback = Arc<dyn Fn(String) + Send + Sync>;

/// When to run scheduled backups. The expression uses the 5-field unix
/// cron syntax (a seconds field is accepted too); occurrences are
/// computed in `timezone`.
#[derive(Debug, Clone)]
pub struct BackupSchedule {
    pub cron_expression: String,
    pub timezone: Tz,
}

impl Default for BackupSchedule {
    fn default() -> Self {
        Self {
            cron_expression: DEFAULT_CRON_EXPRESSION.to_string(),
            timezone: Tz::UTC,
        }
    }
}

struct BackupInner {
    database: Arc<dyn DatabaseService>,
    files: Arc<dyn FileService>,
    pubsub: Arc<dyn PubSubService>,
    bucket: String,
    root_path: String,
    backup_scope: MemoryScope,
    on_error: Option<ErrorCallback>,
    quiesce_wait: Duration,
}

/// The backup engine. Manual when constructed without a schedule;
/// otherwise a background loop takes a backup at every cron occurrence.
///
/// Disposal cancels the loop and waits briefly for it; a disposed
/// service refuses further work.
pub struct DatabaseBackupService {
    inner: Arc<BackupInner>,
    scheduler: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
    disposed: AtomicBool,
}

impl std::fmt::Debug for DatabaseBackupService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseBackupService")
            .field("disposed", &self.disposed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl DatabaseBackupService {
    /// new builds the engine. An unparseable cron expression or an empty
    /// bucket name fails here, not at first use.
    pub fn new(
        database: Arc<dyn DatabaseService>,
        files: Arc<dyn FileService>,
        pubsub: Arc<dyn PubSubService>,
        bucket: &str,
        root_path: &str,
        schedule: Option<BackupSchedule>,
        on_error: Option<ErrorCallback>,
    ) -> ServiceResult<Self> {
        Self::build(
            database,
            files,
            pubsub,
            bucket,
            root_path,
            schedule,
            on_error,
            QUIESCENCE_WAIT,
        )
    }

    #[cfg(test)]
    pub(crate) fn new_for_tests(
        database: Arc<dyn DatabaseService>,
        files: Arc<dyn FileService>,
        pubsub: Arc<dyn PubSubService>,
        bucket: &str,
        root_path: &str,
        schedule: Option<BackupSchedule>,
        quiesce_wait: Duration,
    ) -> ServiceResult<Self> {
        Self::build(
            database, files, pubsub, bucket, root_path, schedule, None, quiesce_wait,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        database: Arc<dyn DatabaseService>,
        files: Arc<dyn FileService>,
        pubsub: Arc<dyn PubSubService>,
        bucket: &str,
        root_path: &str,
        schedule: Option<BackupSchedule>,
        on_error: Option<ErrorCallback>,
        quiesce_wait: Duration,
    ) -> ServiceResult<Self> {
        if bucket.trim().is_empty() {
            return Err(ServiceError::InvalidInput(
                "bucket must not be empty".to_string(),
            ));
        }
        let inner = Arc::new(BackupInner {
            database,
            files,
            pubsub,
            bucket: bucket.to_string(),
            root_path: normalize_root_path(root_path),
            backup_scope: MemoryScope::from_compiled(BACKUP_MUTEX_SCOPE)?,
            on_error,
            quiesce_wait,
        });
        let shutdown = CancellationToken::new();
        let scheduler = match schedule {
            Some(schedule) => {
                let parsed = parse_cron(&schedule.cron_expression)?;
                Some(tokio::spawn(run_scheduler(
                    Arc::clone(&inner),
                    parsed,
                    schedule.timezone,
                    shutdown.clone(),
                )))
            }
            None => None,
        };
        Ok(Self {
            inner,
            scheduler: Mutex::new(scheduler),
            shutdown,
            disposed: AtomicBool::new(false),
        })
    }

    fn ensure_live(&self) -> ServiceResult<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(ServiceError::Disposed);
        }
        Ok(())
    }

    /// take_backup snapshots every non-empty table into one artifact.
    /// Returns `None` without writing anything when there is no data.
    pub async fn take_backup(
        &self,
        drop_tables_after_backup: bool,
        cancel: &CancellationToken,
    ) -> ServiceResult<Option<BackupCursor>> {
        self.ensure_live()?;
        self.inner
            .take_backup(drop_tables_after_backup, cancel)
            .await
    }

    /// restore_backup validates the artifact, then drops and repopulates
    /// its tables under the backup mutex.
    pub async fn restore_backup(
        &self,
        cursor: &BackupCursor,
        full_cleanup_before_restoration: bool,
        cancel: &CancellationToken,
    ) -> ServiceResult<()> {
        self.ensure_live()?;
        self.inner
            .restore_backup(cursor, full_cleanup_before_restoration, cancel)
            .await
    }

    /// backup_file_cursors enumerates every artifact under the root
    /// path, oldest first. The stream ends with a cancellation error
    /// when the token fires mid-enumeration; cursors already yielded
    /// stand.
    pub fn backup_file_cursors(
        &self,
        cancel: CancellationToken,
    ) -> impl Stream<Item = ServiceResult<BackupCursor>> {
        let inner = Arc::clone(&self.inner);
        let disposed = self.disposed.load(Ordering::SeqCst);
        async_stream::stream! {
            if disposed {
                yield Err(ServiceError::Disposed);
                return;
            }
            let mut continuation_token: Option<String> = None;
            loop {
                let request = ListFilesRequest {
                    prefix: (!inner.root_path.is_empty()).then(|| inner.root_path.clone()),
                    max_results: None,
                    continuation_token: continuation_token.clone(),
                };
                let page = match inner.files.list_files(&inner.bucket, request).await {
                    Ok(page) => page,
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                };
                for key in page.file_keys {
                    if cancel.is_cancelled() {
                        yield Err(ServiceError::Cancelled);
                        return;
                    }
                    let file_name = key
                        .strip_prefix(&inner.root_path)
                        .unwrap_or(key.as_str())
                        .to_string();
                    yield Ok(BackupCursor::new(file_name));
                }
                match page.next_continuation_token {
                    Some(next) => continuation_token = Some(next),
                    None => return,
                }
                if cancel.is_cancelled() {
                    yield Err(ServiceError::Cancelled);
                    return;
                }
            }
        }
    }

    /// migrate replays a fresh backup of `source` into `destination`
    /// through `work_bucket`. `cleanup_source` drops the source tables
    /// after the backup; `cleanup_destination` drops every destination
    /// table before restoring.
    pub async fn migrate(
        source: Arc<dyn DatabaseService>,
        destination: Arc<dyn DatabaseService>,
        files: Arc<dyn FileService>,
        pubsub: Arc<dyn PubSubService>,
        work_bucket: &str,
        cleanup_source: bool,
        cleanup_destination: bool,
        cancel: &CancellationToken,
    ) -> ServiceResult<()> {
        Self::migrate_inner(
            source,
            destination,
            files,
            pubsub,
            work_bucket,
            cleanup_source,
            cleanup_destination,
            QUIESCENCE_WAIT,
            cancel,
        )
        .await
    }

    #[cfg(test)]
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn migrate_for_tests(
        source: Arc<dyn DatabaseService>,
        destination: Arc<dyn DatabaseService>,
        files: Arc<dyn FileService>,
        pubsub: Arc<dyn PubSubService>,
        work_bucket: &str,
        cleanup_source: bool,
        cleanup_destination: bool,
        quiesce_wait: Duration,
        cancel: &CancellationToken,
    ) -> ServiceResult<()> {
        Self::migrate_inner(
            source,
            destination,
            files,
            pubsub,
            work_bucket,
            cleanup_source,
            cleanup_destination,
            quiesce_wait,
            cancel,
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn migrate_inner(
        source: Arc<dyn DatabaseService>,
        destination: Arc<dyn DatabaseService>,
        files: Arc<dyn FileService>,
        pubsub: Arc<dyn PubSubService>,
        work_bucket: &str,
        cleanup_source: bool,
        cleanup_destination: bool,
        quiesce_wait: Duration,
        cancel: &CancellationToken,
    ) -> ServiceResult<()> {
        let source_backup = Self::build(
            source,
            Arc::clone(&files),
            Arc::clone(&pubsub),
            work_bucket,
            "",
            None,
            None,
            quiesce_wait,
        )?;
        let cursor = source_backup
            .take_backup(cleanup_source, cancel)
            .await?
            .ok_or_else(|| ServiceError::NotFound("No data found to migrate".to_string()))?;

        let destination_backup = Self::build(
            destination,
            files,
            pubsub,
            work_bucket,
            "",
            None,
            None,
            quiesce_wait,
        )?;
        destination_backup
            .restore_backup(&cursor, cleanup_destination, cancel)
            .await
    }

    /// dispose cancels the scheduler and waits up to five seconds for
    /// it. Further calls on the service fail as disposed.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.cancel();
        let handle = self.scheduler.lock().take();
        if let Some(handle) = handle {
            if tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .is_err()
            {
                tracing::warn!("backup scheduler did not stop within 5s");
            }
        }
    }
}

impl Drop for DatabaseBackupService {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if let Some(handle) = self.scheduler.lock().take() {
            handle.abort();
        }
    }
}

impl BackupInner {
    fn report(&self, message: String) {
        tracing::error!("{message}");
        if let Some(on_error) = &self.on_error {
            on_error(message);
        }
    }

    async fn publish_check(&self, payload: &str) -> ServiceResult<()> {
        self.pubsub.ensure_topic_exists(BACKUP_CHECK_TOPIC).await?;
        self.pubsub.publish(BACKUP_CHECK_TOPIC, payload).await
    }

    /// quiesce publishes `started` and gives every client in the fleet
    /// time to observe the freeze before any table is touched.
    async fn quiesce(&self, cancel: &CancellationToken) -> ServiceResult<()> {
        self.publish_check(BACKUP_STARTED_MESSAGE).await?;
        tokio::select! {
            _ = cancel.cancelled() => Err(ServiceError::Cancelled),
            _ = tokio::time::sleep(self.quiesce_wait) => Ok(()),
        }
    }

    async fn take_backup(
        &self,
        drop_tables_after_backup: bool,
        cancel: &CancellationToken,
    ) -> ServiceResult<Option<BackupCursor>> {
        let memory = self.database.memory_service();
        let mut mutex = DistributedMutex::acquire(
            memory,
            &self.backup_scope,
            BACKUP_MUTEX_KEY,
            BACKUP_MUTEX_TTL,
            cancel,
        )
        .await?;
        self.database.suspend_backup_guard();

        let collected = self.collect_tables(drop_tables_after_backup, cancel).await;

        // The unlock path is mandatory: `ended` and the release happen
        // whether or not the collection succeeded.
        if let Err(e) = self.publish_check(BACKUP_ENDED_MESSAGE).await {
            self.report(format!("failed to publish backup end: {e}"));
        }
        self.database.resume_backup_guard();
        mutex.release().await;

        let tables = collected?;
        if tables.is_empty() {
            return Ok(None);
        }

        let body = serde_json::to_vec(&tables)
            .map_err(|e| ServiceError::Backend(format!("failed to serialize backup: {e}")))?;
        let file_name = timestamp_file_name(Utc::now());
        let object_key = format!("{}{}", self.root_path, file_name);
        self.files
            .upload_file(FileSource::Bytes(body.into()), &self.bucket, &object_key)
            .await?;
        tracing::info!(
            "backup uploaded: {}/{object_key} ({} tables)",
            self.bucket,
            tables.len()
        );
        Ok(Some(BackupCursor::new(file_name)))
    }

    async fn collect_tables(
        &self,
        drop_tables_after_backup: bool,
        cancel: &CancellationToken,
    ) -> ServiceResult<Vec<TableBackup>> {
        self.quiesce(cancel).await?;

        let tables = self.database.table_names(cancel).await?;
        let mut collected = Vec::with_capacity(tables.len());
        for table in tables {
            let (key_names, mut items) = self.database.scan_table(&table, cancel).await?;
            if items.is_empty() {
                continue;
            }
            let key_name = key_names
                .iter()
                .find(|name| items.iter().all(|item| item.contains_key(*name)))
                .cloned()
                .ok_or_else(|| {
                    ServiceError::Backend(format!(
                        "no declared key attribute is present on every item of table {table}"
                    ))
                })?;
            for item in &mut items {
                stringify_key_attribute(item, &key_name);
            }
            collected.push(TableBackup {
                table_name: table.clone(),
                key_name,
                items,
            });
            if drop_tables_after_backup {
                self.database.drop_table(&table, cancel).await?;
            }
        }
        Ok(collected)
    }

    async fn restore_backup(
        &self,
        cursor: &BackupCursor,
        full_cleanup_before_restoration: bool,
        cancel: &CancellationToken,
    ) -> ServiceResult<()> {
        // Download and validate before taking any lock; an invalid
        // artifact must leave the database untouched.
        let object_key = format!("{}{}", self.root_path, cursor.file_name());
        let mut body = Vec::new();
        self.files
            .download_file(&self.bucket, &object_key, &mut body)
            .await?;
        let tables: Vec<TableBackup> = serde_json::from_slice(&body)
            .map_err(|e| ServiceError::InvalidInput(format!("invalid backup artifact: {e}")))?;

        for table in &tables {
            let invalid = table
                .items
                .iter()
                .filter(|item| {
                    !item
                        .get(&table.key_name)
                        .map(Value::is_string)
                        .unwrap_or(false)
                })
                .count();
            if invalid > 0 {
                return Err(ServiceError::InvalidInput(format!(
                    "Invalid items ({invalid}) found in table {}",
                    table.table_name
                )));
            }
        }

        let mut by_name = HashMap::with_capacity(tables.len());
        for table in &tables {
            if by_name.insert(table.table_name.as_str(), table).is_some() {
                return Err(ServiceError::Conflict(format!(
                    "duplicate detected for table name {}",
                    table.table_name
                )));
            }
        }

        let memory = self.database.memory_service();
        let mut mutex = DistributedMutex::acquire(
            memory,
            &self.backup_scope,
            BACKUP_MUTEX_KEY,
            BACKUP_MUTEX_TTL,
            cancel,
        )
        .await?;
        self.database.suspend_backup_guard();

        let result = self
            .restore_tables(&tables, full_cleanup_before_restoration, cancel)
            .await;

        if let Err(e) = self.publish_check(BACKUP_ENDED_MESSAGE).await {
            self.report(format!("failed to publish backup end: {e}"));
        }
        self.database.resume_backup_guard();
        mutex.release().await;
        result
    }

    async fn restore_tables(
        &self,
        tables: &[TableBackup],
        full_cleanup_before_restoration: bool,
        cancel: &CancellationToken,
    ) -> ServiceResult<()> {
        self.quiesce(cancel).await?;

        if full_cleanup_before_restoration {
            let names = self.database.table_names(cancel).await?;
            let drops = join_all(
                names
                    .iter()
                    .map(|name| self.database.drop_table(name, cancel)),
            )
            .await;
            for (name, result) in names.iter().zip(drops) {
                if let Err(e) = result {
                    self.report(format!("failed to drop table {name} during cleanup: {e}"));
                }
            }
        }

        for table in tables {
            self.database.drop_table(&table.table_name, cancel).await?;
            let puts = table.items.iter().map(|item| async move {
                let Some(key_value) = item.get(&table.key_name).and_then(Value::as_str) else {
                    return Err(ServiceError::InvalidInput(format!(
                        "item lacks key attribute {}",
                        table.key_name
                    )));
                };
                let key = DbKey::new(
                    table.key_name.clone(),
                    Primitive::String(key_value.to_string()),
                )?;
                self.database
                    .put_item(
                        &table.table_name,
                        &key,
                        item,
                        ReturnItemBehavior::DoNotReturn,
                        true,
                        cancel,
                    )
                    .await
                    .map(|_| ())
            });
            let errors: Vec<String> = join_all(puts)
                .await
                .into_iter()
                .filter_map(|result| result.err())
                .map(|e| e.to_string())
                .collect();
            if !errors.is_empty() {
                return Err(ServiceError::Backend(format!(
                    "restore of table {} failed: {}",
                    table.table_name,
                    errors.join("; ")
                )));
            }
        }
        Ok(())
    }
}

/// stringify_key_attribute rewrites the item's key attribute into its
/// artifact form: numbers become strings, everything non-string falls
/// back to its JSON rendering. Byte keys are already base64 strings.
fn stringify_key_attribute(item: &mut cross_cloud_types::Item, key_name: &str) {
    if let Some(value) = item.get_mut(key_name) {
        if !value.is_string() {
            let rendered = match value {
                Value::Number(n) => n.to_string(),
                ref other => other.to_string(),
            };
            *value = Value::String(rendered);
        }
    }
}

/// parse_cron accepts the 5-field unix syntax by normalizing it to the
/// 6-field form with a zero seconds column.
fn parse_cron(expression: &str) -> ServiceResult<Schedule> {
    let normalized = if expression.split_whitespace().count() == 5 {
        format!("0 {expression}")
    } else {
        expression.to_string()
    };
    Schedule::from_str(&normalized).map_err(|e| {
        ServiceError::InvalidInput(format!("invalid cron expression {expression:?}: {e}"))
    })
}

/// run_scheduler sleeps until each next cron occurrence and takes a
/// backup there. Failures retry after a short backoff; after
/// [`SCHEDULER_MAX_FAILURES`] consecutive failures the loop reports that
/// it is giving up and exits. Cancellation ends the loop promptly.
async fn run_scheduler(
    inner: Arc<BackupInner>,
    schedule: Schedule,
    timezone: Tz,
    cancel: CancellationToken,
) {
    let mut consecutive_failures = 0u32;
    loop {
        let now = Utc::now().with_timezone(&timezone);
        let Some(next) = schedule.after(&now).next() else {
            tracing::debug!("no future cron occurrence, scheduler exiting");
            return;
        };
        let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(wait) => {}
        }

        loop {
            match inner.take_backup(false, &cancel).await {
                Ok(cursor) => {
                    tracing::debug!("scheduled backup finished: {cursor:?}");
                    consecutive_failures = 0;
                    break;
                }
                Err(ServiceError::Cancelled) => return,
                Err(e) => {
                    consecutive_failures += 1;
                    inner.report(format!(
                        "scheduled backup failed ({consecutive_failures} consecutive): {e}"
                    ));
                    if consecutive_failures >= SCHEDULER_MAX_FAILURES {
                        inner.report(format!(
                            "giving up on scheduled backups after {SCHEDULER_MAX_FAILURES} consecutive failures"
                        ));
                        return;
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(SCHEDULER_RETRY_BACKOFF) => {}
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cross_cloud_database::{
        DatabaseClient, DatabaseClientConfig, InMemoryDatabaseBackend,
    };
    use cross_cloud_memory::{InMemoryMemoryService, MemoryService};
    use cross_cloud_pubsub::InMemoryPubSubService;
    use cross_cloud_storage::InMemoryFileService;
    use cross_cloud_types::Item;
    use futures_util::StreamExt;
    use serde_json::json;
    use serial_test::serial;

    const BUCKET: &str = "backup-bucket";
    const TEST_QUIESCE: Duration = Duration::from_millis(100);

    #[ctor::ctor]
    fn init() {
        let _ = tracing_subscriber::fmt().try_init();
    }

    struct Stack {
        database: Arc<dyn DatabaseService>,
        backend: Arc<InMemoryDatabaseBackend>,
        files: Arc<InMemoryFileService>,
        pubsub: Arc<InMemoryPubSubService>,
        cancel: CancellationToken,
    }

    impl Stack {
        async fn new() -> Self {
            let backend = Arc::new(InMemoryDatabaseBackend::new());
            let memory: Arc<dyn MemoryService> = Arc::new(InMemoryMemoryService::new());
            let pubsub = Arc::new(InMemoryPubSubService::new());
            let client = DatabaseClient::new(
                backend.clone(),
                memory,
                pubsub.clone(),
                DatabaseClientConfig::default(),
            )
            .await
            .unwrap();
            Self {
                database: Arc::new(client),
                backend,
                files: Arc::new(InMemoryFileService::new()),
                pubsub,
                cancel: CancellationToken::new(),
            }
        }

        fn backup(&self, root_path: &str) -> DatabaseBackupService {
            DatabaseBackupService::new_for_tests(
                self.database.clone(),
                self.files.clone(),
                self.pubsub.clone(),
                BUCKET,
                root_path,
                None,
                TEST_QUIESCE,
            )
            .unwrap()
        }

        async fn put(&self, table: &str, key_name: &str, key_value: &str, body: Value) {
            let key = DbKey::new(key_name, key_value).unwrap();
            self.database
                .put_item(
                    table,
                    &key,
                    body.as_object().unwrap(),
                    ReturnItemBehavior::DoNotReturn,
                    true,
                    &self.cancel,
                )
                .await
                .unwrap();
        }

        async fn get(&self, table: &str, key_name: &str, key_value: &str) -> Option<Item> {
            let key = DbKey::new(key_name, key_value).unwrap();
            self.database
                .get_item(table, &key, None, &self.cancel)
                .await
                .unwrap()
        }
    }

    async fn artifact_bytes(stack: &Stack, root: &str, cursor: &BackupCursor) -> Vec<u8> {
        let mut body = Vec::new();
        stack
            .files
            .download_file(
                BUCKET,
                &format!("{}{}", normalize_root_path(root), cursor.file_name()),
                &mut body,
            )
            .await
            .unwrap();
        body
    }

    #[tokio::test(flavor = "multi_thread")]
    #[serial]
    async fn single_table_backup_and_restore() -> Result<(), anyhow::Error> {
        let stack = Stack::new().await;
        stack
            .put(
                "TestUsers",
                "Id",
                "user1",
                json!({"Name": "John Doe", "Email": "john@x", "Age": 30}),
            )
            .await;

        let backup = stack.backup("");
        let cursor = backup.take_backup(false, &stack.cancel).await?.unwrap();

        stack.database.drop_table("TestUsers", &stack.cancel).await?;
        assert!(stack.get("TestUsers", "Id", "user1").await.is_none());

        backup.restore_backup(&cursor, false, &stack.cancel).await?;

        let restored = stack.get("TestUsers", "Id", "user1").await.unwrap();
        assert_eq!(restored["Id"], json!("user1"));
        assert_eq!(restored["Name"], json!("John Doe"));
        assert_eq!(restored["Email"], json!("john@x"));
        assert_eq!(restored["Age"], json!(30));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    #[serial]
    async fn multi_table_backup_and_restore() -> Result<(), anyhow::Error> {
        let stack = Stack::new().await;
        stack.put("Users", "Id", "u1", json!({"Name": "a"})).await;
        stack.put("Users", "Id", "u2", json!({"Name": "b"})).await;
        stack
            .put("Products", "ProductId", "p1", json!({"Price": 10}))
            .await;
        stack
            .put("Products", "ProductId", "p2", json!({"Price": 20}))
            .await;
        stack
            .put("Orders", "OrderId", "o1", json!({"Total": 30}))
            .await;

        let backup = stack.backup("snapshots");
        let cursor = backup.take_backup(false, &stack.cancel).await?.unwrap();

        for table in ["Users", "Products", "Orders"] {
            stack.database.drop_table(table, &stack.cancel).await?;
        }
        backup.restore_backup(&cursor, false, &stack.cancel).await?;

        assert_eq!(
            stack.get("Users", "Id", "u1").await.unwrap()["Name"],
            json!("a")
        );
        assert_eq!(
            stack.get("Products", "ProductId", "p2").await.unwrap()["Price"],
            json!(20)
        );
        assert_eq!(
            stack.get("Orders", "OrderId", "o1").await.unwrap()["Total"],
            json!(30)
        );
        let (_, users) = stack.database.scan_table("Users", &stack.cancel).await?;
        let (_, products) = stack.database.scan_table("Products", &stack.cancel).await?;
        let (_, orders) = stack.database.scan_table("Orders", &stack.cancel).await?;
        assert_eq!((users.len(), products.len(), orders.len()), (2, 2, 1));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    #[serial]
    async fn backup_of_empty_database_returns_none() -> Result<(), anyhow::Error> {
        let stack = Stack::new().await;
        let backup = stack.backup("");
        assert!(backup.take_backup(false, &stack.cancel).await?.is_none());

        let listed = stack
            .files
            .list_files(BUCKET, ListFilesRequest::default())
            .await?;
        assert!(listed.file_keys.is_empty());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    #[serial]
    async fn restore_rejects_invalid_items() -> Result<(), anyhow::Error> {
        let stack = Stack::new().await;
        stack.put("Users", "Id", "u1", json!({"Name": "kept"})).await;

        let artifact = r#"[{"table_name":"Users","key_name":"Id","items":[{"Name":"John"}]}]"#;
        stack
            .files
            .upload_file(artifact.into(), BUCKET, "bad.json")
            .await?;

        let backup = stack.backup("");
        let err = backup
            .restore_backup(&BackupCursor::new("bad.json"), false, &stack.cancel)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 400);
        assert!(err.to_string().contains("Invalid items (1)"));

        // Nothing was written.
        assert_eq!(
            stack.get("Users", "Id", "u1").await.unwrap()["Name"],
            json!("kept")
        );
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    #[serial]
    async fn restore_rejects_duplicate_table_names() -> Result<(), anyhow::Error> {
        let stack = Stack::new().await;
        stack.put("Users", "Id", "u1", json!({"Name": "kept"})).await;

        let artifact = concat!(
            r#"[{"table_name":"Users","key_name":"Id","items":[{"Id":"a"}]},"#,
            r#"{"table_name":"Users","key_name":"Id","items":[{"Id":"b"}]}]"#
        );
        stack
            .files
            .upload_file(artifact.into(), BUCKET, "dup.json")
            .await?;

        let backup = stack.backup("");
        let err = backup
            .restore_backup(&BackupCursor::new("dup.json"), false, &stack.cancel)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 409);
        assert!(err.to_string().contains("duplicate detected"));
        assert_eq!(
            stack.get("Users", "Id", "u1").await.unwrap()["Name"],
            json!("kept")
        );
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    #[serial]
    async fn restore_overwrites_existing_items() -> Result<(), anyhow::Error> {
        let stack = Stack::new().await;
        stack.put("Users", "Id", "user1", json!({"Name": "Backup Name"})).await;

        let backup = stack.backup("");
        let cursor = backup.take_backup(false, &stack.cancel).await?.unwrap();

        stack.put("Users", "Id", "user1", json!({"Name": "Original"})).await;
        backup.restore_backup(&cursor, false, &stack.cancel).await?;

        assert_eq!(
            stack.get("Users", "Id", "user1").await.unwrap()["Name"],
            json!("Backup Name")
        );
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    #[serial]
    async fn backup_restore_backup_is_byte_stable() -> Result<(), anyhow::Error> {
        let stack = Stack::new().await;
        stack
            .put("Users", "Id", "u1", json!({"Name": "a", "Nested": {"x": [1, 2]}}))
            .await;
        stack.put("Users", "Id", "u2", json!({"Age": 41})).await;

        let backup = stack.backup("");
        let first = backup.take_backup(false, &stack.cancel).await?.unwrap();
        let first_bytes = artifact_bytes(&stack, "", &first).await;

        backup.restore_backup(&first, true, &stack.cancel).await?;
        tokio::time::sleep(Duration::from_secs(1)).await;
        let second = backup.take_backup(false, &stack.cancel).await?.unwrap();
        let second_bytes = artifact_bytes(&stack, "", &second).await;

        assert_eq!(first_bytes, second_bytes);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    #[serial]
    async fn take_backup_brackets_the_fleet_with_started_and_ended() -> Result<(), anyhow::Error> {
        let stack = Stack::new().await;
        stack.put("Users", "Id", "u1", json!({"Name": "a"})).await;

        let watcher = stack.pubsub.subscribe(BACKUP_CHECK_TOPIC).await?;
        let backup = stack.backup("");
        backup.take_backup(false, &stack.cancel).await?;

        assert_eq!(watcher.recv().await.unwrap().payload, BACKUP_STARTED_MESSAGE);
        assert_eq!(watcher.recv().await.unwrap().payload, BACKUP_ENDED_MESSAGE);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    #[serial]
    async fn take_backup_with_drop_empties_the_source() -> Result<(), anyhow::Error> {
        let stack = Stack::new().await;
        stack.put("Users", "Id", "u1", json!({"Name": "a"})).await;

        let backup = stack.backup("");
        let cursor = backup.take_backup(true, &stack.cancel).await?;
        assert!(cursor.is_some());
        assert!(stack.database.table_names(&stack.cancel).await?.is_empty());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    #[serial]
    async fn missing_key_attribute_fails_the_backup() -> Result<(), anyhow::Error> {
        let stack = Stack::new().await;
        stack.put("Users", "Id", "u1", json!({"Name": "a"})).await;
        // Slip an item without the declared key attribute straight into
        // the backend, behind the base's guarantees.
        let rogue_key = DbKey::new("Id", "rogue").unwrap();
        let rogue = json!({"Name": "keyless"}).as_object().unwrap().clone();
        cross_cloud_database::DatabaseBackend::put_item(
            stack.backend.as_ref(),
            "Users",
            &rogue_key,
            &rogue,
            true,
        )
        .await?;

        let backup = stack.backup("");
        let err = backup.take_backup(false, &stack.cancel).await.unwrap_err();
        assert_eq!(err.status_code(), 500);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    #[serial]
    async fn concurrent_backups_serialize_on_the_mutex() -> Result<(), anyhow::Error> {
        let stack = Stack::new().await;
        stack.put("Users", "Id", "u1", json!({"Name": "a"})).await;

        // A quiescence wait above one second keeps the serialized
        // backups in distinct timestamp seconds.
        let backup = Arc::new(DatabaseBackupService::new_for_tests(
            stack.database.clone(),
            stack.files.clone(),
            stack.pubsub.clone(),
            BUCKET,
            "",
            None,
            Duration::from_millis(1100),
        )?);

        let runs = (0..3).map(|_| {
            let backup = Arc::clone(&backup);
            let cancel = stack.cancel.clone();
            tokio::spawn(async move { backup.take_backup(false, &cancel).await })
        });
        let mut cursors = Vec::new();
        for run in runs {
            if let Ok(Some(cursor)) = run.await? {
                cursors.push(cursor);
            }
        }

        assert!(!cursors.is_empty());
        for cursor in &cursors {
            assert!(!cursor.file_name().is_empty());
        }
        let mut names: Vec<&str> = cursors.iter().map(|c| c.file_name()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), cursors.len());

        // The source was left untouched.
        let (_, items) = stack.database.scan_table("Users", &stack.cancel).await?;
        assert_eq!(items.len(), 1);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    #[serial]
    async fn cursor_enumeration_honors_cancellation() -> Result<(), anyhow::Error> {
        let stack = Stack::new().await;
        for hour in 0..12 {
            stack
                .files
                .upload_file(
                    "[]".into(),
                    BUCKET,
                    &format!("snapshots/2024-01-01-{hour:02}-00-00.json"),
                )
                .await?;
        }

        let backup = stack.backup("snapshots");
        let cancel = CancellationToken::new();
        let mut stream = Box::pin(backup.backup_file_cursors(cancel.clone()));

        let mut yielded = Vec::new();
        for _ in 0..2 {
            yielded.push(stream.next().await.unwrap()?);
        }
        cancel.cancel();

        let next = stream.next().await.unwrap();
        assert!(matches!(next, Err(ServiceError::Cancelled)));
        assert_eq!(yielded.len(), 2);
        assert_eq!(yielded[0].file_name(), "2024-01-01-00-00-00.json");
        assert_eq!(yielded[1].file_name(), "2024-01-01-01-00-00.json");
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    #[serial]
    async fn migration_copies_and_optionally_cleans_the_source() -> Result<(), anyhow::Error> {
        let source = Stack::new().await;
        let destination = Stack::new().await;
        source
            .put("MigrationTest", "Id", "m1", json!({"V": 1}))
            .await;
        source
            .put("MigrationTest", "Id", "m2", json!({"V": 2}))
            .await;

        DatabaseBackupService::migrate_for_tests(
            source.database.clone(),
            destination.database.clone(),
            source.files.clone(),
            source.pubsub.clone(),
            "migration-bucket",
            false,
            false,
            TEST_QUIESCE,
            &source.cancel,
        )
        .await?;

        for stack in [&source, &destination] {
            let item = stack.get("MigrationTest", "Id", "m1").await.unwrap();
            assert_eq!(item["V"], json!(1));
            let item = stack.get("MigrationTest", "Id", "m2").await.unwrap();
            assert_eq!(item["V"], json!(2));
        }

        // Again with source cleanup: the source empties out.
        DatabaseBackupService::migrate_for_tests(
            source.database.clone(),
            destination.database.clone(),
            source.files.clone(),
            source.pubsub.clone(),
            "migration-bucket",
            true,
            true,
            TEST_QUIESCE,
            &source.cancel,
        )
        .await?;
        assert!(source.database.table_names(&source.cancel).await?.is_empty());
        assert!(destination.get("MigrationTest", "Id", "m1").await.is_some());
        assert!(destination.get("MigrationTest", "Id", "m2").await.is_some());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    #[serial]
    async fn migration_of_an_empty_source_is_not_found() {
        let source = Stack::new().await;
        let destination = Stack::new().await;
        let err = DatabaseBackupService::migrate_for_tests(
            source.database.clone(),
            destination.database.clone(),
            source.files.clone(),
            source.pubsub.clone(),
            "migration-bucket",
            false,
            false,
            TEST_QUIESCE,
            &source.cancel,
        )
        .await
        .unwrap_err();
        assert_eq!(err.status_code(), 404);
        assert!(err.to_string().contains("No data found to migrate"));
    }

    #[tokio::test(flavor = "multi_thread")]
    #[serial]
    async fn scheduled_backups_fire_and_restore() -> Result<(), anyhow::Error> {
        let stack = Stack::new().await;
        stack.put("Cronies", "Id", "c1", json!({"N": 9})).await;

        let backup = DatabaseBackupService::new_for_tests(
            stack.database.clone(),
            stack.files.clone(),
            stack.pubsub.clone(),
            BUCKET,
            "cron",
            Some(BackupSchedule {
                cron_expression: "*/2 * * * * *".to_string(),
                timezone: Tz::UTC,
            }),
            TEST_QUIESCE,
        )?;

        tokio::time::sleep(Duration::from_secs(5)).await;
        backup.dispose().await;

        let cursors: Vec<BackupCursor> = Box::pin(stack.backup("cron").backup_file_cursors(CancellationToken::new()))
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .collect::<Result<_, _>>()?;
        assert!(!cursors.is_empty());
        for cursor in &cursors {
            assert!(cursor.timestamp().is_some());
        }

        stack.database.drop_table("Cronies", &stack.cancel).await?;
        stack
            .backup("cron")
            .restore_backup(cursors.last().unwrap(), false, &stack.cancel)
            .await?;
        assert_eq!(stack.get("Cronies", "Id", "c1").await.unwrap()["N"], json!(9));
        Ok(())
    }

    #[tokio::test]
    async fn invalid_cron_expression_fails_construction() {
        let stack = Stack::new().await;
        let err = DatabaseBackupService::new(
            stack.database.clone(),
            stack.files.clone(),
            stack.pubsub.clone(),
            BUCKET,
            "",
            Some(BackupSchedule {
                cron_expression: "definitely not cron".to_string(),
                timezone: Tz::UTC,
            }),
            None,
        )
        .unwrap_err();
        assert_eq!(err.status_code(), 400);
    }

    #[tokio::test]
    async fn five_field_expressions_parse() {
        assert!(parse_cron("0 1 * * *").is_ok());
        assert!(parse_cron("*/5 * * * *").is_ok());
        assert!(parse_cron("0 0 1 * * *").is_ok());
    }

    #[tokio::test(flavor = "multi_thread")]
    #[serial]
    async fn disposed_service_refuses_work() -> Result<(), anyhow::Error> {
        let stack = Stack::new().await;
        let backup = stack.backup("");
        backup.dispose().await;
        backup.dispose().await;

        let err = backup.take_backup(false, &stack.cancel).await.unwrap_err();
        assert_eq!(err.status_code(), 503);
        let err = backup
            .restore_backup(&BackupCursor::new("x.json"), false, &stack.cancel)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 503);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    #[serial]
    async fn restore_of_missing_artifact_is_not_found() {
        let stack = Stack::new().await;
        let backup = stack.backup("");
        let err = backup
            .restore_backup(&BackupCursor::new("absent.json"), false, &stack.cancel)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 404);
    }
}
