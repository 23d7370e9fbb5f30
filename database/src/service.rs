use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use cross_cloud_memory::MemoryService;
use cross_cloud_types::{Condition, DbKey, Item, Primitive, ServiceResult};

/// What a write operation hands back to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReturnItemBehavior {
    #[default]
    DoNotReturn,
    ReturnOldValues,
    ReturnNewValues,
}

/// One page of a paginated scan.
#[derive(Debug, Clone)]
pub struct ScanPage {
    pub items: Vec<Item>,
    pub next_page_token: Option<String>,
    pub total_count: Option<u64>,
}

/// The uniform table/item surface every database client exposes.
///
/// All operations are async and cancellable. Items are JSON objects; the
/// key attribute of an item always equals its [`DbKey`] value. Writes can
/// be gated by a [`Condition`]; a condition that does not hold fails with
/// a precondition error rather than silently succeeding.
#[async_trait]
pub trait DatabaseService: Send + Sync {
    /// item_exists is true iff the item exists and satisfies the
    /// condition. An unmet condition on an existing item is a
    /// precondition failure.
    async fn item_exists(
        &self,
        table: &str,
        key: &DbKey,
        condition: Option<&Condition>,
        cancel: &CancellationToken,
    ) -> ServiceResult<bool>;

    /// get_item returns the item projected to `attributes` when given,
    /// or `None` when absent.
    async fn get_item(
        &self,
        table: &str,
        key: &DbKey,
        attributes: Option<&[String]>,
        cancel: &CancellationToken,
    ) -> ServiceResult<Option<Item>>;

    /// get_items is a batched get; results come back in request order,
    /// with absent keys skipped.
    async fn get_items(
        &self,
        table: &str,
        keys: &[DbKey],
        attributes: Option<&[String]>,
        cancel: &CancellationToken,
    ) -> ServiceResult<Vec<Item>>;

    /// put_item inserts or (when `overwrite_if_exists`) replaces the
    /// item, returning old or new values per `return_behavior`.
    async fn put_item(
        &self,
        table: &str,
        key: &DbKey,
        item: &Item,
        return_behavior: ReturnItemBehavior,
        overwrite_if_exists: bool,
        cancel: &CancellationToken,
    ) -> ServiceResult<Option<Item>>;

    /// update_item shallow-merges `patch` into the item (upserting when
    /// absent), gated by `condition`.
    async fn update_item(
        &self,
        table: &str,
        key: &DbKey,
        patch: &Item,
        return_behavior: ReturnItemBehavior,
        condition: Option<&Condition>,
        cancel: &CancellationToken,
    ) -> ServiceResult<Option<Item>>;

    async fn delete_item(
        &self,
        table: &str,
        key: &DbKey,
        return_behavior: ReturnItemBehavior,
        condition: Option<&Condition>,
        cancel: &CancellationToken,
    ) -> ServiceResult<Option<Item>>;

    /// add_elements_to_array adds the elements not already present to
    /// the named array attribute.
    async fn add_elements_to_array(
        &self,
        table: &str,
        key: &DbKey,
        attribute: &str,
        elements: &[Primitive],
        condition: Option<&Condition>,
        cancel: &CancellationToken,
    ) -> ServiceResult<()>;

    async fn remove_elements_from_array(
        &self,
        table: &str,
        key: &DbKey,
        attribute: &str,
        elements: &[Primitive],
        condition: Option<&Condition>,
        cancel: &CancellationToken,
    ) -> ServiceResult<()>;

    /// increment_attribute atomically adds `delta` to the numeric
    /// attribute and returns the new value.
    async fn increment_attribute(
        &self,
        table: &str,
        key: &DbKey,
        attribute: &str,
        delta: f64,
        condition: Option<&Condition>,
        cancel: &CancellationToken,
    ) -> ServiceResult<f64>;

    /// scan_table returns the key attribute names declared for the table
    /// together with every item.
    async fn scan_table(
        &self,
        table: &str,
        cancel: &CancellationToken,
    ) -> ServiceResult<(Vec<String>, Vec<Item>)>;

    async fn scan_table_paginated(
        &self,
        table: &str,
        page_size: usize,
        page_token: Option<&str>,
        cancel: &CancellationToken,
    ) -> ServiceResult<ScanPage>;

    /// scan_table_with_filter returns only the items satisfying the
    /// condition, alongside the declared key names.
    async fn scan_table_with_filter(
        &self,
        table: &str,
        condition: &Condition,
        cancel: &CancellationToken,
    ) -> ServiceResult<(Vec<String>, Vec<Item>)>;

    /// table_names lists user tables; the system table is never
    /// included.
    async fn table_names(&self, cancel: &CancellationToken) -> ServiceResult<Vec<String>>;

    /// drop_table drops the table, best effort, and reports whether it
    /// existed. The system-table row goes with it.
    async fn drop_table(&self, table: &str, cancel: &CancellationToken) -> ServiceResult<bool>;

    /// memory_service exposes the memory service whose backup mutex
    /// guards this database.
    fn memory_service(&self) -> Arc<dyn MemoryService>;

    /// suspend_backup_guard exempts subsequent operations on this client
    /// from the backup-freeze wait. Only the backup engine calls this,
    /// strictly while it holds the backup mutex; it must pair with
    /// [`DatabaseService::resume_backup_guard`].
    fn suspend_backup_guard(&self);

    fn resume_backup_guard(&self);

    /// dispose shuts the client down. Disposal is idempotent; every
    /// operation after it fails as disposed.
    fn dispose(&self);
}
