use async_trait::async_trait;

use cross_cloud_types::{Condition, DbKey, Item, Primitive, ServiceResult};

use crate::service::ScanPage;

/// The minimal core a storage provider supplies under
/// [`crate::DatabaseClient`].
///
/// The base has already validated arguments, taken the entity or master
/// mutex, and handled backup-freeze and system-table concerns by the
/// time a backend method runs. Items handed to `put_item` already carry
/// their key attribute.
///
/// Backends translate the [`Condition`] tree into their native filter
/// language where they can; a backend without one evaluates
/// [`Condition::evaluate`] against the current item, which is safe under
/// the entity mutex. An unmet condition fails with a precondition error.
#[async_trait]
pub trait DatabaseBackend: Send + Sync {
    async fn get_item(&self, table: &str, key: &DbKey) -> ServiceResult<Option<Item>>;

    /// put_item stores the item, returning the replaced one. Putting
    /// over an existing item without `overwrite` is a precondition
    /// failure.
    async fn put_item(
        &self,
        table: &str,
        key: &DbKey,
        item: &Item,
        overwrite: bool,
    ) -> ServiceResult<Option<Item>>;

    /// update_item shallow-merges `patch` (upserting when absent) and
    /// returns `(old, new)`.
    async fn update_item(
        &self,
        table: &str,
        key: &DbKey,
        patch: &Item,
        condition: &Condition,
    ) -> ServiceResult<(Option<Item>, Item)>;

    async fn delete_item(
        &self,
        table: &str,
        key: &DbKey,
        condition: &Condition,
    ) -> ServiceResult<Option<Item>>;

    async fn item_exists(
        &self,
        table: &str,
        key: &DbKey,
        condition: &Condition,
    ) -> ServiceResult<bool>;

    async fn add_elements_to_array(
        &self,
        table: &str,
        key: &DbKey,
        attribute: &str,
        elements: &[Primitive],
        condition: &Condition,
    ) -> ServiceResult<()>;

    async fn remove_elements_from_array(
        &self,
        table: &str,
        key: &DbKey,
        attribute: &str,
        elements: &[Primitive],
        condition: &Condition,
    ) -> ServiceResult<()>;

    async fn increment_attribute(
        &self,
        table: &str,
        key: &DbKey,
        attribute: &str,
        delta: f64,
        condition: &Condition,
    ) -> ServiceResult<f64>;

    async fn scan_table(&self, table: &str) -> ServiceResult<Vec<Item>>;

    async fn scan_table_paginated(
        &self,
        table: &str,
        page_size: usize,
        page_token: Option<&str>,
    ) -> ServiceResult<ScanPage>;

    async fn scan_table_with_filter(
        &self,
        table: &str,
        condition: &Condition,
    ) -> ServiceResult<Vec<Item>>;

    /// table_names lists every table the backend holds, the system
    /// table included.
    async fn table_names(&self) -> ServiceResult<Vec<String>>;

    async fn drop_table(&self, table: &str) -> ServiceResult<bool>;
}
