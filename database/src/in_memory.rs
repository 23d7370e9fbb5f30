use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use cross_cloud_types::condition::json_eq;
use cross_cloud_types::{Condition, DbKey, Item, Primitive, ServiceError, ServiceResult};

use crate::backend::DatabaseBackend;
use crate::service::ScanPage;

/// The in-process reference backend: tables are `BTreeMap`s keyed by the
/// key-string form of the item's key value, so scans and pagination come
/// back in a stable ordinal order. Conditions are evaluated with the
/// reference predicate, which is safe because the base serializes item
/// access through the entity mutex.
pub struct InMemoryDatabaseBackend {
    tables: Mutex<HashMap<String, BTreeMap<String, Item>>>,
}

impl InMemoryDatabaseBackend {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(HashMap::new()),
        }
    }

    /// fetch returns the stored item only when its key attribute matches
    /// the requested key by both name and value.
    fn fetch(tables: &HashMap<String, BTreeMap<String, Item>>, table: &str, key: &DbKey) -> Option<Item> {
        tables
            .get(table)
            .and_then(|rows| rows.get(&key.value().to_key_string()))
            .filter(|item| {
                item.get(key.name())
                    .map(|v| json_eq(v, key.value()))
                    .unwrap_or(false)
            })
            .cloned()
    }

    fn precondition(condition: &Condition, item: Option<&Item>) -> ServiceResult<()> {
        if condition.evaluate(item) {
            Ok(())
        } else {
            Err(ServiceError::PreconditionFailed(
                "condition not satisfied".to_string(),
            ))
        }
    }

    fn item_with_key(key: &DbKey) -> Item {
        let mut item = Item::new();
        item.insert(key.name().to_string(), key.value().to_json());
        item
    }
}

impl Default for InMemoryDatabaseBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DatabaseBackend for InMemoryDatabaseBackend {
    async fn get_item(&self, table: &str, key: &DbKey) -> ServiceResult<Option<Item>> {
        Ok(Self::fetch(&self.tables.lock(), table, key))
    }

    async fn put_item(
        &self,
        table: &str,
        key: &DbKey,
        item: &Item,
        overwrite: bool,
    ) -> ServiceResult<Option<Item>> {
        let mut tables = self.tables.lock();
        let rows = tables.entry(table.to_string()).or_default();
        let slot = key.value().to_key_string();
        let old = rows.get(&slot).cloned();
        if old.is_some() && !overwrite {
            return Err(ServiceError::PreconditionFailed(format!(
                "item {key} already exists in table {table}"
            )));
        }
        rows.insert(slot, item.clone());
        Ok(old)
    }

    async fn update_item(
        &self,
        table: &str,
        key: &DbKey,
        patch: &Item,
        condition: &Condition,
    ) -> ServiceResult<(Option<Item>, Item)> {
        let mut tables = self.tables.lock();
        let old = Self::fetch(&tables, table, key);
        Self::precondition(condition, old.as_ref())?;
        let mut merged = old.clone().unwrap_or_else(|| Self::item_with_key(key));
        for (name, value) in patch {
            merged.insert(name.clone(), value.clone());
        }
        tables
            .entry(table.to_string())
            .or_default()
            .insert(key.value().to_key_string(), merged.clone());
        Ok((old, merged))
    }

    async fn delete_item(
        &self,
        table: &str,
        key: &DbKey,
        condition: &Condition,
    ) -> ServiceResult<Option<Item>> {
        let mut tables = self.tables.lock();
        let old = Self::fetch(&tables, table, key);
        Self::precondition(condition, old.as_ref())?;
        if old.is_some() {
            if let Some(rows) = tables.get_mut(table) {
                rows.remove(&key.value().to_key_string());
            }
        }
        Ok(old)
    }

    async fn item_exists(
        &self,
        table: &str,
        key: &DbKey,
        condition: &Condition,
    ) -> ServiceResult<bool> {
        let tables = self.tables.lock();
        match Self::fetch(&tables, table, key) {
            None => Ok(false),
            Some(item) => {
                Self::precondition(condition, Some(&item))?;
                Ok(true)
            }
        }
    }

    async fn add_elements_to_array(
        &self,
        table: &str,
        key: &DbKey,
        attribute: &str,
        elements: &[Primitive],
        condition: &Condition,
    ) -> ServiceResult<()> {
        let mut tables = self.tables.lock();
        let old = Self::fetch(&tables, table, key);
        Self::precondition(condition, old.as_ref())?;
        let mut item = old.unwrap_or_else(|| Self::item_with_key(key));
        if !item.contains_key(attribute) {
            item.insert(attribute.to_string(), Value::Array(vec![]));
        }
        let array = match item.get_mut(attribute) {
            Some(Value::Array(array)) => array,
            _ => {
                return Err(ServiceError::InvalidInput(format!(
                    "attribute {attribute} is not an array"
                )))
            }
        };
        for element in elements {
            if !array.iter().any(|v| json_eq(v, element)) {
                array.push(element.to_json());
            }
        }
        tables
            .entry(table.to_string())
            .or_default()
            .insert(key.value().to_key_string(), item);
        Ok(())
    }

    async fn remove_elements_from_array(
        &self,
        table: &str,
        key: &DbKey,
        attribute: &str,
        elements: &[Primitive],
        condition: &Condition,
    ) -> ServiceResult<()> {
        let mut tables = self.tables.lock();
        let old = Self::fetch(&tables, table, key);
        Self::precondition(condition, old.as_ref())?;
        let Some(mut item) = old else {
            return Ok(());
        };
        if let Some(Value::Array(array)) = item.get_mut(attribute) {
            array.retain(|v| !elements.iter().any(|e| json_eq(v, e)));
        }
        tables
            .entry(table.to_string())
            .or_default()
            .insert(key.value().to_key_string(), item);
        Ok(())
    }

    async fn increment_attribute(
        &self,
        table: &str,
        key: &DbKey,
        attribute: &str,
        delta: f64,
        condition: &Condition,
    ) -> ServiceResult<f64> {
        let mut tables = self.tables.lock();
        let old = Self::fetch(&tables, table, key);
        Self::precondition(condition, old.as_ref())?;
        let mut item = old.unwrap_or_else(|| Self::item_with_key(key));
        let current = match item.get(attribute) {
            Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
            Some(_) => {
                return Err(ServiceError::InvalidInput(format!(
                    "attribute {attribute} is not numeric"
                )))
            }
            None => 0.0,
        };
        let next = current + delta;
        // Keep whole results as JSON integers so round numbers do not
        // grow a fractional representation.
        let stored = if next.fract() == 0.0 && next.abs() < i64::MAX as f64 {
            Value::Number((next as i64).into())
        } else {
            serde_json::Number::from_f64(next)
                .map(Value::Number)
                .unwrap_or(Value::Null)
        };
        item.insert(attribute.to_string(), stored);
        tables
            .entry(table.to_string())
            .or_default()
            .insert(key.value().to_key_string(), item);
        Ok(next)
    }

    async fn scan_table(&self, table: &str) -> ServiceResult<Vec<Item>> {
        Ok(self
            .tables
            .lock()
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn scan_table_paginated(
        &self,
        table: &str,
        page_size: usize,
        page_token: Option<&str>,
    ) -> ServiceResult<ScanPage> {
        let page_size = page_size.max(1);
        let tables = self.tables.lock();
        let Some(rows) = tables.get(table) else {
            return Ok(ScanPage {
                items: vec![],
                next_page_token: None,
                total_count: Some(0),
            });
        };
        let lower = match page_token {
            Some(token) => Bound::Excluded(token.to_string()),
            None => Bound::Unbounded,
        };
        let mut items = Vec::with_capacity(page_size);
        let mut last_slot = None;
        let mut more = false;
        for (slot, item) in rows.range((lower, Bound::Unbounded)) {
            if items.len() == page_size {
                more = true;
                break;
            }
            items.push(item.clone());
            last_slot = Some(slot.clone());
        }
        Ok(ScanPage {
            items,
            next_page_token: if more { last_slot } else { None },
            total_count: Some(rows.len() as u64),
        })
    }

    async fn scan_table_with_filter(
        &self,
        table: &str,
        condition: &Condition,
    ) -> ServiceResult<Vec<Item>> {
        Ok(self
            .tables
            .lock()
            .get(table)
            .map(|rows| {
                rows.values()
                    .filter(|item| condition.evaluate(Some(item)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn table_names(&self) -> ServiceResult<Vec<String>> {
        let mut names: Vec<String> = self.tables.lock().keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn drop_table(&self, table: &str) -> ServiceResult<bool> {
        Ok(self.tables.lock().remove(table).is_some())
    }
}
