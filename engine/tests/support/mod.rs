//! Shared fixtures: an in-memory local store and a scripted remote
//! backend.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use tether_engine::{
    system, Filter, Item, LocalStore, Query, QueryResult, RemoteBackend, RemoteError,
    RemoteTable, ServerPage, SortDirection, StoreError, TableDefinition, Value,
};

fn matches(query: &Query, item: &Item) -> bool {
    if !query.include_deleted && item.is_deleted() {
        return false;
    }
    query.filter.as_ref().map_or(true, |f| f.matches(item))
}

fn sort_items(items: &mut [Item], order_by: &[(String, SortDirection)]) {
    items.sort_by(|a, b| {
        for (name, direction) in order_by {
            let left = a.get(name).unwrap_or(&Value::Null);
            let right = b.get(name).unwrap_or(&Value::Null);
            let mut ord = left.partial_cmp_scalar(right).unwrap_or(Ordering::Equal);
            if matches!(direction, SortDirection::Descending) {
                ord = ord.reverse();
            }
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
}

fn page(mut items: Vec<Item>, query: &Query) -> (Vec<Item>, u64) {
    sort_items(&mut items, &query.order_by);
    let total = items.len() as u64;
    let skip = query.skip.unwrap_or(0) as usize;
    let items: Vec<Item> = items
        .into_iter()
        .skip(skip)
        .take(query.top.map_or(usize::MAX, |t| t as usize))
        .collect();
    (items, total)
}

/// In-memory [`LocalStore`] honoring declared columns.
#[derive(Default)]
pub struct MemoryStore {
    definitions: Mutex<HashMap<String, TableDefinition>>,
    tables: Mutex<HashMap<String, BTreeMap<String, Item>>>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.tables
            .lock()
            .unwrap()
            .get(table)
            .map_or(0, BTreeMap::len)
    }

    pub fn row(&self, table: &str, id: &str) -> Option<Item> {
        self.tables
            .lock()
            .unwrap()
            .get(table)
            .and_then(|rows| rows.get(id).cloned())
    }

    pub fn rows(&self, table: &str) -> Vec<Item> {
        self.tables
            .lock()
            .unwrap()
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Overwrites one property of a stored row, bypassing the store
    /// contract. For setting up states the public API refuses to build.
    pub fn patch(&self, table: &str, id: &str, name: &str, value: Value) {
        let mut tables = self.tables.lock().unwrap();
        if let Some(item) = tables.get_mut(table).and_then(|rows| rows.get_mut(id)) {
            item.insert(name.to_string(), value);
        }
    }
}

#[async_trait]
impl LocalStore for MemoryStore {
    async fn define_table(&self, definition: TableDefinition) -> Result<(), StoreError> {
        let mut definitions = self.definitions.lock().unwrap();
        let mut tables = self.tables.lock().unwrap();
        tables.entry(definition.name.clone()).or_default();
        definitions.insert(definition.name.clone(), definition);
        Ok(())
    }

    async fn initialize(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn upsert(
        &self,
        table: &str,
        items: Vec<Item>,
        ignore_missing_columns: bool,
    ) -> Result<(), StoreError> {
        let definitions = self.definitions.lock().unwrap();
        let definition = definitions
            .get(table)
            .ok_or_else(|| StoreError::new(format!("table '{table}' is not defined")))?;
        let mut tables = self.tables.lock().unwrap();
        let rows = tables.entry(table.to_string()).or_default();

        for item in items {
            let id = item
                .id()
                .ok_or_else(|| StoreError::new("item without id"))?
                .to_string();
            let mut stored = Item::new();
            for (name, value) in item.iter() {
                if definition.has_column(name) {
                    stored.insert(name.clone(), value.clone());
                } else if !ignore_missing_columns {
                    return Err(StoreError::new(format!(
                        "table '{table}' has no column '{name}'"
                    )));
                }
            }
            rows.insert(id, stored);
        }
        Ok(())
    }

    async fn delete_ids(&self, table: &str, ids: &[String]) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().unwrap();
        if let Some(rows) = tables.get_mut(table) {
            for id in ids {
                rows.remove(id);
            }
        }
        Ok(())
    }

    async fn delete_query(&self, query: &Query) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().unwrap();
        if let Some(rows) = tables.get_mut(&query.table) {
            rows.retain(|_, item| !matches(query, item));
        }
        Ok(())
    }

    async fn lookup(&self, table: &str, id: &str) -> Result<Option<Item>, StoreError> {
        Ok(self.row(table, id))
    }

    async fn read(&self, query: &Query) -> Result<QueryResult, StoreError> {
        let tables = self.tables.lock().unwrap();
        let items: Vec<Item> = tables
            .get(&query.table)
            .map(|rows| {
                rows.values()
                    .filter(|item| matches(query, item))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        let (items, total) = page(items, query);
        Ok(QueryResult {
            items,
            total_count: query.include_total_count.then_some(total),
        })
    }
}

/// Scripted remote table with optimistic-concurrency semantics:
/// versions are monotonic counters, deletes are tombstones, and a
/// sticky failure can be injected.
pub struct MockRemoteTable {
    name: String,
    rows: Mutex<BTreeMap<String, Item>>,
    version: AtomicU64,
    clock: AtomicU64,
    failure: Mutex<Option<RemoteError>>,
    calls: AtomicU64,
}

impl MockRemoteTable {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            rows: Mutex::new(BTreeMap::new()),
            version: AtomicU64::new(0),
            clock: AtomicU64::new(0),
            failure: Mutex::new(None),
            calls: AtomicU64::new(0),
        })
    }

    /// Makes every call fail with the given error until cleared.
    pub fn fail_with(&self, error: RemoteError) {
        *self.failure.lock().unwrap() = Some(error);
    }

    pub fn clear_failure(&self) {
        *self.failure.lock().unwrap() = None;
    }

    pub fn call_count(&self) -> u64 {
        self.calls.load(AtomicOrdering::SeqCst)
    }

    fn next_version(&self) -> String {
        (self.version.fetch_add(1, AtomicOrdering::SeqCst) + 1).to_string()
    }

    fn tick(&self) -> DateTime<Utc> {
        let seconds = self.clock.fetch_add(1, AtomicOrdering::SeqCst) + 1;
        Utc.timestamp_opt(1_700_000_000 + seconds as i64, 0).unwrap()
    }

    fn checked(&self) -> Result<(), RemoteError> {
        self.calls.fetch_add(1, AtomicOrdering::SeqCst);
        match self.failure.lock().unwrap().clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Seeds a server record directly, bypassing failure injection.
    pub fn seed(&self, mut item: Item) -> Item {
        let id = item.id().expect("seeded item needs an id").to_string();
        item.insert(system::VERSION, self.next_version());
        let now = self.tick();
        if !item.contains(system::CREATED_AT) {
            item.insert(system::CREATED_AT, now);
        }
        item.insert(system::UPDATED_AT, now);
        if !item.contains(system::DELETED) {
            item.insert(system::DELETED, false);
        }
        self.rows.lock().unwrap().insert(id, item.clone());
        item
    }

    pub fn server_row(&self, id: &str) -> Option<Item> {
        self.rows.lock().unwrap().get(id).cloned()
    }

    pub fn server_row_count(&self) -> usize {
        self.rows.lock().unwrap().len()
    }

    fn conflict(&self, current: &Item) -> RemoteError {
        RemoteError::from_response(
            412,
            Some(current.to_json().to_string()),
            "the server version does not match If-Match",
        )
    }
}

#[async_trait]
impl RemoteTable for MockRemoteTable {
    async fn read(&self, query: &Query) -> Result<ServerPage, RemoteError> {
        self.checked()?;
        let rows = self.rows.lock().unwrap();
        let items: Vec<Item> = rows
            .values()
            .filter(|item| {
                (query.include_deleted || !item.is_deleted())
                    && query.filter.as_ref().map_or(true, |f| f.matches(item))
            })
            .cloned()
            .collect();
        let (items, total) = page(items, query);
        Ok(ServerPage {
            items,
            total_count: query.include_total_count.then_some(total),
            next_link: None,
        })
    }

    async fn read_url(&self, _url: &str) -> Result<ServerPage, RemoteError> {
        self.checked()?;
        Ok(ServerPage::default())
    }

    async fn insert(&self, item: Item) -> Result<Item, RemoteError> {
        self.checked()?;
        let id = item
            .id()
            .ok_or_else(|| RemoteError::from_response(400, None, "item without id"))?
            .to_string();
        let mut rows = self.rows.lock().unwrap();
        if let Some(current) = rows.get(&id) {
            if !current.is_deleted() {
                return Err(RemoteError::from_response(
                    409,
                    Some(current.to_json().to_string()),
                    "an item with this id already exists",
                ));
            }
        }
        let mut stored = item;
        stored.insert(system::VERSION, self.next_version());
        let now = self.tick();
        stored.insert(system::CREATED_AT, now);
        stored.insert(system::UPDATED_AT, now);
        stored.insert(system::DELETED, false);
        rows.insert(id, stored.clone());
        Ok(stored)
    }

    async fn update(&self, item: Item, if_match: Option<&str>) -> Result<Item, RemoteError> {
        self.checked()?;
        let id = item
            .id()
            .ok_or_else(|| RemoteError::from_response(400, None, "item without id"))?
            .to_string();
        let mut rows = self.rows.lock().unwrap();
        let current = rows
            .get(&id)
            .cloned()
            .ok_or_else(|| RemoteError::from_response(404, None, "no such item"))?;
        if let Some(expected) = if_match {
            if current.version() != Some(expected) {
                return Err(self.conflict(&current));
            }
        }
        let mut stored = current;
        for (name, value) in item.iter() {
            if name != system::ID && !system::is_system_property(name) {
                stored.insert(name.clone(), value.clone());
            }
        }
        stored.insert(system::VERSION, self.next_version());
        stored.insert(system::UPDATED_AT, self.tick());
        rows.insert(id, stored.clone());
        Ok(stored)
    }

    async fn delete(&self, id: &str, if_match: Option<&str>) -> Result<(), RemoteError> {
        self.checked()?;
        let mut rows = self.rows.lock().unwrap();
        let current = rows
            .get(id)
            .cloned()
            .ok_or_else(|| RemoteError::from_response(404, None, "no such item"))?;
        if current.is_deleted() {
            return Err(RemoteError::from_response(404, None, "no such item"));
        }
        if let Some(expected) = if_match {
            if current.version() != Some(expected) {
                return Err(self.conflict(&current));
            }
        }
        let mut stored = current;
        stored.insert(system::DELETED, true);
        stored.insert(system::VERSION, self.next_version());
        stored.insert(system::UPDATED_AT, self.tick());
        rows.insert(id.to_string(), stored);
        Ok(())
    }

    async fn lookup(&self, id: &str) -> Result<Item, RemoteError> {
        self.checked()?;
        self.rows
            .lock()
            .unwrap()
            .get(id)
            .filter(|item| !item.is_deleted())
            .cloned()
            .ok_or_else(|| RemoteError::from_response(404, None, "no such item"))
    }
}

/// Backend resolving [`MockRemoteTable`]s by name, creating them on
/// first use.
#[derive(Default)]
pub struct MockBackend {
    tables: Mutex<HashMap<String, Arc<MockRemoteTable>>>,
}

impl MockBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn remote(&self, name: &str) -> Arc<MockRemoteTable> {
        self.tables
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_insert_with(|| MockRemoteTable::new(name))
            .clone()
    }
}

impl RemoteBackend for MockBackend {
    fn table(&self, name: &str) -> Arc<dyn RemoteTable> {
        self.remote(name)
    }
}

/// Builds an item from a JSON literal.
pub fn item(json: serde_json::Value) -> Item {
    Item::from_json(json).expect("test items are objects")
}

/// A filter on updatedAt useful for seeding incremental pulls.
pub fn updated_since(ts: DateTime<Utc>) -> Filter {
    Filter::Ge(system::UPDATED_AT.into(), Value::Timestamp(ts))
}
