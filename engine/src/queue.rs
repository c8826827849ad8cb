//! Durable operation queue.
//!
//! Pending operations live in the `__operations` system table. The
//! queue keeps two atomics over it, the sequence counter and the
//! pending count, loaded once at startup and maintained through CAS
//! transitions rather than re-scans.

use crate::coordination::{LockGuard, LockMap};
use crate::error::Result;
use crate::operations::PendingOperation;
use crate::query::{Filter, Query, SortDirection};
use crate::store::LocalStore;
use crate::table::{ColumnDef, ColumnType, TableDefinition, TableKind};
use crate::value::{system, Item, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tracing::debug;
use uuid::Uuid;

/// Name of the operation system table.
pub const OPERATIONS_TABLE: &str = "__operations";

/// Definition of the `__operations` system table.
pub fn operations_table_definition() -> TableDefinition {
    TableDefinition::new(OPERATIONS_TABLE)
        .with_column("kind", ColumnDef::of(ColumnType::Integer))
        .with_column("state", ColumnDef::of(ColumnType::Integer))
        .with_column("tableName", ColumnDef::of(ColumnType::String))
        .with_column("tableKind", ColumnDef::of(ColumnType::Integer))
        .with_column("itemId", ColumnDef::of(ColumnType::String))
        .with_column("item", ColumnDef::of(ColumnType::String))
        .with_column(system::CREATED_AT, ColumnDef::of(ColumnType::Timestamp))
        .with_column("sequence", ColumnDef::of(ColumnType::Integer))
        .with_column("version", ColumnDef::of(ColumnType::Integer))
}

/// Ordered, durable log of pending local mutations.
pub struct OperationQueue {
    store: Arc<dyn LocalStore>,
    sequence: AtomicI64,
    pending: AtomicUsize,
    item_locks: LockMap,
    table_locks: LockMap,
    /// Merge bases for queued updates, keyed by operation id.
    ///
    /// The base is not part of the persisted row (`item` is inlined
    /// only for deletes), so it lives for the process lifetime; error
    /// rows created after a restart simply carry no base.
    merge_bases: StdMutex<HashMap<Uuid, Item>>,
}

impl OperationQueue {
    /// Loads the queue from the store.
    ///
    /// This is the only time the sequence counter is read from storage:
    /// it starts at the maximum persisted sequence, and the pending
    /// count at the persisted row count.
    pub async fn load(store: Arc<dyn LocalStore>) -> Result<OperationQueue> {
        let rows = store.query(&Query::table(OPERATIONS_TABLE)).await?;
        let max_sequence = rows
            .iter()
            .filter_map(|row| row.get("sequence").and_then(Value::as_integer))
            .max()
            .unwrap_or(0);
        let pending = rows.len();
        debug!(pending, max_sequence, "operation queue loaded");

        Ok(OperationQueue {
            store,
            sequence: AtomicI64::new(max_sequence),
            pending: AtomicUsize::new(pending),
            item_locks: LockMap::new(),
            table_locks: LockMap::new(),
            merge_bases: StdMutex::new(HashMap::new()),
        })
    }

    fn rehydrate(&self, mut op: PendingOperation) -> PendingOperation {
        op.previous_item = self
            .merge_bases
            .lock()
            .expect("merge bases poisoned")
            .get(&op.id)
            .cloned();
        op
    }

    /// Records or clears the in-memory merge base for an operation.
    pub(crate) fn set_merge_base(&self, op_id: Uuid, base: Option<Item>) {
        let mut bases = self.merge_bases.lock().expect("merge bases poisoned");
        match base {
            Some(item) => {
                bases.insert(op_id, item);
            }
            None => {
                bases.remove(&op_id);
            }
        }
    }

    /// Number of pending operations across all tables.
    pub fn pending_operations(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Number of pending operations targeting one table.
    pub async fn count_pending(&self, table_name: &str) -> Result<usize> {
        let query = Query::table(OPERATIONS_TABLE)
            .with_filter(Filter::Eq("tableName".into(), Value::from(table_name)));
        Ok(self.store.query(&query).await?.len())
    }

    /// Acquires the named lock for an item id.
    pub async fn lock_item(&self, item_id: &str) -> LockGuard {
        self.item_locks.acquire(item_id).await
    }

    /// Acquires the named lock for a table.
    pub async fn lock_table(&self, table_name: &str) -> LockGuard {
        self.table_locks.acquire(table_name).await
    }

    /// Assigns the next sequence and persists the operation.
    ///
    /// The caller holds the per-item guard, which makes the
    /// check-collapse-enqueue window atomic.
    pub async fn enqueue(&self, op: &mut PendingOperation) -> Result<()> {
        op.sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        self.store
            .upsert(OPERATIONS_TABLE, vec![op.to_row()], false)
            .await?;
        if let Some(base) = &op.previous_item {
            self.set_merge_base(op.id, Some(base.clone()));
        }
        self.pending.fetch_add(1, Ordering::SeqCst);
        debug!(
            op_id = %op.id,
            table = %op.table_name,
            item = %op.item_id,
            sequence = op.sequence,
            "operation enqueued"
        );
        Ok(())
    }

    /// Returns the earliest operation with `sequence > after_sequence`
    /// matching the table-kind filter and, when provided, the
    /// table-name whitelist.
    pub async fn peek(
        &self,
        after_sequence: i64,
        table_kind: TableKind,
        tables: Option<&[String]>,
    ) -> Result<Option<PendingOperation>> {
        let mut filters = vec![
            Filter::Gt("sequence".into(), Value::Integer(after_sequence)),
            Filter::Eq("tableKind".into(), Value::Integer(table_kind.as_code())),
        ];
        if let Some(tables) = tables {
            filters.push(Filter::In(
                "tableName".into(),
                tables.iter().map(|t| Value::from(t.clone())).collect(),
            ));
        }
        let query = Query::table(OPERATIONS_TABLE)
            .with_filter(Filter::And(filters))
            .order_by("sequence", SortDirection::Ascending)
            .top(1);

        match self.store.query(&query).await?.into_iter().next() {
            Some(row) => Ok(Some(self.rehydrate(PendingOperation::from_row(&row)?))),
            None => Ok(None),
        }
    }

    /// Finds the queued operation for an item, if any.
    pub async fn get_by_item(
        &self,
        table_name: &str,
        item_id: &str,
    ) -> Result<Option<PendingOperation>> {
        let query = Query::table(OPERATIONS_TABLE).with_filter(Filter::And(vec![
            Filter::Eq("tableName".into(), Value::from(table_name)),
            Filter::Eq("itemId".into(), Value::from(item_id)),
        ]));
        match self.store.query(&query).await?.into_iter().next() {
            Some(row) => Ok(Some(self.rehydrate(PendingOperation::from_row(&row)?))),
            None => Ok(None),
        }
    }

    /// Finds an operation by id.
    pub async fn get_by_id(&self, op_id: Uuid) -> Result<Option<PendingOperation>> {
        match self
            .store
            .lookup(OPERATIONS_TABLE, &op_id.to_string())
            .await?
        {
            Some(row) => Ok(Some(self.rehydrate(PendingOperation::from_row(&row)?))),
            None => Ok(None),
        }
    }

    /// Persists the operation's current state.
    pub async fn update(&self, op: &PendingOperation) -> Result<()> {
        self.store
            .upsert(OPERATIONS_TABLE, vec![op.to_row()], false)
            .await?;
        Ok(())
    }

    /// Optimistically rewrites an operation's payload: bumps the
    /// version, resets the state to pending, and replaces the item
    /// (persisted only for deletes). Returns false when the persisted
    /// version no longer matches.
    pub async fn try_update(
        &self,
        op_id: Uuid,
        expected_version: i64,
        item: Item,
    ) -> Result<bool> {
        let Some(mut op) = self.get_by_id(op_id).await? else {
            return Ok(false);
        };
        if op.version != expected_version {
            return Ok(false);
        }
        op.version += 1;
        op.state = crate::operations::OperationState::Pending;
        op.item = Some(item);
        self.update(&op).await?;
        Ok(true)
    }

    /// Optimistically deletes an operation; decrements the pending
    /// count on success. Returns false when the persisted version no
    /// longer matches.
    pub async fn try_delete(&self, op_id: Uuid, expected_version: i64) -> Result<bool> {
        let Some(op) = self.get_by_id(op_id).await? else {
            return Ok(false);
        };
        if op.version != expected_version {
            return Ok(false);
        }
        self.store
            .delete_ids(OPERATIONS_TABLE, &[op_id.to_string()])
            .await?;
        self.set_merge_base(op_id, None);
        self.pending.fetch_sub(1, Ordering::SeqCst);
        debug!(%op_id, "operation removed from queue");
        Ok(true)
    }

    /// Removes every queued operation for a table, returning the
    /// removed operation ids. Used by purge.
    pub async fn delete_for_table(&self, table_name: &str) -> Result<Vec<Uuid>> {
        let query = Query::table(OPERATIONS_TABLE)
            .with_filter(Filter::Eq("tableName".into(), Value::from(table_name)));
        let rows = self.store.query(&query).await?;
        let ids: Vec<Uuid> = rows
            .iter()
            .filter_map(|row| row.get(system::ID).and_then(Value::as_str))
            .filter_map(|s| Uuid::parse_str(s).ok())
            .collect();
        if ids.is_empty() {
            return Ok(ids);
        }
        let id_strings: Vec<String> = ids.iter().map(Uuid::to_string).collect();
        self.store.delete_ids(OPERATIONS_TABLE, &id_strings).await?;
        for id in &ids {
            self.set_merge_base(*id, None);
        }
        self.pending.fetch_sub(ids.len(), Ordering::SeqCst);
        debug!(table = table_name, removed = ids.len(), "operations purged");
        Ok(ids)
    }
}
