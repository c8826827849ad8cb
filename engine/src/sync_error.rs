//! Persisted push errors.
//!
//! When a push fails for one operation without aborting the batch, the
//! failure is recorded as a row in the `__errors` system table. Error
//! rows survive restarts, feed the conflict engine (they carry the
//! merge base, the local item, and the server's copy), and are deleted
//! once handled or once a newer operation supersedes them.

use crate::error::{Error, Result};
use crate::operations::{OperationKind, PendingOperation};
use crate::query::{Filter, Query};
use crate::remote::RemoteError;
use crate::store::LocalStore;
use crate::table::{ColumnDef, ColumnType, TableDefinition, TableKind};
use crate::value::{system, Item, Value};
use std::sync::Arc;
use uuid::Uuid;

/// Name of the error system table.
pub const ERRORS_TABLE: &str = "__errors";

/// Definition of the `__errors` system table.
pub fn errors_table_definition() -> TableDefinition {
    TableDefinition::new(ERRORS_TABLE)
        .with_column("version", ColumnDef::of(ColumnType::Integer))
        .with_column("operationKind", ColumnDef::of(ColumnType::Integer))
        .with_column("operationVersion", ColumnDef::of(ColumnType::Integer))
        .with_column("tableName", ColumnDef::of(ColumnType::String))
        .with_column("tableKind", ColumnDef::of(ColumnType::Integer))
        .with_column("httpStatus", ColumnDef::of(ColumnType::Integer))
        .with_column("item", ColumnDef::of(ColumnType::String))
        .with_column("rawResult", ColumnDef::of(ColumnType::String))
        .with_column("result", ColumnDef::of(ColumnType::String))
        .with_column("previousItem", ColumnDef::of(ColumnType::String))
}

/// A recorded per-operation push failure.
///
/// The row id equals the failed operation's id, so one operation has at
/// most one error row and collapse can remove it without a scan.
#[derive(Debug, Clone, PartialEq)]
pub struct TableOperationError {
    /// Error row id; equal to the operation id.
    pub id: Uuid,
    /// Row version counter.
    pub version: i64,
    /// Id of the failed operation.
    pub operation_id: Uuid,
    /// Version of the operation when it failed; conflict resolutions
    /// CAS against it.
    pub operation_version: i64,
    /// Kind of the failed operation.
    pub operation_kind: OperationKind,
    /// Target table.
    pub table_name: String,
    /// Target table kind.
    pub table_kind: TableKind,
    /// HTTP status of the failed call, when a response arrived.
    pub http_status: Option<u16>,
    /// The local item the operation carried. An `{id}` stub when the
    /// local row was missing.
    pub item: Item,
    /// The merge base: the last server-acknowledged item when the
    /// local edit began.
    pub previous_item: Option<Item>,
    /// Raw response body.
    pub raw_result: Option<String>,
    /// Server-side item parsed from the response.
    pub result: Option<Item>,
    /// Set by the push-complete handler once the error is dealt with.
    /// Handled errors are deleted and not re-raised. Not persisted.
    pub handled: bool,
}

impl TableOperationError {
    /// Builds an error row for a failed remote call.
    pub fn from_remote(op: &PendingOperation, item: Item, remote: &RemoteError) -> Self {
        Self {
            id: op.id,
            version: 1,
            operation_id: op.id,
            operation_version: op.version,
            operation_kind: op.kind,
            table_name: op.table_name.clone(),
            table_kind: op.table_kind,
            http_status: remote.status,
            item,
            previous_item: op.previous_item.clone(),
            raw_result: remote.body.clone(),
            result: remote.item.clone(),
            handled: false,
        }
    }

    /// Builds an error row for an operation whose local item vanished.
    /// Carries an `{id}` stub so the failure stays addressable.
    pub fn missing_item(op: &PendingOperation) -> Self {
        Self {
            id: op.id,
            version: 1,
            operation_id: op.id,
            operation_version: op.version,
            operation_kind: op.kind,
            table_name: op.table_name.clone(),
            table_kind: op.table_kind,
            http_status: None,
            item: Item::id_only(&op.item_id),
            previous_item: None,
            raw_result: None,
            result: None,
            handled: false,
        }
    }

    /// Id of the item this error is about.
    pub fn item_id(&self) -> Option<&str> {
        self.item.id()
    }

    /// True when the failure is a server-side conflict (412 or 409).
    pub fn is_conflict(&self) -> bool {
        matches!(self.http_status, Some(409) | Some(412))
    }

    fn item_column(item: &Option<Item>) -> Value {
        match item {
            Some(item) => Value::String(item.to_json().to_string()),
            None => Value::Null,
        }
    }

    fn parse_item_column(row: &Item, name: &str) -> Option<Item> {
        match row.get(name) {
            Some(Value::String(text)) => serde_json::from_str::<serde_json::Value>(text)
                .ok()
                .and_then(Item::from_json),
            _ => None,
        }
    }

    /// Serializes to an `__errors` row.
    pub fn to_row(&self) -> Item {
        let mut row = Item::new();
        row.insert(system::ID, self.id.to_string());
        row.insert("version", self.version);
        row.insert("operationKind", self.operation_kind.as_code());
        row.insert("operationVersion", self.operation_version);
        row.insert("tableName", self.table_name.clone());
        row.insert("tableKind", self.table_kind.as_code());
        match self.http_status {
            Some(status) => row.insert("httpStatus", i64::from(status)),
            None => row.insert("httpStatus", Value::Null),
        }
        row.insert("item", Value::String(self.item.to_json().to_string()));
        match &self.raw_result {
            Some(raw) => row.insert("rawResult", raw.clone()),
            None => row.insert("rawResult", Value::Null),
        }
        row.insert("result", Self::item_column(&self.result));
        row.insert("previousItem", Self::item_column(&self.previous_item));
        row
    }

    /// Deserializes from an `__errors` row.
    pub fn from_row(row: &Item) -> Result<TableOperationError> {
        let id = row
            .get(system::ID)
            .and_then(Value::as_str)
            .and_then(|s| Uuid::parse_str(s).ok())
            .ok_or_else(|| Error::inconsistent_state("error row has a malformed id"))?;
        let operation_kind = row
            .get("operationKind")
            .and_then(Value::as_integer)
            .and_then(OperationKind::from_code)
            .ok_or_else(|| Error::inconsistent_state("error row has an unknown kind"))?;
        let table_kind = row
            .get("tableKind")
            .and_then(Value::as_integer)
            .and_then(TableKind::from_code)
            .ok_or_else(|| Error::inconsistent_state("error row has an unknown table kind"))?;
        let table_name = row
            .get("tableName")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::inconsistent_state("error row has a malformed table name"))?
            .to_string();
        let item = Self::parse_item_column(row, "item")
            .ok_or_else(|| Error::inconsistent_state("error row has a malformed item"))?;

        Ok(TableOperationError {
            id,
            version: row
                .get("version")
                .and_then(Value::as_integer)
                .unwrap_or(1),
            operation_id: id,
            operation_version: row
                .get("operationVersion")
                .and_then(Value::as_integer)
                .unwrap_or(1),
            operation_kind,
            table_name,
            table_kind,
            http_status: row
                .get("httpStatus")
                .and_then(Value::as_integer)
                .and_then(|s| u16::try_from(s).ok()),
            item,
            previous_item: Self::parse_item_column(row, "previousItem"),
            raw_result: row
                .get("rawResult")
                .and_then(Value::as_str)
                .map(str::to_string),
            result: Self::parse_item_column(row, "result"),
            handled: false,
        })
    }
}

/// Accessor over the `__errors` table.
pub struct OperationErrorLog {
    store: Arc<dyn LocalStore>,
}

impl OperationErrorLog {
    /// Creates an error-log accessor over the store.
    pub fn new(store: Arc<dyn LocalStore>) -> Self {
        Self { store }
    }

    /// Persists an error row.
    pub async fn save(&self, error: &TableOperationError) -> Result<()> {
        self.store
            .upsert(ERRORS_TABLE, vec![error.to_row()], false)
            .await?;
        Ok(())
    }

    /// Deletes the error row for an operation. Missing rows are fine.
    pub async fn remove(&self, operation_id: Uuid) -> Result<()> {
        self.store
            .delete_ids(ERRORS_TABLE, &[operation_id.to_string()])
            .await?;
        Ok(())
    }

    /// Deletes every error row for a table. Used by purge.
    pub async fn remove_for_table(&self, table_name: &str) -> Result<()> {
        let query = Query::table(ERRORS_TABLE)
            .with_filter(Filter::Eq("tableName".into(), Value::from(table_name)));
        self.store.delete_query(&query).await?;
        Ok(())
    }

    /// Loads all persisted error rows.
    pub async fn list(&self) -> Result<Vec<TableOperationError>> {
        let rows = self.store.query(&Query::table(ERRORS_TABLE)).await?;
        rows.iter().map(TableOperationError::from_row).collect()
    }
}
