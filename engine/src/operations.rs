//! Pending table operations.
//!
//! Local mutations are expressed as operations, not direct writes: an
//! Insert, Update, or Delete queued for replay against the remote
//! table. Operations on the same item collapse into a single effective
//! operation at enqueue time, so the queue never holds more than one
//! live entry per (table, item).

use crate::error::{Error, Result};
use crate::remote::{RemoteError, RemoteErrorKind, RemoteTable};
use crate::store::LocalStore;
use crate::table::TableKind;
use crate::value::{system, Item, Value};
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Kind of a pending operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Insert,
    Update,
    Delete,
}

impl OperationKind {
    /// Persisted integer code.
    pub const fn as_code(self) -> i64 {
        match self {
            OperationKind::Insert => 0,
            OperationKind::Update => 1,
            OperationKind::Delete => 2,
        }
    }

    /// Parses a persisted integer code.
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(OperationKind::Insert),
            1 => Some(OperationKind::Update),
            2 => Some(OperationKind::Delete),
            _ => None,
        }
    }
}

/// Lifecycle state of a pending operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OperationState {
    /// Never sent to the network.
    #[default]
    Pending,
    /// A remote call was started; its outcome is unknown.
    Attempted,
    /// The last remote call failed.
    Failed,
}

impl OperationState {
    /// Persisted integer code.
    pub const fn as_code(self) -> i64 {
        match self {
            OperationState::Pending => 0,
            OperationState::Attempted => 1,
            OperationState::Failed => 2,
        }
    }

    /// Parses a persisted integer code.
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(OperationState::Pending),
            1 => Some(OperationState::Attempted),
            2 => Some(OperationState::Failed),
            _ => None,
        }
    }
}

/// A queued local mutation awaiting replay against the remote table.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingOperation {
    /// Operation id.
    pub id: Uuid,
    /// Operation kind.
    pub kind: OperationKind,
    /// Target table.
    pub table_name: String,
    /// Target table kind.
    pub table_kind: TableKind,
    /// Target item id.
    pub item_id: String,
    /// Inlined item. Persisted only for deletes, whose local row is
    /// gone by the time the operation replays.
    pub item: Option<Item>,
    /// When the operation was created.
    pub created_at: DateTime<Utc>,
    /// Position in the queue's total order. Assigned at enqueue.
    pub sequence: i64,
    /// Optimistic-concurrency counter for queue updates. Starts at 1.
    pub version: i64,
    /// Lifecycle state.
    pub state: OperationState,
    /// The local row as it stood before the first update, kept in
    /// memory as the three-way merge base. Not persisted.
    pub previous_item: Option<Item>,
    /// Set when a collapse cancelled this operation.
    pub is_cancelled: bool,
    /// Set when a collapse folded a newer mutation into this operation.
    pub is_updated: bool,
}

impl PendingOperation {
    fn new(kind: OperationKind, table_name: impl Into<String>, item_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            table_name: table_name.into(),
            table_kind: TableKind::Table,
            item_id: item_id.into(),
            item: None,
            created_at: Utc::now(),
            sequence: 0,
            version: 1,
            state: OperationState::Pending,
            previous_item: None,
            is_cancelled: false,
            is_updated: false,
        }
    }

    /// Creates an insert operation.
    pub fn insert(table_name: impl Into<String>, item_id: impl Into<String>) -> Self {
        Self::new(OperationKind::Insert, table_name, item_id)
    }

    /// Creates an update operation. `previous_item` is the local row
    /// before the update, used later as the merge base.
    pub fn update(
        table_name: impl Into<String>,
        item_id: impl Into<String>,
        previous_item: Option<Item>,
    ) -> Self {
        let mut op = Self::new(OperationKind::Update, table_name, item_id);
        op.previous_item = previous_item;
        op
    }

    /// Creates a delete operation. `item` is the local row at delete
    /// time, inlined so the delete can replay after the row is gone.
    pub fn delete(
        table_name: impl Into<String>,
        item_id: impl Into<String>,
        item: Option<Item>,
    ) -> Self {
        let mut op = Self::new(OperationKind::Delete, table_name, item_id);
        op.item = item;
        op
    }

    /// True when a successful remote response should be written back
    /// into the local store.
    pub fn writes_result_back(&self) -> bool {
        matches!(self.kind, OperationKind::Insert | OperationKind::Update)
    }

    /// True when the operation's item is persisted in the queue row.
    pub fn serializes_item_to_queue(&self) -> bool {
        matches!(self.kind, OperationKind::Delete)
    }

    /// Marks the operation cancelled. Cancelled operations are removed
    /// from the queue by the caller.
    pub fn cancel(&mut self) {
        self.is_cancelled = true;
    }

    /// Folds a newer mutation into this operation: bumps the version,
    /// resets the state so the operation is retried, and flags it for
    /// re-persistence.
    pub fn mark_updated(&mut self) {
        self.version += 1;
        self.state = OperationState::Pending;
        self.is_updated = true;
    }

    /// Collapses `new_op` into this queued operation.
    ///
    /// Exactly one of three things happens: the pair is rejected, the
    /// new operation is absorbed (cancelled) into this one, or this
    /// operation is cancelled and the new one survives. The caller
    /// persists whatever the flags say afterwards.
    pub fn collapse_with(&mut self, new_op: &mut PendingOperation) -> Result<()> {
        use OperationKind::{Delete, Insert, Update};
        match (self.kind, new_op.kind) {
            (Insert, Insert) | (Update, Insert) => Err(Error::invalid_input(format!(
                "an operation for item '{}' is already in the queue; it cannot be inserted again",
                self.item_id
            ))),
            (Insert, Update) | (Update, Update) => {
                self.mark_updated();
                new_op.cancel();
                Ok(())
            }
            (Insert, Delete) => {
                if self.state != OperationState::Pending {
                    return Err(Error::inconsistent_state(format!(
                        "the insert for item '{}' was already sent to the server; \
                         push before deleting",
                        self.item_id
                    )));
                }
                // The insert never reached the server, so neither
                // operation has anything left to replay.
                self.cancel();
                new_op.cancel();
                Ok(())
            }
            (Update, Delete) => {
                self.cancel();
                Ok(())
            }
            (Delete, _) => Err(Error::inconsistent_state(format!(
                "a delete for item '{}' is pending; no further operation may follow it",
                self.item_id
            ))),
        }
    }

    /// Applies the operation to the local store. Insert and update
    /// require the item; delete ignores it.
    pub async fn execute_local(&self, store: &dyn LocalStore, item: Option<&Item>) -> Result<()> {
        match self.kind {
            OperationKind::Insert => {
                let item = item.ok_or_else(|| {
                    Error::invalid_input("an insert operation requires an item")
                })?;
                if store.lookup(&self.table_name, &self.item_id).await?.is_some() {
                    return Err(Error::invalid_input(format!(
                        "an item with id '{}' already exists in table '{}'",
                        self.item_id, self.table_name
                    )));
                }
                store
                    .upsert(&self.table_name, vec![item.clone()], false)
                    .await?;
            }
            OperationKind::Update => {
                let item = item.ok_or_else(|| {
                    Error::invalid_input("an update operation requires an item")
                })?;
                store
                    .upsert(&self.table_name, vec![item.clone()], false)
                    .await?;
            }
            OperationKind::Delete => {
                store
                    .delete_ids(&self.table_name, std::slice::from_ref(&self.item_id))
                    .await?;
            }
        }
        Ok(())
    }

    /// Replays the operation against the remote table.
    ///
    /// System fields are stripped from the body; the `version` token
    /// travels as `If-Match` on update and delete. A 404 on delete is
    /// success: the record is gone either way.
    pub async fn execute_remote(
        &self,
        remote: &dyn RemoteTable,
        item: &Item,
    ) -> std::result::Result<Option<Item>, RemoteError> {
        match self.kind {
            OperationKind::Insert => {
                let body = item.without_system_properties(false);
                remote.insert(body).await.map(Some)
            }
            OperationKind::Update => {
                let version = item.version().map(str::to_string);
                let body = item.without_system_properties(false);
                remote.update(body, version.as_deref()).await.map(Some)
            }
            OperationKind::Delete => {
                let version = item.version().map(str::to_string);
                match remote.delete(&self.item_id, version.as_deref()).await {
                    Ok(()) => Ok(None),
                    Err(err) if err.kind == RemoteErrorKind::NotFound => Ok(None),
                    Err(err) => Err(err),
                }
            }
        }
    }

    /// Serializes to an `__operations` row.
    pub fn to_row(&self) -> Item {
        let mut row = Item::new();
        row.insert(system::ID, self.id.to_string());
        row.insert("kind", self.kind.as_code());
        row.insert("state", self.state.as_code());
        row.insert("tableName", self.table_name.clone());
        row.insert("tableKind", self.table_kind.as_code());
        row.insert("itemId", self.item_id.clone());
        match &self.item {
            Some(item) if self.serializes_item_to_queue() => {
                row.insert("item", item.to_json().to_string());
            }
            _ => row.insert("item", Value::Null),
        }
        row.insert(system::CREATED_AT, self.created_at);
        row.insert("sequence", self.sequence);
        row.insert("version", self.version);
        row
    }

    /// Deserializes from an `__operations` row.
    pub fn from_row(row: &Item) -> Result<PendingOperation> {
        let field = |name: &str| {
            row.get(name)
                .ok_or_else(|| Error::inconsistent_state(format!("operation row lacks '{name}'")))
        };
        let int_field = |name: &str| {
            field(name).and_then(|v| {
                v.as_integer().ok_or_else(|| {
                    Error::inconsistent_state(format!("operation row '{name}' is not an integer"))
                })
            })
        };

        let id = field(system::ID)?
            .as_str()
            .and_then(|s| Uuid::parse_str(s).ok())
            .ok_or_else(|| Error::inconsistent_state("operation row has a malformed id"))?;
        let kind = OperationKind::from_code(int_field("kind")?)
            .ok_or_else(|| Error::inconsistent_state("operation row has an unknown kind"))?;
        let state = OperationState::from_code(int_field("state")?)
            .ok_or_else(|| Error::inconsistent_state("operation row has an unknown state"))?;
        let table_kind = TableKind::from_code(int_field("tableKind")?)
            .ok_or_else(|| Error::inconsistent_state("operation row has an unknown table kind"))?;
        let table_name = field("tableName")?
            .as_str()
            .ok_or_else(|| Error::inconsistent_state("operation row has a malformed table name"))?
            .to_string();
        let item_id = field("itemId")?
            .as_str()
            .ok_or_else(|| Error::inconsistent_state("operation row has a malformed item id"))?
            .to_string();
        let item = match row.get("item") {
            Some(Value::String(text)) => serde_json::from_str::<serde_json::Value>(text)
                .ok()
                .and_then(Item::from_json),
            _ => None,
        };
        let created_at = field(system::CREATED_AT)?
            .as_timestamp()
            .ok_or_else(|| Error::inconsistent_state("operation row has a malformed timestamp"))?;

        Ok(PendingOperation {
            id,
            kind,
            table_name,
            table_kind,
            item_id,
            item,
            created_at,
            sequence: int_field("sequence")?,
            version: int_field("version")?,
            state,
            previous_item: None,
            is_cancelled: false,
            is_updated: false,
        })
    }
}
