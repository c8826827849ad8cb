//! The sync context.
//!
//! [`SyncContext`] is the public face of the engine: applications
//! mutate records through it while offline, then push, pull, and purge
//! against the remote backend. It owns the operation queue, the sync
//! settings, and the store handle, and it enforces the locking
//! discipline (item lock, then table lock, then the store/queue writer
//! lock) around every mutation.

use crate::actions::ActionRunner;
use crate::conflict::{ComparerRegistry, PropertyValueComparer, UpdateConflict};
use crate::coordination::CancellationToken;
use crate::error::{Error, Result};
use crate::operations::{OperationKind, PendingOperation};
use crate::pull::{PullAction, PullOptions};
use crate::purge::PurgeAction;
use crate::push::{PushEngine, SyncHandler};
use crate::query::{Query, QueryResult, RemoteQueryOptions};
use crate::queue::{operations_table_definition, OperationQueue};
use crate::remote::RemoteBackend;
use crate::settings::{config_table_definition, SyncSettings};
use crate::store::{LocalStore, StoreOperationSource};
use crate::sync_error::{errors_table_definition, OperationErrorLog, TableOperationError};
use crate::table::{is_system_table, TableDefinition};
use crate::tracker::{ChangeEvent, ChangeFeed, TrackedStore, TrackingOptions};
use crate::value::{system, Item};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

/// Client-side offline sync engine over one local store and one remote
/// backend.
pub struct SyncContext {
    store: Arc<dyn LocalStore>,
    backend: Arc<dyn RemoteBackend>,
    handler: Arc<dyn SyncHandler>,
    queue: Arc<OperationQueue>,
    settings: Arc<SyncSettings>,
    errors: Arc<OperationErrorLog>,
    tables: Arc<HashMap<String, TableDefinition>>,
    comparers: ComparerRegistry,
    feed: Arc<ChangeFeed>,
    tracking: TrackingOptions,
    store_queue_lock: Arc<RwLock<()>>,
    runner: ActionRunner,
}

impl SyncContext {
    /// Initializes the engine: declares the system and application
    /// tables on the store, opens it, and loads the operation queue.
    ///
    /// Table definitions are frozen from here on.
    pub async fn initialize(
        store: Arc<dyn LocalStore>,
        backend: Arc<dyn RemoteBackend>,
        handler: Arc<dyn SyncHandler>,
        tables: Vec<TableDefinition>,
        tracking: TrackingOptions,
    ) -> Result<SyncContext> {
        for definition in &tables {
            if is_system_table(&definition.name) {
                return Err(Error::invalid_input(format!(
                    "'{}' is a reserved table name",
                    definition.name
                )));
            }
        }

        store.define_table(operations_table_definition()).await?;
        store.define_table(errors_table_definition()).await?;
        store.define_table(config_table_definition()).await?;
        for definition in &tables {
            store
                .define_table(definition.clone().ensured_system_columns())
                .await?;
        }
        store.initialize().await?;

        let queue = Arc::new(OperationQueue::load(store.clone()).await?);
        let settings = Arc::new(SyncSettings::new(store.clone()));
        for definition in &tables {
            settings
                .set_system_properties(&definition.name, definition.system_properties)
                .await?;
        }

        info!(
            tables = tables.len(),
            pending = queue.pending_operations(),
            "sync context initialized"
        );

        Ok(SyncContext {
            errors: Arc::new(OperationErrorLog::new(store.clone())),
            store,
            backend,
            handler,
            queue,
            settings,
            tables: Arc::new(
                tables
                    .into_iter()
                    .map(|def| (def.name.clone(), def))
                    .collect(),
            ),
            comparers: ComparerRegistry::new(),
            feed: Arc::new(ChangeFeed::new()),
            tracking,
            store_queue_lock: Arc::new(RwLock::new(())),
            runner: ActionRunner::new(),
        })
    }

    /// Registers a property comparer used when building conflict sets.
    pub fn register_comparer(
        &mut self,
        table_name: impl Into<String>,
        property_name: impl Into<String>,
        comparer: Arc<dyn PropertyValueComparer>,
    ) {
        self.comparers
            .register(table_name, property_name, comparer);
    }

    /// Number of operations awaiting push.
    pub fn pending_operations(&self) -> usize {
        self.queue.pending_operations()
    }

    /// Subscribes to change-tracker events.
    pub fn subscribe(&self) -> UnboundedReceiver<ChangeEvent> {
        self.feed.subscribe()
    }

    fn tracked(&self, source: StoreOperationSource) -> Arc<TrackedStore> {
        Arc::new(TrackedStore::new(
            self.store.clone(),
            self.feed.clone(),
            self.tracking,
            source,
            self.tables.clone(),
        ))
    }

    fn require_table(&self, table_name: &str) -> Result<()> {
        if self.tables.contains_key(table_name) {
            Ok(())
        } else {
            Err(Error::invalid_input(format!(
                "table '{table_name}' is not defined"
            )))
        }
    }

    fn require_item_id(item: &Item) -> Result<String> {
        match item.id() {
            Some(id) if !id.trim().is_empty() => Ok(id.to_string()),
            Some(_) => Err(Error::invalid_input("item id cannot be empty")),
            None => Err(Error::invalid_input("item must carry a string id")),
        }
    }

    // ----- local CRUD ------------------------------------------------

    /// Reads rows from the local store.
    pub async fn read(&self, query: &Query) -> Result<QueryResult> {
        self.require_table(&query.table)?;
        let _read = self.store_queue_lock.read().await;
        Ok(self.store.read(query).await?)
    }

    /// Looks up one row from the local store.
    pub async fn lookup(&self, table_name: &str, id: &str) -> Result<Option<Item>> {
        self.require_table(table_name)?;
        let _read = self.store_queue_lock.read().await;
        Ok(self.store.lookup(table_name, id).await?)
    }

    /// Inserts an item locally and queues the insert for push.
    /// Generates an id when the item carries none; returns the item as
    /// stored.
    pub async fn insert(&self, table_name: &str, mut item: Item) -> Result<Item> {
        self.require_table(table_name)?;
        if !item.contains(system::ID) {
            item.insert(system::ID, Uuid::new_v4().to_string());
        }
        let id = Self::require_item_id(&item)?;
        let op = PendingOperation::insert(table_name, id);
        self.execute_operation(op, Some(item.clone())).await?;
        Ok(item)
    }

    /// Updates an item locally and queues the update for push.
    pub async fn update(&self, table_name: &str, item: Item) -> Result<()> {
        self.require_table(table_name)?;
        let id = Self::require_item_id(&item)?;
        let op = PendingOperation::update(table_name, id, None);
        self.execute_operation(op, Some(item)).await
    }

    /// Deletes an item locally and queues the delete for push.
    pub async fn delete(&self, table_name: &str, id: &str) -> Result<()> {
        self.require_table(table_name)?;
        if id.trim().is_empty() {
            return Err(Error::invalid_input("item id cannot be empty"));
        }
        let op = PendingOperation::delete(table_name, id, None);
        self.execute_operation(op, None).await
    }

    /// Applies a local mutation under the engine's locking discipline:
    /// collapse against any queued operation for the item, apply the
    /// store effect, then persist the queue transition.
    async fn execute_operation(
        &self,
        mut op: PendingOperation,
        item: Option<Item>,
    ) -> Result<()> {
        let tracker = self.tracked(StoreOperationSource::Local);
        let _item_lock = self.queue.lock_item(&op.item_id).await;
        let _table_lock = self.queue.lock_table(&op.table_name).await;
        let _write = self.store_queue_lock.write().await;

        match op.kind {
            OperationKind::Update => {
                // The row as it stands is the last server-acknowledged
                // state only when no operation is queued; in the
                // collapse case the queued operation keeps its base.
                op.previous_item = self.store.lookup(&op.table_name, &op.item_id).await?;
            }
            OperationKind::Delete => {
                op.item = self.store.lookup(&op.table_name, &op.item_id).await?;
            }
            OperationKind::Insert => {}
        }

        let existing = self.queue.get_by_item(&op.table_name, &op.item_id).await?;
        match existing {
            Some(mut queued) => {
                queued.collapse_with(&mut op)?;
                op.execute_local(tracker.as_ref(), item.as_ref()).await?;
                self.errors.remove(queued.id).await?;
                if queued.is_cancelled {
                    if !self.queue.try_delete(queued.id, queued.version).await? {
                        return Err(Error::inconsistent_state(
                            "the queued operation changed during collapse",
                        ));
                    }
                } else if queued.is_updated {
                    self.queue.update(&queued).await?;
                }
                if !op.is_cancelled {
                    self.queue.enqueue(&mut op).await?;
                }
            }
            None => {
                op.execute_local(tracker.as_ref(), item.as_ref()).await?;
                self.queue.enqueue(&mut op).await?;
            }
        }

        tracker.complete();
        Ok(())
    }

    // ----- sync actions ----------------------------------------------

    /// Pushes pending operations to the remote backend, optionally
    /// restricted to the given tables.
    pub async fn push(
        &self,
        tables: Option<Vec<String>>,
        token: &CancellationToken,
    ) -> Result<()> {
        self.runner
            .exclusive(self.push_internal(tables, token))
            .await
    }

    async fn push_internal(
        &self,
        tables: Option<Vec<String>>,
        token: &CancellationToken,
    ) -> Result<()> {
        let tracker = self.tracked(StoreOperationSource::ServerPush);
        let engine = PushEngine {
            store: tracker.clone(),
            queue: &self.queue,
            errors: &self.errors,
            backend: self.backend.as_ref(),
            handler: self.handler.as_ref(),
            token,
            tables,
        };
        let result = engine.execute().await;
        tracker.complete();
        result
    }

    /// Pulls server records for a table into the local store.
    ///
    /// A `query_id` makes the pull incremental, resuming from the
    /// persisted delta token. If the table (or a related table) has
    /// pending operations, the pull defers itself behind a push of
    /// those tables.
    #[allow(clippy::too_many_arguments)]
    pub async fn pull(
        &self,
        table_name: &str,
        query_id: Option<&str>,
        query: Query,
        options: RemoteQueryOptions,
        related_tables: Option<Vec<String>>,
        pull_options: PullOptions,
        token: &CancellationToken,
    ) -> Result<()> {
        self.require_table(table_name)?;
        let tracker = self.tracked(StoreOperationSource::ServerPull);
        let mut query = query;
        query.table = table_name.to_string();

        let action = PullAction {
            store: tracker.clone(),
            queue: self.queue.clone(),
            settings: self.settings.clone(),
            remote: self.backend.table(table_name),
            table_name: table_name.to_string(),
            query_id: query_id.map(str::to_string),
            query,
            options,
            pull_options,
            related_tables,
            token: token.clone(),
        };
        let result = self
            .runner
            .run(action, |tables| self.push_internal(tables, token))
            .await;
        tracker.complete();
        result
    }

    /// Purges local records matching the query, together with the
    /// table's pending operations, error rows, and delta token.
    pub async fn purge(
        &self,
        table_name: &str,
        query_id: Option<&str>,
        query: Query,
        force: bool,
        token: &CancellationToken,
    ) -> Result<()> {
        self.require_table(table_name)?;
        let tracker = self.tracked(StoreOperationSource::LocalPurge);
        let mut query = query;
        query.table = table_name.to_string();

        let action = PurgeAction {
            store: tracker.clone(),
            queue: self.queue.clone(),
            settings: self.settings.clone(),
            errors: self.errors.clone(),
            store_queue_lock: self.store_queue_lock.clone(),
            table_name: table_name.to_string(),
            query_id: query_id.map(str::to_string),
            query,
            force,
            token: token.clone(),
        };
        let result = self
            .runner
            .run(action, |tables| self.push_internal(tables, token))
            .await;
        tracker.complete();
        result
    }

    // ----- conflict resolution ---------------------------------------

    /// Builds the property conflict set for a failed update.
    pub fn update_conflict(&self, error: TableOperationError) -> Result<UpdateConflict> {
        UpdateConflict::build(error, &self.comparers)
    }

    /// Submits a fully resolved conflict set: the merged item replaces
    /// the operation's payload and is written back locally.
    pub async fn merge_and_update(&self, conflict: UpdateConflict) -> Result<()> {
        let (error, merged) = conflict.into_parts()?;
        self.update_operation(&error, merged).await
    }

    /// Abandons the failed operation and discards the local record.
    pub async fn cancel_and_discard(&self, error: &TableOperationError) -> Result<()> {
        let item_id = Self::error_item_id(error)?;
        let tracker = self.tracked(StoreOperationSource::LocalConflictResolution);
        let _item_lock = self.queue.lock_item(&item_id).await;
        let _table_lock = self.queue.lock_table(&error.table_name).await;
        let _write = self.store_queue_lock.write().await;

        self.remove_operation(error).await?;
        self.errors.remove(error.id).await?;
        tracker.delete_ids(&error.table_name, &[item_id]).await?;
        tracker.complete();
        Ok(())
    }

    /// Abandons the failed operation and replaces the local record,
    /// typically with the server's copy.
    pub async fn cancel_and_update(
        &self,
        error: &TableOperationError,
        item: Item,
    ) -> Result<()> {
        let item_id = Self::error_item_id(error)?;
        if item.id() != Some(item_id.as_str()) {
            return Err(Error::invalid_input(
                "the replacement item must keep the failed operation's id",
            ));
        }
        let tracker = self.tracked(StoreOperationSource::LocalConflictResolution);
        let _item_lock = self.queue.lock_item(&item_id).await;
        let _table_lock = self.queue.lock_table(&error.table_name).await;
        let _write = self.store_queue_lock.write().await;

        self.remove_operation(error).await?;
        self.errors.remove(error.id).await?;
        tracker
            .upsert(&error.table_name, vec![item], false)
            .await?;
        tracker.complete();
        Ok(())
    }

    /// Replaces the failed operation's payload and requeues it as
    /// pending; for non-deletes the item is also written back locally.
    pub async fn update_operation(
        &self,
        error: &TableOperationError,
        item: Item,
    ) -> Result<()> {
        let item_id = Self::error_item_id(error)?;
        if item.id() != Some(item_id.as_str()) {
            return Err(Error::invalid_input(
                "the replacement item must keep the failed operation's id",
            ));
        }
        let tracker = self.tracked(StoreOperationSource::LocalConflictResolution);
        let _item_lock = self.queue.lock_item(&item_id).await;
        let _table_lock = self.queue.lock_table(&error.table_name).await;
        let _write = self.store_queue_lock.write().await;

        if !self
            .queue
            .try_update(error.operation_id, error.operation_version, item.clone())
            .await?
        {
            return Err(Error::inconsistent_state(
                "the operation was modified after this error was recorded",
            ));
        }
        // The server's copy, when the error carries one, becomes the
        // merge base for the resubmitted operation.
        self.queue
            .set_merge_base(error.operation_id, error.result.clone());
        self.errors.remove(error.id).await?;

        if error.operation_kind != OperationKind::Delete {
            tracker
                .upsert(&error.table_name, vec![item], false)
                .await?;
        }
        tracker.complete();
        Ok(())
    }

    fn error_item_id(error: &TableOperationError) -> Result<String> {
        error
            .item_id()
            .map(str::to_string)
            .ok_or_else(|| Error::invalid_input("the error does not carry an item id"))
    }

    async fn remove_operation(&self, error: &TableOperationError) -> Result<()> {
        if !self
            .queue
            .try_delete(error.operation_id, error.operation_version)
            .await?
        {
            return Err(Error::inconsistent_state(
                "the operation was modified after this error was recorded",
            ));
        }
        Ok(())
    }
}
