//! Change tracking.
//!
//! A [`TrackedStore`] decorates the local store for the duration of one
//! push, pull, purge, or local mutation and emits change events for
//! non-system tables: one per record, and an aggregate per batch when
//! the scope closes. Which events fire is controlled by
//! [`TrackingOptions`] and the mutation's [`StoreOperationSource`].

use crate::error::StoreError;
use crate::query::{Query, QueryResult};
use crate::store::{LocalStore, StoreOperationSource};
use crate::table::{is_system_table, TableDefinition};
use crate::value::{system, Item, Value};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use uuid::Uuid;

/// Which change notifications are emitted, as a bitset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TrackingOptions(u16);

impl TrackingOptions {
    /// No notifications.
    pub const NONE: Self = Self(0);
    /// Per-record events for local application mutations (and purges).
    pub const NOTIFY_LOCAL_OPERATIONS: Self = Self(0x01);
    /// Per-record events for conflict-resolution write-backs.
    pub const NOTIFY_LOCAL_CONFLICT_RESOLUTION_OPERATIONS: Self = Self(0x02);
    /// Per-record events for records applied during pulls.
    pub const NOTIFY_SERVER_PULL_OPERATIONS: Self = Self(0x04);
    /// Per-record events for server results written back during pushes.
    pub const NOTIFY_SERVER_PUSH_OPERATIONS: Self = Self(0x08);
    /// Aggregate event when a pull scope closes.
    pub const NOTIFY_SERVER_PULL_BATCH: Self = Self(0x10);
    /// Aggregate event when a push scope closes.
    pub const NOTIFY_SERVER_PUSH_BATCH: Self = Self(0x20);
    /// Read existing ids before upsert to distinguish inserts from
    /// updates.
    pub const DETECT_INSERTS_AND_UPDATES: Self = Self(0x40);
    /// Suppress events for server writes whose version matches the
    /// stored row.
    pub const DETECT_RECORD_CHANGES: Self = Self(0x80);
    /// Everything on.
    pub const ALL: Self = Self(0xff);

    /// Returns true if all of `other`'s flags are set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns a copy with `other`'s flags added.
    #[must_use]
    pub const fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    fn records_enabled(self, source: StoreOperationSource) -> bool {
        let flag = match source {
            StoreOperationSource::Local | StoreOperationSource::LocalPurge => {
                Self::NOTIFY_LOCAL_OPERATIONS
            }
            StoreOperationSource::LocalConflictResolution => {
                Self::NOTIFY_LOCAL_CONFLICT_RESOLUTION_OPERATIONS
            }
            StoreOperationSource::ServerPull => Self::NOTIFY_SERVER_PULL_OPERATIONS,
            StoreOperationSource::ServerPush => Self::NOTIFY_SERVER_PUSH_OPERATIONS,
        };
        self.contains(flag)
    }

    fn batch_enabled(self, source: StoreOperationSource) -> bool {
        match source {
            StoreOperationSource::ServerPull => self.contains(Self::NOTIFY_SERVER_PULL_BATCH),
            StoreOperationSource::ServerPush => self.contains(Self::NOTIFY_SERVER_PUSH_BATCH),
            _ => false,
        }
    }
}

/// Type of a record-level change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordChangeKind {
    Insert,
    Update,
    Delete,
}

/// A single record-level change event.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordChange {
    /// Table the record belongs to.
    pub table_name: String,
    /// Changed record id.
    pub item_id: String,
    /// Type of change.
    pub kind: RecordChangeKind,
    /// Where the mutation originated.
    pub source: StoreOperationSource,
    /// Scope the change belongs to.
    pub batch_id: Uuid,
}

/// Aggregate counts for one closed scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchSummary {
    /// Scope id.
    pub batch_id: Uuid,
    /// Where the scope's mutations originated.
    pub source: StoreOperationSource,
    /// Records inserted.
    pub inserts: usize,
    /// Records updated.
    pub updates: usize,
    /// Records deleted.
    pub deletes: usize,
}

/// A change event from the feed.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    /// One record changed.
    Record(RecordChange),
    /// A push or pull scope closed.
    Batch(BatchSummary),
}

/// Fan-out of change events to subscribers.
///
/// Each subscriber gets its own unbounded channel; closed receivers are
/// pruned on the next publish.
#[derive(Default)]
pub struct ChangeFeed {
    senders: StdMutex<Vec<UnboundedSender<ChangeEvent>>>,
}

impl ChangeFeed {
    /// Creates an empty feed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes to all future events.
    pub fn subscribe(&self) -> UnboundedReceiver<ChangeEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.lock().expect("feed poisoned").push(tx);
        rx
    }

    /// Publishes an event to every live subscriber.
    pub fn publish(&self, event: ChangeEvent) {
        let mut senders = self.senders.lock().expect("feed poisoned");
        senders.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

#[derive(Default)]
struct BatchCounts {
    inserts: usize,
    updates: usize,
    deletes: usize,
}

/// Store decorator emitting change events for one sync scope.
pub struct TrackedStore {
    inner: Arc<dyn LocalStore>,
    feed: Arc<ChangeFeed>,
    options: TrackingOptions,
    source: StoreOperationSource,
    batch_id: Uuid,
    tables: Arc<HashMap<String, TableDefinition>>,
    counts: StdMutex<BatchCounts>,
}

impl TrackedStore {
    /// Creates a tracker scoped to one invocation.
    pub fn new(
        inner: Arc<dyn LocalStore>,
        feed: Arc<ChangeFeed>,
        options: TrackingOptions,
        source: StoreOperationSource,
        tables: Arc<HashMap<String, TableDefinition>>,
    ) -> Self {
        Self {
            inner,
            feed,
            options,
            source,
            batch_id: Uuid::new_v4(),
            tables,
            counts: StdMutex::new(BatchCounts::default()),
        }
    }

    /// Scope id of this tracker.
    pub fn batch_id(&self) -> Uuid {
        self.batch_id
    }

    /// Closes the scope, emitting the aggregate batch event when the
    /// source's batch flag is set and anything changed.
    pub fn complete(&self) {
        if !self.options.batch_enabled(self.source) {
            return;
        }
        let counts = self.counts.lock().expect("tracker poisoned");
        if counts.inserts + counts.updates + counts.deletes == 0 {
            return;
        }
        self.feed.publish(ChangeEvent::Batch(BatchSummary {
            batch_id: self.batch_id,
            source: self.source,
            inserts: counts.inserts,
            updates: counts.updates,
            deletes: counts.deletes,
        }));
    }

    fn tracks(&self, table: &str) -> bool {
        !is_system_table(table)
            && (self.options.records_enabled(self.source)
                || self.options.batch_enabled(self.source))
    }

    fn emit(&self, table: &str, item_id: &str, kind: RecordChangeKind) {
        {
            let mut counts = self.counts.lock().expect("tracker poisoned");
            match kind {
                RecordChangeKind::Insert => counts.inserts += 1,
                RecordChangeKind::Update => counts.updates += 1,
                RecordChangeKind::Delete => counts.deletes += 1,
            }
        }
        if self.options.records_enabled(self.source) {
            self.feed.publish(ChangeEvent::Record(RecordChange {
                table_name: table.to_string(),
                item_id: item_id.to_string(),
                kind,
                source: self.source,
                batch_id: self.batch_id,
            }));
        }
    }

    fn table_has_version(&self, table: &str) -> bool {
        self.tables
            .get(table)
            .map(|def| def.system_properties.has_version())
            .unwrap_or(false)
    }
}

#[async_trait]
impl LocalStore for TrackedStore {
    async fn define_table(&self, definition: TableDefinition) -> Result<(), StoreError> {
        self.inner.define_table(definition).await
    }

    async fn initialize(&self) -> Result<(), StoreError> {
        self.inner.initialize().await
    }

    async fn upsert(
        &self,
        table: &str,
        items: Vec<Item>,
        ignore_missing_columns: bool,
    ) -> Result<(), StoreError> {
        if !self.tracks(table) {
            return self.inner.upsert(table, items, ignore_missing_columns).await;
        }

        let detect_kinds = self.options.contains(TrackingOptions::DETECT_INSERTS_AND_UPDATES);
        let suppress_unchanged = self.options.contains(TrackingOptions::DETECT_RECORD_CHANGES)
            && self.source != StoreOperationSource::Local
            && self.table_has_version(table);

        let mut changes = Vec::with_capacity(items.len());
        for item in &items {
            let Some(id) = item.id().map(str::to_string) else {
                continue;
            };
            let existing = if detect_kinds || suppress_unchanged {
                self.inner.lookup(table, &id).await?
            } else {
                None
            };

            if suppress_unchanged {
                let stored_version = existing.as_ref().and_then(Item::version);
                if stored_version.is_some() && stored_version == item.version() {
                    continue;
                }
            }

            let kind = if detect_kinds && existing.is_none() {
                RecordChangeKind::Insert
            } else {
                RecordChangeKind::Update
            };
            changes.push((id, kind));
        }

        self.inner.upsert(table, items, ignore_missing_columns).await?;
        for (id, kind) in changes {
            self.emit(table, &id, kind);
        }
        Ok(())
    }

    async fn delete_ids(&self, table: &str, ids: &[String]) -> Result<(), StoreError> {
        self.inner.delete_ids(table, ids).await?;
        if self.tracks(table) {
            for id in ids {
                self.emit(table, id, RecordChangeKind::Delete);
            }
        }
        Ok(())
    }

    async fn delete_query(&self, query: &Query) -> Result<(), StoreError> {
        if !self.tracks(&query.table) {
            return self.inner.delete_query(query).await;
        }
        // Deletes by query lose their ids unless read first.
        let doomed = self.inner.query(query).await?;
        self.inner.delete_query(query).await?;
        for item in doomed {
            if let Some(id) = item.get(system::ID).and_then(Value::as_str) {
                self.emit(&query.table, id, RecordChangeKind::Delete);
            }
        }
        Ok(())
    }

    async fn lookup(&self, table: &str, id: &str) -> Result<Option<Item>, StoreError> {
        self.inner.lookup(table, id).await
    }

    async fn read(&self, query: &Query) -> Result<QueryResult, StoreError> {
        self.inner.read(query).await
    }
}
