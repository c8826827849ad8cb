//! # Tether Engine
//!
//! A client-side offline sync engine for table-based backends.
//!
//! Applications mutate records locally while disconnected; the engine
//! queues those mutations, later replays them against the remote
//! backend, pulls server changes down, and exposes property-level
//! three-way conflict resolution when the two sides diverge.
//!
//! ## Design Principles
//!
//! - **Storage and transport are consumed, not implemented**: the
//!   embedded store and the remote table are traits
//!   ([`LocalStore`], [`RemoteTable`]) the host provides.
//! - **One effective operation per record**: local mutations collapse
//!   in the queue, so a record is pushed at most once per batch.
//! - **Local work is never lost silently**: pulls skip records with
//!   pending operations, and push conflicts surface as error rows the
//!   application resolves explicitly.
//!
//! ## Core Concepts
//!
//! ### Items
//!
//! Records are dynamic property bags ([`Item`]) with a required string
//! `id` and server-managed system properties: `version` (the
//! concurrency token), `createdAt`, `updatedAt`, and `deleted`.
//!
//! ### The operation queue
//!
//! Every local insert, update, or delete becomes a
//! [`PendingOperation`] persisted in the `__operations` system table.
//! Operations on the same record collapse (an insert followed by an
//! update is still one insert; an update followed by a delete is one
//! delete), and a monotonic sequence defines push order.
//!
//! ### Push, pull, purge
//!
//! The three sync actions never interleave. A push walks the queue and
//! replays operations; per-record failures become `__errors` rows
//! delivered through [`SyncHandler::on_push_complete`]. A pull pages
//! server records into the store, incrementally when given a query id
//! (resuming from a persisted delta token), and defers itself behind a
//! push when the table has pending operations. A purge discards local
//! data and sync state for a table.
//!
//! ### Conflicts
//!
//! A 412 on push records the merge base, the local edit, and the
//! server's copy. [`SyncContext::update_conflict`] diffs them into
//! [`PropertyConflict`]s; each is resolved exactly once (take local,
//! take remote, or a custom value) and
//! [`SyncContext::merge_and_update`] resubmits the merged record.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use tether_engine::{
//!     CancellationToken, Item, PullOptions, Query, RemoteQueryOptions, SyncContext,
//!     TableDefinition, TrackingOptions,
//! };
//! use serde_json::json;
//!
//! let context = SyncContext::initialize(
//!     store,                       // Arc<dyn LocalStore>
//!     backend,                     // Arc<dyn RemoteBackend>
//!     handler,                     // Arc<dyn SyncHandler>
//!     vec![TableDefinition::new("todos")],
//!     TrackingOptions::NONE,
//! )
//! .await?;
//!
//! let item = Item::from_json(json!({"title": "write the docs"})).unwrap();
//! context.insert("todos", item).await?;
//!
//! let token = CancellationToken::new();
//! context.push(None, &token).await?;
//! context
//!     .pull(
//!         "todos",
//!         Some("all"),
//!         Query::table("todos"),
//!         RemoteQueryOptions::ALL,
//!         None,
//!         PullOptions::default(),
//!         &token,
//!     )
//!     .await?;
//! ```

pub mod actions;
pub mod conflict;
pub mod context;
pub mod coordination;
pub mod error;
pub mod operations;
pub mod pull;
pub mod purge;
pub mod push;
pub mod query;
pub mod queue;
pub mod remote;
pub mod settings;
pub mod store;
pub mod sync_error;
pub mod table;
pub mod tracker;
pub mod value;

// Re-export main types at crate root
pub use conflict::{ComparerRegistry, PropertyConflict, PropertyValueComparer, UpdateConflict};
pub use context::SyncContext;
pub use coordination::{ActionSlot, CancellationToken, LockGuard, LockMap};
pub use error::{Error, PushStatus, Result, StoreError};
pub use operations::{OperationKind, OperationState, PendingOperation};
pub use pull::PullOptions;
pub use push::{
    DefaultSyncHandler, HandlerError, PushCompletionResult, SyncHandler,
};
pub use query::{
    Filter, Query, QueryResult, RemoteQueryOptions, SortDirection, INCLUDE_DELETED_PARAMETER,
};
pub use queue::{OperationQueue, OPERATIONS_TABLE};
pub use remote::{RemoteBackend, RemoteError, RemoteErrorKind, RemoteTable, ServerPage};
pub use settings::{SyncSettings, CONFIG_TABLE};
pub use store::{LocalStore, StoreOperationSource};
pub use sync_error::{OperationErrorLog, TableOperationError, ERRORS_TABLE};
pub use table::{
    is_system_table, ColumnDef, ColumnType, SystemProperties, TableDefinition, TableKind,
};
pub use tracker::{
    BatchSummary, ChangeEvent, ChangeFeed, RecordChange, RecordChangeKind, TrackedStore,
    TrackingOptions,
};
pub use value::{system, Item, Value};

/// Type aliases for clarity
pub type TableName = String;
pub type ItemId = String;
pub type Sequence = i64;
