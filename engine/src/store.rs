//! Local store contract.
//!
//! The engine does not implement storage. It drives an embedded
//! relational store through [`LocalStore`] and tags every mutation with
//! a [`StoreOperationSource`] so the change tracker can route
//! notifications.

use crate::error::StoreError;
use crate::query::{Query, QueryResult};
use crate::table::TableDefinition;
use crate::value::Item;
use async_trait::async_trait;

/// Where a store mutation originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOperationSource {
    /// An application mutation through the sync context.
    Local,
    /// A purge of local data.
    LocalPurge,
    /// A conflict resolution writing back locally.
    LocalConflictResolution,
    /// Server records applied during a pull.
    ServerPull,
    /// Server responses written back during a push.
    ServerPush,
}

impl StoreOperationSource {
    /// True for mutations that originate on this device.
    pub fn is_local(self) -> bool {
        matches!(
            self,
            StoreOperationSource::Local
                | StoreOperationSource::LocalPurge
                | StoreOperationSource::LocalConflictResolution
        )
    }
}

/// Contract of the embedded local store.
///
/// Implementations persist items per table and evaluate structured
/// queries. All methods are cancel-safe from the engine's perspective:
/// the engine never assumes partial effects on error.
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Declares a table. Must be called before [`LocalStore::initialize`].
    async fn define_table(&self, definition: TableDefinition) -> Result<(), StoreError>;

    /// Creates declared tables and opens the store for use.
    async fn initialize(&self) -> Result<(), StoreError>;

    /// Inserts or replaces items by id.
    ///
    /// With `ignore_missing_columns`, properties without a declared
    /// column are dropped instead of failing; server payloads may carry
    /// columns the local schema does not know.
    async fn upsert(
        &self,
        table: &str,
        items: Vec<Item>,
        ignore_missing_columns: bool,
    ) -> Result<(), StoreError>;

    /// Deletes rows by id. Missing ids are not an error.
    async fn delete_ids(&self, table: &str, ids: &[String]) -> Result<(), StoreError>;

    /// Deletes all rows matching a query.
    async fn delete_query(&self, query: &Query) -> Result<(), StoreError>;

    /// Looks up a single row by id.
    async fn lookup(&self, table: &str, id: &str) -> Result<Option<Item>, StoreError>;

    /// Evaluates a query, honoring `include_total_count`.
    async fn read(&self, query: &Query) -> Result<QueryResult, StoreError>;

    /// Evaluates a query, returning rows only.
    async fn query(&self, query: &Query) -> Result<Vec<Item>, StoreError> {
        Ok(self.read(query).await?.items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_locality() {
        assert!(StoreOperationSource::Local.is_local());
        assert!(StoreOperationSource::LocalPurge.is_local());
        assert!(StoreOperationSource::LocalConflictResolution.is_local());
        assert!(!StoreOperationSource::ServerPull.is_local());
        assert!(!StoreOperationSource::ServerPush.is_local());
    }
}
