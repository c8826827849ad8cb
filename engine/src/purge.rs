//! Purge.
//!
//! A purge discards local records matching a query, together with any
//! pending operations and error rows for the table, and resets the
//! delta token so the next incremental pull starts clean. Tables with
//! pending operations refuse to purge unless forced with a filter-free
//! query.

use crate::actions::{ActionStep, SyncAction};
use crate::coordination::CancellationToken;
use crate::error::{Error, Result};
use crate::query::Query;
use crate::queue::OperationQueue;
use crate::settings::SyncSettings;
use crate::store::LocalStore;
use crate::sync_error::OperationErrorLog;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

/// One purge invocation, driven as an action.
pub(crate) struct PurgeAction {
    /// Store for row deletion; tracked with `LocalPurge`.
    pub store: Arc<dyn LocalStore>,
    pub queue: Arc<OperationQueue>,
    pub settings: Arc<SyncSettings>,
    pub errors: Arc<OperationErrorLog>,
    pub store_queue_lock: Arc<RwLock<()>>,
    pub table_name: String,
    pub query_id: Option<String>,
    pub query: Query,
    pub force: bool,
    pub token: CancellationToken,
}

#[async_trait]
impl SyncAction for PurgeAction {
    async fn enter(&mut self) -> Result<ActionStep> {
        self.execute().await?;
        Ok(ActionStep::Done)
    }

    async fn resume_after_push(&mut self) -> Result<ActionStep> {
        Ok(ActionStep::Done)
    }
}

impl PurgeAction {
    async fn execute(&self) -> Result<()> {
        if self.token.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let _table = self.queue.lock_table(&self.table_name).await;
        let _write = self.store_queue_lock.write().await;

        let pending = self.queue.count_pending(&self.table_name).await?;
        if pending > 0 && (!self.force || self.query.filter.is_some()) {
            return Err(Error::inconsistent_state(format!(
                "table '{}' has {pending} pending operation(s); push first, or force a \
                 filter-free purge",
                self.table_name
            )));
        }

        let removed_ops = self.queue.delete_for_table(&self.table_name).await?;
        self.errors.remove_for_table(&self.table_name).await?;

        let mut query = self.query.clone();
        query.include_deleted = true;
        query.include_total_count = false;
        self.store.delete_query(&query).await?;

        if let Some(query_id) = &self.query_id {
            self.settings
                .reset_delta_token(&self.table_name, query_id)
                .await?;
        }

        info!(
            table = %self.table_name,
            discarded_operations = removed_ops.len(),
            forced = self.force,
            "purge finished"
        );
        Ok(())
    }
}
