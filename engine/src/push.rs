//! Push engine.
//!
//! A push drains the operation queue in sequence order, replaying each
//! pending operation against its remote table. Per-operation failures
//! become persisted error rows and the walk continues; batch-level
//! failures (network, auth, explicit abort, cancellation, store
//! failure) stop the walk and classify the whole push.

use crate::coordination::CancellationToken;
use crate::error::{Error, PushStatus, Result};
use crate::operations::{OperationState, PendingOperation};
use crate::queue::OperationQueue;
use crate::remote::{RemoteBackend, RemoteError, RemoteErrorKind, RemoteTable};
use crate::store::LocalStore;
use crate::sync_error::{OperationErrorLog, TableOperationError};
use crate::table::TableKind;
use crate::value::Item;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error as ThisError;
use tracing::{debug, info, warn};

/// Failure returned by a sync handler's operation execution.
#[derive(Debug, ThisError)]
pub enum HandlerError {
    /// The remote call failed.
    #[error(transparent)]
    Remote(#[from] RemoteError),
    /// The handler asked to abort the whole batch.
    #[error("push aborted by the operation handler")]
    Abort,
}

/// Outcome of a push batch, handed to
/// [`SyncHandler::on_push_complete`].
///
/// The handler may mark individual errors handled; handled errors are
/// deleted from the error table and not re-raised.
#[derive(Debug)]
pub struct PushCompletionResult {
    /// Why the batch stopped.
    pub status: PushStatus,
    /// Per-operation errors recorded during the batch.
    pub errors: Vec<TableOperationError>,
}

impl PushCompletionResult {
    /// Marks every error handled.
    pub fn mark_all_handled(&mut self) {
        for error in &mut self.errors {
            error.handled = true;
        }
    }
}

/// Application hook into push execution.
///
/// The default behavior replays each operation against the remote
/// table; overriding `execute_table_operation` lets applications
/// transform requests or abort the batch, and `on_push_complete` is
/// where conflicts get acknowledged.
#[async_trait]
pub trait SyncHandler: Send + Sync {
    /// Executes one operation against the remote table.
    async fn execute_table_operation(
        &self,
        op: &PendingOperation,
        item: &Item,
        remote: &dyn RemoteTable,
    ) -> std::result::Result<Option<Item>, HandlerError> {
        op.execute_remote(remote, item).await.map_err(HandlerError::from)
    }

    /// Called once per batch, after the walk finished or aborted.
    async fn on_push_complete(&self, _result: &mut PushCompletionResult) {}
}

/// The no-op handler: plain replay, nothing handled.
pub struct DefaultSyncHandler;

#[async_trait]
impl SyncHandler for DefaultSyncHandler {}

/// One push batch over the queue.
pub(crate) struct PushEngine<'a> {
    /// Store for result write-backs; tracked with `ServerPush`.
    pub store: Arc<dyn LocalStore>,
    pub queue: &'a OperationQueue,
    pub errors: &'a OperationErrorLog,
    pub backend: &'a dyn RemoteBackend,
    pub handler: &'a dyn SyncHandler,
    pub token: &'a CancellationToken,
    /// Table-name whitelist; `None` pushes every table.
    pub tables: Option<Vec<String>>,
}

enum StepOutcome {
    Continue,
    Abort(PushStatus, Option<Error>),
}

impl<'a> PushEngine<'a> {
    /// Runs the batch to completion and surfaces the outcome.
    ///
    /// Succeeds only when the walk completed and the handler left no
    /// error unhandled; otherwise fails with
    /// [`Error::PushFailed`] carrying the classified status.
    pub async fn execute(&self) -> Result<()> {
        let mut batch_errors = Vec::new();
        let (status, cause) = match self.walk(&mut batch_errors).await {
            Ok((status, cause)) => (status, cause),
            Err(Error::LocalStore(store_err)) => (
                PushStatus::CancelledBySyncStoreError,
                Some(Error::LocalStore(store_err)),
            ),
            Err(other) => (PushStatus::InternalError, Some(other)),
        };
        info!(
            ?status,
            errors = batch_errors.len(),
            "push batch finished"
        );

        let mut result = PushCompletionResult {
            status,
            errors: batch_errors,
        };
        self.handler.on_push_complete(&mut result).await;

        let mut unhandled = Vec::new();
        for error in result.errors {
            if error.handled {
                self.errors.remove(error.id).await?;
            } else {
                unhandled.push(error);
            }
        }

        if status.is_complete() && unhandled.is_empty() {
            Ok(())
        } else {
            Err(Error::PushFailed {
                status,
                errors: unhandled,
                source: cause.map(Box::new),
            })
        }
    }

    /// Walks the queue from sequence zero. `peek` is monotonic, so
    /// operations enqueued while the walk runs are not picked up.
    async fn walk(
        &self,
        batch_errors: &mut Vec<TableOperationError>,
    ) -> Result<(PushStatus, Option<Error>)> {
        let mut last_sequence = 0;
        loop {
            if self.token.is_cancelled() {
                return Ok((PushStatus::CancelledByToken, None));
            }
            let peeked = self
                .queue
                .peek(last_sequence, TableKind::Table, self.tables.as_deref())
                .await?;
            let Some(peeked) = peeked else {
                return Ok((PushStatus::Complete, None));
            };
            last_sequence = peeked.sequence;

            // The per-item lock is held across the remote call so a
            // concurrent local edit cannot race the in-flight state.
            let _item_guard = self.queue.lock_item(&peeked.item_id).await;
            let Some(op) = self.queue.get_by_id(peeked.id).await? else {
                continue;
            };

            match self.push_one(op, batch_errors).await? {
                StepOutcome::Continue => {}
                StepOutcome::Abort(status, cause) => return Ok((status, cause)),
            }
        }
    }

    async fn push_one(
        &self,
        mut op: PendingOperation,
        batch_errors: &mut Vec<TableOperationError>,
    ) -> Result<StepOutcome> {
        let item = match op.item.clone() {
            Some(item) => Some(item),
            None => self.store.lookup(&op.table_name, &op.item_id).await?,
        };
        let Some(item) = item else {
            warn!(
                table = %op.table_name,
                item = %op.item_id,
                "operation's local item is missing; recording error"
            );
            op.state = OperationState::Failed;
            self.queue.update(&op).await?;
            let error = TableOperationError::missing_item(&op);
            self.errors.save(&error).await?;
            batch_errors.push(error);
            return Ok(StepOutcome::Continue);
        };

        op.state = OperationState::Attempted;
        self.queue.update(&op).await?;

        let remote = self.backend.table(&op.table_name);
        match self
            .handler
            .execute_table_operation(&op, &item, remote.as_ref())
            .await
        {
            Ok(result) => {
                if op.writes_result_back() {
                    if let Some(server_item) = result {
                        self.store
                            .upsert(&op.table_name, vec![server_item], true)
                            .await?;
                    }
                }
                if self.queue.try_delete(op.id, op.version).await? {
                    self.errors.remove(op.id).await?;
                } else {
                    debug!(op_id = %op.id, "operation changed mid-push; left in queue");
                }
                Ok(StepOutcome::Continue)
            }
            Err(HandlerError::Abort) => {
                op.state = OperationState::Failed;
                self.queue.update(&op).await?;
                Ok(StepOutcome::Abort(PushStatus::CancelledByOperation, None))
            }
            Err(HandlerError::Remote(remote_err)) => {
                op.state = OperationState::Failed;
                self.queue.update(&op).await?;
                match remote_err.kind {
                    RemoteErrorKind::NetworkError => Ok(StepOutcome::Abort(
                        PushStatus::CancelledByNetworkError,
                        Some(Error::Remote(remote_err)),
                    )),
                    RemoteErrorKind::Unauthorized => Ok(StepOutcome::Abort(
                        PushStatus::CancelledByAuthenticationError,
                        Some(Error::Remote(remote_err)),
                    )),
                    _ => {
                        debug!(
                            op_id = %op.id,
                            status = ?remote_err.status,
                            "operation failed; error recorded, batch continues"
                        );
                        let error = TableOperationError::from_remote(&op, item, &remote_err);
                        self.errors.save(&error).await?;
                        batch_errors.push(error);
                        Ok(StepOutcome::Continue)
                    }
                }
            }
        }
    }
}
