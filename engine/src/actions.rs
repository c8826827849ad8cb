//! Action sequencing.
//!
//! Push, pull, and purge are modeled as actions driven by a runner that
//! owns the single action slot. An action is a small state machine with
//! two entry points: `enter`, and `resume_after_push` for actions that
//! defer themselves behind a push (a pull against a dirty table). The
//! nested push runs while the slot is held, so actions never
//! interleave.

use crate::coordination::ActionSlot;
use crate::error::Result;
use async_trait::async_trait;
use std::future::Future;
use tracing::debug;

/// What an action wants next.
pub(crate) enum ActionStep {
    /// The action finished.
    Done,
    /// The action needs the named tables pushed before it can proceed;
    /// `None` means all tables.
    PushRequired { tables: Option<Vec<String>> },
}

/// A sync action driven by the runner.
#[async_trait]
pub(crate) trait SyncAction: Send {
    /// First entry into the action.
    async fn enter(&mut self) -> Result<ActionStep>;

    /// Re-entry after a requested push succeeded.
    async fn resume_after_push(&mut self) -> Result<ActionStep>;
}

/// Serializes actions through the single slot.
pub(crate) struct ActionRunner {
    slot: ActionSlot,
}

impl ActionRunner {
    pub fn new() -> Self {
        Self {
            slot: ActionSlot::new(),
        }
    }

    /// Runs an action to completion, driving requested pushes through
    /// `push`. A failed push propagates as the action's own failure;
    /// the action is not resumed.
    pub async fn run<A, P, F>(&self, mut action: A, mut push: P) -> Result<()>
    where
        A: SyncAction,
        P: FnMut(Option<Vec<String>>) -> F,
        F: Future<Output = Result<()>>,
    {
        let _slot = self.slot.acquire().await;
        let mut step = action.enter().await?;
        while let ActionStep::PushRequired { tables } = step {
            debug!(?tables, "action deferred behind a push");
            push(tables).await?;
            step = action.resume_after_push().await?;
        }
        Ok(())
    }

    /// Runs a future while holding the action slot. Used for pushes
    /// invoked directly.
    pub async fn exclusive<F, T>(&self, future: F) -> T
    where
        F: Future<Output = T>,
    {
        let _slot = self.slot.acquire().await;
        future.await
    }
}
