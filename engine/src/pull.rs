//! Pull engine.
//!
//! A pull fetches server records page by page and applies them to the
//! local store, skipping any record with a pending local operation.
//! Incremental pulls resume from a persisted delta token; snapshot
//! pulls page with a cursor. A pull against a dirty table defers itself
//! behind a push of the affected tables.

use crate::actions::{ActionStep, SyncAction};
use crate::coordination::CancellationToken;
use crate::error::{Error, Result};
use crate::query::{Filter, Query, RemoteQueryOptions, SortDirection, INCLUDE_DELETED_PARAMETER};
use crate::queue::OperationQueue;
use crate::remote::{RemoteTable, ServerPage};
use crate::settings::SyncSettings;
use crate::store::LocalStore;
use crate::value::{system, Item, Value};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info};

/// Tuning knobs for a pull.
#[derive(Debug, Clone)]
pub struct PullOptions {
    /// Page size requested from the server when it honors `top`.
    pub max_page_size: u64,
}

impl Default for PullOptions {
    fn default() -> Self {
        Self { max_page_size: 50 }
    }
}

/// Validates a user pull query against the engine's rules and the
/// remote table's declared capabilities.
pub(crate) fn validate_pull_query(
    query: &Query,
    query_id: Option<&str>,
    options: RemoteQueryOptions,
) -> Result<()> {
    if !query.select.is_empty() {
        return Err(Error::invalid_input(
            "pull queries cannot use projections; the whole record is synchronized",
        ));
    }
    if query
        .parameters
        .keys()
        .any(|k| k.eq_ignore_ascii_case(INCLUDE_DELETED_PARAMETER))
    {
        return Err(Error::invalid_input(format!(
            "the '{INCLUDE_DELETED_PARAMETER}' parameter is reserved"
        )));
    }
    if query_id.is_some() {
        if !query.order_by.is_empty() || query.top.is_some() || query.skip.is_some() {
            return Err(Error::invalid_input(
                "incremental pull queries cannot use orderby, top, or skip",
            ));
        }
    } else {
        if !query.order_by.is_empty() && !options.contains(RemoteQueryOptions::ORDER_BY) {
            return Err(Error::invalid_input(
                "the remote table does not support ordering",
            ));
        }
        if query.skip.is_some() && !options.contains(RemoteQueryOptions::SKIP) {
            return Err(Error::invalid_input("the remote table does not support skip"));
        }
        if query.top.is_some() && !options.contains(RemoteQueryOptions::TOP) {
            return Err(Error::invalid_input("the remote table does not support top"));
        }
    }
    Ok(())
}

/// Checks that a server next-page link only uses query features the
/// remote table declared. Unknown parameters pass through.
pub(crate) fn next_link_allowed(url: &str, options: RemoteQueryOptions) -> bool {
    let Some((_, query_string)) = url.split_once('?') else {
        return true;
    };
    for pair in query_string.split('&') {
        let name = pair.split('=').next().unwrap_or("");
        let name = name.trim_start_matches('$').to_ascii_lowercase();
        let required = match name.as_str() {
            "orderby" => RemoteQueryOptions::ORDER_BY,
            "skip" => RemoteQueryOptions::SKIP,
            "top" => RemoteQueryOptions::TOP,
            _ => continue,
        };
        if !options.contains(required) {
            return false;
        }
    }
    true
}

/// One pull invocation, driven as an action.
pub(crate) struct PullAction {
    /// Store for applying server records; tracked with `ServerPull`.
    pub store: Arc<dyn LocalStore>,
    pub queue: Arc<OperationQueue>,
    pub settings: Arc<SyncSettings>,
    pub remote: Arc<dyn RemoteTable>,
    pub table_name: String,
    pub query_id: Option<String>,
    pub query: Query,
    pub options: RemoteQueryOptions,
    pub pull_options: PullOptions,
    /// Tables whose pending operations also gate this pull. `None`
    /// treats every table as related; empty treats none.
    pub related_tables: Option<Vec<String>>,
    pub token: CancellationToken,
}

#[async_trait]
impl SyncAction for PullAction {
    async fn enter(&mut self) -> Result<ActionStep> {
        validate_pull_query(&self.query, self.query_id.as_deref(), self.options)?;

        if let Some(tables) = self.dirty_tables().await? {
            return Ok(ActionStep::PushRequired { tables });
        }
        self.pull_all().await?;
        Ok(ActionStep::Done)
    }

    async fn resume_after_push(&mut self) -> Result<ActionStep> {
        self.pull_all().await?;
        Ok(ActionStep::Done)
    }
}

struct BatchStats {
    /// Records in the page, pending-skips included.
    page_len: u64,
    /// Highest `updatedAt` observed in the page.
    max_updated_at: Option<DateTime<Utc>>,
    /// How many records carried that highest timestamp.
    at_max: u64,
}

impl PullAction {
    /// Returns the tables that must be pushed first, or `None` when
    /// the pull can proceed.
    async fn dirty_tables(&self) -> Result<Option<Option<Vec<String>>>> {
        match &self.related_tables {
            None => {
                if self.queue.pending_operations() > 0 {
                    Ok(Some(None))
                } else {
                    Ok(None)
                }
            }
            Some(related) => {
                let mut gated = vec![self.table_name.clone()];
                gated.extend(related.iter().cloned());
                for i in 0..gated.len() {
                    if self.queue.count_pending(&gated[i]).await? > 0 {
                        return Ok(Some(Some(gated)));
                    }
                }
                Ok(None)
            }
        }
    }

    async fn pull_all(&self) -> Result<()> {
        if self.query_id.is_some() {
            self.pull_incremental().await
        } else {
            self.pull_snapshot().await
        }
    }

    /// Applies one server page: deletions and upserts are collected and
    /// flushed together, and records with a pending local operation are
    /// never touched.
    async fn apply_page(&self, items: Vec<Item>) -> Result<BatchStats> {
        let mut stats = BatchStats {
            page_len: items.len() as u64,
            max_updated_at: None,
            at_max: 0,
        };
        let mut upserts = Vec::new();
        let mut deletes = Vec::new();

        for item in items {
            let id = item
                .id()
                .ok_or_else(|| Error::invalid_input("the server returned an item without an id"))?
                .to_string();

            if let Some(updated_at) = item.updated_at() {
                match stats.max_updated_at {
                    Some(max) if updated_at > max => {
                        stats.max_updated_at = Some(updated_at);
                        stats.at_max = 1;
                    }
                    Some(max) if updated_at == max => stats.at_max += 1,
                    None => {
                        stats.max_updated_at = Some(updated_at);
                        stats.at_max = 1;
                    }
                    _ => {}
                }
            }

            if self.queue.get_by_item(&self.table_name, &id).await?.is_some() {
                debug!(item = %id, "skipping pulled record with a pending operation");
                continue;
            }
            if item.is_deleted() {
                deletes.push(id);
            } else {
                upserts.push(item);
            }
        }

        if !deletes.is_empty() {
            self.store.delete_ids(&self.table_name, &deletes).await?;
        }
        if !upserts.is_empty() {
            self.store.upsert(&self.table_name, upserts, true).await?;
        }
        Ok(stats)
    }

    fn base_query(&self) -> Query {
        let mut query = self.query.clone();
        query.include_deleted = true;
        query.include_total_count = false;
        query
    }

    /// Snapshot pull: cursor over skip/top when the server supports
    /// them, falling back to whitelisted next-page links.
    async fn pull_snapshot(&self) -> Result<()> {
        let base = self.base_query();
        let supports_skip = self.options.contains(RemoteQueryOptions::SKIP);
        let supports_top = self.options.contains(RemoteQueryOptions::TOP);
        let user_top = base.top;
        let mut read: u64 = 0;
        let mut next_url: Option<String> = None;

        loop {
            if self.token.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let page = match next_url.take() {
                Some(url) => self.remote.read_url(&url).await?,
                None => {
                    let mut query = base.clone();
                    if supports_skip {
                        query.skip = Some(base.skip.unwrap_or(0) + read);
                    }
                    if supports_top {
                        let window = match user_top {
                            Some(top) => (top - read).min(self.pull_options.max_page_size),
                            None => self.pull_options.max_page_size,
                        };
                        query.top = Some(window);
                    }
                    self.remote.read(&query).await?
                }
            };

            if page.items.is_empty() {
                break;
            }
            let ServerPage {
                items, next_link, ..
            } = page;
            let stats = self.apply_page(items).await?;
            read += stats.page_len;

            if user_top.is_some_and(|top| read >= top) {
                break;
            }
            match next_link {
                Some(link) if next_link_allowed(&link, self.options) => {
                    next_url = Some(link);
                }
                Some(link) => {
                    debug!(%link, "next link uses unsupported query features; using cursor");
                    if !supports_skip {
                        break;
                    }
                }
                None => {
                    if !supports_skip {
                        break;
                    }
                }
            }
        }

        info!(table = %self.table_name, records = read, "snapshot pull finished");
        Ok(())
    }

    /// Incremental pull: `updatedAt >= delta`, ordered by
    /// `updatedAt asc, id asc`, skipping past records that share the
    /// watermark timestamp. The delta token advances after each page.
    async fn pull_incremental(&self) -> Result<()> {
        let query_id = self.query_id.as_deref().unwrap_or_default();
        let mut delta = self.settings.delta_token(&self.table_name, query_id).await?;
        let mut at_watermark: u64 = 0;
        let page_size = self.pull_options.max_page_size;
        let mut read: u64 = 0;

        loop {
            if self.token.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let mut query = self.base_query();
            query.filter = Filter::merge(
                query.filter.take(),
                Some(Filter::Ge(
                    system::UPDATED_AT.into(),
                    Value::Timestamp(delta),
                )),
            );
            query.order_by = vec![
                (system::UPDATED_AT.into(), SortDirection::Ascending),
                (system::ID.into(), SortDirection::Ascending),
            ];
            query.skip = (at_watermark > 0).then_some(at_watermark);
            query.top = Some(page_size);

            let page = self.remote.read(&query).await?;
            if page.items.is_empty() {
                break;
            }
            let stats = self.apply_page(page.items).await?;
            read += stats.page_len;

            match stats.max_updated_at {
                Some(max) if max > delta => {
                    delta = max;
                    at_watermark = stats.at_max;
                    self.settings
                        .set_delta_token(&self.table_name, query_id, delta)
                        .await?;
                }
                _ => {
                    // The whole page sits on the watermark; page past it.
                    at_watermark += stats.page_len;
                }
            }

            if stats.page_len < page_size {
                break;
            }
        }

        info!(
            table = %self.table_name,
            records = read,
            delta = %delta,
            "incremental pull finished"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_projections() {
        let query = Query::table("todos").select(vec!["title".to_string()]);
        let err = validate_pull_query(&query, None, RemoteQueryOptions::ALL).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn rejects_reserved_parameter() {
        let query = Query::table("todos").with_parameter("__includeDeleted", "true");
        let err = validate_pull_query(&query, None, RemoteQueryOptions::ALL).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(msg) if msg.contains("__includeDeleted")));
    }

    #[test]
    fn incremental_rejects_paging_clauses() {
        for query in [
            Query::table("todos").top(5),
            Query::table("todos").skip(5),
            Query::table("todos").order_by("title", SortDirection::Ascending),
        ] {
            let err =
                validate_pull_query(&query, Some("all"), RemoteQueryOptions::ALL).unwrap_err();
            assert!(matches!(err, Error::InvalidInput(_)));
        }
    }

    #[test]
    fn snapshot_respects_remote_capabilities() {
        let query = Query::table("todos").top(5);
        assert!(validate_pull_query(&query, None, RemoteQueryOptions::ALL).is_ok());
        let err = validate_pull_query(&query, None, RemoteQueryOptions::NONE).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn next_link_whitelist() {
        let all = RemoteQueryOptions::ALL;
        let none = RemoteQueryOptions::NONE;
        assert!(next_link_allowed("https://x/t?$skip=50&$top=50", all));
        assert!(!next_link_allowed("https://x/t?$skip=50", none));
        assert!(next_link_allowed("https://x/t?$filter=a%20gt%201", none));
        assert!(next_link_allowed("https://x/t", none));
    }
}
